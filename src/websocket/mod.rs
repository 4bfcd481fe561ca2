//! RFC 6455 protocol layer: framing, the opening handshake and the
//! per-connection state machine.

pub mod assembler;
pub mod connection;
pub mod consts;
pub mod frame;
pub mod handshake;

pub use assembler::FrameAssembler;
pub use connection::{Connection, Role, State};
pub use frame::{CloseReason, Frame, Opcode};
