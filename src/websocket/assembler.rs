//! Turns an arbitrarily chunked byte stream into complete frames.

use super::frame::{Frame, PartialFrame};
use crate::error::FrameError;

/// Holds at most one in-progress frame between calls to [`parse`](Self::parse).
#[derive(Debug, Default)]
pub struct FrameAssembler {
    current: PartialFrame,
    max_payload: Option<usize>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any frame declaring a payload longer than `limit`.
    pub fn with_max_payload(limit: usize) -> Self {
        Self {
            current: PartialFrame::new().with_max_payload(Some(limit)),
            max_payload: Some(limit),
        }
    }

    /// Feed `chunk`, returning every frame it completes, in wire order.
    ///
    /// A trailing partial frame is retained for the next call. On error the
    /// in-progress frame is discarded; the stream is no longer in sync and the
    /// caller is expected to fail the connection.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let (complete, leftover) = match self.current.parse(rest) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.current = self.fresh();
                    return Err(e);
                }
            };
            rest = leftover;
            if complete {
                let next = self.fresh();
                let done = std::mem::replace(&mut self.current, next);
                frames.push(done.into_frame());
            }
        }

        Ok(frames)
    }

    /// Whether a frame has been partially received.
    pub fn has_partial(&self) -> bool {
        self.current.is_started()
    }

    fn fresh(&self) -> PartialFrame {
        PartialFrame::new().with_max_payload(self.max_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::Opcode;

    fn wire(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.encode().to_vec()).collect()
    }

    #[test]
    fn many_frames_in_one_chunk() {
        let sent = [
            Frame::text("a"),
            Frame::ping("p").masked(),
            Frame::binary(vec![7u8; 300]),
            Frame::close(1000, ""),
        ];
        let frames = FrameAssembler::new().parse(&wire(&sent)).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(&frames[1].payload[..], b"p");
        assert_eq!(frames[2].payload.len(), 300);
        assert_eq!(frames[3].opcode, Opcode::Close);
    }

    #[test]
    fn arbitrary_chunk_boundaries() {
        let sent = [
            Frame::text("hello").masked(),
            Frame::new(Opcode::Text, "ab", false).masked(),
            Frame::new(Opcode::Continuation, vec![1u8; 200], true).masked(),
            Frame::pong(""),
        ];
        let bytes = wire(&sent);
        let whole = FrameAssembler::new().parse(&bytes).unwrap();

        for chunk_len in 1..=17 {
            let mut assembler = FrameAssembler::new();
            let mut frames = Vec::new();
            for chunk in bytes.chunks(chunk_len) {
                frames.extend(assembler.parse(chunk).unwrap());
            }
            assert!(!assembler.has_partial());
            assert_eq!(frames.len(), whole.len());
            for (got, want) in frames.iter().zip(&whole) {
                assert_eq!(got.opcode, want.opcode);
                assert_eq!(got.fin, want.fin);
                assert_eq!(got.payload, want.payload);
            }
        }
    }

    #[test]
    fn partial_frame_is_kept() {
        let bytes = Frame::text("split me").encode();
        let mut assembler = FrameAssembler::new();
        assert!(assembler.parse(&bytes[..3]).unwrap().is_empty());
        assert!(assembler.has_partial());
        let frames = assembler.parse(&bytes[3..]).unwrap();
        assert_eq!(&frames[0].payload[..], b"split me");
    }

    #[test]
    fn empty_chunk_yields_nothing() {
        assert!(FrameAssembler::new().parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn error_resets_state() {
        let mut assembler = FrameAssembler::with_max_payload(4);
        let err = assembler.parse(&Frame::text("too long").encode()).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { len: 8, limit: 4 }));
        assert!(!assembler.has_partial());
        let frames = assembler.parse(&Frame::text("ok").encode()).unwrap();
        assert_eq!(&frames[0].payload[..], b"ok");
    }
}
