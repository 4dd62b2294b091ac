//! Data channel framing
//!
//! A data channel message has a size limit well below a typical file, so
//! every message handed to the transport is cut into frames:
//!
//! ```text
//! [flag: u8][chunk: up to MAX_FRAME_PAYLOAD bytes]
//! ```
//!
//! `flag` is 1 on the last frame of a message and 0 otherwise. The data
//! channel is reliable and ordered, so frames arrive in sequence and the
//! receiver only has to concatenate until it sees the final flag.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};

/// Chunk size per frame (16KB, safe for every SCTP implementation)
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

/// Split one message into frames. An empty message still yields one frame.
pub fn split_message(message: &[u8], max_payload: usize) -> Vec<Bytes> {
    let max_payload = max_payload.max(1);
    if message.is_empty() {
        return vec![Bytes::from_static(&[FLAG_FINAL])];
    }

    let count = message.len().div_ceil(max_payload);
    message
        .chunks(max_payload)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = BytesMut::with_capacity(chunk.len() + 1);
            frame.put_u8(if i + 1 == count { FLAG_FINAL } else { FLAG_MORE });
            frame.put_slice(chunk);
            frame.freeze()
        })
        .collect()
}

/// Reassembles frames into complete messages.
#[derive(Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the message once its final frame arrived.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Bytes>> {
        let Some((&flag, chunk)) = frame.split_first() else {
            anyhow::bail!("Received empty data channel frame");
        };

        if flag != FLAG_MORE && flag != FLAG_FINAL {
            anyhow::bail!("Unknown frame flag: {}", flag);
        }

        self.buffer.extend_from_slice(chunk);
        if flag == FLAG_FINAL {
            Ok(Some(self.buffer.split().freeze()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_message_is_single_final_frame() {
        let frames = split_message(&[0x01, 0x02, 0x03], MAX_FRAME_PAYLOAD);
        assert_eq!(frames, vec![Bytes::from_static(&[1, 0x01, 0x02, 0x03])]);
    }

    #[test]
    fn test_empty_message_round_trips() {
        let frames = split_message(&[], MAX_FRAME_PAYLOAD);
        assert_eq!(frames.len(), 1);

        let mut assembler = MessageAssembler::new();
        assert_eq!(assembler.push(&frames[0]).unwrap(), Some(Bytes::new()));
    }

    #[test]
    fn test_large_message_is_split_and_reassembled() {
        let message: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let frames = split_message(&message, MAX_FRAME_PAYLOAD);

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_PAYLOAD + 1));
        assert_eq!(frames[0][0], 0);
        assert_eq!(frames[2][0], 1);

        let mut assembler = MessageAssembler::new();
        assert_eq!(assembler.push(&frames[0]).unwrap(), None);
        assert_eq!(assembler.push(&frames[1]).unwrap(), None);
        let out = assembler.push(&frames[2]).unwrap().unwrap();
        assert_eq!(&out[..], &message[..]);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_frame() {
        let message = vec![7u8; 8];
        let frames = split_message(&message, 4);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][0], 1);
    }

    #[test]
    fn test_consecutive_messages_stay_separate() {
        let mut assembler = MessageAssembler::new();
        for frame in split_message(b"first", 2) {
            if let Some(msg) = assembler.push(&frame).unwrap() {
                assert_eq!(&msg[..], b"first");
            }
        }
        let second: Vec<_> = split_message(b"second", 4)
            .iter()
            .filter_map(|f| assembler.push(f).unwrap())
            .collect();
        assert_eq!(second, vec![Bytes::from_static(b"second")]);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&[]).is_err());
        assert!(assembler.push(&[9, 1, 2]).is_err());
    }
}
