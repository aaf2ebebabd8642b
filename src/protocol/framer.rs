//! Splits and joins the sub-packets carried inside one batch.
//!
//! A framed batch is the plain concatenation of VarInt-length-prefixed
//! sub-packet buffers. The framer knows nothing about compression or
//! encryption; it produces and consumes plain byte buffers.

use crate::protocol::{
    decoder::{DecodeError, Decoder},
    encoder::{var_u32_size, Encoder},
};

/// Concatenates sub-packets into one framed batch.
pub fn frame<'a>(sub_packets: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut batch = Vec::new();
    let mut encoder = Encoder::new(&mut batch);
    for sub_packet in sub_packets {
        encoder.write_var_u32(sub_packet.len().try_into().unwrap_or(u32::MAX));
        encoder.write_slice(sub_packet);
    }
    batch
}

/// Byte size of the framed form of a single sub-packet.
pub fn framed_size(sub_packet_len: usize) -> usize {
    var_u32_size(sub_packet_len as u32) + sub_packet_len
}

/// Lazily splits a framed batch back into sub-packet slices.
///
/// Iteration ends when the buffer is exhausted. A length prefix that
/// overruns the remaining bytes yields [`DecodeError::TruncatedFrame`]
/// and ends the iteration.
pub fn unframe(batch: &[u8]) -> Unframe<'_> {
    Unframe {
        decoder: Decoder::new(batch),
        poisoned: false,
    }
}

pub struct Unframe<'a> {
    decoder: Decoder<'a>,
    poisoned: bool,
}

impl<'a> Iterator for Unframe<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.decoder.is_finished() {
            return None;
        }

        let length = match self.decoder.read_var_u32() {
            Ok(x) => x as usize,
            Err(e) => {
                self.poisoned = true;
                return Some(Err(e));
            }
        };

        let remaining = self.decoder.buffer().len();
        if length > remaining {
            self.poisoned = true;
            return Some(Err(DecodeError::TruncatedFrame { length, remaining }));
        }

        Some(Ok(self.decoder.consume_slice(length).expect("length checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let packets: Vec<&[u8]> = vec![b"abc", b"", b"0123456789", &[0xFE; 300]];
        let batch = frame(packets.iter().copied());
        let out: Vec<&[u8]> = unframe(&batch).collect::<Result<_, _>>().unwrap();
        assert_eq!(out, packets);
    }

    #[test]
    fn empty_batch_yields_nothing() {
        assert!(unframe(&[]).next().is_none());
    }

    #[test]
    fn truncated_frame_is_reported_once() {
        // Length prefix of 10 with only 2 bytes behind it.
        let batch = [0x0A, 0x01, 0x02];
        let mut iter = unframe(&batch);
        assert!(matches!(
            iter.next(),
            Some(Err(DecodeError::TruncatedFrame {
                length: 10,
                remaining: 2
            }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn framed_size_matches_frame() {
        let payload = vec![0u8; 200];
        let batch = frame([payload.as_slice()]);
        assert_eq!(batch.len(), framed_size(payload.len()));
    }
}
