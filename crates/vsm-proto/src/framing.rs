//! Varint frame codec
//!
//! Wire format is a little-endian base-128 varint length prefix (up to ten
//! bytes, high bit meaning "more follows") followed by that many bytes of
//! serialized message. The decoder is a byte-at-a-time state machine so a
//! read may deliver any split of the stream, including a single byte.

use prost::Message;

use crate::message::VsmMessage;

/// Hard cap on a single framed message. A prefix announcing more than this
/// is a protocol violation and terminal for the connection.
pub const PROTO_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    Oversize { size: u64, max: usize },
    #[error("frame length prefix does not terminate within 10 bytes")]
    PrefixTooLong,
}

// ----------------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// Callers read up to [`next_read_size`](Self::next_read_size) bytes from the
/// stream and push whatever arrived through [`feed`]. Complete payloads come
/// back in arrival order; a decode error poisons the decoder and must tear
/// the connection down.
#[derive(Debug)]
pub struct FrameDecoder {
    reading_header: bool,
    message_size: u64,
    shift: u32,
    to_read: usize,
    body: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            reading_header: true,
            message_size: 0,
            shift: 0,
            to_read: 1,
            body: Vec::new(),
        }
    }

    /// How many bytes the next read should ask for: one while the varint
    /// header is incomplete, the remaining body budget afterwards.
    pub fn next_read_size(&self) -> usize {
        if self.reading_header {
            1
        } else {
            self.to_read
        }
    }

    /// Consume `bytes` and return every payload they complete.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            if self.reading_header {
                let byte = bytes[0];
                bytes = &bytes[1..];
                self.push_header_byte(byte)?;
            } else {
                let take = bytes.len().min(self.to_read);
                self.body.extend_from_slice(&bytes[..take]);
                bytes = &bytes[take..];
                self.to_read -= take;
                if self.to_read == 0 {
                    frames.push(std::mem::take(&mut self.body));
                    self.reset();
                }
            }
        }
        Ok(frames)
    }

    fn push_header_byte(&mut self, byte: u8) -> Result<(), FrameError> {
        // Accumulate through u128 so a hostile prefix saturates instead of
        // aliasing to a small length.
        let bits = (byte & 0x7f) as u128;
        let size = (self.message_size as u128) | (bits << self.shift);
        self.message_size = size.min(u64::MAX as u128) as u64;

        if byte & 0x80 != 0 {
            self.shift += 7;
            if self.shift > 63 {
                return Err(FrameError::PrefixTooLong);
            }
            return Ok(());
        }

        // Header complete.
        if self.message_size > PROTO_MAX_MESSAGE_LEN as u64 {
            return Err(FrameError::Oversize {
                size: self.message_size,
                max: PROTO_MAX_MESSAGE_LEN,
            });
        }
        if self.message_size == 0 {
            // Empty frame: nothing to deliver, wait for the next header.
            self.reset();
        } else {
            self.reading_header = false;
            self.to_read = self.message_size as usize;
            self.body = Vec::with_capacity(self.to_read.min(4096));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.reading_header = true;
        self.message_size = 0;
        self.shift = 0;
        self.to_read = 1;
    }
}

// ----------------------------------------------------------------------------
// Encoder
// ----------------------------------------------------------------------------

/// Prefix `payload` with its varint length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > PROTO_MAX_MESSAGE_LEN {
        return Err(FrameError::Oversize {
            size: payload.len() as u64,
            max: PROTO_MAX_MESSAGE_LEN,
        });
    }
    let mut prefix = [0u8; 10];
    let mut used = 0;
    let mut rest = payload.len() as u64;
    loop {
        let byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest != 0 {
            prefix[used] = byte | 0x80;
            used += 1;
        } else {
            prefix[used] = byte;
            used += 1;
            break;
        }
    }
    let mut out = Vec::with_capacity(used + payload.len());
    out.extend_from_slice(&prefix[..used]);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Serialize and frame a message in one step.
pub fn encode_message(message: &VsmMessage) -> Result<Vec<u8>, FrameError> {
    encode_frame(&message.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RegisterPeer, VsmMessage};

    fn sample_message() -> VsmMessage {
        VsmMessage {
            device_id: Some(12),
            message_id: Some(77),
            response_required: Some(true),
            register_peer: Some(RegisterPeer {
                peer_id: Some(0xDEAD_BEEF),
                name: Some("test peer".into()),
                ..RegisterPeer::default()
            }),
            ..VsmMessage::default()
        }
    }

    #[test]
    fn roundtrip_whole_buffer() {
        let msg = sample_message();
        let wire = encode_message(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        let back = VsmMessage::decode(frames[0].as_slice()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn roundtrip_one_byte_at_a_time() {
        let msg = sample_message();
        let wire = encode_message(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &wire {
            assert!(decoder.next_read_size() >= 1);
            frames.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(VsmMessage::decode(frames[0].as_slice()).unwrap(), msg);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let msg = sample_message();
        let mut wire = encode_message(&msg).unwrap();
        wire.extend(encode_message(&msg).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert_eq!(VsmMessage::decode(frame.as_slice()).unwrap(), msg);
        }
    }

    #[test]
    fn empty_frame_is_skipped() {
        let msg = sample_message();
        let mut wire = vec![0u8]; // zero-length frame
        wire.extend(encode_message(&msg).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(VsmMessage::decode(frames[0].as_slice()).unwrap(), msg);
    }

    #[test]
    fn next_read_size_tracks_body_budget() {
        let payload = vec![0xABu8; 300];
        let wire = encode_frame(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        // 300 needs a two-byte varint.
        assert!(decoder.feed(&wire[..1]).unwrap().is_empty());
        assert_eq!(decoder.next_read_size(), 1);
        assert!(decoder.feed(&wire[1..2]).unwrap().is_empty());
        assert_eq!(decoder.next_read_size(), 300);

        let frames = decoder.feed(&wire[2..102]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(decoder.next_read_size(), 200);

        let frames = decoder.feed(&wire[102..]).unwrap();
        assert_eq!(frames, vec![payload]);
        assert_eq!(decoder.next_read_size(), 1);
    }

    #[test]
    fn oversize_prefix_is_fatal() {
        let size = (PROTO_MAX_MESSAGE_LEN as u64) + 1;
        let mut prefix = Vec::new();
        let mut rest = size;
        loop {
            let byte = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest != 0 {
                prefix.push(byte | 0x80);
            } else {
                prefix.push(byte);
                break;
            }
        }

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&prefix).unwrap_err();
        assert_eq!(
            err,
            FrameError::Oversize {
                size,
                max: PROTO_MAX_MESSAGE_LEN
            }
        );
    }

    #[test]
    fn runaway_prefix_is_fatal() {
        let prefix = [0x80u8; 11];
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&prefix).unwrap_err(), FrameError::PrefixTooLong);
    }

    #[test]
    fn encoder_rejects_oversize_payload() {
        // Construct the error without allocating 16 MiB: encode_frame checks
        // the length before copying, so a zero-filled vec is fine.
        let payload = vec![0u8; PROTO_MAX_MESSAGE_LEN + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FrameError::Oversize { .. })
        ));
    }
}
