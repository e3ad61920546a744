//! RFC 6455 frame codec
//!
//! Translates between the WebSocket wire format and typed frames. The
//! decoder consumes client-to-server frames (normally masked, multi-frame
//! per TCP segment); the encoder produces single-fragment unmasked
//! server-to-client frames. Both directions are pure functions over byte
//! slices so the codec is trivially reentrant.

use thiserror::Error;

/// WebSocket opcodes from the low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved or unknown opcode; decoded and discarded by the caller.
    Other(u8),
}

impl Opcode {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Other(v) => v & 0x0F,
        }
    }
}

/// One complete decoded frame plus how many input bytes it occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    /// Header + mask key + payload; the caller advances its read cursor
    /// by this amount.
    pub consumed: usize,
}

/// Transport-fatal decode failures. Any of these destroys the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: u64, max: usize },
}

/// Attempts to decode one frame from the start of `buf`.
///
/// Returns `Ok(None)` when the header or payload is still incomplete
/// (read more bytes and retry), `Ok(Some(frame))` on success, or an error
/// for oversized / malformed lengths. The size limit is enforced from the
/// declared length alone, before any payload byte is touched.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let opcode = Opcode::from_nibble(buf[0] & 0x0F);
    let masked = buf[1] & 0x80 != 0;
    let short_len = (buf[1] & 0x7F) as u64;

    let (payload_len, header_len) = match short_len {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(bytes);
            // A 64-bit length with any of the high 32 bits set is beyond
            // every sane limit; fail without waiting for the payload.
            if len >> 32 != 0 {
                return Err(FrameError::PayloadTooLarge {
                    len,
                    max: max_payload,
                });
            }
            (len, 10)
        }
        n => (n, 2),
    };

    if payload_len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let mask_len = if masked { 4 } else { 0 };
    let total = header_len + mask_len + payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header_len + mask_len..total].to_vec();
    if masked {
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some(Frame {
        opcode,
        payload,
        consumed: total,
    }))
}

/// Encodes a single-fragment (FIN=1) unmasked frame.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.as_u8());

    if payload.len() <= 125 {
        out.push(payload.len() as u8);
    } else if payload.len() <= 65_535 {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

/// Encodes a text frame.
pub fn encode_text_frame(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes())
}

/// The bare close frame the server writes before destroying a connection.
pub fn close_frame() -> Vec<u8> {
    vec![0x88, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1_048_576;

    /// Builds a masked client frame the way a browser would.
    fn masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode.as_u8()];
        if payload.len() <= 125 {
            out.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 65_535 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(&key);
        out.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % 4]),
        );
        out
    }

    #[test]
    fn test_decode_masked_text_frame() {
        let wire = masked_frame(Opcode::Text, b"hello", [0x37, 0xFA, 0x21, 0x3D]);
        let frame = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.consumed, wire.len());
    }

    #[test]
    fn test_decode_unmasked_frame_is_tolerated() {
        let wire = encode_frame(Opcode::Text, b"hi");
        let frame = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(frame.payload, b"hi");
        assert_eq!(frame.consumed, 4);
    }

    #[test]
    fn test_decode_extended_16_bit_length() {
        let payload = vec![0xAB; 300];
        let wire = masked_frame(Opcode::Binary, &payload, [1, 2, 3, 4]);
        assert_eq!(wire[1] & 0x7F, 126);
        let frame = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_decode_extended_64_bit_length() {
        let payload = vec![0x42; 70_000];
        let wire = masked_frame(Opcode::Binary, &payload, [9, 8, 7, 6]);
        assert_eq!(wire[1] & 0x7F, 127);
        let frame = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn test_need_more_on_partial_input() {
        let wire = masked_frame(Opcode::Text, b"partial payload", [1, 2, 3, 4]);
        for cut in [0, 1, 2, 5, wire.len() - 1] {
            assert_eq!(decode_frame(&wire[..cut], MAX).unwrap(), None);
        }
    }

    #[test]
    fn test_oversized_declared_length_fails_without_payload() {
        // Header declares 2 MiB; only the header bytes are present. The
        // limit must trip before the decoder waits for payload.
        let mut wire = vec![0x81, 127];
        wire.extend_from_slice(&(2_097_152u64).to_be_bytes());
        let err = decode_frame(&wire, MAX).unwrap_err();
        assert_eq!(
            err,
            FrameError::PayloadTooLarge {
                len: 2_097_152,
                max: MAX
            }
        );
    }

    #[test]
    fn test_high_32_bits_in_64_bit_length_rejected() {
        let mut wire = vec![0x81, 127];
        wire.extend_from_slice(&(1u64 << 33).to_be_bytes());
        assert!(decode_frame(&wire, MAX).is_err());
    }

    #[test]
    fn test_two_frames_in_one_packet_decode_sequentially() {
        let mut wire = masked_frame(Opcode::Text, b"first", [1, 1, 1, 1]);
        let second = masked_frame(Opcode::Text, b"second", [2, 2, 2, 2]);
        wire.extend_from_slice(&second);

        let a = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(a.payload, b"first");
        let b = decode_frame(&wire[a.consumed..], MAX).unwrap().unwrap();
        assert_eq!(b.payload, b"second");
        assert_eq!(a.consumed + b.consumed, wire.len());
    }

    #[test]
    fn test_control_opcodes_decode() {
        let ping = masked_frame(Opcode::Ping, b"beat", [5, 5, 5, 5]);
        assert_eq!(
            decode_frame(&ping, MAX).unwrap().unwrap().opcode,
            Opcode::Ping
        );

        let close = masked_frame(Opcode::Close, &[], [0, 0, 0, 0]);
        assert_eq!(
            decode_frame(&close, MAX).unwrap().unwrap().opcode,
            Opcode::Close
        );
    }

    #[test]
    fn test_unknown_opcode_is_surfaced_not_fatal() {
        let wire = masked_frame(Opcode::Other(0x7), b"x", [1, 2, 3, 4]);
        let frame = decode_frame(&wire, MAX).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Other(0x7));
    }

    #[test]
    fn test_encoder_length_forms() {
        assert_eq!(encode_frame(Opcode::Text, &[0; 125])[1], 125);
        let medium = encode_frame(Opcode::Text, &[0; 126]);
        assert_eq!(medium[1], 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 126);
        let large = encode_frame(Opcode::Text, &[0; 70_000]);
        assert_eq!(large[1], 127);
        let mut len = [0u8; 8];
        len.copy_from_slice(&large[2..10]);
        assert_eq!(u64::from_be_bytes(len), 70_000);
    }

    #[test]
    fn test_encoder_never_masks_and_sets_fin() {
        let wire = encode_text_frame("payload");
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1] & 0x80, 0);
    }

    #[test]
    fn test_close_frame_bytes() {
        assert_eq!(close_frame(), vec![0x88, 0x00]);
    }
}
