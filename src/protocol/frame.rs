//! Wrapped frame codec.
//!
//! ```text
//! Host -> Device:  01 LEN(4) SEQ CMD(4) DATA(0-213) 05 BCC(4) 03
//! Device -> Host:  01 LEN(4) SEQ CMD(4) DATA(0-218) 04 STATUS(8) 05 BCC(4) 03
//! ```
//!
//! LEN, CMD and BCC are 16-bit values sent as four bytes, one per nibble,
//! most significant first, each nibble offset by 0x30. LEN is the byte count
//! from the first LEN byte through the postamble plus 0x20; BCC is the sum of
//! the same byte range modulo 0x10000.

use crate::error::FrameError;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub const PREAMBLE: u8 = 0x01;
pub const TERMINATOR: u8 = 0x03;
pub const SEPARATOR: u8 = 0x04;
pub const POSTAMBLE: u8 = 0x05;
pub const TAB: u8 = 0x09;
pub const ESCAPE: u8 = 0x10;
pub const NAK: u8 = 0x15;
pub const SYN: u8 = 0x16;

/// Offset added to LEN and to each digit nibble.
pub const SPACE: u8 = 0x20;
const DIGIT_OFFSET: u8 = 0x30;
const ESCAPE_OFFSET: u8 = 0x40;

pub const MAX_HOST_DATA: usize = 213;
pub const MAX_DEVICE_DATA: usize = 218;
pub const STATUS_LEN: usize = 8;

/// Lowest valid sequence number; 0x00-0x1F are never used.
pub const MIN_SEQUENCE: u8 = 0x20;

/// PRE + LEN + SEQ + CMD + PST + BCC + ETX around an empty host payload.
const HOST_OVERHEAD: usize = 1 + 4 + 1 + 4 + 1 + 4 + 1;
/// Index of the first DATA byte.
const DATA_START: usize = 10;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One protocol unit. `status` is present on device-to-host frames only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u8,
    pub command: u16,
    pub data: Vec<u8>,
    pub status: Option<[u8; STATUS_LEN]>,
}

impl Frame {
    /// Host-to-device frame.
    pub fn request(sequence: u8, command: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence,
            command,
            data: data.into(),
            status: None,
        }
    }

    /// Device-to-host frame.
    pub fn reply(
        sequence: u8,
        command: u16,
        data: impl Into<Vec<u8>>,
        status: [u8; STATUS_LEN],
    ) -> Self {
        Self {
            sequence,
            command,
            data: data.into(),
            status: Some(status),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.status.is_some()
    }
}

// ---------------------------------------------------------------------------
// Digit encoding / checksum
// ---------------------------------------------------------------------------

/// 16-bit value -> four bytes in 0x30..=0x3F.
pub fn encode_digits(value: u16) -> [u8; 4] {
    [
        ((value >> 12) & 0x0F) as u8 + DIGIT_OFFSET,
        ((value >> 8) & 0x0F) as u8 + DIGIT_OFFSET,
        ((value >> 4) & 0x0F) as u8 + DIGIT_OFFSET,
        (value & 0x0F) as u8 + DIGIT_OFFSET,
    ]
}

/// Inverse of [`encode_digits`]; every byte must lie in 0x30..=0x3F.
pub fn decode_digits(bytes: &[u8]) -> Result<u16, FrameError> {
    if bytes.len() != 4 {
        return Err(FrameError::Malformed(format!(
            "digit field must be 4 bytes, got {}",
            bytes.len()
        )));
    }
    bytes.iter().try_fold(0u16, |acc, &b| {
        if !(DIGIT_OFFSET..=DIGIT_OFFSET + 0x0F).contains(&b) {
            return Err(FrameError::Malformed(format!(
                "digit byte 0x{b:02X} outside 0x30..=0x3F"
            )));
        }
        Ok((acc << 4) | u16::from(b - DIGIT_OFFSET))
    })
}

/// BCC: arithmetic sum modulo 0x10000.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encoder/decoder for wrapped frames.
///
/// With `escape_control_bytes` off (the default) DATA bytes below 0x20 other
/// than TAB are rejected. With it on they are sent as `0x10, b + 0x40`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    escape_control_bytes: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_escaping(escape_control_bytes: bool) -> Self {
        Self {
            escape_control_bytes,
        }
    }

    pub fn escapes_control_bytes(&self) -> bool {
        self.escape_control_bytes
    }

    /// Encode a frame to wire bytes. Request frames are capped at 213 DATA
    /// bytes, reply frames at 218 (after escaping).
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        if frame.sequence < MIN_SEQUENCE {
            return Err(FrameError::InvalidPayload(format!(
                "sequence 0x{:02X} below 0x20",
                frame.sequence
            )));
        }

        let data = self.escape(&frame.data)?;
        let limit = if frame.is_reply() {
            MAX_DEVICE_DATA
        } else {
            MAX_HOST_DATA
        };
        if data.len() > limit {
            return Err(FrameError::InvalidPayload(format!(
                "{} data bytes exceed the {limit}-byte limit",
                data.len()
            )));
        }

        let status_len = frame.status.map_or(0, |_| 1 + STATUS_LEN);
        let body_len = 4 + 1 + 4 + data.len() + status_len + 1;
        // body_len <= 19 + 218, so this never truncates
        let len_field = (body_len + usize::from(SPACE)) as u16;

        let mut out = Vec::with_capacity(body_len + 6);
        out.push(PREAMBLE);
        out.extend_from_slice(&encode_digits(len_field));
        out.push(frame.sequence);
        out.extend_from_slice(&encode_digits(frame.command));
        out.extend_from_slice(&data);
        if let Some(status) = frame.status {
            out.push(SEPARATOR);
            out.extend_from_slice(&status);
        }
        out.push(POSTAMBLE);
        let bcc = checksum(&out[1..]);
        out.extend_from_slice(&encode_digits(bcc));
        out.push(TERMINATOR);
        Ok(out)
    }

    /// Decode one complete frame, `PREAMBLE` through `TERMINATOR`.
    ///
    /// Structure is validated first, then BCC. An unknown command decodes
    /// normally; rejecting it is the device's business.
    pub fn decode(&self, raw: &[u8]) -> Result<Frame, FrameError> {
        if raw.len() < HOST_OVERHEAD {
            return Err(FrameError::Malformed(format!(
                "{} bytes is shorter than the smallest frame",
                raw.len()
            )));
        }
        if raw[0] != PREAMBLE {
            return Err(FrameError::Malformed(format!(
                "expected preamble 0x01, got 0x{:02X}",
                raw[0]
            )));
        }
        if raw[raw.len() - 1] != TERMINATOR {
            return Err(FrameError::Malformed("missing terminator 0x03".into()));
        }

        let postamble_at = frame_body_len(&raw[1..5])?;
        if raw.len() != postamble_at + 6 {
            return Err(FrameError::Malformed(format!(
                "LEN describes a {}-byte frame, got {} bytes",
                postamble_at + 6,
                raw.len()
            )));
        }
        if raw[postamble_at] != POSTAMBLE {
            return Err(FrameError::Malformed(format!(
                "expected postamble 0x05 at offset {postamble_at}, got 0x{:02X}",
                raw[postamble_at]
            )));
        }

        let actual = decode_digits(&raw[postamble_at + 1..postamble_at + 5])?;
        let expected = checksum(&raw[1..=postamble_at]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let sequence = raw[5];
        if sequence < MIN_SEQUENCE {
            return Err(FrameError::Malformed(format!(
                "sequence 0x{sequence:02X} below 0x20"
            )));
        }
        let command = decode_digits(&raw[6..DATA_START])?;

        let payload = &raw[DATA_START..postamble_at];
        let (wire_data, status) = match payload.iter().position(|&b| b == SEPARATOR) {
            Some(at) => {
                let status: [u8; STATUS_LEN] = payload[at + 1..].try_into().map_err(|_| {
                    FrameError::Malformed(format!(
                        "status field is {} bytes, expected {STATUS_LEN}",
                        payload.len() - at - 1
                    ))
                })?;
                (&payload[..at], Some(status))
            }
            None => (payload, None),
        };
        if wire_data.len() > MAX_DEVICE_DATA {
            return Err(FrameError::Malformed(format!(
                "{} data bytes exceed the {MAX_DEVICE_DATA}-byte limit",
                wire_data.len()
            )));
        }

        Ok(Frame {
            sequence,
            command,
            data: unescape(wire_data)?,
            status,
        })
    }

    fn escape(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(data.len());
        for (i, &b) in data.iter().enumerate() {
            if b >= SPACE || b == TAB {
                out.push(b);
            } else if self.escape_control_bytes {
                out.push(ESCAPE);
                out.push(b + ESCAPE_OFFSET);
            } else {
                return Err(FrameError::InvalidPayload(format!(
                    "byte 0x{b:02X} at offset {i} is outside 0x20..=0xFF"
                )));
            }
        }
        Ok(out)
    }
}

/// Offset of the postamble implied by a 4-byte LEN field.
///
/// The body runs from offset 1 (first LEN byte) through the postamble, so the
/// postamble sits at offset `LEN - 0x20`.
pub(crate) fn frame_body_len(len_field: &[u8]) -> Result<usize, FrameError> {
    let len = usize::from(decode_digits(len_field)?);
    let body = len
        .checked_sub(usize::from(SPACE))
        .ok_or_else(|| FrameError::Malformed(format!("LEN 0x{len:04X} below 0x20")))?;
    if body < DATA_START {
        return Err(FrameError::Malformed(format!(
            "LEN 0x{len:04X} too small for a frame"
        )));
    }
    Ok(body)
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&b) = bytes.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(&e) if (ESCAPE_OFFSET..ESCAPE_OFFSET + SPACE).contains(&e) => {
                out.push(e - ESCAPE_OFFSET)
            }
            Some(&e) => {
                return Err(FrameError::Malformed(format!(
                    "invalid escape sequence 0x10 0x{e:02X}"
                )))
            }
            None => return Err(FrameError::Malformed("dangling escape byte".into())),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: [u8; 8] = [0x80, 0x80, 0x80, 0x80, 0x86, 0x9A, 0x80, 0x80];

    #[test]
    fn test_digit_encoding() {
        assert_eq!(encode_digits(0x004A), [0x30, 0x30, 0x34, 0x3A]);
        assert_eq!(encode_digits(0xFFFF), [0x3F, 0x3F, 0x3F, 0x3F]);
        assert_eq!(decode_digits(&[0x30, 0x30, 0x34, 0x3A]).unwrap(), 0x004A);
        assert!(decode_digits(&[0x30, 0x30, 0x34, b'A']).is_err());
        assert!(decode_digits(&[0x30, 0x30]).is_err());
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 6);
        let big = vec![0xFF; 300];
        assert_eq!(checksum(&big), ((0xFFu32 * 300) % 0x10000) as u16);
    }

    #[test]
    fn test_encode_status_request_layout() {
        let wire = FrameCodec::new()
            .encode(&Frame::request(0x20, 0x4A, Vec::new()))
            .unwrap();
        // LEN = 10 + 0x20 = 0x2A
        assert_eq!(
            &wire[..11],
            &[0x01, 0x30, 0x30, 0x32, 0x3A, 0x20, 0x30, 0x30, 0x34, 0x3A, 0x05]
        );
        let bcc = checksum(&wire[1..11]);
        assert_eq!(&wire[11..15], &encode_digits(bcc));
        assert_eq!(wire[15], 0x03);
        assert_eq!(wire.len(), 16);
    }

    #[test]
    fn test_encode_reply_length_field() {
        let frame = Frame::reply(0x21, 0x4A, b"0\t".to_vec(), STATUS);
        let wire = FrameCodec::new().encode(&frame).unwrap();
        let len = decode_digits(&wire[1..5]).unwrap();
        assert_eq!(usize::from(len), 19 + 2 + 0x20);
        assert_eq!(wire[12], SEPARATOR);
        assert_eq!(&wire[13..21], &STATUS);
        assert_eq!(wire[21], POSTAMBLE);
    }

    #[test]
    fn test_round_trip_request_and_reply() {
        let codec = FrameCodec::new();
        let request = Frame::request(0x7F, 0x0031, b"Coffee\tA\t3.50\t2\t".to_vec());
        assert_eq!(codec.decode(&codec.encode(&request).unwrap()).unwrap(), request);

        let reply = Frame::reply(0xFF, 0x005A, vec![0xC0, 0xFF, 0x20, TAB], STATUS);
        assert_eq!(codec.decode(&codec.encode(&reply).unwrap()).unwrap(), reply);
    }

    /// Every byte a DATA field may carry literally.
    fn literal_alphabet() -> Vec<u8> {
        std::iter::once(TAB).chain(SPACE..=0xFF).collect()
    }

    fn fill(len: usize, offset: usize, alphabet: &[u8]) -> Vec<u8> {
        (0..len)
            .map(|i| alphabet[(i + offset) % alphabet.len()])
            .collect()
    }

    #[test]
    fn test_round_trip_sweep_sequences_lengths_commands() {
        let alphabet = literal_alphabet();
        for codec in [FrameCodec::new(), FrameCodec::with_escaping(true)] {
            for sequence in MIN_SEQUENCE..=0xFF {
                let offset = usize::from(sequence);
                for command in [0x0000, 0x004A, 0xFFFF] {
                    for len in [0, 1, MAX_HOST_DATA - 1, MAX_HOST_DATA] {
                        let request =
                            Frame::request(sequence, command, fill(len, offset, &alphabet));
                        let wire = codec.encode(&request).unwrap();
                        assert_eq!(wire.len(), len + HOST_OVERHEAD);
                        assert_eq!(codec.decode(&wire).unwrap(), request);
                    }
                    for len in [0, 1, MAX_DEVICE_DATA - 1, MAX_DEVICE_DATA] {
                        let reply =
                            Frame::reply(sequence, command, fill(len, offset, &alphabet), STATUS);
                        let wire = codec.encode(&reply).unwrap();
                        assert_eq!(codec.decode(&wire).unwrap(), reply);
                    }
                }
            }
        }
    }

    #[test]
    fn test_round_trip_sweep_byte_values() {
        let plain = FrameCodec::new();
        for byte in literal_alphabet() {
            let frame = Frame::request(0x20, 0x36, vec![byte, byte]);
            assert_eq!(plain.decode(&plain.encode(&frame).unwrap()).unwrap(), frame);
        }

        // with escaping every byte value survives, control bytes included
        let escaping = FrameCodec::with_escaping(true);
        for byte in 0..=0xFFu8 {
            let frame = Frame::reply(0x20, 0x36, vec![byte, b'x', byte], STATUS);
            assert_eq!(escaping.decode(&escaping.encode(&frame).unwrap()).unwrap(), frame);
        }
        let all: Vec<u8> = (0..=0xFFu8).collect();
        for chunk in all.chunks(64) {
            let frame = Frame::request(0x20, 0x36, chunk.to_vec());
            assert_eq!(escaping.decode(&escaping.encode(&frame).unwrap()).unwrap(), frame);
        }
    }

    #[test]
    fn test_encode_rejects_control_bytes_by_default() {
        let err = FrameCodec::new()
            .encode(&Frame::request(0x20, 0x31, vec![b'A', 0x03]))
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidPayload(_)));
    }

    #[test]
    fn test_escaping_round_trip() {
        let codec = FrameCodec::with_escaping(true);
        let frame = Frame::request(0x20, 0x36, vec![b'x', 0x01, ESCAPE, 0x1F, TAB]);
        let wire = codec.encode(&frame).unwrap();
        assert_eq!(&wire[10..17], &[b'x', 0x10, 0x41, 0x10, 0x50, 0x10, 0x5F]);
        assert_eq!(wire[17], TAB);
        assert_eq!(codec.decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_data_limits() {
        let codec = FrameCodec::new();
        assert!(codec
            .encode(&Frame::request(0x20, 0x36, vec![b'a'; MAX_HOST_DATA]))
            .is_ok());
        assert!(matches!(
            codec.encode(&Frame::request(0x20, 0x36, vec![b'a'; MAX_HOST_DATA + 1])),
            Err(FrameError::InvalidPayload(_))
        ));
        assert!(codec
            .encode(&Frame::reply(0x20, 0x36, vec![b'a'; MAX_DEVICE_DATA], STATUS))
            .is_ok());
        // escaping counts against the limit
        let escaped = FrameCodec::with_escaping(true);
        assert!(escaped
            .encode(&Frame::request(0x20, 0x36, vec![0x01; 107]))
            .is_err());
    }

    #[test]
    fn test_encode_rejects_low_sequence() {
        assert!(FrameCodec::new()
            .encode(&Frame::request(0x1F, 0x4A, Vec::new()))
            .is_err());
    }

    #[test]
    fn test_flipped_payload_bit_is_checksum_mismatch() {
        let codec = FrameCodec::new();
        let wire = codec
            .encode(&Frame::reply(0x30, 0x4A, b"0\tOK\t".to_vec(), STATUS))
            .unwrap();
        // every bit of every DATA and STATUS byte
        for at in DATA_START..wire.len() - 6 {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[at] ^= 1 << bit;
                let err = codec.decode(&corrupted).unwrap_err();
                assert!(
                    matches!(err, FrameError::ChecksumMismatch { .. }),
                    "offset {at} bit {bit}: {err:?}"
                );
            }
        }
    }

    #[test]
    fn test_decode_structural_failures() {
        let codec = FrameCodec::new();
        let wire = codec.encode(&Frame::request(0x20, 0x4A, Vec::new())).unwrap();

        assert!(matches!(codec.decode(&wire[..10]), Err(FrameError::Malformed(_))));

        let mut no_pre = wire.clone();
        no_pre[0] = 0x02;
        assert!(matches!(codec.decode(&no_pre), Err(FrameError::Malformed(_))));

        let mut no_term = wire.clone();
        *no_term.last_mut().unwrap() = 0x04;
        assert!(matches!(codec.decode(&no_term), Err(FrameError::Malformed(_))));

        let mut extra = wire.clone();
        extra.insert(10, b'x');
        assert!(matches!(codec.decode(&extra), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_unknown_command_decodes() {
        let codec = FrameCodec::new();
        let wire = codec
            .encode(&Frame::reply(0x20, 0xBEEF, Vec::new(), STATUS))
            .unwrap();
        let frame = codec.decode(&wire).unwrap();
        assert_eq!(frame.command, 0xBEEF);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_short_status_is_malformed() {
        let codec = FrameCodec::new();
        let mut wire = vec![PREAMBLE];
        let body = [0x20, 0x30, 0x30, 0x34, 0x3A, SEPARATOR, 0x80, 0x80, POSTAMBLE];
        wire.extend_from_slice(&encode_digits((4 + body.len() + 0x20) as u16));
        wire.extend_from_slice(&body);
        let bcc = checksum(&wire[1..]);
        wire.extend_from_slice(&encode_digits(bcc));
        wire.push(TERMINATOR);
        assert!(matches!(codec.decode(&wire), Err(FrameError::Malformed(_))));
    }
}
