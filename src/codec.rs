//! FIX tag/value wire codec.
//!
//! A frame is a sequence of `TAG=VALUE` groups delimited by SOH (0x01):
//! `8=BeginString`, `9=BodyLength`, the body (starting with `35=MsgType`),
//! and a `10=nnn` checksum trailer. Body length counts the bytes between
//! the SOH after field 9 and the SOH before field 10; the checksum is the
//! sum of all preceding frame bytes mod 256, rendered as three zero-padded
//! digits.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;

use crate::message::InboundMessage;

pub const SOH: u8 = 0x01; // ASCII control-A

/// Frame start marker used for stream resynchronization.
const FRAME_PREFIX: &[u8] = b"8=FIX";

/// `10=nnn<SOH>` is fixed-size.
const CHECKSUM_FIELD_LEN: usize = 7;

/// The FIX tag numbers this crate reads or writes.
pub mod tags {
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const END_SEQ_NO: u32 = 16;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDER_SUB_ID: u32 = 50;
    pub const SENDING_TIME: u32 = 52;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const ON_BEHALF_OF_COMP_ID: u32 = 115;
    pub const ON_BEHALF_OF_SUB_ID: u32 = 116;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("field {tag} value contains a byte illegal on the wire (SOH or '=')")]
    IllegalByte { tag: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing required field: tag {0}")]
    MissingRequiredField(u32),

    #[error("MsgSeqNum is not a non-negative integer: {0:?}")]
    InvalidSeqNum(String),

    #[error("malformed field: {0:?}")]
    MalformedField(String),

    #[error("frame parse failed: {0}")]
    ParseException(String),
}

/// Sum-mod-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Serializes an ordered body field list (starting with `35=`) into a
/// complete frame: `8=`, `9=` computed over the rendered body, the body,
/// then the `10=` trailer.
pub fn encode_frame(begin_string: &str, body_fields: &[(u32, String)]) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::with_capacity(64 + body_fields.len() * 16);
    for (tag, value) in body_fields {
        if value.bytes().any(|b| b == SOH || b == b'=') {
            return Err(EncodeError::IllegalByte { tag: *tag });
        }
        body.extend_from_slice(tag.to_string().as_bytes());
        body.put_u8(b'=');
        body.extend_from_slice(value.as_bytes());
        body.put_u8(SOH);
    }

    let mut frame = BytesMut::with_capacity(body.len() + 32);
    frame.extend_from_slice(begin_string_field(begin_string).as_bytes());
    frame.extend_from_slice(format!("9={}\x01", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    let ck = checksum(&frame);
    frame.extend_from_slice(format!("10={ck:03}\x01").as_bytes());
    Ok(frame.freeze())
}

fn begin_string_field(begin_string: &str) -> String {
    format!("8={begin_string}\x01")
}

/// Parses one complete frame into an [`InboundMessage`].
///
/// All `(tag, value)` pairs are kept in wire order, headers and trailer
/// included, because repeating-group semantics are positional. Checksum and
/// body length are NOT validated here; see [`verify_checksum`].
pub fn parse_frame(frame: &[u8]) -> Result<InboundMessage, ParseError> {
    let trimmed = frame.strip_suffix(&[SOH]).unwrap_or(frame);
    let mut fields: Vec<(u32, String)> = Vec::new();
    for part in trimmed.split(|b| *b == SOH) {
        if part.is_empty() {
            continue;
        }
        let s = std::str::from_utf8(part)
            .map_err(|e| ParseError::ParseException(format!("non-utf8 field: {e}")))?;
        let (tag, value) = s
            .split_once('=')
            .ok_or_else(|| ParseError::MalformedField(s.to_string()))?;
        let tag: u32 = tag
            .parse()
            .map_err(|_| ParseError::MalformedField(s.to_string()))?;
        fields.push((tag, value.to_string()));
    }

    let msg_type = field_value(&fields, tags::MSG_TYPE)
        .ok_or(ParseError::MissingRequiredField(tags::MSG_TYPE))?
        .to_string();
    let seq_raw = field_value(&fields, tags::MSG_SEQ_NUM)
        .ok_or(ParseError::MissingRequiredField(tags::MSG_SEQ_NUM))?;
    let seq_num: u64 = seq_raw
        .parse()
        .map_err(|_| ParseError::InvalidSeqNum(seq_raw.to_string()))?;
    let poss_dup = field_value(&fields, tags::POSS_DUP_FLAG) == Some("Y");
    let complete = fields.last().map(|(tag, _)| *tag) == Some(tags::CHECK_SUM);

    Ok(InboundMessage {
        msg_type,
        seq_num,
        poss_dup,
        fields,
        raw: Bytes::copy_from_slice(frame),
        valid: true,
        complete,
    })
}

fn field_value(fields: &[(u32, String)], tag: u32) -> Option<&str> {
    fields
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, v)| v.as_str())
}

/// Checks the `10=nnn` trailer against the sum of the preceding bytes.
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() < CHECKSUM_FIELD_LEN || frame[frame.len() - 1] != SOH {
        return false;
    }
    let trailer = &frame[frame.len() - CHECKSUM_FIELD_LEN..];
    if !trailer.starts_with(b"10=") {
        return false;
    }
    let digits = &trailer[3..6];
    if !digits.iter().all(u8::is_ascii_digit) {
        return false;
    }
    let declared = digits
        .iter()
        .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
    declared <= u32::from(u8::MAX)
        && checksum(&frame[..frame.len() - CHECKSUM_FIELD_LEN]) == declared as u8
}

/// Splits every complete frame off the front of `buffer`, leaving partial
/// tail bytes in place for the next read.
///
/// Framing is body-length-driven: locate `8=FIX`, read `9=<n>`, and slice
/// `n` body bytes plus the fixed-size trailer. A frame whose length field is
/// unusable (or whose trailer is not where the length says) is skipped by
/// resynchronizing at the next `8=FIX` prefix.
pub fn split_stream(buffer: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        let data: &[u8] = buffer.as_ref();
        let Some(start) = memmem::find(data, FRAME_PREFIX) else {
            // Keep a short tail in case a prefix straddles two reads.
            let keep = data.len().min(FRAME_PREFIX.len() - 1);
            let drop_len = data.len() - keep;
            if drop_len > 0 {
                buffer.advance(drop_len);
            }
            return frames;
        };
        match probe_frame(&data[start..]) {
            FrameStatus::Complete(len) => {
                if start > 0 {
                    buffer.advance(start);
                }
                frames.push(buffer.split_to(len).freeze());
            }
            FrameStatus::Partial => {
                if start > 0 {
                    buffer.advance(start);
                }
                return frames;
            }
            FrameStatus::Garbled => {
                tracing::warn!("garbled frame header; resynchronizing at next prefix");
                buffer.advance(start + 1);
            }
        }
    }
}

enum FrameStatus {
    /// A whole frame of this many bytes is available.
    Complete(usize),
    /// More bytes are needed.
    Partial,
    /// The header cannot be trusted; skip this prefix.
    Garbled,
}

/// `data` starts at an `8=FIX` prefix.
fn probe_frame(data: &[u8]) -> FrameStatus {
    let Some(begin_end) = memchr::memchr(SOH, data) else {
        return FrameStatus::Partial;
    };
    let rest = &data[begin_end + 1..];
    if !rest.starts_with(b"9=") {
        return if rest.len() < 2 {
            FrameStatus::Partial
        } else {
            FrameStatus::Garbled
        };
    }
    let Some(len_end) = memchr::memchr(SOH, rest) else {
        return FrameStatus::Partial;
    };
    let len_digits = &rest[2..len_end];
    if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
        return FrameStatus::Garbled;
    }
    let body_len = match std::str::from_utf8(len_digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    {
        Some(n) => n,
        None => return FrameStatus::Garbled,
    };

    let body_start = begin_end + 1 + len_end + 1;
    let Some(trailer_start) = body_start.checked_add(body_len) else {
        return FrameStatus::Garbled;
    };
    let Some(total) = trailer_start.checked_add(CHECKSUM_FIELD_LEN) else {
        return FrameStatus::Garbled;
    };
    if data.len() < total {
        return FrameStatus::Partial;
    }
    if !data[trailer_start..].starts_with(b"10=") || data[total - 1] != SOH {
        return FrameStatus::Garbled;
    }
    FrameStatus::Complete(total)
}

/// Renders a frame for humans: SOH becomes `|`.
pub fn render_readable(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|&b| if b == SOH { '|' } else { char::from(b) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soh(s: &str) -> Vec<u8> {
        s.replace('|', "\x01").into_bytes()
    }

    #[test]
    fn parses_application_frame() {
        // 9 and 10 are deliberately not validated by parse_frame.
        let frame = soh(
            "8=FIX.4.4|9=100|35=D|34=42|49=SENDER|56=TARGET|52=20250104-14:30:45|55=BTC-USD|10=123|",
        );
        let msg = parse_frame(&frame).unwrap();
        assert_eq!(msg.msg_type, "D");
        assert_eq!(msg.seq_num, 42);
        assert!(!msg.poss_dup);
        assert!(msg.valid);
        assert!(msg.complete);
        assert!(msg
            .fields
            .contains(&(55, "BTC-USD".to_string())));
        assert_eq!(msg.raw, Bytes::from(frame));
    }

    #[test]
    fn rejects_missing_seq_num() {
        let err = parse_frame(&soh("8=FIX.4.4|35=D|10=123|")).unwrap_err();
        assert_eq!(err, ParseError::MissingRequiredField(tags::MSG_SEQ_NUM));
    }

    #[test]
    fn rejects_missing_msg_type() {
        let err = parse_frame(&soh("8=FIX.4.4|34=3|10=123|")).unwrap_err();
        assert_eq!(err, ParseError::MissingRequiredField(tags::MSG_TYPE));
    }

    #[test]
    fn rejects_non_integer_seq_num() {
        let err = parse_frame(&soh("8=FIX.4.4|35=D|34=abc|10=123|")).unwrap_err();
        assert_eq!(err, ParseError::InvalidSeqNum("abc".to_string()));
    }

    #[test]
    fn rejects_field_without_separator() {
        let err = parse_frame(&soh("8=FIX.4.4|35=D|34=1|BADFIELD|10=123|")).unwrap_err();
        assert_eq!(err, ParseError::MalformedField("BADFIELD".to_string()));
    }

    #[test]
    fn detects_poss_dup() {
        let msg = parse_frame(&soh("8=FIX.4.4|35=D|34=9|43=Y|10=123|")).unwrap();
        assert!(msg.poss_dup);
    }

    #[test]
    fn checksum_matches_byte_sum() {
        let fields = vec![
            (tags::MSG_TYPE, "A".to_string()),
            (tags::MSG_SEQ_NUM, "1".to_string()),
            (tags::SENDER_COMP_ID, "S".to_string()),
            (tags::TARGET_COMP_ID, "T".to_string()),
        ];
        let frame = encode_frame("FIX.4.4", &fields).unwrap();

        let prefix = soh("8=FIX.4.4|9=20|35=A|34=1|49=S|56=T|");
        let expected = prefix.iter().map(|b| u32::from(*b)).sum::<u32>() % 256;
        let rendered = render_readable(&frame);
        assert!(frame.starts_with(&prefix), "frame was {rendered}");
        assert!(rendered.ends_with(&format!("10={expected:03}|")));
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn body_length_spans_body_only() {
        let fields = vec![
            (tags::MSG_TYPE, "0".to_string()),
            (tags::MSG_SEQ_NUM, "7".to_string()),
        ];
        let frame = encode_frame("FIX.4.4", &fields).unwrap();
        // body is "35=0|34=7|" = 10 bytes
        assert!(render_readable(&frame).starts_with("8=FIX.4.4|9=10|"));
    }

    #[test]
    fn encode_rejects_illegal_value_bytes() {
        let fields = vec![(tags::MSG_TYPE, "D".to_string()), (58, "a=b".to_string())];
        assert_eq!(
            encode_frame("FIX.4.4", &fields).unwrap_err(),
            EncodeError::IllegalByte { tag: 58 }
        );

        let fields = vec![(tags::MSG_TYPE, "D".to_string()), (58, "a\x01b".to_string())];
        assert!(encode_frame("FIX.4.4", &fields).is_err());
    }

    #[test]
    fn build_parse_round_trip_preserves_order() {
        let fields = vec![
            (tags::MSG_TYPE, "8".to_string()),
            (tags::SENDER_COMP_ID, "S".to_string()),
            (tags::TARGET_COMP_ID, "T".to_string()),
            (tags::MSG_SEQ_NUM, "17".to_string()),
            // repeating group, order-sensitive
            (269, "0".to_string()),
            (270, "100.5".to_string()),
            (269, "1".to_string()),
            (270, "101.5".to_string()),
        ];
        let frame = encode_frame("FIX.4.4", &fields).unwrap();
        let msg = parse_frame(&frame).unwrap();

        assert_eq!(msg.msg_type, "8");
        assert_eq!(msg.seq_num, 17);
        // wire order survives, with 8/9 prepended and 10 appended
        let without_envelope: Vec<(u32, String)> = msg
            .fields
            .iter()
            .filter(|(t, _)| *t != tags::BEGIN_STRING && *t != tags::BODY_LENGTH && *t != tags::CHECK_SUM)
            .cloned()
            .collect();
        assert_eq!(without_envelope, fields);
    }

    #[test]
    fn splits_concatenated_frames_and_keeps_tail() {
        let a = encode_frame("FIX.4.4", &[(35, "0".to_string()), (34, "1".to_string())]).unwrap();
        let b = encode_frame("FIX.4.4", &[(35, "0".to_string()), (34, "2".to_string())]).unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&a);
        buffer.extend_from_slice(&b);
        buffer.extend_from_slice(&b[..6]); // partial third frame

        let frames = split_stream(&mut buffer);
        assert_eq!(frames, vec![a, b.clone()]);
        assert_eq!(&buffer[..], &b[..6]);

        // completing the tail yields the third frame
        buffer.extend_from_slice(&b[6..]);
        assert_eq!(split_stream(&mut buffer), vec![b]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn skips_leading_garbage() {
        let frame = encode_frame("FIX.4.4", &[(35, "0".to_string()), (34, "1".to_string())]).unwrap();
        let mut buffer = BytesMut::from(&b"noise before the frame"[..]);
        buffer.extend_from_slice(&frame);

        assert_eq!(split_stream(&mut buffer), vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn resyncs_past_garbled_length() {
        let good = encode_frame("FIX.4.4", &[(35, "0".to_string()), (34, "5".to_string())]).unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&soh("8=FIX.4.4|9=oops|35=0|"));
        buffer.extend_from_slice(&good);

        assert_eq!(split_stream(&mut buffer), vec![good]);
    }

    #[test]
    fn holds_partial_header() {
        let mut buffer = BytesMut::from(&b"8=FIX.4.4\x019=12"[..]);
        assert!(split_stream(&mut buffer).is_empty());
        assert_eq!(&buffer[..], b"8=FIX.4.4\x019=12");
    }

    #[test]
    fn rejects_tampered_checksum() {
        let frame = encode_frame("FIX.4.4", &[(35, "0".to_string()), (34, "1".to_string())]).unwrap();
        let mut bad = frame.to_vec();
        let len = bad.len();
        bad[len - 2] = if bad[len - 2] == b'9' { b'8' } else { b'9' };
        assert!(!verify_checksum(&bad));
    }

    #[test]
    fn renders_soh_as_pipe() {
        assert_eq!(render_readable(&soh("8=FIX.4.4|9=5|")), "8=FIX.4.4|9=5|");
    }
}
