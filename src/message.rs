//! Outbound message builder and parsed inbound messages.

use bytes::Bytes;

use crate::codec::{self, tags};

/// MsgType (35) values with session-level meaning.
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
}

/// Value slot for one tag in an outbound message.
///
/// A tag written once holds a single value; writing it again turns the slot
/// into an ordered list, reproducing FIX repeating-group semantics without
/// schema awareness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    One(String),
    Many(Vec<String>),
}

impl FieldValue {
    fn push(&mut self, value: String) {
        match self {
            Self::One(first) => {
                *self = Self::Many(vec![std::mem::take(first), value]);
            }
            Self::Many(values) => values.push(value),
        }
    }
}

/// A user-authored outbound FIX message: a message type plus an ordered
/// body field list. Standard headers are stamped by the session at send
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixMessage {
    msg_type: String,
    fields: Vec<(u32, FieldValue)>,
}

impl FixMessage {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            fields: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Sets a field, preserving insertion order. Writing the same tag again
    /// appends to that tag's ordered value list.
    pub fn set_field(&mut self, tag: u32, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.fields.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, slot)) => slot.push(value),
            None => self.fields.push((tag, FieldValue::One(value))),
        }
        self
    }

    /// Bulk setter; equivalent to calling [`set_field`](Self::set_field) per
    /// pair.
    pub fn set_fields<I, V>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (u32, V)>,
        V: Into<String>,
    {
        for (tag, value) in fields {
            self.set_field(tag, value);
        }
        self
    }

    pub fn get_field(&self, tag: u32) -> Option<&FieldValue> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    pub fn has_field(&self, tag: u32) -> bool {
        self.fields.iter().any(|(t, _)| *t == tag)
    }

    /// Removes a tag entirely, returning what it held.
    pub fn remove_field(&mut self, tag: u32) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|(t, _)| *t == tag)?;
        Some(self.fields.remove(idx).1)
    }

    /// Flattens the body back into repeated `(tag, value)` entries in
    /// insertion order, ready for the wire.
    pub fn wire_fields(&self) -> Vec<(u32, String)> {
        let mut out = Vec::with_capacity(self.fields.len());
        for (tag, slot) in &self.fields {
            match slot {
                FieldValue::One(v) => out.push((*tag, v.clone())),
                FieldValue::Many(vs) => out.extend(vs.iter().map(|v| (*tag, v.clone()))),
            }
        }
        out
    }

    // Admin message shorthands. The session stamps comp IDs, sequence
    // number, and sending time; only type-specific body fields live here.

    pub fn heartbeat(test_req_id: Option<&str>) -> Self {
        let mut msg = Self::new(msg_type::HEARTBEAT);
        if let Some(id) = test_req_id {
            msg.set_field(tags::TEST_REQ_ID, id);
        }
        msg
    }

    pub fn logout(text: Option<&str>) -> Self {
        let mut msg = Self::new(msg_type::LOGOUT);
        if let Some(t) = text {
            msg.set_field(tags::TEXT, t);
        }
        msg
    }

    pub fn resend_request(begin_seq_no: u64, end_seq_no: u64) -> Self {
        let mut msg = Self::new(msg_type::RESEND_REQUEST);
        msg.set_field(tags::BEGIN_SEQ_NO, begin_seq_no.to_string());
        msg.set_field(tags::END_SEQ_NO, end_seq_no.to_string());
        msg
    }

    pub fn sequence_reset(new_seq_no: u64, gap_fill: bool) -> Self {
        let mut msg = Self::new(msg_type::SEQUENCE_RESET);
        msg.set_field(tags::NEW_SEQ_NO, new_seq_no.to_string());
        if gap_fill {
            msg.set_field(tags::GAP_FILL_FLAG, "Y");
        }
        msg
    }
}

/// The parsed form of a received wire frame.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// MsgType (35) as received.
    pub msg_type: String,
    /// MsgSeqNum (34).
    pub seq_num: u64,
    /// True iff PossDupFlag (43) is `Y`. Advisory metadata for the handler;
    /// the session never counts duplicates as sequence progress.
    pub poss_dup: bool,
    /// Every `(tag, value)` pair in wire order, headers and trailer
    /// included.
    pub fields: Vec<(u32, String)>,
    /// The exact received frame, for forensic logging.
    pub raw: Bytes,
    pub valid: bool,
    pub complete: bool,
}

impl InboundMessage {
    /// First occurrence of `tag`.
    pub fn get_field(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    /// Every occurrence of `tag`, in wire order.
    pub fn get_fields(&self, tag: u32) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn has_field(&self, tag: u32) -> bool {
        self.fields.iter().any(|(t, _)| *t == tag)
    }
}

impl std::fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&codec::render_readable(&self.raw))
    }
}
