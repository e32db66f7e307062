// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire frame codec.
//!
//! Every message on a link is one frame: a fixed 15-byte header followed
//! by `length` body bytes. All multi-byte fields are network byte order.
//!
//! ```text
//! +---------+-----------+--------+-----------+-------------+----------+
//! | type:u16| origin:i32| flag:u8| length:u32| checksum:u32|  body    |
//! +---------+-----------+--------+-----------+-------------+----------+
//! |<----------------- 15 bytes ------------------------->|<-length->|
//! ```
//!
//! The checksum is not a content hash: it is the fixed magic constant
//! `0x1FE23DC4` acting as a frame-sync guard. A mismatch means the
//! stream position is lost and the connection must be closed; the
//! protocol has no resync strategy.
//!
//! `flag` distinguishes SYSTEM frames (keepalive, link authentication,
//! subscription — handled inside the transport) from APPLICATION frames
//! (dispatched to registered handlers by type).

/// Frame-sync magic stamped into every header's checksum field.
pub const CHECK_MAGIC: u32 = 0x1FE2_3DC4;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 15;

/// Frame carries a system message (type is one of [`sys`]).
pub const FLAG_SYSTEM: u8 = 0;

/// Frame carries an application message.
pub const FLAG_APPLICATION: u8 = 1;

/// Maximum user name length in a link-auth request body.
pub const USER_MAX_LEN: usize = 32;

/// Maximum password length in a link-auth request body.
pub const PASSWORD_MAX_LEN: usize = 16;

/// System message types (`flag == FLAG_SYSTEM`).
pub mod sys {
    /// Link authentication request (first frame on every new link).
    pub const LINK_AUTH_REQ: u16 = 1;
    /// Link authentication reply.
    pub const LINK_AUTH_RSP: u16 = 2;
    /// Keepalive probe.
    pub const KEEPALIVE_REQ: u16 = 3;
    /// Keepalive acknowledgement.
    pub const KEEPALIVE_RSP: u16 = 4;
    /// Subscribe to an application message type (fan-out delivery).
    pub const SUBSCRIBE_REQ: u16 = 5;
}

// ============================================================================
// Header
// ============================================================================

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message kind. System types for SYSTEM frames, application types
    /// (`0..type_max`) otherwise.
    pub msg_type: u16,

    /// Logical node id of the sender.
    pub origin: i32,

    /// [`FLAG_SYSTEM`] or [`FLAG_APPLICATION`].
    pub flag: u8,

    /// Body byte count.
    pub length: u32,
}

impl FrameHeader {
    /// Header for a system frame.
    pub fn system(msg_type: u16, origin: i32, length: u32) -> Self {
        Self {
            msg_type,
            origin,
            flag: FLAG_SYSTEM,
            length,
        }
    }

    /// Header for an application frame.
    pub fn application(msg_type: u16, origin: i32, length: u32) -> Self {
        Self {
            msg_type,
            origin,
            flag: FLAG_APPLICATION,
            length,
        }
    }

    /// Whether this frame is handled inside the transport.
    pub fn is_system(&self) -> bool {
        self.flag == FLAG_SYSTEM
    }

    /// Total wire length of the frame (header + body).
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    /// Append the 15 wire bytes (magic stamped) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.msg_type.to_be_bytes());
        buf.extend_from_slice(&self.origin.to_be_bytes());
        buf.push(self.flag);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&CHECK_MAGIC.to_be_bytes());
    }
}

/// Build a complete wire frame from header fields and a body.
///
/// `length` is taken from `body.len()`; the magic is stamped.
pub fn encode(msg_type: u16, origin: i32, flag: u8, body: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        msg_type,
        origin,
        flag,
        length: body.len() as u32,
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    header.encode_into(&mut buf);
    buf.extend_from_slice(body);
    buf
}

// ============================================================================
// Decoding
// ============================================================================

/// Result of attempting to decode one frame from a buffer window.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<'a> {
    /// The window does not yet hold a complete frame.
    NeedMore,

    /// Checksum/type/length validation failed. Connection-fatal: the
    /// caller must close the connection, there is no resync.
    Corrupt,

    /// One complete, validated frame.
    Frame {
        /// Parsed header fields.
        header: FrameHeader,
        /// Body bytes (borrowed from the window).
        body: &'a [u8],
        /// Bytes to consume from the window (header + body).
        consumed: usize,
    },
}

/// Try to decode one frame from `window` without consuming it.
///
/// Never blocks and never reads past the window. `max_body` bounds the
/// claimed body length (a frame that could never fit the receive buffer
/// is corrupt, not "large"); `type_max` bounds the type field.
pub fn try_decode(window: &[u8], max_body: usize, type_max: u16) -> DecodeOutcome<'_> {
    if window.len() < HEADER_SIZE {
        return DecodeOutcome::NeedMore;
    }

    let msg_type = u16::from_be_bytes([window[0], window[1]]);
    let origin = i32::from_be_bytes([window[2], window[3], window[4], window[5]]);
    let flag = window[6];
    let length = u32::from_be_bytes([window[7], window[8], window[9], window[10]]);
    let checksum = u32::from_be_bytes([window[11], window[12], window[13], window[14]]);

    if checksum != CHECK_MAGIC
        || flag > FLAG_APPLICATION
        || msg_type >= type_max
        || length as usize > max_body
    {
        return DecodeOutcome::Corrupt;
    }

    let total = HEADER_SIZE + length as usize;
    if window.len() < total {
        return DecodeOutcome::NeedMore;
    }

    DecodeOutcome::Frame {
        header: FrameHeader {
            msg_type,
            origin,
            flag,
            length,
        },
        body: &window[HEADER_SIZE..total],
        consumed: total,
    }
}

// ============================================================================
// System message bodies
// ============================================================================

/// Link authentication request body (52 bytes).
///
/// Credentials are fixed-width NUL-padded fields; the node id is the
/// sender's claimed logical identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkAuthReq {
    pub node_id: i32,
    pub user: String,
    pub password: String,
}

impl LinkAuthReq {
    /// Wire size of the body.
    pub const WIRE_LEN: usize = 4 + USER_MAX_LEN + PASSWORD_MAX_LEN;

    /// Encode to the fixed 52-byte body. Credentials longer than the
    /// field are truncated (config validation rejects them earlier).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        push_padded(&mut buf, self.user.as_bytes(), USER_MAX_LEN);
        push_padded(&mut buf, self.password.as_bytes(), PASSWORD_MAX_LEN);
        buf
    }

    /// Decode from a body; `None` on size mismatch or non-UTF-8 fields.
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != Self::WIRE_LEN {
            return None;
        }
        let node_id = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let user = take_padded(&body[4..4 + USER_MAX_LEN])?;
        let password = take_padded(&body[4 + USER_MAX_LEN..])?;
        Some(Self {
            node_id,
            user,
            password,
        })
    }
}

/// Link authentication reply body (8 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkAuthRsp {
    pub node_id: i32,
    pub succ: bool,
}

impl LinkAuthRsp {
    /// Wire size of the body.
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        buf.extend_from_slice(&(i32::from(self.succ)).to_be_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != Self::WIRE_LEN {
            return None;
        }
        let node_id = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let succ = i32::from_be_bytes([body[4], body[5], body[6], body[7]]) == 1;
        Some(Self { node_id, succ })
    }
}

/// Subscribe request body (2 bytes): the application type to fan out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeReq {
    pub msg_type: u16,
}

impl SubscribeReq {
    /// Wire size of the body.
    pub const WIRE_LEN: usize = 2;

    pub fn encode(&self) -> Vec<u8> {
        self.msg_type.to_be_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            msg_type: u16::from_be_bytes([body[0], body[1]]),
        })
    }
}

fn push_padded(buf: &mut Vec<u8>, field: &[u8], width: usize) {
    let take = field.len().min(width);
    buf.extend_from_slice(&field[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

fn take_padded(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec()).ok()
}

// ============================================================================
// Tests
// ============================================================================
