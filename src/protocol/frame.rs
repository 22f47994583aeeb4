use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::protocol::error::ProtocolError;

/// Biggest message body an NDT5 frame can carry - the length field is a u16.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

pub const HEADER_SIZE: usize = 3;

/// Biggest complete frame on the wire: header plus maximum body.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_MESSAGE_SIZE;

/// The message-type byte of an NDT5 frame. Servers are free to introduce new
///  types, so decoding never fails: unknown bytes land in the catch-all
///  variant and are rejected later by whichever protocol step sees them.
#[derive(Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    SrvQueue = 1,
    Login = 2,
    TestPrepare = 3,
    TestStart = 4,
    TestMsg = 5,
    TestFinalize = 6,
    Results = 8,
    Logout = 9,
    ExtendedLogin = 11,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Debug for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::SrvQueue => write!(f, "SRV_QUEUE"),
            MessageType::Login => write!(f, "LOGIN"),
            MessageType::TestPrepare => write!(f, "TEST_PREPARE"),
            MessageType::TestStart => write!(f, "TEST_START"),
            MessageType::TestMsg => write!(f, "TEST_MSG"),
            MessageType::TestFinalize => write!(f, "TEST_FINALIZE"),
            MessageType::Results => write!(f, "RESULTS"),
            MessageType::Logout => write!(f, "LOGOUT"),
            MessageType::ExtendedLogin => write!(f, "EXTENDED_LOGIN"),
            MessageType::Unknown(b) => write!(f, "UNKNOWN({})", b),
        }
    }
}

/// One NDT5 frame: `<type: u8> <length: u16 big-endian> <body: length bytes>`.
///
/// The raw wire bytes are kept alongside the parsed body so that observers can
///  log exactly what went over the wire. For the WebSocket transport the two
///  differ: `raw` holds the JSON the server sent while `message` holds the
///  reconstructed textual body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub mtype: MessageType,
    pub message: Bytes,
    pub raw: Bytes,
}

impl Frame {
    /// Encodes a new frame. Fails with [ProtocolError::MessageTooLarge] if the
    ///  body does not fit the u16 length field; nothing is emitted in that case.
    pub fn new(mtype: MessageType, message: &[u8]) -> anyhow::Result<Frame> {
        if message.len() > MAX_MESSAGE_SIZE {
            bail!(ProtocolError::MessageTooLarge);
        }
        let mut raw = BytesMut::with_capacity(HEADER_SIZE + message.len());
        raw.put_u8(mtype.into());
        raw.put_u16(message.len() as u16);
        raw.put_slice(message);
        let raw = raw.freeze();
        Ok(Frame {
            mtype,
            message: raw.slice(HEADER_SIZE..),
            raw,
        })
    }

    /// Parses a complete frame from its wire bytes, verifying that the length
    ///  field matches the actual body length.
    pub fn from_wire(raw: Bytes) -> anyhow::Result<Frame> {
        if raw.len() < HEADER_SIZE {
            bail!("frame too small: {} bytes", raw.len());
        }
        let length = u16::from_be_bytes([raw[1], raw[2]]) as usize;
        if raw.len() != HEADER_SIZE + length {
            bail!(
                "frame length mismatch: header says {} body bytes, got {}",
                length,
                raw.len() - HEADER_SIZE
            );
        }
        Ok(Frame {
            mtype: MessageType::from(raw[0]),
            message: raw.slice(HEADER_SIZE..),
            raw,
        })
    }

    pub fn message_str(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}
