// JDWP protocol definitions and packet handling
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

// JDWP uses big-endian (network byte order) for all multi-byte values
// This is architecture-independent (works on Intel, ARM M1/M2/M3, etc.)

pub type JdwpResult<T> = Result<T, JdwpError>;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("JDWP error code {0}")]
    Command(u16),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl JdwpError {
    /// Error code put on the wire when this error terminates a command
    pub fn error_code(&self) -> u16 {
        match self {
            JdwpError::Command(code) => *code,
            _ => error_codes::INTERNAL,
        }
    }
}

// JDWP handshake string
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Error codes sent back in reply packets
pub mod error_codes {
    pub const NONE: u16 = 0;
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_CLASS: u16 = 21;
    pub const INVALID_METHODID: u16 = 23;
    pub const INVALID_LOCATION: u16 = 24;
    pub const INVALID_FIELDID: u16 = 25;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const OPAQUE_FRAME: u16 = 32;
    pub const TYPE_MISMATCH: u16 = 34;
    pub const NOT_IMPLEMENTED: u16 = 99;
    pub const ABSENT_INFORMATION: u16 = 101;
    pub const INVALID_EVENT_TYPE: u16 = 102;
    pub const ILLEGAL_ARGUMENT: u16 = 103;
    pub const INTERNAL: u16 = 113;
    pub const ALREADY_INVOKING: u16 = 502;
    pub const INVALID_INDEX: u16 = 503;
    pub const INVALID_LENGTH: u16 = 504;
    pub const INVALID_COUNT: u16 = 512;
}

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

/// A decoded frame, as seen by the processor
#[derive(Debug, Clone)]
pub enum Packet {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

impl Packet {
    /// Decode a full frame (length prefix included)
    pub fn decode(buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol(format!(
                "Packet too short: {} bytes",
                buf.len()
            )));
        }

        if buf[8] & REPLY_FLAG != 0 {
            ReplyPacket::decode(buf).map(Packet::Reply)
        } else {
            CommandPacket::decode(buf).map(Packet::Command)
        }
    }
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn with_data(id: u32, command_set: u8, command: u8, data: Vec<u8>) -> Self {
        Self {
            id,
            command_set,
            command,
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // command flag
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol("Command packet too short".to_string()));
        }

        let length = buf.get_u32() as usize;
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags & REPLY_FLAG != 0 {
            return Err(JdwpError::Protocol(format!("Invalid command flag: {:#x}", flags)));
        }

        let command_set = buf.get_u8();
        let command = buf.get_u8();

        let data_len = length.saturating_sub(HEADER_SIZE);
        if buf.len() < data_len {
            return Err(JdwpError::Protocol(format!(
                "Command packet truncated: declared {} bytes, have {}",
                length,
                HEADER_SIZE + buf.len()
            )));
        }

        Ok(Self {
            id,
            command_set,
            command,
            data: buf[..data_len].to_vec(),
        })
    }

    /// The payload, positioned for reading
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl ReplyPacket {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            error_code: error_codes::NONE,
            data: Vec::new(),
        }
    }

    pub fn with_data(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            error_code: error_codes::NONE,
            data,
        }
    }

    pub fn error(id: u32, error_code: u16) -> Self {
        Self {
            id,
            error_code,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(REPLY_FLAG);
        buf.put_u16(self.error_code);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol("Reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(JdwpError::Protocol(format!("Invalid reply flag: {:#x}", flags)));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_codes::NONE
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn error_message(&self) -> &'static str {
        error_message(self.error_code)
    }
}

/// Symbolic name of a JDWP error code
pub fn error_message(error_code: u16) -> &'static str {
    match error_code {
        0 => "NONE",
        10 => "INVALID_THREAD",
        11 => "INVALID_THREAD_GROUP",
        12 => "INVALID_PRIORITY",
        13 => "THREAD_NOT_SUSPENDED",
        14 => "THREAD_SUSPENDED",
        20 => "INVALID_OBJECT",
        21 => "INVALID_CLASS",
        22 => "CLASS_NOT_PREPARED",
        23 => "INVALID_METHODID",
        24 => "INVALID_LOCATION",
        25 => "INVALID_FIELDID",
        30 => "INVALID_FRAMEID",
        31 => "NO_MORE_FRAMES",
        32 => "OPAQUE_FRAME",
        33 => "NOT_CURRENT_FRAME",
        34 => "TYPE_MISMATCH",
        35 => "INVALID_SLOT",
        40 => "DUPLICATE",
        41 => "NOT_FOUND",
        50 => "INVALID_MONITOR",
        51 => "NOT_MONITOR_OWNER",
        52 => "INTERRUPT",
        99 => "NOT_IMPLEMENTED",
        100 => "NULL_POINTER",
        101 => "ABSENT_INFORMATION",
        102 => "INVALID_EVENT_TYPE",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        111 => "ACCESS_DENIED",
        112 => "VM_DEAD",
        113 => "INTERNAL",
        115 => "UNATTACHED_THREAD",
        500 => "INVALID_TAG",
        502 => "ALREADY_INVOKING",
        503 => "INVALID_INDEX",
        504 => "INVALID_LENGTH",
        506 => "INVALID_STRING",
        507 => "INVALID_CLASS_LOADER",
        508 => "INVALID_ARRAY",
        509 => "TRANSPORT_LOAD",
        510 => "TRANSPORT_INIT",
        511 => "NATIVE_METHOD",
        512 => "INVALID_COUNT",
        _ => "UNKNOWN_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packet_encode() {
        let packet = CommandPacket::new(1, 1, 1);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 11]); // length (big-endian)
        assert_eq!(&encoded[4..8], &[0, 0, 0, 1]); // id (big-endian)
        assert_eq!(encoded[8], 0x00); // command flag
        assert_eq!(encoded[9], 1); // command set
        assert_eq!(encoded[10], 1); // command
    }

    #[test]
    fn test_big_endian_encoding() {
        let packet = CommandPacket::new(0x12345678, 1, 1);
        let encoded = packet.encode();

        assert_eq!(&encoded[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_ne!(&encoded[4..8], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_command_packet_decode() {
        let raw = vec![
            0, 0, 0, 13, // length = 13
            0, 0, 0, 7,  // id = 7
            0x00,        // command flag
            15, 1,       // EventRequest.Set
            2, 1,        // payload
        ];

        match Packet::decode(&raw).unwrap() {
            Packet::Command(cmd) => {
                assert_eq!(cmd.id, 7);
                assert_eq!(cmd.command_set, 15);
                assert_eq!(cmd.command, 1);
                assert_eq!(cmd.data(), &[2, 1]);
            }
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_command_is_rejected() {
        let raw = vec![0, 0, 0, 20, 0, 0, 0, 1, 0x00, 1, 1, 9];
        assert!(CommandPacket::decode(&raw).is_err());
    }

    #[test]
    fn test_reply_packet_encode() {
        let reply = ReplyPacket::error(0x0102, error_codes::THREAD_NOT_SUSPENDED);
        let encoded = reply.encode();

        assert_eq!(
            encoded,
            vec![0, 0, 0, 11, 0, 0, 1, 2, 0x80, 0, 13],
        );
        assert_eq!(reply.error_message(), "THREAD_NOT_SUSPENDED");
    }

    #[test]
    fn test_reply_packet_decode() {
        let reply_data = vec![
            0, 0, 0, 11, // length = 11 (big-endian)
            0, 0, 0, 1,  // id = 1 (big-endian)
            0x80,        // reply flag
            0, 0,        // error code = 0 (big-endian)
        ];

        let packet = ReplyPacket::decode(&reply_data).unwrap();
        assert_eq!(packet.id, 1);
        assert_eq!(packet.error_code, 0);
        assert!(!packet.is_error());
    }

    #[test]
    fn test_error_codes_for_faults() {
        assert_eq!(JdwpError::Command(error_codes::INVALID_THREAD).error_code(), 10);
        assert_eq!(
            JdwpError::Protocol("bad".to_string()).error_code(),
            error_codes::INTERNAL
        );
    }
}
