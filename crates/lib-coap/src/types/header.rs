use std::fmt::Display;

use crate::types::Code;

/// The four transmission types carried in the 2-bit type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    /// Decode the 2-bit wire field. Only the two low bits are considered.
    pub fn from_wire(value: u8) -> Self {
        match value & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn is_confirmable(&self) -> bool {
        matches!(self, MessageType::Confirmable)
    }
}

impl From<MessageType> for u8 {
    fn from(mtype: MessageType) -> Self {
        match mtype {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Confirmable => write!(f, "CON"),
            MessageType::NonConfirmable => write!(f, "NON"),
            MessageType::Acknowledgement => write!(f, "ACK"),
            MessageType::Reset => write!(f, "RST"),
        }
    }
}

/// The fixed part of every message: type, code and message ID. Version and
/// token length are derived during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
}

impl Header {
    pub fn new(mtype: MessageType, code: Code) -> Self {
        Self {
            mtype,
            code,
            message_id: 0,
        }
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} id={}", self.mtype, self.code, self.message_id)
    }
}
