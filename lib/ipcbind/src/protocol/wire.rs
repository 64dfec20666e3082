use crate::ids::{ClientId, EventId, InstanceId, MajorVersion, MethodId, ServiceId, SessionId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Only protocol version understood by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Size of the generic header preceding every message.
pub const GENERIC_HEADER_SIZE: usize = 12;

pub const METHOD_HEADER_SIZE: usize = 24;
pub const ERROR_HEADER_SIZE: usize = 28;
pub const EVENT_HEADER_SIZE: usize = 20;
pub const SUBSCRIPTION_HEADER_SIZE: usize = 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Request,
    RequestNoReturn,
    Response,
    ErrorResponse,
    ApplicationError,
    Notification,
    SubscribeEvent,
    SubscribeEventAck,
    SubscribeEventNAck,
    UnsubscribeEvent,
    UnsubscribeEventAck,
    UnsubscribeEventNAck,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<MessageType> {
        match raw {
            0x0000_0000 => Some(MessageType::Request),
            0x0000_0001 => Some(MessageType::RequestNoReturn),
            0x0000_0002 => Some(MessageType::Response),
            0x0000_0003 => Some(MessageType::ErrorResponse),
            0x0000_0004 => Some(MessageType::ApplicationError),
            0x0000_0005 => Some(MessageType::Notification),
            0x8000_0003 => Some(MessageType::SubscribeEvent),
            0x8000_0004 => Some(MessageType::SubscribeEventAck),
            0x8000_0005 => Some(MessageType::SubscribeEventNAck),
            0x8000_0006 => Some(MessageType::UnsubscribeEvent),
            0x8000_0007 => Some(MessageType::UnsubscribeEventAck),
            0x8000_0008 => Some(MessageType::UnsubscribeEventNAck),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::Request => 0x0000_0000,
            MessageType::RequestNoReturn => 0x0000_0001,
            MessageType::Response => 0x0000_0002,
            MessageType::ErrorResponse => 0x0000_0003,
            MessageType::ApplicationError => 0x0000_0004,
            MessageType::Notification => 0x0000_0005,
            MessageType::SubscribeEvent => 0x8000_0003,
            MessageType::SubscribeEventAck => 0x8000_0004,
            MessageType::SubscribeEventNAck => 0x8000_0005,
            MessageType::UnsubscribeEvent => 0x8000_0006,
            MessageType::UnsubscribeEventAck => 0x8000_0007,
            MessageType::UnsubscribeEventNAck => 0x8000_0008,
        }
    }

    /// Length of the type specific header following the generic header.
    pub fn specific_header_len(self) -> usize {
        match self {
            MessageType::Request
            | MessageType::RequestNoReturn
            | MessageType::Response
            | MessageType::ApplicationError => METHOD_HEADER_SIZE,
            MessageType::ErrorResponse => ERROR_HEADER_SIZE,
            MessageType::Notification => EVENT_HEADER_SIZE,
            MessageType::SubscribeEvent
            | MessageType::SubscribeEventAck
            | MessageType::SubscribeEventNAck
            | MessageType::UnsubscribeEvent
            | MessageType::UnsubscribeEventAck
            | MessageType::UnsubscribeEventNAck => SUBSCRIPTION_HEADER_SIZE,
        }
    }
}

/// Return codes carried by `ErrorResponse` messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReturnCode {
    UnknownServiceId,
    UnknownInstanceId,
    UnknownMethodId,
    MalformedMessage,
    ServiceNotAvailable,
    MethodRequestSchedulingFailed,
}

impl ReturnCode {
    pub fn from_u32(raw: u32) -> Option<ReturnCode> {
        match raw {
            0 => Some(ReturnCode::UnknownServiceId),
            1 => Some(ReturnCode::UnknownInstanceId),
            2 => Some(ReturnCode::UnknownMethodId),
            3 => Some(ReturnCode::MalformedMessage),
            4 => Some(ReturnCode::ServiceNotAvailable),
            5 => Some(ReturnCode::MethodRequestSchedulingFailed),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        match self {
            ReturnCode::UnknownServiceId => 0,
            ReturnCode::UnknownInstanceId => 1,
            ReturnCode::UnknownMethodId => 2,
            ReturnCode::MalformedMessage => 3,
            ReturnCode::ServiceNotAvailable => 4,
            ReturnCode::MethodRequestSchedulingFailed => 5,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    Truncated,
    UnsupportedProtocolVersion(u32),
    UnknownMessageType(u32),
    LengthMismatch { declared: u32, actual: usize },
    UnknownReturnCode(u32),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GenericHeader {
    pub message_type: MessageType,
    pub message_length: u32,
}

/// Specific header shared by `Request`, `RequestNoReturn`, `Response` and
/// `ApplicationError`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MethodHeader {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub major_version: MajorVersion,
    pub method_id: MethodId,
    pub client_id: ClientId,
    pub session_id: SessionId,
}

/// `ErrorResponse` specific header: a method header plus a return code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ErrorHeader {
    pub method: MethodHeader,
    pub return_code: ReturnCode,
}

/// `Notification` specific header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EventHeader {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub major_version: MajorVersion,
    pub event_id: EventId,
    pub session_id: SessionId,
}

/// Specific header shared by the subscription message family.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubscriptionHeader {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub major_version: MajorVersion,
    pub event_id: EventId,
    pub client_id: ClientId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpecificHeader {
    Method(MethodHeader),
    Error(ErrorHeader),
    Event(EventHeader),
    Subscription(SubscriptionHeader),
}

impl GenericHeader {
    /// Writes the 12 byte generic header. Serialization into an adequately
    /// sized buffer cannot fail.
    pub fn encode(&self, stream: &mut Vec<u8>) {
        stream
            .write_u32::<LittleEndian>(PROTOCOL_VERSION)
            .expect("Error writing protocol version");
        stream
            .write_u32::<LittleEndian>(self.message_type.as_u32())
            .expect("Error writing message type");
        stream
            .write_u32::<LittleEndian>(self.message_length)
            .expect("Error writing message length");
    }

    /// Parses and validates the generic header of a received buffer. The
    /// declared message length must account for the exact remainder of the
    /// buffer.
    pub fn decode(buffer: &[u8]) -> Result<GenericHeader, DecodeError> {
        if buffer.len() < GENERIC_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        let mut cursor = Cursor::new(buffer);

        let version = cursor.read_u32::<LittleEndian>().expect("Error reading version");
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedProtocolVersion(version));
        }

        let raw_type = cursor.read_u32::<LittleEndian>().expect("Error reading message type");
        let message_type =
            MessageType::from_u32(raw_type).ok_or(DecodeError::UnknownMessageType(raw_type))?;

        let message_length = cursor
            .read_u32::<LittleEndian>()
            .expect("Error reading message length");

        let actual = buffer.len() - GENERIC_HEADER_SIZE;
        if message_length as usize != actual {
            return Err(DecodeError::LengthMismatch {
                declared: message_length,
                actual,
            });
        }

        if (message_length as usize) < message_type.specific_header_len() {
            return Err(DecodeError::Truncated);
        }

        Ok(GenericHeader {
            message_type,
            message_length,
        })
    }
}

impl MethodHeader {
    pub fn encode(&self, stream: &mut Vec<u8>) {
        stream
            .write_u32::<LittleEndian>(self.service_id)
            .expect("Error writing service id");
        stream
            .write_u32::<LittleEndian>(self.instance_id)
            .expect("Error writing instance id");
        stream
            .write_u32::<LittleEndian>(self.major_version)
            .expect("Error writing major version");
        stream
            .write_u32::<LittleEndian>(self.method_id)
            .expect("Error writing method id");
        stream
            .write_u32::<LittleEndian>(self.client_id)
            .expect("Error writing client id");
        stream
            .write_u32::<LittleEndian>(self.session_id)
            .expect("Error writing session id");
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<MethodHeader, DecodeError> {
        if remaining(cursor) < METHOD_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        Ok(MethodHeader {
            service_id: cursor.read_u32::<LittleEndian>().expect("Error reading service id"),
            instance_id: cursor.read_u32::<LittleEndian>().expect("Error reading instance id"),
            major_version: cursor.read_u32::<LittleEndian>().expect("Error reading major version"),
            method_id: cursor.read_u32::<LittleEndian>().expect("Error reading method id"),
            client_id: cursor.read_u32::<LittleEndian>().expect("Error reading client id"),
            session_id: cursor.read_u32::<LittleEndian>().expect("Error reading session id"),
        })
    }
}

impl ErrorHeader {
    pub fn encode(&self, stream: &mut Vec<u8>) {
        self.method.encode(stream);
        stream
            .write_u32::<LittleEndian>(self.return_code.as_u32())
            .expect("Error writing return code");
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<ErrorHeader, DecodeError> {
        let method = MethodHeader::decode(cursor)?;

        if remaining(cursor) < 4 {
            return Err(DecodeError::Truncated);
        }

        let raw = cursor.read_u32::<LittleEndian>().expect("Error reading return code");
        let return_code = ReturnCode::from_u32(raw).ok_or(DecodeError::UnknownReturnCode(raw))?;

        Ok(ErrorHeader { method, return_code })
    }
}

impl EventHeader {
    pub fn encode(&self, stream: &mut Vec<u8>) {
        stream
            .write_u32::<LittleEndian>(self.service_id)
            .expect("Error writing service id");
        stream
            .write_u32::<LittleEndian>(self.instance_id)
            .expect("Error writing instance id");
        stream
            .write_u32::<LittleEndian>(self.major_version)
            .expect("Error writing major version");
        stream
            .write_u32::<LittleEndian>(self.event_id)
            .expect("Error writing event id");
        stream
            .write_u32::<LittleEndian>(self.session_id)
            .expect("Error writing session id");
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<EventHeader, DecodeError> {
        if remaining(cursor) < EVENT_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        Ok(EventHeader {
            service_id: cursor.read_u32::<LittleEndian>().expect("Error reading service id"),
            instance_id: cursor.read_u32::<LittleEndian>().expect("Error reading instance id"),
            major_version: cursor.read_u32::<LittleEndian>().expect("Error reading major version"),
            event_id: cursor.read_u32::<LittleEndian>().expect("Error reading event id"),
            session_id: cursor.read_u32::<LittleEndian>().expect("Error reading session id"),
        })
    }
}

impl SubscriptionHeader {
    pub fn encode(&self, stream: &mut Vec<u8>) {
        stream
            .write_u32::<LittleEndian>(self.service_id)
            .expect("Error writing service id");
        stream
            .write_u32::<LittleEndian>(self.instance_id)
            .expect("Error writing instance id");
        stream
            .write_u32::<LittleEndian>(self.major_version)
            .expect("Error writing major version");
        stream
            .write_u32::<LittleEndian>(self.event_id)
            .expect("Error writing event id");
        stream
            .write_u32::<LittleEndian>(self.client_id)
            .expect("Error writing client id");
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<SubscriptionHeader, DecodeError> {
        if remaining(cursor) < SUBSCRIPTION_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        Ok(SubscriptionHeader {
            service_id: cursor.read_u32::<LittleEndian>().expect("Error reading service id"),
            instance_id: cursor.read_u32::<LittleEndian>().expect("Error reading instance id"),
            major_version: cursor.read_u32::<LittleEndian>().expect("Error reading major version"),
            event_id: cursor.read_u32::<LittleEndian>().expect("Error reading event id"),
            client_id: cursor.read_u32::<LittleEndian>().expect("Error reading client id"),
        })
    }
}

impl SpecificHeader {
    /// Parses the specific header matching the supplied message type.
    pub fn decode(
        message_type: MessageType,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<SpecificHeader, DecodeError> {
        Ok(match message_type {
            MessageType::Request
            | MessageType::RequestNoReturn
            | MessageType::Response
            | MessageType::ApplicationError => SpecificHeader::Method(MethodHeader::decode(cursor)?),
            MessageType::ErrorResponse => SpecificHeader::Error(ErrorHeader::decode(cursor)?),
            MessageType::Notification => SpecificHeader::Event(EventHeader::decode(cursor)?),
            MessageType::SubscribeEvent
            | MessageType::SubscribeEventAck
            | MessageType::SubscribeEventNAck
            | MessageType::UnsubscribeEvent
            | MessageType::UnsubscribeEventAck
            | MessageType::UnsubscribeEventNAck => {
                SpecificHeader::Subscription(SubscriptionHeader::decode(cursor)?)
            }
        })
    }
}

#[inline]
fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}
