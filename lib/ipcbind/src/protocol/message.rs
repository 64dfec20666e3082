use crate::pool::PooledBuf;
use crate::protocol::wire::{
    DecodeError, ErrorHeader, EventHeader, GenericHeader, MessageType, MethodHeader, ReturnCode,
    SpecificHeader, SubscriptionHeader, GENERIC_HEADER_SIZE,
};
use std::io::Cursor;
use std::sync::Arc;

/// A complete wire message: a reference counted immutable byte buffer with a
/// parsed header view. Cloning is cheap and shares the buffer, which is how
/// one notification is fanned out to many subscribers.
#[derive(Clone)]
pub struct Packet {
    buf: Arc<PooledBuf>,
    generic: GenericHeader,
    specific: SpecificHeader,
}

impl Packet {
    /// Parses a received buffer into a packet. The buffer must contain the
    /// complete frame, generic header included.
    pub fn parse(buf: PooledBuf) -> Result<Packet, DecodeError> {
        let generic = GenericHeader::decode(&buf)?;

        let specific = {
            let mut cursor = Cursor::new(&buf[GENERIC_HEADER_SIZE..]);
            SpecificHeader::decode(generic.message_type, &mut cursor)?
        };

        Ok(Packet {
            buf: Arc::new(buf),
            generic,
            specific,
        })
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.generic.message_type
    }

    #[inline]
    pub fn specific(&self) -> &SpecificHeader {
        &self.specific
    }

    /// The full frame as transmitted, generic header included.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    /// Shared handle on the underlying frame buffer, used by the transport
    /// send path.
    #[inline]
    pub(crate) fn buffer(&self) -> Arc<PooledBuf> {
        self.buf.clone()
    }

    /// The opaque payload following the specific header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[GENERIC_HEADER_SIZE + self.generic.message_type.specific_header_len()..]
    }

    #[inline]
    pub fn method_header(&self) -> Option<&MethodHeader> {
        match &self.specific {
            SpecificHeader::Method(header) => Some(header),
            SpecificHeader::Error(header) => Some(&header.method),
            _ => None,
        }
    }

    #[inline]
    pub fn error_header(&self) -> Option<&ErrorHeader> {
        match &self.specific {
            SpecificHeader::Error(header) => Some(header),
            _ => None,
        }
    }

    #[inline]
    pub fn event_header(&self) -> Option<&EventHeader> {
        match &self.specific {
            SpecificHeader::Event(header) => Some(header),
            _ => None,
        }
    }

    #[inline]
    pub fn subscription_header(&self) -> Option<&SubscriptionHeader> {
        match &self.specific {
            SpecificHeader::Subscription(header) => Some(header),
            _ => None,
        }
    }

    pub fn request(header: MethodHeader, payload: &[u8]) -> Packet {
        Self::build_method(MessageType::Request, header, payload)
    }

    pub fn request_no_return(header: MethodHeader, payload: &[u8]) -> Packet {
        Self::build_method(MessageType::RequestNoReturn, header, payload)
    }

    pub fn response(header: MethodHeader, payload: &[u8]) -> Packet {
        Self::build_method(MessageType::Response, header, payload)
    }

    pub fn application_error(header: MethodHeader, payload: &[u8]) -> Packet {
        Self::build_method(MessageType::ApplicationError, header, payload)
    }

    pub fn error_response(method: MethodHeader, return_code: ReturnCode) -> Packet {
        let header = ErrorHeader { method, return_code };

        Self::assemble(
            MessageType::ErrorResponse,
            SpecificHeader::Error(header),
            |stream| header.encode(stream),
            &[],
        )
    }

    pub fn notification(header: EventHeader, payload: &[u8]) -> Packet {
        Self::assemble(
            MessageType::Notification,
            SpecificHeader::Event(header),
            |stream| header.encode(stream),
            payload,
        )
    }

    pub fn subscribe(header: SubscriptionHeader) -> Packet {
        Self::build_subscription(MessageType::SubscribeEvent, header)
    }

    pub fn subscribe_ack(header: SubscriptionHeader) -> Packet {
        Self::build_subscription(MessageType::SubscribeEventAck, header)
    }

    pub fn subscribe_nack(header: SubscriptionHeader) -> Packet {
        Self::build_subscription(MessageType::SubscribeEventNAck, header)
    }

    pub fn unsubscribe(header: SubscriptionHeader) -> Packet {
        Self::build_subscription(MessageType::UnsubscribeEvent, header)
    }

    fn build_method(message_type: MessageType, header: MethodHeader, payload: &[u8]) -> Packet {
        Self::assemble(
            message_type,
            SpecificHeader::Method(header),
            |stream| header.encode(stream),
            payload,
        )
    }

    fn build_subscription(message_type: MessageType, header: SubscriptionHeader) -> Packet {
        Self::assemble(
            message_type,
            SpecificHeader::Subscription(header),
            |stream| header.encode(stream),
            &[],
        )
    }

    fn assemble<F: FnOnce(&mut Vec<u8>)>(
        message_type: MessageType,
        specific: SpecificHeader,
        encode_specific: F,
        payload: &[u8],
    ) -> Packet {
        let specific_len = message_type.specific_header_len();
        let message_length = (specific_len + payload.len()) as u32;

        let mut buffer = Vec::with_capacity(GENERIC_HEADER_SIZE + specific_len + payload.len());

        GenericHeader {
            message_type,
            message_length,
        }
        .encode(&mut buffer);
        encode_specific(&mut buffer);
        buffer.extend_from_slice(payload);

        Packet {
            buf: Arc::new(PooledBuf::detached(buffer)),
            generic: GenericHeader {
                message_type,
                message_length,
            },
            specific,
        }
    }
}
