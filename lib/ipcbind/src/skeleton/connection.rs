//! Server side per-peer connection. Decodes inbound messages, forwards them
//! to the skeleton router and transmits typed responses and notifications.

use crate::error::{TransportError, TransportResult};
use crate::ids::{allocate_connection_id, ConnectionId};
use crate::pool::BufferPool;
use crate::protocol::message::Packet;
use crate::protocol::wire::MessageType;
use crate::skeleton::event::NotificationSink;
use crate::skeleton::router::SkeletonRouter;
use crate::transport::connection::Connection;
use crate::transport::handler::MessageHandler;
use keel::cred::{Credentials, IntegrityLevel};
use keel::logging;
use keel::reactor::ReactorHandle;
use std::sync::{Arc, Weak};

/// Owner of a skeleton connection, asked to drop it after a fatal error.
pub trait ConnectionOwner: Send + Sync {
    fn drop_connection(&self, connection_id: ConnectionId);
}

/// One accepted peer of an offered service instance.
pub struct SkeletonConnection {
    weak: Weak<SkeletonConnection>,
    id: ConnectionId,
    handler: Arc<MessageHandler>,
    router: Arc<SkeletonRouter>,
    owner: Weak<dyn ConnectionOwner>,
    log: logging::Logger,
}

impl SkeletonConnection {
    /// Wires an accepted connection into the router and arms its receive
    /// loop. The connection id is process-unique.
    pub fn spawn(
        conn: Arc<Connection>,
        router: Arc<SkeletonRouter>,
        owner: Weak<dyn ConnectionOwner>,
        reactor: &ReactorHandle,
        pool: BufferPool,
        log: &logging::Logger,
    ) -> TransportResult<Arc<SkeletonConnection>> {
        let id = allocate_connection_id();
        let handler = MessageHandler::new(conn, pool, log);

        let skeleton = Arc::new_cyclic(|weak| SkeletonConnection {
            weak: weak.clone(),
            id,
            handler: handler.clone(),
            router,
            owner,
            log: log.new(logging::o!("component" => "skeleton_connection", "connection_id" => id)),
        });

        {
            // Destruction must not run inside a socket callback frame, so
            // the teardown is posted onto the reactor.
            let weak = skeleton.weak.clone();
            let reactor = reactor.clone();
            handler.set_error_callback(Box::new(move |err| {
                reactor.post(Box::new(move || {
                    if let Some(connection) = weak.upgrade() {
                        connection.teardown(err);
                    }
                }));
            }));
        }

        {
            let weak = skeleton.weak.clone();
            handler.start_receive(Box::new(move |packet| {
                if let Some(connection) = weak.upgrade() {
                    connection.dispatch(packet);
                }
            }))?;
        }

        Ok(skeleton)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_identity(&self) -> TransportResult<Credentials> {
        self.handler.connection().peer_identity()
    }

    pub fn check_peer_integrity_level(&self, minimum: IntegrityLevel) -> bool {
        self.handler.connection().check_peer_integrity_level(minimum)
    }

    pub fn send_response(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::Response);
        self.handler.send(packet)
    }

    pub fn send_error_response(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::ErrorResponse);
        self.handler.send(packet)
    }

    pub fn send_application_error(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::ApplicationError);
        self.handler.send(packet)
    }

    pub fn send_notification(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::Notification);
        self.handler.send(packet)
    }

    pub fn send_subscribe_ack(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::SubscribeEventAck);
        self.handler.send(packet)
    }

    pub fn send_subscribe_nack(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::SubscribeEventNAck);
        self.handler.send(packet)
    }

    /// The peer violated the protocol: the connection is closed and the
    /// handler invalidated, which in turn schedules the teardown.
    pub fn protocol_violation(&self) {
        logging::error!(self.log, "protocol violation"; "context" => "protocol_violation");
        self.handler.invalidate(TransportError::ProtocolError);
    }

    pub fn close(&self) {
        self.handler.connection().close();
    }

    pub fn is_in_use(&self) -> bool {
        self.handler.is_in_use()
    }

    fn dispatch(&self, packet: Packet) {
        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => return,
        };

        match packet.message_type() {
            MessageType::Request => self.router.route_request(&this, packet),
            MessageType::RequestNoReturn => self.router.route_request_no_return(&packet),
            MessageType::SubscribeEvent => self.router.route_subscribe(&this, &packet),
            MessageType::UnsubscribeEvent => self.router.route_unsubscribe(&this, &packet),
            other => {
                logging::error!(self.log, "message type not valid towards a skeleton";
                                "context" => "dispatch",
                                "message_type" => ?other);
                self.protocol_violation();
            }
        }
    }

    fn teardown(&self, err: TransportError) {
        logging::warn!(self.log, "tearing down connection";
                       "context" => "teardown",
                       "error" => ?err);

        self.handler.connection().close();
        self.router.connection_closed(self.id);

        if let Some(owner) = self.owner.upgrade() {
            owner.drop_connection(self.id);
        }
    }
}

impl NotificationSink for SkeletonConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send_notification(&self, packet: Packet) -> bool {
        SkeletonConnection::send_notification(self, packet)
    }

    fn send_subscribe_ack(&self, packet: Packet) -> bool {
        SkeletonConnection::send_subscribe_ack(self, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{MethodHeader, ReturnCode};
    use crate::skeleton::router::SkeletonService;
    use crate::ids::ProvidedServiceInstanceId;
    use keel::reactor::Reactor;
    use mio::net::UnixStream;
    use std::sync::Mutex;
    use std::time::Duration;

    fn pump(reactor: &mut Reactor, mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            reactor.handle_events(Some(Duration::from_millis(10))).unwrap();

            if done() {
                return;
            }
        }

        panic!("Reactor pump deadline expired");
    }

    struct EchoService;

    impl SkeletonService for EchoService {
        fn handle_request(
            &self,
            connection: &Arc<SkeletonConnection>,
            packet: &Packet,
        ) -> Result<(), ReturnCode> {
            let header = *packet.method_header().unwrap();

            if header.method_id != 5 {
                return Err(ReturnCode::UnknownMethodId);
            }

            connection.send_response(Packet::response(header, &[0xBE, 0xEF]));
            Ok(())
        }

        fn handle_request_no_return(&self, _packet: &Packet) -> Result<(), ReturnCode> {
            Ok(())
        }

        fn handle_subscribe(
            &self,
            _connection: &Arc<SkeletonConnection>,
            _packet: &Packet,
        ) -> Result<(), ReturnCode> {
            Ok(())
        }

        fn handle_unsubscribe(&self, _connection_id: ConnectionId, _packet: &Packet) {}

        fn handle_connection_closed(&self, _connection_id: ConnectionId) {}

        fn handle_stop_offer(&self) {}
    }

    fn provided() -> ProvidedServiceInstanceId {
        ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        }
    }

    fn request_header(method_id: u32) -> MethodHeader {
        MethodHeader {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            method_id,
            client_id: 42,
            session_id: 1,
        }
    }

    struct Fixture {
        skeleton: Arc<SkeletonConnection>,
        peer: Arc<MessageHandler>,
        peer_inbox: Arc<Mutex<Vec<Packet>>>,
    }

    fn fixture(reactor: &Reactor) -> Fixture {
        let log = logging::discard();
        let handle = reactor.handle();

        let router = SkeletonRouter::new(&log);
        router.add_service(provided(), Arc::new(EchoService));

        let (server_stream, client_stream) = UnixStream::pair().unwrap();

        let server_conn = Connection::from_accepted(server_stream, &handle, &log).unwrap();
        let skeleton = SkeletonConnection::spawn(
            server_conn,
            router,
            Weak::<ServerStub>::new(),
            &handle,
            BufferPool::new(),
            &log,
        )
        .unwrap();

        let client_conn = Connection::from_accepted(client_stream, &handle, &log).unwrap();
        let peer = MessageHandler::new(client_conn, BufferPool::new(), &log);

        let peer_inbox = Arc::new(Mutex::new(Vec::new()));
        let inbox = peer_inbox.clone();
        peer.start_receive(Box::new(move |packet| {
            inbox.lock().unwrap().push(packet);
        }))
        .unwrap();

        Fixture {
            skeleton,
            peer,
            peer_inbox,
        }
    }

    struct ServerStub;

    impl ConnectionOwner for ServerStub {
        fn drop_connection(&self, _connection_id: ConnectionId) {}
    }

    #[test]
    fn test_request_gets_response() {
        let mut reactor = Reactor::new(None).unwrap();
        let fix = fixture(&reactor);

        fix.peer.send(Packet::request(request_header(5), &[0xDE, 0xAD]));

        let inbox = fix.peer_inbox.clone();
        pump(&mut reactor, move || !inbox.lock().unwrap().is_empty());

        let inbox = fix.peer_inbox.lock().unwrap();
        assert_eq!(inbox[0].message_type(), MessageType::Response);
        assert_eq!(inbox[0].method_header().unwrap().session_id, 1);
        assert_eq!(inbox[0].payload(), &[0xBE, 0xEF]);
    }

    #[test]
    fn test_unknown_method_yields_error_response() {
        let mut reactor = Reactor::new(None).unwrap();
        let fix = fixture(&reactor);

        fix.peer.send(Packet::request(request_header(99), &[]));

        let inbox = fix.peer_inbox.clone();
        pump(&mut reactor, move || !inbox.lock().unwrap().is_empty());

        let inbox = fix.peer_inbox.lock().unwrap();
        let header = inbox[0].error_header().unwrap();
        assert_eq!(header.method.method_id, 99);
        assert_eq!(header.return_code, ReturnCode::UnknownMethodId);
    }

    #[test]
    fn test_wrong_direction_message_closes_connection() {
        let mut reactor = Reactor::new(None).unwrap();
        let fix = fixture(&reactor);

        // A Response has no business arriving at a skeleton.
        fix.peer.send(Packet::response(request_header(5), &[]));

        let skeleton = fix.skeleton.clone();
        pump(&mut reactor, move || {
            !skeleton.handler.connection().check_is_open()
        });

        assert!(fix.skeleton.handler.is_in_error());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let reactor = Reactor::new(None).unwrap();
        let a = fixture(&reactor);
        let b = fixture(&reactor);

        assert_ne!(a.skeleton.id(), b.skeleton.id());
    }
}
