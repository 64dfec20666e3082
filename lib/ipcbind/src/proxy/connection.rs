//! Client side per-server connection. Tracks the connection state, fans
//! state changes out to the registered handlers and transmits typed
//! requests. One instance is shared by every proxy talking to the same
//! server address.

use crate::error::{TransportError, TransportResult};
use crate::ids::ProvidedServiceInstanceId;
use crate::pool::BufferPool;
use crate::protocol::message::Packet;
use crate::protocol::wire::MessageType;
use crate::proxy::router::ProxyRouterMapper;
use crate::transport::address::IpcUnicastAddress;
use crate::transport::connection::Connection;
use crate::transport::handler::MessageHandler;
use hashbrown::HashMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::ReactorHandle;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observer of connection state changes, registered per provided instance.
pub trait ConnectionStateChangeHandler: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self, reason: TransportError);
}

/// Back-edge to the owning connection manager.
pub trait DisconnectListener: Send + Sync {
    fn on_connection_lost(&self, address: IpcUnicastAddress);
}

struct StateInner {
    state: ConnectionState,
    handlers: HashMap<ProvidedServiceInstanceId, Weak<dyn ConnectionStateChangeHandler>>,
    conn: Option<Arc<Connection>>,
    handler: Option<Arc<MessageHandler>>,
}

pub struct ProxyConnection {
    weak: Weak<ProxyConnection>,
    address: IpcUnicastAddress,
    socket_path: PathBuf,
    integrity: IntegrityLevel,
    mapper: Arc<ProxyRouterMapper>,
    listener: Weak<dyn DisconnectListener>,
    reactor: ReactorHandle,
    pool: BufferPool,
    inner: Mutex<StateInner>,
    log: logging::Logger,
}

impl ProxyConnection {
    pub fn new(
        address: IpcUnicastAddress,
        socket_path: PathBuf,
        integrity: IntegrityLevel,
        mapper: Arc<ProxyRouterMapper>,
        listener: Weak<dyn DisconnectListener>,
        reactor: &ReactorHandle,
        pool: BufferPool,
        log: &logging::Logger,
    ) -> Arc<ProxyConnection> {
        Arc::new_cyclic(|weak| ProxyConnection {
            weak: weak.clone(),
            address,
            socket_path,
            integrity,
            mapper,
            listener,
            reactor: reactor.clone(),
            pool,
            inner: Mutex::new(StateInner {
                state: ConnectionState::Disconnected,
                handlers: HashMap::new(),
                conn: None,
                handler: None,
            }),
            log: log.new(logging::o!("component" => "proxy_connection", "address" => format!("{}", address))),
        })
    }

    #[inline]
    pub fn address(&self) -> IpcUnicastAddress {
        self.address
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    #[inline]
    pub fn router_mapper(&self) -> &Arc<ProxyRouterMapper> {
        &self.mapper
    }

    /// Registers the state handler for a provided instance and drives the
    /// connection towards `Connected`. Registration is idempotent per
    /// instance. A handler registering on an already connected socket still
    /// receives `on_connected`, via a posted reactor task.
    pub fn connect(
        &self,
        provided: ProvidedServiceInstanceId,
        handler: &Arc<dyn ConnectionStateChangeHandler>,
    ) -> ConnectionState {
        let mut inner = self.lock();

        inner.handlers.insert(provided, Arc::downgrade(handler));

        match inner.state {
            ConnectionState::Connected => {
                let weak = Arc::downgrade(handler);
                self.reactor.post(Box::new(move || {
                    if let Some(handler) = weak.upgrade() {
                        handler.on_connected();
                    }
                }));

                ConnectionState::Connected
            }
            ConnectionState::Connecting => ConnectionState::Connecting,
            ConnectionState::Disconnected => {
                let conn = Connection::new(&self.reactor, &self.log);
                let weak = self.weak.clone();

                let kick = conn.connect_async(
                    &self.socket_path,
                    Box::new(move |result| {
                        if let Some(proxy) = weak.upgrade() {
                            proxy.on_connect_complete(result);
                        }
                    }),
                );

                inner.state = ConnectionState::Connecting;

                match kick {
                    Ok(()) => inner.conn = Some(conn),
                    Err(err) => {
                        // Synchronous failure: report through the same
                        // asynchronous path as a slow one.
                        let weak = self.weak.clone();
                        self.reactor.post(Box::new(move || {
                            if let Some(proxy) = weak.upgrade() {
                                proxy.handle_disconnect(err);
                            }
                        }));
                    }
                }

                ConnectionState::Connecting
            }
        }
    }

    /// Unregisters the state handler of a provided instance. When the last
    /// handler is gone the socket is closed.
    pub fn disconnect(&self, provided: &ProvidedServiceInstanceId) {
        let close = {
            let mut inner = self.lock();
            inner.handlers.remove(provided);
            inner.handlers.is_empty()
        };

        if close {
            self.shutdown();
        }
    }

    pub fn has_handlers(&self) -> bool {
        !self.lock().handlers.is_empty()
    }

    /// Drops all routing state of a provided instance on this connection.
    pub fn release_routers(&self, provided: &ProvidedServiceInstanceId) {
        self.mapper.release_instance(provided);
    }

    pub fn send_request(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::Request);
        self.transmit(packet)
    }

    pub fn send_request_no_return(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::RequestNoReturn);
        self.transmit(packet)
    }

    pub fn subscribe_event(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::SubscribeEvent);
        self.transmit(packet)
    }

    pub fn unsubscribe_event(&self, packet: Packet) -> bool {
        debug_assert_eq!(packet.message_type(), MessageType::UnsubscribeEvent);
        self.transmit(packet)
    }

    pub fn is_in_use(&self) -> bool {
        let handler = { self.lock().handler.clone() };

        match handler {
            Some(handler) => handler.is_in_use(),
            None => false,
        }
    }

    /// Closes the socket without firing state handlers. Used when the last
    /// handler has already unregistered and during deinitialization.
    pub(crate) fn shutdown(&self) {
        let conn = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Disconnected;
            inner.handler = None;
            inner.conn.take()
        };

        if let Some(conn) = conn {
            conn.close();
        }
    }

    fn transmit(&self, packet: Packet) -> bool {
        let handler = { self.lock().handler.clone() };

        match handler {
            Some(handler) => handler.send(packet),
            None => false,
        }
    }

    fn on_connect_complete(&self, result: TransportResult<()>) {
        let result = result.and_then(|()| self.wire_handler());

        match result {
            Ok(()) => {
                let handlers = {
                    let mut inner = self.lock();
                    inner.state = ConnectionState::Connected;
                    Self::collect_handlers(&inner)
                };

                logging::debug!(self.log, "connected"; "context" => "on_connect_complete");

                for handler in handlers {
                    handler.on_connected();
                }
            }
            Err(err) => self.handle_disconnect(err),
        }
    }

    /// Gates the freshly connected socket on peer integrity and arms its
    /// message handler.
    fn wire_handler(&self) -> TransportResult<()> {
        let conn = {
            let inner = self.lock();
            match inner.conn.clone() {
                Some(conn) => conn,
                None => return Err(TransportError::Disconnected),
            }
        };

        if !conn.check_peer_integrity_level(self.integrity) {
            logging::warn!(self.log, "server below required integrity level";
                           "context" => "wire_handler");
            conn.close();
            return Err(TransportError::InsufficientPrivileges);
        }

        let handler = MessageHandler::new(conn, self.pool.clone(), &self.log);

        {
            let weak = self.weak.clone();
            let reactor = self.reactor.clone();
            handler.set_error_callback(Box::new(move |err| {
                // Invalidation happens inside a socket callback; the state
                // fan-out and map cleanup are deferred to a reactor task.
                reactor.post(Box::new(move || {
                    if let Some(proxy) = weak.upgrade() {
                        proxy.handle_disconnect(err);
                    }
                }));
            }));
        }

        {
            let weak = self.weak.clone();
            handler.start_receive(Box::new(move |packet| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.dispatch(packet);
                }
            }))?;
        }

        self.lock().handler = Some(handler);

        Ok(())
    }

    fn dispatch(&self, packet: Packet) {
        match packet.message_type() {
            MessageType::Response | MessageType::ErrorResponse | MessageType::ApplicationError => {
                self.mapper.route_response(&packet)
            }
            MessageType::Notification => self.mapper.route_notification(&packet),
            MessageType::SubscribeEventAck => self.mapper.route_subscription_response(&packet, true),
            MessageType::SubscribeEventNAck => self.mapper.route_subscription_response(&packet, false),
            MessageType::UnsubscribeEventAck | MessageType::UnsubscribeEventNAck => {
                // Reserved wire values; receipt is a no-op.
                logging::trace!(self.log, "reserved message type ignored";
                                "context" => "dispatch",
                                "message_type" => ?packet.message_type());
            }
            other => {
                logging::error!(self.log, "message type not valid towards a proxy";
                                "context" => "dispatch",
                                "message_type" => ?other);

                let handler = { self.lock().handler.clone() };
                if let Some(handler) = handler {
                    handler.invalidate(TransportError::ProtocolError);
                }
            }
        }
    }

    /// Transitions to `Disconnected` and fires `on_disconnected` exactly
    /// once per connection loss, then informs the manager.
    fn handle_disconnect(&self, reason: TransportError) {
        let (conn, handlers) = {
            let mut inner = self.lock();

            if inner.state == ConnectionState::Disconnected {
                return;
            }

            inner.state = ConnectionState::Disconnected;
            inner.handler = None;

            (inner.conn.take(), Self::collect_handlers(&inner))
        };

        if let Some(conn) = conn {
            conn.close();
        }

        logging::warn!(self.log, "disconnected"; "context" => "handle_disconnect", "reason" => ?reason);

        for handler in handlers {
            handler.on_disconnected(reason);
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.on_connection_lost(self.address);
        }
    }

    fn collect_handlers(inner: &StateInner) -> Vec<Arc<dyn ConnectionStateChangeHandler>> {
        inner
            .handlers
            .values()
            .filter_map(|handler| handler.upgrade())
            .collect()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<StateInner> {
        self.inner.lock().expect("proxy connection state poisoned")
    }
}
