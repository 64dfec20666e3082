//! Proxy side routing. Each proxy owns a router keyed by its client id, so
//! several proxies to the same instance route independently. Responses are
//! matched to pending method calls; notifications fan out to every router
//! registered for the instance.

use crate::ids::{ClientId, EventId, MethodId, ProvidedServiceInstanceId, SessionId};
use crate::protocol::message::Packet;
use crate::protocol::wire::MessageType;
use hashbrown::HashMap;
use keel::logging;
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of a method call, delivered to the pending handler.
pub enum MethodResponse {
    Ok(Packet),
    Error(Packet),
    ApplicationError(Packet),
}

pub type ResponseCallback = Box<dyn FnOnce(MethodResponse) + Send>;

/// Receiver of event traffic for one subscribed event of one proxy.
pub trait EventReceiveHandler: Send + Sync {
    fn on_notification(&self, packet: &Packet);
    fn on_subscription_ack(&self);
    fn on_subscription_nack(&self);
}

/// Demultiplexes inbound traffic of a single proxy, by method and session
/// for calls and by event id for notifications.
pub struct ProxyRouter {
    provided: ProvidedServiceInstanceId,
    client_id: ClientId,
    pending: Mutex<HashMap<(MethodId, SessionId), ResponseCallback>>,
    events: Mutex<HashMap<EventId, Arc<dyn EventReceiveHandler>>>,
    log: logging::Logger,
}

impl ProxyRouter {
    fn new(
        provided: ProvidedServiceInstanceId,
        client_id: ClientId,
        log: &logging::Logger,
    ) -> Arc<ProxyRouter> {
        Arc::new(ProxyRouter {
            provided,
            client_id,
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("client_id" => client_id)),
        })
    }

    #[inline]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[inline]
    pub fn provided(&self) -> ProvidedServiceInstanceId {
        self.provided
    }

    /// Registers the completion for an outgoing method call. One call, one
    /// completion; a duplicate key is a contract violation.
    pub fn register_response_handler(
        &self,
        method_id: MethodId,
        session_id: SessionId,
        callback: ResponseCallback,
    ) {
        let mut pending = self.lock_pending();

        if pending.insert((method_id, session_id), callback).is_some() {
            panic!(
                "Response handler registered twice for method {} session {}",
                method_id, session_id
            );
        }
    }

    pub fn register_event_handler(&self, event_id: EventId, handler: Arc<dyn EventReceiveHandler>) {
        let mut events = self.lock_events();

        if events.insert(event_id, handler).is_some() {
            panic!("Event handler registered twice for event {}", event_id);
        }
    }

    pub fn deregister_event_handler(&self, event_id: EventId) {
        self.lock_events().remove(&event_id);
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn complete(&self, method_id: MethodId, session_id: SessionId, response: MethodResponse) {
        let callback = self.lock_pending().remove(&(method_id, session_id));

        match callback {
            Some(callback) => callback(response),
            None => {
                logging::debug!(self.log, "response without pending call dropped";
                                "context" => "complete",
                                "method_id" => method_id,
                                "session_id" => session_id);
            }
        }
    }

    fn deliver_notification(&self, event_id: EventId, packet: &Packet) {
        let handler = self.lock_events().get(&event_id).cloned();

        if let Some(handler) = handler {
            handler.on_notification(packet);
        }
    }

    fn deliver_subscription_response(&self, event_id: EventId, ack: bool) {
        let handler = self.lock_events().get(&event_id).cloned();

        if let Some(handler) = handler {
            if ack {
                handler.on_subscription_ack();
            } else {
                handler.on_subscription_nack();
            }
        }
    }

    #[inline]
    fn lock_pending(&self) -> MutexGuard<HashMap<(MethodId, SessionId), ResponseCallback>> {
        self.pending.lock().expect("pending call map poisoned")
    }

    #[inline]
    fn lock_events(&self) -> MutexGuard<HashMap<EventId, Arc<dyn EventReceiveHandler>>> {
        self.events.lock().expect("event handler map poisoned")
    }
}

/// Owns the per-proxy routers, keyed by provided instance and client id.
pub struct ProxyRouterMapper {
    routers: Mutex<HashMap<(ProvidedServiceInstanceId, ClientId), Arc<ProxyRouter>>>,
    log: logging::Logger,
}

impl ProxyRouterMapper {
    pub fn new(log: &logging::Logger) -> Arc<ProxyRouterMapper> {
        Arc::new(ProxyRouterMapper {
            routers: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("component" => "proxy_router_mapper")),
        })
    }

    /// Creates the router for one proxy. A duplicate (instance, client)
    /// pair is a contract violation.
    pub fn add_router(
        &self,
        provided: ProvidedServiceInstanceId,
        client_id: ClientId,
    ) -> Arc<ProxyRouter> {
        let router = ProxyRouter::new(provided, client_id, &self.log);

        let mut routers = self.lock();

        if routers.insert((provided, client_id), router.clone()).is_some() {
            panic!("Proxy router registered twice for {} client {}", provided, client_id);
        }

        router
    }

    pub fn get(
        &self,
        provided: &ProvidedServiceInstanceId,
        client_id: ClientId,
    ) -> Option<Arc<ProxyRouter>> {
        self.lock().get(&(*provided, client_id)).cloned()
    }

    pub fn release(&self, provided: &ProvidedServiceInstanceId, client_id: ClientId) {
        self.lock().remove(&(*provided, client_id));
    }

    /// Removes every router of the provided instance. Used when the last
    /// proxy of the instance releases the shared connection.
    pub fn release_instance(&self, provided: &ProvidedServiceInstanceId) {
        self.lock().retain(|(instance, _), _| instance != provided);
    }

    pub fn router_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops every router. Part of the deinitialization sequence.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Routes `Response`, `ErrorResponse` and `ApplicationError` messages to
    /// the pending call of the addressed client.
    pub fn route_response(&self, packet: &Packet) {
        let header = *packet.method_header().expect("response without method header");

        let router = {
            let routers = self.lock();
            routers
                .iter()
                .find(|((provided, client_id), _)| {
                    *client_id == header.client_id
                        && provided.matches_wire(header.service_id, header.instance_id, header.major_version)
                })
                .map(|(_, router)| router.clone())
        };

        let router = match router {
            Some(router) => router,
            None => {
                logging::debug!(self.log, "response for unknown client dropped";
                                "context" => "route_response",
                                "client_id" => header.client_id);
                return;
            }
        };

        let response = match packet.message_type() {
            MessageType::Response => MethodResponse::Ok(packet.clone()),
            MessageType::ErrorResponse => MethodResponse::Error(packet.clone()),
            MessageType::ApplicationError => MethodResponse::ApplicationError(packet.clone()),
            _ => unreachable!("route_response called with a non-response packet"),
        };

        router.complete(header.method_id, header.session_id, response);
    }

    /// Fans a notification out to every router of the instance. The wire
    /// carries no client id for notifications.
    pub fn route_notification(&self, packet: &Packet) {
        let header = *packet.event_header().expect("notification without event header");

        let routers: Vec<Arc<ProxyRouter>> = {
            let routers = self.lock();
            routers
                .iter()
                .filter(|((provided, _), _)| {
                    provided.matches_wire(header.service_id, header.instance_id, header.major_version)
                })
                .map(|(_, router)| router.clone())
                .collect()
        };

        for router in routers {
            router.deliver_notification(header.event_id, packet);
        }
    }

    /// Routes a subscription acknowledgement to the addressed client.
    pub fn route_subscription_response(&self, packet: &Packet, ack: bool) {
        let header = *packet
            .subscription_header()
            .expect("subscription response without subscription header");

        let router = {
            let routers = self.lock();
            routers
                .iter()
                .find(|((provided, client_id), _)| {
                    *client_id == header.client_id
                        && provided.matches_wire(header.service_id, header.instance_id, header.major_version)
                })
                .map(|(_, router)| router.clone())
        };

        match router {
            Some(router) => router.deliver_subscription_response(header.event_id, ack),
            None => {
                logging::debug!(self.log, "subscription response for unknown client dropped";
                                "context" => "route_subscription_response",
                                "client_id" => header.client_id);
            }
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<(ProvidedServiceInstanceId, ClientId), Arc<ProxyRouter>>> {
        self.routers.lock().expect("router map poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{EventHeader, MethodHeader, ReturnCode, SubscriptionHeader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provided() -> ProvidedServiceInstanceId {
        ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        }
    }

    fn response(client_id: u32, method_id: u32, session_id: u32) -> Packet {
        Packet::response(
            MethodHeader {
                service_id: 7,
                instance_id: 3,
                major_version: 1,
                method_id,
                client_id,
                session_id,
            },
            &[0xBE, 0xEF],
        )
    }

    fn notification(event_id: u32) -> Packet {
        Packet::notification(
            EventHeader {
                service_id: 7,
                instance_id: 3,
                major_version: 1,
                event_id,
                session_id: 1,
            },
            &[1],
        )
    }

    struct CountingEventHandler {
        notifications: AtomicUsize,
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    impl CountingEventHandler {
        fn new() -> Arc<CountingEventHandler> {
            Arc::new(CountingEventHandler {
                notifications: AtomicUsize::new(0),
                acks: AtomicUsize::new(0),
                nacks: AtomicUsize::new(0),
            })
        }
    }

    impl EventReceiveHandler for CountingEventHandler {
        fn on_notification(&self, _packet: &Packet) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }

        fn on_subscription_ack(&self) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_subscription_nack(&self) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_response_completes_pending_call() {
        let mapper = ProxyRouterMapper::new(&logging::discard());
        let router = mapper.add_router(provided(), 42);

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_cb = completed.clone();
        router.register_response_handler(
            5,
            1,
            Box::new(move |response| match response {
                MethodResponse::Ok(packet) => {
                    assert_eq!(packet.payload(), &[0xBE, 0xEF]);
                    completed_cb.fetch_add(1, Ordering::SeqCst);
                }
                _ => panic!("Expected an Ok response"),
            }),
        );

        mapper.route_response(&response(42, 5, 1));

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn test_response_for_other_client_not_delivered() {
        let mapper = ProxyRouterMapper::new(&logging::discard());
        let router = mapper.add_router(provided(), 42);

        router.register_response_handler(5, 1, Box::new(|_| panic!("Wrong client")));

        mapper.route_response(&response(43, 5, 1));

        assert_eq!(router.pending_count(), 1);
    }

    #[test]
    fn test_error_response_delivered_as_error() {
        let mapper = ProxyRouterMapper::new(&logging::discard());
        let router = mapper.add_router(provided(), 42);

        let saw_error = Arc::new(AtomicUsize::new(0));
        let saw_error_cb = saw_error.clone();
        router.register_response_handler(
            99,
            1,
            Box::new(move |response| match response {
                MethodResponse::Error(packet) => {
                    assert_eq!(
                        packet.error_header().unwrap().return_code,
                        ReturnCode::UnknownMethodId
                    );
                    saw_error_cb.fetch_add(1, Ordering::SeqCst);
                }
                _ => panic!("Expected an error response"),
            }),
        );

        let error = Packet::error_response(
            MethodHeader {
                service_id: 7,
                instance_id: 3,
                major_version: 1,
                method_id: 99,
                client_id: 42,
                session_id: 1,
            },
            ReturnCode::UnknownMethodId,
        );
        mapper.route_response(&error);

        assert_eq!(saw_error.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notification_fans_out_to_all_instance_routers() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        let first = mapper.add_router(provided(), 1);
        let second = mapper.add_router(provided(), 2);

        let handler_a = CountingEventHandler::new();
        let handler_b = CountingEventHandler::new();
        first.register_event_handler(4, handler_a.clone());
        second.register_event_handler(4, handler_b.clone());

        mapper.route_notification(&notification(4));

        assert_eq!(handler_a.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(handler_b.notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_ack_routed_by_client() {
        let mapper = ProxyRouterMapper::new(&logging::discard());
        let router = mapper.add_router(provided(), 7);

        let handler = CountingEventHandler::new();
        router.register_event_handler(4, handler.clone());

        let header = SubscriptionHeader {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            event_id: 4,
            client_id: 7,
        };

        mapper.route_subscription_response(&Packet::subscribe_ack(header), true);
        mapper.route_subscription_response(&Packet::subscribe_nack(header), false);

        assert_eq!(handler.acks.load(Ordering::SeqCst), 1);
        assert_eq!(handler.nacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_instance_removes_all_clients() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        mapper.add_router(provided(), 1);
        mapper.add_router(provided(), 2);
        let other = ProvidedServiceInstanceId {
            instance_id: 9,
            ..provided()
        };
        mapper.add_router(other, 3);

        mapper.release_instance(&provided());

        assert_eq!(mapper.router_count(), 1);
        assert!(mapper.get(&other, 3).is_some());
    }

    #[test]
    #[should_panic(expected = "Proxy router registered twice")]
    fn test_duplicate_router_is_violation() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        mapper.add_router(provided(), 1);
        mapper.add_router(provided(), 1);
    }

    #[test]
    #[should_panic(expected = "Response handler registered twice")]
    fn test_duplicate_response_handler_is_violation() {
        let mapper = ProxyRouterMapper::new(&logging::discard());
        let router = mapper.add_router(provided(), 1);

        router.register_response_handler(5, 1, Box::new(|_| ()));
        router.register_response_handler(5, 1, Box::new(|_| ()));
    }
}
