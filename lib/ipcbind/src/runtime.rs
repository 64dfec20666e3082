//! Binding glue: one initialize/deinitialize lifecycle wrapping the
//! managers, routers and the injected service discovery.

use crate::config::RuntimeConfig;
use crate::discovery::{FindServiceListener, ServiceDiscovery};
use crate::error::{BindingError, BindingResult};
use crate::ids::{ProvidedServiceInstanceId, RequiredServiceInstanceId};
use crate::pool::BufferPool;
use crate::proxy::manager::ProxyConnectionManager;
use crate::proxy::remote::{RemoteServer, RemoteServerManager};
use crate::proxy::router::ProxyRouterMapper;
use crate::skeleton::router::{SkeletonRouter, SkeletonService};
use crate::skeleton::server::SkeletonConnectionManager;
use crate::transport::address::IpcUnicastAddress;
use hashbrown::HashMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::ReactorHandle;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DEINIT_DRAIN_ATTEMPTS: usize = 1000;
const DEINIT_DRAIN_PAUSE: Duration = Duration::from_millis(1);

/// Offers observed through discovery for the configured required
/// instances.
struct OfferCache {
    offers: Mutex<HashMap<ProvidedServiceInstanceId, (IpcUnicastAddress, IntegrityLevel)>>,
}

impl OfferCache {
    fn new() -> Arc<OfferCache> {
        Arc::new(OfferCache {
            offers: Mutex::new(HashMap::new()),
        })
    }

    fn find_match(
        &self,
        required: &RequiredServiceInstanceId,
    ) -> Option<(ProvidedServiceInstanceId, IpcUnicastAddress, IntegrityLevel)> {
        let offers = self.offers.lock().expect("offer cache poisoned");

        offers
            .iter()
            .find(|(provided, _)| required.matches(provided))
            .map(|(provided, (address, integrity))| (*provided, *address, *integrity))
    }
}

impl FindServiceListener for OfferCache {
    fn on_service_found(
        &self,
        provided: ProvidedServiceInstanceId,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
    ) {
        self.offers
            .lock()
            .expect("offer cache poisoned")
            .insert(provided, (address, integrity));
    }

    fn on_service_stopped(&self, provided: ProvidedServiceInstanceId) {
        self.offers.lock().expect("offer cache poisoned").remove(&provided);
    }
}

/// The assembled binding. Constructed once per process by `initialize`,
/// torn down by `deinitialize` after the reactor thread has stopped.
pub struct Runtime {
    config: RuntimeConfig,
    discovery: Arc<dyn ServiceDiscovery>,
    reactor: ReactorHandle,
    pool: BufferPool,
    skeleton_router: Arc<SkeletonRouter>,
    router_mapper: Arc<ProxyRouterMapper>,
    skeleton_manager: SkeletonConnectionManager,
    proxy_manager: Arc<ProxyConnectionManager>,
    remote_servers: RemoteServerManager,
    offers: Arc<OfferCache>,
    log: logging::Logger,
}

impl Runtime {
    /// Builds the managers and routers and subscribes to offers for every
    /// configured required instance.
    pub fn initialize(
        config: RuntimeConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        reactor: &ReactorHandle,
        log: &logging::Logger,
    ) -> Runtime {
        let runtime_log = log.new(logging::o!("component" => "runtime"));
        let pool = BufferPool::new();

        let skeleton_router = SkeletonRouter::new(&runtime_log);
        let router_mapper = ProxyRouterMapper::new(&runtime_log);

        let skeleton_manager = SkeletonConnectionManager::new(
            skeleton_router.clone(),
            reactor,
            pool.clone(),
            config.socket_dir.clone(),
            &runtime_log,
        );

        let proxy_manager = ProxyConnectionManager::new(
            reactor,
            pool.clone(),
            config.socket_dir.clone(),
            &runtime_log,
        );

        let remote_servers = RemoteServerManager::new(
            proxy_manager.clone(),
            router_mapper.clone(),
            reactor,
            &runtime_log,
        );

        let offers = OfferCache::new();

        for required in config.required.iter() {
            let listener: Arc<dyn FindServiceListener> = offers.clone();
            discovery.start_find_service(required.required_id(), listener);
        }

        logging::info!(runtime_log, "binding initialized";
                       "context" => "initialize",
                       "provided" => config.provided.len(),
                       "required" => config.required.len());

        Runtime {
            config,
            discovery,
            reactor: reactor.clone(),
            pool,
            skeleton_router,
            router_mapper,
            skeleton_manager,
            proxy_manager,
            remote_servers,
            offers,
            log: runtime_log,
        }
    }

    #[inline]
    pub fn skeleton_router(&self) -> &Arc<SkeletonRouter> {
        &self.skeleton_router
    }

    #[inline]
    pub fn router_mapper(&self) -> &Arc<ProxyRouterMapper> {
        &self.router_mapper
    }

    #[inline]
    pub fn skeleton_manager(&self) -> &SkeletonConnectionManager {
        &self.skeleton_manager
    }

    #[inline]
    pub fn proxy_manager(&self) -> &Arc<ProxyConnectionManager> {
        &self.proxy_manager
    }

    #[inline]
    pub fn remote_servers(&self) -> &RemoteServerManager {
        &self.remote_servers
    }

    #[inline]
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    #[inline]
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Offers a configured provided instance: registers the handler, binds
    /// the server and announces the offer through discovery.
    pub fn offer_service(
        &self,
        provided: ProvidedServiceInstanceId,
        service: Arc<dyn SkeletonService>,
    ) -> BindingResult<()> {
        let entry = match self.config.find_provided(&provided, &self.log) {
            Some(entry) => entry.clone(),
            None => {
                logging::warn!(self.log, "offer for unconfigured instance";
                               "context" => "offer_service",
                               "provided" => %provided);
                return Err(BindingError::ErrorNotOk);
            }
        };

        if self.skeleton_router.has_service(&provided) {
            return Err(BindingError::ErrorNotOk);
        }

        self.skeleton_router.add_service(provided, service);

        if let Err(err) = self
            .skeleton_manager
            .create_server(entry.address, provided, entry.integrity)
        {
            self.skeleton_router.remove_service(&provided);
            return Err(err);
        }

        self.discovery.offer_service(provided, entry.address, entry.integrity);

        Ok(())
    }

    /// Withdraws the offer, stops the server and releases the handler.
    pub fn stop_offer_service(&self, provided: ProvidedServiceInstanceId) -> BindingResult<()> {
        self.discovery.stop_offer_service(provided);
        self.skeleton_manager.disconnect_server(&provided)?;

        if let Some(service) = self.skeleton_router.remove_service(&provided) {
            service.handle_stop_offer();
        }

        Ok(())
    }

    /// Resolves a required instance against the offers seen so far and
    /// returns the shared remote server for the match.
    pub fn request_remote_server(
        &self,
        required: RequiredServiceInstanceId,
    ) -> BindingResult<Arc<RemoteServer>> {
        let (provided, address, _offered) = match self.offers.find_match(&required) {
            Some(found) => found,
            None => {
                logging::debug!(self.log, "no offer for required instance";
                                "context" => "request_remote_server");
                return Err(BindingError::ErrorNotOk);
            }
        };

        let minimum = self
            .config
            .required
            .iter()
            .find(|entry| entry.required_id() == required)
            .map(|entry| entry.integrity)
            .unwrap_or(IntegrityLevel::Low);

        Ok(self
            .remote_servers
            .request_remote_server(provided, required, address, minimum))
    }

    pub fn release_remote_server(&self, provided: &ProvidedServiceInstanceId) {
        self.remote_servers.release_remote_server(provided);
    }

    pub fn is_in_use(&self) -> bool {
        self.proxy_manager.is_in_use() || self.skeleton_manager.is_in_use()
    }

    /// Tears the binding down in dependency order and waits for every
    /// socket to report `is_in_use() == false`. The reactor thread must
    /// have stopped before this is called.
    pub fn deinitialize(self) {
        for required in self.config.required.iter() {
            self.discovery.stop_find_service(required.required_id());
        }

        self.proxy_manager.deinit();
        self.skeleton_manager.deinit();
        self.remote_servers.deinit();
        self.router_mapper.clear();
        self.skeleton_router.clear();

        for _ in 0..DEINIT_DRAIN_ATTEMPTS {
            if !self.is_in_use() {
                break;
            }

            thread::sleep(DEINIT_DRAIN_PAUSE);
        }

        logging::info!(self.log, "binding deinitialized"; "context" => "deinitialize");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProvidedInstanceConfig, RequiredInstanceConfig};
    use crate::discovery::LocalDiscovery;
    use crate::ids::{ConnectionId, EventId, InstanceSelector};
    use crate::protocol::message::Packet;
    use crate::protocol::wire::{MethodHeader, ReturnCode, SubscriptionHeader};
    use crate::proxy::connection::{ConnectionState, ConnectionStateChangeHandler};
    use crate::proxy::router::{EventReceiveHandler, MethodResponse};
    use crate::skeleton::connection::SkeletonConnection;
    use crate::skeleton::event::{NotificationSink, SkeletonEvent};
    use crate::error::TransportError;
    use keel::reactor::Reactor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const FIELD_EVENT: EventId = 4;

    fn pump(reactor: &mut Reactor, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            reactor.handle_events(Some(Duration::from_millis(10))).unwrap();

            if done() {
                return;
            }
        }

        panic!("Reactor pump deadline expired");
    }

    fn provided() -> ProvidedServiceInstanceId {
        ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        }
    }

    fn required() -> RequiredServiceInstanceId {
        RequiredServiceInstanceId {
            service_id: 7,
            major_version: 1,
            minor_version: 0,
            instance: InstanceSelector::Exact(3),
        }
    }

    fn make_runtime(reactor: &Reactor, dir: &Path) -> Runtime {
        let log = logging::discard();
        let discovery = LocalDiscovery::new(&log);

        let config = RuntimeConfig {
            socket_dir: Some(dir.to_path_buf()),
            provided: vec![ProvidedInstanceConfig {
                instance_identifier: "IpcBinding:7:3:1:0".to_string(),
                address: IpcUnicastAddress::new(10, 1000),
                integrity: IntegrityLevel::Low,
            }],
            required: vec![RequiredInstanceConfig {
                service_id: 7,
                major_version: 1,
                minor_version: 0,
                instance_id: Some(3),
                integrity: IntegrityLevel::Low,
            }],
        };

        Runtime::initialize(config, discovery, &reactor.handle(), &log)
    }

    /// Test skeleton: method 5 answers `[0xBE, 0xEF]`, event 4 is a field
    /// notifier.
    struct TestService {
        field: SkeletonEvent,
    }

    impl TestService {
        fn new() -> Arc<TestService> {
            Arc::new(TestService {
                field: SkeletonEvent::new(provided(), FIELD_EVENT, true, &logging::discard()),
            })
        }
    }

    impl SkeletonService for TestService {
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
            connection: &Arc<SkeletonConnection>,
            packet: &Packet,
        ) -> Result<(), ReturnCode> {
            let header = packet.subscription_header().unwrap();

            if header.event_id != FIELD_EVENT {
                return Err(ReturnCode::UnknownMethodId);
            }

            let sink: Arc<dyn NotificationSink> = connection.clone();
            self.field.handle_subscription(&sink, header);
            Ok(())
        }

        fn handle_unsubscribe(&self, connection_id: ConnectionId, _packet: &Packet) {
            self.field.handle_unsubscription(connection_id);
        }

        fn handle_connection_closed(&self, connection_id: ConnectionId) {
            self.field.handle_disconnect(connection_id);
        }

        fn handle_stop_offer(&self) {
            self.field.handle_stop_offer();
        }
    }

    struct StateProbe {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl StateProbe {
        fn new() -> Arc<StateProbe> {
            Arc::new(StateProbe {
                connected: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
            })
        }
    }

    impl ConnectionStateChangeHandler for StateProbe {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnected(&self, _reason: TransportError) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records the order of event traffic as seen by one proxy.
    struct EventProbe {
        sequence: Mutex<Vec<String>>,
        payloads: Mutex<Vec<Vec<u8>>>,
        sessions: Mutex<Vec<u32>>,
    }

    impl EventProbe {
        fn new() -> Arc<EventProbe> {
            Arc::new(EventProbe {
                sequence: Mutex::new(Vec::new()),
                payloads: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            })
        }

        fn sequence(&self) -> Vec<String> {
            self.sequence.lock().unwrap().clone()
        }
    }

    impl EventReceiveHandler for EventProbe {
        fn on_notification(&self, packet: &Packet) {
            self.sequence.lock().unwrap().push("notification".to_string());
            self.payloads.lock().unwrap().push(packet.payload().to_vec());
            self.sessions
                .lock()
                .unwrap()
                .push(packet.event_header().unwrap().session_id);
        }

        fn on_subscription_ack(&self) {
            self.sequence.lock().unwrap().push("ack".to_string());
        }

        fn on_subscription_nack(&self) {
            self.sequence.lock().unwrap().push("nack".to_string());
        }
    }

    struct ConnectedProxy {
        remote: Arc<RemoteServer>,
        router: Arc<crate::proxy::router::ProxyRouter>,
        client_id: u32,
        probe: Arc<StateProbe>,
    }

    fn connect_proxy(reactor: &mut Reactor, runtime: &Runtime) -> ConnectedProxy {
        let remote = runtime.request_remote_server(required()).unwrap();
        let (client_id, router) = remote.create_client_router();

        let probe = StateProbe::new();
        let handler: Arc<dyn ConnectionStateChangeHandler> = probe.clone();
        remote.connect(&handler);

        let probe_wait = probe.clone();
        pump(reactor, move || probe_wait.connected.load(Ordering::SeqCst) == 1);

        ConnectedProxy {
            remote,
            router,
            client_id,
            probe,
        }
    }

    fn request_header(client_id: u32, method_id: u32, session_id: u32) -> MethodHeader {
        MethodHeader {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            method_id,
            client_id,
            session_id,
        }
    }

    #[test]
    fn test_request_response_happy_path() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();

        let proxy = connect_proxy(&mut reactor, &runtime);

        let response: Arc<Mutex<Option<Packet>>> = Arc::new(Mutex::new(None));
        let response_cb = response.clone();
        proxy.router.register_response_handler(
            5,
            1,
            Box::new(move |outcome| match outcome {
                MethodResponse::Ok(packet) => *response_cb.lock().unwrap() = Some(packet),
                _ => panic!("Expected a successful response"),
            }),
        );

        assert!(proxy
            .remote
            .send_request(Packet::request(request_header(proxy.client_id, 5, 1), &[0xDE, 0xAD])));

        let response_wait = response.clone();
        pump(&mut reactor, move || response_wait.lock().unwrap().is_some());

        let response = response.lock().unwrap();
        let packet = response.as_ref().unwrap();
        let header = packet.method_header().unwrap();
        assert_eq!(header.method_id, 5);
        assert_eq!(header.client_id, proxy.client_id);
        assert_eq!(header.session_id, 1);
        assert_eq!(packet.payload(), &[0xBE, 0xEF]);
    }

    #[test]
    fn test_unknown_method_yields_error_response() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();

        let proxy = connect_proxy(&mut reactor, &runtime);

        let error: Arc<Mutex<Option<Packet>>> = Arc::new(Mutex::new(None));
        let error_cb = error.clone();
        proxy.router.register_response_handler(
            99,
            1,
            Box::new(move |outcome| match outcome {
                MethodResponse::Error(packet) => *error_cb.lock().unwrap() = Some(packet),
                _ => panic!("Expected an error response"),
            }),
        );

        assert!(proxy
            .remote
            .send_request(Packet::request(request_header(proxy.client_id, 99, 1), &[])));

        let error_wait = error.clone();
        pump(&mut reactor, move || error_wait.lock().unwrap().is_some());

        let error = error.lock().unwrap();
        let header = error.as_ref().unwrap().error_header().unwrap();
        assert_eq!(header.method.method_id, 99);
        assert_eq!(header.method.session_id, 1);
        assert_eq!(header.return_code, ReturnCode::UnknownMethodId);
    }

    #[test]
    fn test_field_initial_value_after_ack() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        let service = TestService::new();
        runtime.offer_service(provided(), service.clone()).unwrap();

        // A value is published before anyone subscribes.
        service.field.send(&[0xAA, 0xBB]);

        let proxy = connect_proxy(&mut reactor, &runtime);

        let events = EventProbe::new();
        proxy.router.register_event_handler(FIELD_EVENT, events.clone());

        assert!(proxy.remote.subscribe_event(Packet::subscribe(SubscriptionHeader {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            event_id: FIELD_EVENT,
            client_id: proxy.client_id,
        })));

        let events_wait = events.clone();
        pump(&mut reactor, move || events_wait.sequence().len() == 2);

        assert_eq!(events.sequence(), vec!["ack".to_string(), "notification".to_string()]);
        assert_eq!(events.payloads.lock().unwrap()[0], vec![0xAA, 0xBB]);
        assert_eq!(events.sessions.lock().unwrap()[0], 1);

        // The ongoing stream follows with increasing session ids.
        service.field.send(&[0xCC]);

        let events_wait = events.clone();
        pump(&mut reactor, move || events_wait.sequence().len() == 3);

        assert_eq!(events.payloads.lock().unwrap()[1], vec![0xCC]);
        assert_eq!(events.sessions.lock().unwrap()[1], 2);
    }

    #[test]
    fn test_connection_loss_fans_out_to_all_proxies() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();

        // Two proxies sharing one connection.
        let remote = runtime.request_remote_server(required()).unwrap();

        let first = StateProbe::new();
        let second = StateProbe::new();
        let first_handler: Arc<dyn ConnectionStateChangeHandler> = first.clone();
        let second_handler: Arc<dyn ConnectionStateChangeHandler> = second.clone();

        remote.connect(&first_handler);
        remote.connect(&second_handler);

        let (first_wait, second_wait) = (first.clone(), second.clone());
        pump(&mut reactor, move || {
            first_wait.connected.load(Ordering::SeqCst) == 1
                && second_wait.connected.load(Ordering::SeqCst) == 1
        });

        // Kill the server.
        runtime.stop_offer_service(provided()).unwrap();

        let (first_wait, second_wait) = (first.clone(), second.clone());
        pump(&mut reactor, move || {
            first_wait.disconnected.load(Ordering::SeqCst) == 1
                && second_wait.disconnected.load(Ordering::SeqCst) == 1
        });

        // No second callback fires.
        for _ in 0..5 {
            reactor.handle_events(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(first.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(second.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(first.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_proxy_still_sees_on_connected() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();

        let proxy = connect_proxy(&mut reactor, &runtime);

        // The connection is already up; a late handler still gets the
        // callback, and the early one does not see it twice.
        let late = StateProbe::new();
        let late_handler: Arc<dyn ConnectionStateChangeHandler> = late.clone();
        assert_eq!(proxy.remote.connect(&late_handler), ConnectionState::Connected);

        let late_wait = late.clone();
        pump(&mut reactor, move || {
            late_wait.connected.load(Ordering::SeqCst) == 1
        });

        assert_eq!(proxy.probe.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_offer_unconfigured_instance_fails() {
        let reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        let other = ProvidedServiceInstanceId {
            instance_id: 9,
            ..provided()
        };

        assert_eq!(
            runtime.offer_service(other, TestService::new()).err().unwrap(),
            BindingError::ErrorNotOk
        );
    }

    #[test]
    fn test_offer_twice_fails() {
        let reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();

        assert_eq!(
            runtime.offer_service(provided(), TestService::new()).err().unwrap(),
            BindingError::ErrorNotOk
        );

        runtime.stop_offer_service(provided()).unwrap();
        runtime.offer_service(provided(), TestService::new()).unwrap();
    }

    #[test]
    fn test_request_without_offer_fails() {
        let reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        assert_eq!(
            runtime.request_remote_server(required()).err().unwrap(),
            BindingError::ErrorNotOk
        );
    }

    #[test]
    fn test_deinitialize_releases_everything() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(&reactor, dir.path());

        runtime.offer_service(provided(), TestService::new()).unwrap();
        let proxy = connect_proxy(&mut reactor, &runtime);

        drop(proxy.remote);
        drop(proxy.router);

        runtime.deinitialize();
    }
}
