//! Acceptor-owning server per offered instance, and the manager holding all
//! active servers. Manager operations run in reactor context only.

use crate::error::{BindingError, BindingResult, TransportResult};
use crate::ids::{ConnectionId, ProvidedServiceInstanceId};
use crate::pool::BufferPool;
use crate::skeleton::connection::{ConnectionOwner, SkeletonConnection};
use crate::skeleton::router::SkeletonRouter;
use crate::transport::acceptor::Acceptor;
use crate::transport::address::IpcUnicastAddress;
use hashbrown::HashMap;
use indexmap::IndexMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::ReactorHandle;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct ServerShared {
    connections: Mutex<IndexMap<ConnectionId, Arc<SkeletonConnection>>>,
    log: logging::Logger,
}

impl ConnectionOwner for ServerShared {
    fn drop_connection(&self, connection_id: ConnectionId) {
        let mut connections = self.connections.lock().expect("connection list poisoned");
        connections.swap_remove(&connection_id);

        logging::debug!(self.log, "connection dropped";
                        "context" => "drop_connection",
                        "connection_id" => connection_id,
                        "remaining" => connections.len());
    }
}

/// Exists while a provided instance is offered. Owns the acceptor and all
/// skeleton connections accepted for the instance.
pub struct Server {
    address: IpcUnicastAddress,
    provided: ProvidedServiceInstanceId,
    integrity: IntegrityLevel,
    acceptor: Arc<Acceptor>,
    shared: Arc<ServerShared>,
}

impl Server {
    fn create(
        address: IpcUnicastAddress,
        provided: ProvidedServiceInstanceId,
        integrity: IntegrityLevel,
        socket_path: PathBuf,
        router: Arc<SkeletonRouter>,
        reactor: &ReactorHandle,
        pool: BufferPool,
        log: &logging::Logger,
    ) -> TransportResult<Server> {
        let server_log = log.new(logging::o!("component" => "server", "provided" => format!("{}", provided)));

        let acceptor = Acceptor::new(reactor, &server_log);
        acceptor.init(socket_path)?;

        let shared = Arc::new(ServerShared {
            connections: Mutex::new(IndexMap::new()),
            log: server_log.clone(),
        });

        {
            let shared_dyn: Arc<dyn ConnectionOwner> = shared.clone();
            let owner: Weak<dyn ConnectionOwner> = Arc::downgrade(&shared_dyn);
            let shared = shared.clone();
            let router = router.clone();
            let reactor = reactor.clone();
            let accept_log = server_log.clone();

            acceptor.accept_async(Box::new(move |result| match result {
                Ok(conn) => {
                    if !conn.check_peer_integrity_level(integrity) {
                        logging::warn!(accept_log, "peer below required integrity level";
                                       "context" => "accept");
                        conn.close();
                        return;
                    }

                    match SkeletonConnection::spawn(
                        conn,
                        router.clone(),
                        owner.clone(),
                        &reactor,
                        pool.clone(),
                        &accept_log,
                    ) {
                        Ok(connection) => {
                            logging::debug!(accept_log, "connection accepted";
                                            "context" => "accept",
                                            "connection_id" => connection.id());

                            shared
                                .connections
                                .lock()
                                .expect("connection list poisoned")
                                .insert(connection.id(), connection);
                        }
                        Err(err) => {
                            logging::warn!(accept_log, "error wiring accepted connection";
                                           "context" => "accept",
                                           "error" => ?err);
                        }
                    }
                }
                Err(err) => {
                    logging::warn!(accept_log, "accept failed"; "context" => "accept", "error" => ?err);
                }
            }));
        }

        Ok(Server {
            address,
            provided,
            integrity,
            acceptor,
            shared,
        })
    }

    #[inline]
    pub fn address(&self) -> IpcUnicastAddress {
        self.address
    }

    #[inline]
    pub fn provided(&self) -> ProvidedServiceInstanceId {
        self.provided
    }

    #[inline]
    pub fn integrity(&self) -> IntegrityLevel {
        self.integrity
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().expect("connection list poisoned").len()
    }

    fn stop(&self) {
        self.acceptor.close();

        let connections: Vec<Arc<SkeletonConnection>> = {
            let mut connections = self.shared.connections.lock().expect("connection list poisoned");
            connections.drain(..).map(|(_, connection)| connection).collect()
        };

        for connection in connections {
            connection.close();
        }
    }

    fn is_in_use(&self) -> bool {
        if self.acceptor.is_in_use() {
            return true;
        }

        self.shared
            .connections
            .lock()
            .expect("connection list poisoned")
            .values()
            .any(|connection| connection.is_in_use())
    }
}

/// Holds all active servers, one per offered provided instance.
pub struct SkeletonConnectionManager {
    servers: Mutex<HashMap<ProvidedServiceInstanceId, Server>>,
    router: Arc<SkeletonRouter>,
    reactor: ReactorHandle,
    pool: BufferPool,
    socket_dir: Option<PathBuf>,
    log: logging::Logger,
}

impl SkeletonConnectionManager {
    pub fn new(
        router: Arc<SkeletonRouter>,
        reactor: &ReactorHandle,
        pool: BufferPool,
        socket_dir: Option<PathBuf>,
        log: &logging::Logger,
    ) -> SkeletonConnectionManager {
        SkeletonConnectionManager {
            servers: Mutex::new(HashMap::new()),
            router,
            reactor: reactor.clone(),
            pool,
            socket_dir,
            log: log.new(logging::o!("component" => "skeleton_connection_manager")),
        }
    }

    /// Binds and starts accepting for the provided instance. Creating a
    /// second server for the same instance without an intervening
    /// `disconnect_server` fails.
    pub fn create_server(
        &self,
        address: IpcUnicastAddress,
        provided: ProvidedServiceInstanceId,
        integrity: IntegrityLevel,
    ) -> BindingResult<()> {
        self.reactor.assert_reactor_context();

        let mut servers = self.lock();

        if servers.contains_key(&provided) {
            logging::warn!(self.log, "server already exists";
                           "context" => "create_server",
                           "provided" => %provided);
            return Err(BindingError::ErrorNotOk);
        }

        let socket_path = address.socket_path(self.socket_dir.as_deref());

        let server = Server::create(
            address,
            provided,
            integrity,
            socket_path,
            self.router.clone(),
            &self.reactor,
            self.pool.clone(),
            &self.log,
        )?;

        servers.insert(provided, server);

        logging::info!(self.log, "server created";
                       "context" => "create_server",
                       "provided" => %provided,
                       "address" => %address);

        Ok(())
    }

    /// Stops accepting and closes every connection of the instance.
    pub fn disconnect_server(&self, provided: &ProvidedServiceInstanceId) -> BindingResult<()> {
        self.reactor.assert_reactor_context();

        match self.lock().remove(provided) {
            Some(server) => {
                server.stop();
                Ok(())
            }
            None => Err(BindingError::ErrorNotOk),
        }
    }

    pub fn server_connection_count(&self, provided: &ProvidedServiceInstanceId) -> Option<usize> {
        self.lock().get(provided).map(|server| server.connection_count())
    }

    /// Stops all servers. Part of the deinitialization sequence.
    pub fn deinit(&self) {
        let servers: Vec<Server> = {
            let mut map = self.lock();
            map.drain().map(|(_, server)| server).collect()
        };

        for server in servers.iter() {
            server.stop();
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.lock().values().any(|server| server.is_in_use())
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<ProvidedServiceInstanceId, Server>> {
        self.servers.lock().expect("server map poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Packet;
    use crate::protocol::wire::{MessageType, MethodHeader, ReturnCode};
    use crate::skeleton::router::SkeletonService;
    use crate::transport::connection::Connection;
    use crate::transport::handler::MessageHandler;
    use keel::reactor::Reactor;
    use std::sync::Mutex as StdMutex;
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
            connection.send_response(Packet::response(header, packet.payload()));
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

    fn manager(reactor: &Reactor, socket_dir: PathBuf) -> SkeletonConnectionManager {
        let log = logging::discard();
        let router = SkeletonRouter::new(&log);
        router.add_service(provided(), Arc::new(EchoService));

        SkeletonConnectionManager::new(
            router,
            &reactor.handle(),
            BufferPool::new(),
            Some(socket_dir),
            &log,
        )
    }

    #[test]
    fn test_create_server_twice_is_error_not_ok() {
        let reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&reactor, dir.path().to_path_buf());

        let address = IpcUnicastAddress::new(10, 1000);

        manager.create_server(address, provided(), IntegrityLevel::Low).unwrap();
        assert_eq!(
            manager.create_server(address, provided(), IntegrityLevel::Low),
            Err(BindingError::ErrorNotOk)
        );

        manager.deinit();
    }

    #[test]
    fn test_disconnect_unknown_server_is_error_not_ok() {
        let reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&reactor, dir.path().to_path_buf());

        assert_eq!(
            manager.disconnect_server(&provided()),
            Err(BindingError::ErrorNotOk)
        );
    }

    #[test]
    fn test_request_response_through_server() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&reactor, dir.path().to_path_buf());

        let address = IpcUnicastAddress::new(10, 1000);
        manager.create_server(address, provided(), IntegrityLevel::Low).unwrap();

        let log = logging::discard();
        let handle = reactor.handle();

        let client = Connection::new(&handle, &log);
        client
            .connect_async(
                &address.socket_path(Some(dir.path())),
                Box::new(|result| result.unwrap()),
            )
            .unwrap();

        let client_probe = client.clone();
        pump(&mut reactor, move || client_probe.check_is_open());

        let peer = MessageHandler::new(client, BufferPool::new(), &log);
        let inbox = Arc::new(StdMutex::new(Vec::new()));
        let inbox_cb = inbox.clone();
        peer.start_receive(Box::new(move |packet| {
            inbox_cb.lock().unwrap().push(packet);
        }))
        .unwrap();

        peer.send(Packet::request(
            MethodHeader {
                service_id: 7,
                instance_id: 3,
                major_version: 1,
                method_id: 5,
                client_id: 42,
                session_id: 1,
            },
            &[0xDE, 0xAD],
        ));

        let inbox_probe = inbox.clone();
        pump(&mut reactor, move || !inbox_probe.lock().unwrap().is_empty());

        {
            let inbox = inbox.lock().unwrap();
            assert_eq!(inbox[0].message_type(), MessageType::Response);
            assert_eq!(inbox[0].payload(), &[0xDE, 0xAD]);
        }

        assert_eq!(manager.server_connection_count(&provided()), Some(1));

        manager.disconnect_server(&provided()).unwrap();
        assert_eq!(manager.server_connection_count(&provided()), None);
    }

    #[test]
    fn test_peer_loss_drops_connection_on_reactor() {
        let mut reactor = Reactor::new(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&reactor, dir.path().to_path_buf());

        let address = IpcUnicastAddress::new(10, 1001);
        manager.create_server(address, provided(), IntegrityLevel::Low).unwrap();

        let log = logging::discard();
        let client = Connection::new(&reactor.handle(), &log);
        client
            .connect_async(
                &address.socket_path(Some(dir.path())),
                Box::new(|result| result.unwrap()),
            )
            .unwrap();

        let client_probe = client.clone();
        pump(&mut reactor, move || client_probe.check_is_open());

        let count_probe = || manager.server_connection_count(&provided());
        pump(&mut reactor, || count_probe() == Some(1));

        client.close();

        pump(&mut reactor, || count_probe() == Some(0));

        manager.deinit();
    }
}
