//! Proxy connection manager: opens or reuses one outbound connection per
//! server address and forwards state change registrations to it.

use crate::ids::ProvidedServiceInstanceId;
use crate::pool::BufferPool;
use crate::proxy::connection::{
    ConnectionState, ConnectionStateChangeHandler, DisconnectListener, ProxyConnection,
};
use crate::proxy::router::ProxyRouterMapper;
use crate::transport::address::IpcUnicastAddress;
use hashbrown::HashMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::ReactorHandle;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub struct ProxyConnectionManager {
    weak: Weak<ProxyConnectionManager>,
    connections: Mutex<HashMap<IpcUnicastAddress, Arc<ProxyConnection>>>,
    reactor: ReactorHandle,
    pool: BufferPool,
    socket_dir: Option<PathBuf>,
    log: logging::Logger,
}

impl ProxyConnectionManager {
    pub fn new(
        reactor: &ReactorHandle,
        pool: BufferPool,
        socket_dir: Option<PathBuf>,
        log: &logging::Logger,
    ) -> Arc<ProxyConnectionManager> {
        Arc::new_cyclic(|weak| ProxyConnectionManager {
            weak: weak.clone(),
            connections: Mutex::new(HashMap::new()),
            reactor: reactor.clone(),
            pool,
            socket_dir,
            log: log.new(logging::o!("component" => "proxy_connection_manager")),
        })
    }

    /// Registers the state handler on the connection towards `address`,
    /// creating the connection if this is the first proxy asking for it.
    pub fn connect(
        &self,
        state_handler: &Arc<dyn ConnectionStateChangeHandler>,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
        provided: ProvidedServiceInstanceId,
        mapper: Arc<ProxyRouterMapper>,
    ) -> ConnectionState {
        self.reactor.assert_reactor_context();

        let connection = self.acquire_connection(address, integrity, mapper);
        connection.connect(provided, state_handler)
    }

    /// Unregisters the instance from the connection; the connection is
    /// dropped from the map once its last handler is gone.
    pub fn disconnect(&self, provided: &ProvidedServiceInstanceId, address: IpcUnicastAddress) {
        self.reactor.assert_reactor_context();

        let connection = { self.lock().get(&address).cloned() };

        if let Some(connection) = connection {
            connection.disconnect(provided);

            if !connection.has_handlers() {
                self.lock().remove(&address);
            }
        }
    }

    /// Drops the routing state of the instance on the connection's mapper.
    pub fn release_router_mapper(
        &self,
        address: IpcUnicastAddress,
        provided: &ProvidedServiceInstanceId,
    ) {
        let connection = { self.lock().get(&address).cloned() };

        if let Some(connection) = connection {
            connection.release_routers(provided);
        }
    }

    /// Returns the shared connection for `address`, creating it on first
    /// use. Does not initiate connecting; that happens on `connect`.
    pub fn acquire_connection(
        &self,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
        mapper: Arc<ProxyRouterMapper>,
    ) -> Arc<ProxyConnection> {
        let mut connections = self.lock();

        if let Some(connection) = connections.get(&address) {
            return connection.clone();
        }

        let listener: Weak<dyn DisconnectListener> = self.weak.clone();

        let connection = ProxyConnection::new(
            address,
            address.socket_path(self.socket_dir.as_deref()),
            integrity,
            mapper,
            listener,
            &self.reactor,
            self.pool.clone(),
            &self.log,
        );

        connections.insert(address, connection.clone());

        logging::debug!(self.log, "proxy connection created";
                        "context" => "acquire_connection",
                        "address" => %address);

        connection
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Closes every connection. Part of the deinitialization sequence.
    pub fn deinit(&self) {
        let connections: Vec<Arc<ProxyConnection>> = {
            let mut map = self.lock();
            map.drain().map(|(_, connection)| connection).collect()
        };

        for connection in connections {
            connection.shutdown();
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.lock().values().any(|connection| connection.is_in_use())
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<IpcUnicastAddress, Arc<ProxyConnection>>> {
        self.connections.lock().expect("proxy connection map poisoned")
    }
}

impl DisconnectListener for ProxyConnectionManager {
    /// Back-edge from a proxy connection that lost its socket. The dead
    /// connection is dropped so the next `connect` builds a fresh one.
    fn on_connection_lost(&self, address: IpcUnicastAddress) {
        self.lock().remove(&address);

        logging::debug!(self.log, "connection removed after loss";
                        "context" => "on_connection_lost",
                        "address" => %address);
    }
}
