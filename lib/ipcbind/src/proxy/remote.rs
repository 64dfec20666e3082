//! Shared remote-server objects: one per provided instance id, shared by
//! every local proxy of that instance and reference counted through
//! `Arc`.

use crate::error::TransportError;
use crate::ids::{allocate_client_id, ClientId, ProvidedServiceInstanceId, RequiredServiceInstanceId};
use crate::protocol::message::Packet;
use crate::proxy::connection::{ConnectionState, ConnectionStateChangeHandler, ProxyConnection};
use crate::proxy::manager::ProxyConnectionManager;
use crate::proxy::router::{ProxyRouter, ProxyRouterMapper};
use crate::transport::address::IpcUnicastAddress;
use hashbrown::HashMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::ReactorHandle;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct StateEntry {
    handler: Weak<dyn ConnectionStateChangeHandler>,
    connected_seen: bool,
}

/// Client side representation of one provided instance. Holds the shared
/// proxy connection handle; dropped when the last proxy releases it.
///
/// The remote server registers itself as the instance's single state
/// handler on the shared connection and fans state changes out to its
/// proxies. The `connected_seen` mark keeps the fan-out idempotent per
/// proxy, so a late joiner receives `on_connected` without replaying it to
/// the others.
pub struct RemoteServer {
    weak: Weak<RemoteServer>,
    provided: ProvidedServiceInstanceId,
    required: RequiredServiceInstanceId,
    address: IpcUnicastAddress,
    connection: Arc<ProxyConnection>,
    manager: Arc<ProxyConnectionManager>,
    mapper: Arc<ProxyRouterMapper>,
    state_handlers: Mutex<Vec<StateEntry>>,
    reactor: ReactorHandle,
}

impl RemoteServer {
    #[inline]
    pub fn provided(&self) -> ProvidedServiceInstanceId {
        self.provided
    }

    #[inline]
    pub fn required(&self) -> RequiredServiceInstanceId {
        self.required
    }

    #[inline]
    pub fn address(&self) -> IpcUnicastAddress {
        self.address
    }

    /// Registers a proxy's state handler and drives the shared connection
    /// towards `Connected`. On an already connected socket the new handler
    /// still observes `on_connected`, through a posted reactor task.
    pub fn connect(&self, handler: &Arc<dyn ConnectionStateChangeHandler>) -> ConnectionState {
        {
            let weak = Arc::downgrade(handler);
            let mut entries = self.lock_handlers();

            if !entries.iter().any(|entry| entry.handler.ptr_eq(&weak)) {
                entries.push(StateEntry {
                    handler: weak,
                    connected_seen: false,
                });
            }
        }

        let this: Arc<dyn ConnectionStateChangeHandler> =
            self.weak.upgrade().expect("remote server vanished during connect");

        self.connection.connect(self.provided, &this)
    }

    /// Unregisters a proxy's state handler; the last one releases the
    /// shared connection.
    pub fn disconnect(&self, handler: &Arc<dyn ConnectionStateChangeHandler>) {
        let empty = {
            let weak = Arc::downgrade(handler);
            let mut entries = self.lock_handlers();
            entries.retain(|entry| !entry.handler.ptr_eq(&weak));
            entries.is_empty()
        };

        if empty {
            let manager = self.manager.clone();
            let provided = self.provided;
            let address = self.address;

            self.reactor.post(Box::new(move || {
                manager.disconnect(&provided, address);
            }));
        }
    }

    #[inline]
    fn lock_handlers(&self) -> std::sync::MutexGuard<Vec<StateEntry>> {
        self.state_handlers.lock().expect("state handler list poisoned")
    }

    /// Allocates a process-unique client id and its router on the shared
    /// mapper.
    pub fn create_client_router(&self) -> (ClientId, Arc<ProxyRouter>) {
        let client_id = allocate_client_id();
        let router = self.mapper.add_router(self.provided, client_id);

        (client_id, router)
    }

    pub fn release_client_router(&self, client_id: ClientId) {
        self.mapper.release(&self.provided, client_id);
    }

    pub fn send_request(&self, packet: Packet) -> bool {
        self.connection.send_request(packet)
    }

    pub fn send_request_no_return(&self, packet: Packet) -> bool {
        self.connection.send_request_no_return(packet)
    }

    pub fn subscribe_event(&self, packet: Packet) -> bool {
        self.connection.subscribe_event(packet)
    }

    pub fn unsubscribe_event(&self, packet: Packet) -> bool {
        self.connection.unsubscribe_event(packet)
    }
}

impl ConnectionStateChangeHandler for RemoteServer {
    fn on_connected(&self) {
        let handlers: Vec<Arc<dyn ConnectionStateChangeHandler>> = {
            let mut entries = self.lock_handlers();
            entries
                .iter_mut()
                .filter(|entry| !entry.connected_seen)
                .filter_map(|entry| {
                    entry.handler.upgrade().map(|handler| {
                        entry.connected_seen = true;
                        handler
                    })
                })
                .collect()
        };

        for handler in handlers {
            handler.on_connected();
        }
    }

    fn on_disconnected(&self, reason: TransportError) {
        let handlers: Vec<Arc<dyn ConnectionStateChangeHandler>> = {
            let mut entries = self.lock_handlers();
            entries
                .iter_mut()
                .filter_map(|entry| {
                    entry.connected_seen = false;
                    entry.handler.upgrade()
                })
                .collect()
        };

        for handler in handlers {
            handler.on_disconnected(reason);
        }
    }
}

impl Drop for RemoteServer {
    /// The last proxy released the server. Connection teardown and mapper
    /// cleanup run in reactor context.
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let provided = self.provided;
        let address = self.address;

        self.reactor.post(Box::new(move || {
            manager.release_router_mapper(address, &provided);
            manager.disconnect(&provided, address);
        }));
    }
}

/// Deduplicates remote servers per provided instance id. Entries hold weak
/// references: an entry exists while at least one proxy holds the shared
/// handle, and is evicted on the next release after the last drop.
pub struct RemoteServerManager {
    servers: Mutex<HashMap<ProvidedServiceInstanceId, Weak<RemoteServer>>>,
    proxy_manager: Arc<ProxyConnectionManager>,
    mapper: Arc<ProxyRouterMapper>,
    reactor: ReactorHandle,
    log: logging::Logger,
}

impl RemoteServerManager {
    pub fn new(
        proxy_manager: Arc<ProxyConnectionManager>,
        mapper: Arc<ProxyRouterMapper>,
        reactor: &ReactorHandle,
        log: &logging::Logger,
    ) -> RemoteServerManager {
        RemoteServerManager {
            servers: Mutex::new(HashMap::new()),
            proxy_manager,
            mapper,
            reactor: reactor.clone(),
            log: log.new(logging::o!("component" => "remote_server_manager")),
        }
    }

    /// Returns the shared remote server for the provided instance, creating
    /// it on first request. All proxies of the instance share one object.
    pub fn request_remote_server(
        &self,
        provided: ProvidedServiceInstanceId,
        required: RequiredServiceInstanceId,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
    ) -> Arc<RemoteServer> {
        let mut servers = self.lock();

        if let Some(weak) = servers.get(&provided) {
            if let Some(server) = weak.upgrade() {
                return server;
            }
        }

        let connection =
            self.proxy_manager
                .acquire_connection(address, integrity, self.mapper.clone());

        let server = Arc::new_cyclic(|weak| RemoteServer {
            weak: weak.clone(),
            provided,
            required,
            address,
            connection,
            manager: self.proxy_manager.clone(),
            mapper: self.mapper.clone(),
            state_handlers: Mutex::new(Vec::new()),
            reactor: self.reactor.clone(),
        });

        servers.insert(provided, Arc::downgrade(&server));

        logging::debug!(self.log, "remote server created";
                        "context" => "request_remote_server",
                        "provided" => %provided);

        server
    }

    /// Evicts the entry once no proxy holds the shared handle any more.
    pub fn release_remote_server(&self, provided: &ProvidedServiceInstanceId) {
        let mut servers = self.lock();

        if let Some(weak) = servers.get(provided) {
            if weak.upgrade().is_none() {
                servers.remove(provided);

                logging::debug!(self.log, "remote server entry evicted";
                                "context" => "release_remote_server",
                                "provided" => %provided);
            }
        }
    }

    pub fn has_entry(&self, provided: &ProvidedServiceInstanceId) -> bool {
        self.lock().contains_key(provided)
    }

    pub fn entry_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops all bookkeeping. Part of the deinitialization sequence.
    pub fn deinit(&self) {
        self.lock().clear();
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<ProvidedServiceInstanceId, Weak<RemoteServer>>> {
        self.servers.lock().expect("remote server map poisoned")
    }
}
