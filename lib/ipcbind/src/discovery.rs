//! Service discovery as consumed by the core: offers are announced and
//! withdrawn, and consumers subscribe to offers matching a required
//! instance. The multicast implementation lives outside the core; the
//! in-process registry below backs single-process deployments and the test
//! suite.

use crate::ids::{ProvidedServiceInstanceId, RequiredServiceInstanceId};
use crate::transport::address::IpcUnicastAddress;
use hashbrown::HashMap;
use keel::cred::IntegrityLevel;
use keel::logging;
use std::sync::{Arc, Mutex, MutexGuard};

/// Callbacks delivered to a consumer watching for offers.
pub trait FindServiceListener: Send + Sync {
    fn on_service_found(
        &self,
        provided: ProvidedServiceInstanceId,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
    );

    fn on_service_stopped(&self, provided: ProvidedServiceInstanceId);
}

/// Injected discovery interface.
pub trait ServiceDiscovery: Send + Sync {
    fn offer_service(
        &self,
        provided: ProvidedServiceInstanceId,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
    );

    fn stop_offer_service(&self, provided: ProvidedServiceInstanceId);

    fn start_find_service(
        &self,
        required: RequiredServiceInstanceId,
        listener: Arc<dyn FindServiceListener>,
    );

    fn stop_find_service(&self, required: RequiredServiceInstanceId);
}

struct LocalState {
    offers: HashMap<ProvidedServiceInstanceId, (IpcUnicastAddress, IntegrityLevel)>,
    finds: Vec<(RequiredServiceInstanceId, Arc<dyn FindServiceListener>)>,
}

/// In-process discovery registry matching offers against finds.
pub struct LocalDiscovery {
    state: Mutex<LocalState>,
    log: logging::Logger,
}

impl LocalDiscovery {
    pub fn new(log: &logging::Logger) -> Arc<LocalDiscovery> {
        Arc::new(LocalDiscovery {
            state: Mutex::new(LocalState {
                offers: HashMap::new(),
                finds: Vec::new(),
            }),
            log: log.new(logging::o!("component" => "local_discovery")),
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<LocalState> {
        self.state.lock().expect("discovery registry poisoned")
    }
}

impl ServiceDiscovery for LocalDiscovery {
    fn offer_service(
        &self,
        provided: ProvidedServiceInstanceId,
        address: IpcUnicastAddress,
        integrity: IntegrityLevel,
    ) {
        let listeners: Vec<Arc<dyn FindServiceListener>> = {
            let mut state = self.lock();
            state.offers.insert(provided, (address, integrity));

            state
                .finds
                .iter()
                .filter(|(required, _)| required.matches(&provided))
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        logging::debug!(self.log, "offer announced";
                        "context" => "offer_service",
                        "provided" => %provided,
                        "address" => %address);

        for listener in listeners {
            listener.on_service_found(provided, address, integrity);
        }
    }

    fn stop_offer_service(&self, provided: ProvidedServiceInstanceId) {
        let listeners: Vec<Arc<dyn FindServiceListener>> = {
            let mut state = self.lock();

            if state.offers.remove(&provided).is_none() {
                return;
            }

            state
                .finds
                .iter()
                .filter(|(required, _)| required.matches(&provided))
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        for listener in listeners {
            listener.on_service_stopped(provided);
        }
    }

    fn start_find_service(
        &self,
        required: RequiredServiceInstanceId,
        listener: Arc<dyn FindServiceListener>,
    ) {
        // Replay offers that are already on the table.
        let matches: Vec<(ProvidedServiceInstanceId, IpcUnicastAddress, IntegrityLevel)> = {
            let mut state = self.lock();

            let matches = state
                .offers
                .iter()
                .filter(|(provided, _)| required.matches(provided))
                .map(|(provided, (address, integrity))| (*provided, *address, *integrity))
                .collect();

            state.finds.push((required, listener.clone()));
            matches
        };

        for (provided, address, integrity) in matches {
            listener.on_service_found(provided, address, integrity);
        }
    }

    fn stop_find_service(&self, required: RequiredServiceInstanceId) {
        self.lock().finds.retain(|(found, _)| *found != required);
    }
}
