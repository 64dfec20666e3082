//! Registry of skeleton service handlers keyed by provided instance, and
//! the dispatch of inbound messages to them. Routing misses materialize as
//! `ErrorResponse` messages for requests and are logged and dropped for
//! fire-and-forget requests.

use crate::ids::{ConnectionId, MajorVersion, ProvidedServiceInstanceId, ServiceId};
use crate::protocol::message::Packet;
use crate::protocol::wire::ReturnCode;
use crate::skeleton::connection::SkeletonConnection;
use hashbrown::HashMap;
use keel::logging;
use std::sync::{Arc, Mutex, MutexGuard};

/// Server side face of one provided service instance. Implemented by the
/// generated skeleton backend; method and event demultiplexing happens
/// behind this trait.
pub trait SkeletonService: Send + Sync {
    /// Handles a method request. The implementation sends its response (or
    /// application error) through the connection; a returned code is turned
    /// into an `ErrorResponse` by the router.
    fn handle_request(
        &self,
        connection: &Arc<SkeletonConnection>,
        packet: &Packet,
    ) -> Result<(), ReturnCode>;

    /// Handles a fire-and-forget request. Failures are logged and dropped.
    fn handle_request_no_return(&self, packet: &Packet) -> Result<(), ReturnCode>;

    /// Handles an event subscription; the implementation acknowledges
    /// through the connection. A returned code yields a negative
    /// acknowledgement.
    fn handle_subscribe(
        &self,
        connection: &Arc<SkeletonConnection>,
        packet: &Packet,
    ) -> Result<(), ReturnCode>;

    /// Handles an event unsubscription.
    fn handle_unsubscribe(&self, connection_id: ConnectionId, packet: &Packet);

    /// A peer connection went away; all its subscriptions are dropped.
    fn handle_connection_closed(&self, connection_id: ConnectionId);

    /// The instance stopped being offered.
    fn handle_stop_offer(&self);
}

/// Maps provided instances to their skeleton handlers. Keys are unique;
/// registering a duplicate is a contract violation.
pub struct SkeletonRouter {
    services: Mutex<HashMap<ProvidedServiceInstanceId, Arc<dyn SkeletonService>>>,
    log: logging::Logger,
}

impl SkeletonRouter {
    pub fn new(log: &logging::Logger) -> Arc<SkeletonRouter> {
        Arc::new(SkeletonRouter {
            services: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("component" => "skeleton_router")),
        })
    }

    pub fn add_service(&self, provided: ProvidedServiceInstanceId, service: Arc<dyn SkeletonService>) {
        let mut services = self.lock();

        if services.insert(provided, service).is_some() {
            panic!("Skeleton handler registered twice for {}", provided);
        }

        logging::debug!(self.log, "service registered"; "context" => "add_service", "provided" => %provided);
    }

    pub fn remove_service(&self, provided: &ProvidedServiceInstanceId) -> Option<Arc<dyn SkeletonService>> {
        self.lock().remove(provided)
    }

    pub fn has_service(&self, provided: &ProvidedServiceInstanceId) -> bool {
        self.lock().contains_key(provided)
    }

    /// Drops every registered handler. Part of the deinitialization
    /// sequence.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn route_request(&self, connection: &Arc<SkeletonConnection>, packet: Packet) {
        let header = *packet.method_header().expect("request without method header");

        let outcome = match self.find(header.service_id, header.instance_id, header.major_version) {
            Ok(service) => service.handle_request(connection, &packet),
            Err(code) => Err(code),
        };

        if let Err(code) = outcome {
            logging::debug!(self.log, "request failed";
                            "context" => "route_request",
                            "service_id" => header.service_id,
                            "method_id" => header.method_id,
                            "return_code" => ?code);

            connection.send_error_response(Packet::error_response(header, code));
        }
    }

    pub fn route_request_no_return(&self, packet: &Packet) {
        let header = *packet.method_header().expect("request without method header");

        let outcome = match self.find(header.service_id, header.instance_id, header.major_version) {
            Ok(service) => service.handle_request_no_return(packet),
            Err(code) => Err(code),
        };

        if let Err(code) = outcome {
            logging::debug!(self.log, "fire-and-forget request dropped";
                            "context" => "route_request_no_return",
                            "service_id" => header.service_id,
                            "method_id" => header.method_id,
                            "return_code" => ?code);
        }
    }

    /// Routes a subscription. Subscriptions arrive only over connections
    /// accepted by an offered server, so a miss means the peer is talking
    /// out of state: the connection is invalidated.
    pub fn route_subscribe(&self, connection: &Arc<SkeletonConnection>, packet: &Packet) {
        let header = *packet
            .subscription_header()
            .expect("subscription without subscription header");

        match self.find(header.service_id, header.instance_id, header.major_version) {
            Ok(service) => {
                if let Err(code) = service.handle_subscribe(connection, packet) {
                    logging::debug!(self.log, "subscription refused";
                                    "context" => "route_subscribe",
                                    "event_id" => header.event_id,
                                    "return_code" => ?code);

                    connection.send_subscribe_nack(Packet::subscribe_nack(header));
                }
            }
            Err(_) => {
                logging::error!(self.log, "subscription for unoffered instance";
                                "context" => "route_subscribe",
                                "service_id" => header.service_id,
                                "instance_id" => header.instance_id);

                connection.protocol_violation();
            }
        }
    }

    pub fn route_unsubscribe(&self, connection: &Arc<SkeletonConnection>, packet: &Packet) {
        let header = *packet
            .subscription_header()
            .expect("subscription without subscription header");

        match self.find(header.service_id, header.instance_id, header.major_version) {
            Ok(service) => service.handle_unsubscribe(connection.id(), packet),
            Err(_) => {
                logging::debug!(self.log, "unsubscription for unknown instance dropped";
                                "context" => "route_unsubscribe",
                                "service_id" => header.service_id);
            }
        }
    }

    /// Fans a closed connection out to every registered service.
    pub fn connection_closed(&self, connection_id: ConnectionId) {
        let services: Vec<Arc<dyn SkeletonService>> = self.lock().values().cloned().collect();

        for service in services {
            service.handle_connection_closed(connection_id);
        }
    }

    /// Looks a service up by its wire coordinates. The minor version does
    /// not travel on the wire, so matching ignores it.
    fn find(
        &self,
        service_id: ServiceId,
        instance_id: u32,
        major_version: MajorVersion,
    ) -> Result<Arc<dyn SkeletonService>, ReturnCode> {
        let services = self.lock();

        for (provided, service) in services.iter() {
            if provided.matches_wire(service_id, instance_id, major_version) {
                return Ok(service.clone());
            }
        }

        if services.keys().any(|provided| provided.service_id == service_id) {
            Err(ReturnCode::UnknownInstanceId)
        } else {
            Err(ReturnCode::UnknownServiceId)
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<ProvidedServiceInstanceId, Arc<dyn SkeletonService>>> {
        self.services.lock().expect("service registry poisoned")
    }
}
