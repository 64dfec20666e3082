//! Loopback demonstration: offers an echo service instance and consumes it
//! through a proxy in the same process, driving the binding end to end
//! over a real Unix socket.

use ipcbind::config::{ProvidedInstanceConfig, RequiredInstanceConfig, RuntimeConfig};
use ipcbind::discovery::LocalDiscovery;
use ipcbind::error::TransportError;
use ipcbind::ids::{ConnectionId, ProvidedServiceInstanceId};
use ipcbind::protocol::message::Packet;
use ipcbind::protocol::wire::{MethodHeader, ReturnCode, SubscriptionHeader};
use ipcbind::proxy::connection::ConnectionStateChangeHandler;
use ipcbind::proxy::router::{EventReceiveHandler, MethodResponse};
use ipcbind::runtime::Runtime;
use ipcbind::skeleton::connection::SkeletonConnection;
use ipcbind::skeleton::event::{NotificationSink, SkeletonEvent};
use ipcbind::skeleton::router::SkeletonService;
use ipcbind::transport::address::IpcUnicastAddress;
use keel::cred::IntegrityLevel;
use keel::logging;
use keel::reactor::Reactor;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ECHO_METHOD: u32 = 1;
const TICK_EVENT: u32 = 4;

fn provided() -> ProvidedServiceInstanceId {
    ProvidedServiceInstanceId {
        service_id: 7,
        instance_id: 3,
        major_version: 1,
        minor_version: 0,
    }
}

/// Echoes every request payload back and publishes a tick field.
struct EchoService {
    tick: SkeletonEvent,
}

impl EchoService {
    fn new(log: &logging::Logger) -> Arc<EchoService> {
        Arc::new(EchoService {
            tick: SkeletonEvent::new(provided(), TICK_EVENT, true, log),
        })
    }
}

impl SkeletonService for EchoService {
    fn handle_request(
        &self,
        connection: &Arc<SkeletonConnection>,
        packet: &Packet,
    ) -> Result<(), ReturnCode> {
        let header = *packet.method_header().expect("request without method header");

        if header.method_id != ECHO_METHOD {
            return Err(ReturnCode::UnknownMethodId);
        }

        connection.send_response(Packet::response(header, packet.payload()));
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
        let header = packet.subscription_header().expect("subscription without header");

        if header.event_id != TICK_EVENT {
            return Err(ReturnCode::UnknownMethodId);
        }

        let sink: Arc<dyn NotificationSink> = connection.clone();
        self.tick.handle_subscription(&sink, header);
        Ok(())
    }

    fn handle_unsubscribe(&self, connection_id: ConnectionId, _packet: &Packet) {
        self.tick.handle_unsubscription(connection_id);
    }

    fn handle_connection_closed(&self, connection_id: ConnectionId) {
        self.tick.handle_disconnect(connection_id);
    }

    fn handle_stop_offer(&self) {
        self.tick.handle_stop_offer();
    }
}

struct StateLogger {
    ready: mpsc::Sender<()>,
    log: logging::Logger,
}

impl ConnectionStateChangeHandler for StateLogger {
    fn on_connected(&self) {
        logging::info!(self.log, "proxy connected"; "context" => "state");
        drop(self.ready.send(()));
    }

    fn on_disconnected(&self, reason: TransportError) {
        logging::warn!(self.log, "proxy disconnected"; "context" => "state", "reason" => ?reason);
    }
}

struct TickPrinter {
    notifications: mpsc::Sender<Vec<u8>>,
    log: logging::Logger,
}

impl EventReceiveHandler for TickPrinter {
    fn on_notification(&self, packet: &Packet) {
        drop(self.notifications.send(packet.payload().to_vec()));
    }

    fn on_subscription_ack(&self) {
        logging::info!(self.log, "subscription acknowledged"; "context" => "event");
    }

    fn on_subscription_nack(&self) {
        logging::warn!(self.log, "subscription refused"; "context" => "event");
    }
}

fn main() {
    let log = logging::term(logging::Severity::Debug);

    let socket_dir = env::temp_dir().join("echoloop");
    let config = RuntimeConfig {
        socket_dir: Some(socket_dir),
        provided: vec![ProvidedInstanceConfig {
            instance_identifier: provided().to_string(),
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

    let mut reactor = Reactor::new(&log).expect("Error creating reactor");
    let handle = reactor.handle();

    let discovery = LocalDiscovery::new(&log);
    let runtime = Runtime::initialize(config, discovery, &handle, &log);

    // Server side: offer the echo instance and publish a first tick. Server
    // creation is a reactor-context operation, so it happens before the
    // reactor thread takes over.
    let service = EchoService::new(&log);
    runtime
        .offer_service(provided(), service.clone())
        .expect("Error offering echo service");
    service.tick.send(b"tick-0");

    let stop = Arc::new(AtomicBool::new(false));
    let reactor_thread = {
        let stop = stop.clone();
        thread::spawn(move || {
            reactor
                .handle_events_loop(|| stop.load(Ordering::SeqCst))
                .expect("Reactor loop failed");
            reactor
        })
    };

    // Client side: resolve the offer and connect.
    let remote = runtime
        .request_remote_server(config_required())
        .expect("Echo service not offered");
    let (client_id, router) = remote.create_client_router();

    let (ready_tx, ready_rx) = mpsc::channel();
    let state: Arc<dyn ConnectionStateChangeHandler> = Arc::new(StateLogger {
        ready: ready_tx,
        log: log.clone(),
    });
    remote.connect(&state);
    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timed out connecting to the echo service");

    // One round trip.
    let (response_tx, response_rx) = mpsc::channel();
    router.register_response_handler(
        ECHO_METHOD,
        1,
        Box::new(move |outcome| match outcome {
            MethodResponse::Ok(packet) => drop(response_tx.send(packet.payload().to_vec())),
            MethodResponse::Error(packet) => {
                panic!("Echo failed: {:?}", packet.error_header().map(|h| h.return_code))
            }
            MethodResponse::ApplicationError(_) => panic!("Echo raised an application error"),
        }),
    );

    remote.send_request(Packet::request(
        MethodHeader {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            method_id: ECHO_METHOD,
            client_id,
            session_id: 1,
        },
        b"hello over ipc",
    ));

    let echoed = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timed out waiting for the echo response");
    logging::info!(log, "echo round trip done";
                   "context" => "main",
                   "payload" => String::from_utf8_lossy(&echoed).into_owned());

    // Subscribe to the tick field; the cached value arrives first.
    let (tick_tx, tick_rx) = mpsc::channel();
    router.register_event_handler(
        TICK_EVENT,
        Arc::new(TickPrinter {
            notifications: tick_tx,
            log: log.clone(),
        }),
    );

    remote.subscribe_event(Packet::subscribe(SubscriptionHeader {
        service_id: 7,
        instance_id: 3,
        major_version: 1,
        event_id: TICK_EVENT,
        client_id,
    }));

    let initial = tick_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timed out waiting for the initial field value");
    logging::info!(log, "initial field value received";
                   "context" => "main",
                   "payload" => String::from_utf8_lossy(&initial).into_owned());

    service.tick.send(b"tick-1");
    let next = tick_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timed out waiting for the next tick");
    logging::info!(log, "tick received";
                   "context" => "main",
                   "payload" => String::from_utf8_lossy(&next).into_owned());

    // Tear down: release the proxy side, stop the reactor thread, then
    // deinitialize the binding (which withdraws the offer with it).
    remote.disconnect(&state);
    remote.release_client_router(client_id);
    drop(remote);
    runtime.release_remote_server(&provided());

    stop.store(true, Ordering::SeqCst);
    handle.unblock();
    let _reactor = reactor_thread.join().expect("Reactor thread panicked");

    runtime.deinitialize();

    println!("echoloop finished");
}

fn config_required() -> ipcbind::ids::RequiredServiceInstanceId {
    ipcbind::ids::RequiredServiceInstanceId {
        service_id: 7,
        major_version: 1,
        minor_version: 0,
        instance: ipcbind::ids::InstanceSelector::Exact(3),
    }
}
