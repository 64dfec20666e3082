//! Per-event subscriber fan-out on the skeleton side. A field notifier
//! additionally caches the last sent value and replays it to late
//! subscribers, after their acknowledgement.

use crate::ids::{ConnectionId, EventId, ProvidedServiceInstanceId};
use crate::protocol::message::Packet;
use crate::protocol::session::SessionHandler;
use crate::protocol::wire::{EventHeader, SubscriptionHeader};
use hashbrown::HashMap;
use keel::logging;
use std::sync::{Mutex, MutexGuard, Weak};

/// Outbound face of a skeleton connection as seen by the event fan-out.
pub trait NotificationSink: Send + Sync {
    fn connection_id(&self) -> ConnectionId;
    fn send_notification(&self, packet: Packet) -> bool;
    fn send_subscribe_ack(&self, packet: Packet) -> bool;
}

struct Subscriber {
    sink: Weak<dyn NotificationSink>,
    refcount: u32,
}

/// One event (or field notifier) of a provided service instance.
///
/// Lock order: `sending` strictly before `subscribers` whenever both are
/// held.
pub struct SkeletonEvent {
    provided: ProvidedServiceInstanceId,
    event_id: EventId,
    is_field: bool,
    session: SessionHandler,
    sending: Mutex<Option<Vec<u8>>>,
    subscribers: Mutex<HashMap<ConnectionId, Subscriber>>,
    log: logging::Logger,
}

impl SkeletonEvent {
    pub fn new(
        provided: ProvidedServiceInstanceId,
        event_id: EventId,
        is_field: bool,
        log: &logging::Logger,
    ) -> SkeletonEvent {
        SkeletonEvent {
            provided,
            event_id,
            is_field,
            session: SessionHandler::new(0),
            sending: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("event_id" => event_id)),
        }
    }

    #[inline]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    #[inline]
    pub fn is_field(&self) -> bool {
        self.is_field
    }

    /// Broadcasts a sample to all live subscribers. For a field notifier the
    /// sample also becomes the cached initial value for late subscribers.
    /// Dead subscriber entries are skipped here and reclaimed on explicit
    /// unsubscription or disconnect.
    pub fn send(&self, sample: &[u8]) {
        let mut cache = self.lock_sending();

        if self.is_field {
            *cache = Some(sample.to_vec());
        }

        let session_id = self.session.advance();

        let packet = Packet::notification(
            EventHeader {
                service_id: self.provided.service_id,
                instance_id: self.provided.instance_id,
                major_version: self.provided.major_version,
                event_id: self.event_id,
                session_id,
            },
            sample,
        );

        logging::trace!(self.log, "broadcasting notification";
                        "context" => "send",
                        "session_id" => session_id);

        {
            let subscribers = self.lock_subscribers();

            for subscriber in subscribers.values() {
                if let Some(sink) = subscriber.sink.upgrade() {
                    sink.send_notification(packet.clone());
                }
            }
        }

        drop(cache);
    }

    /// Registers a subscriber, acknowledges the subscription and, for a
    /// field with a cached value, delivers the initial value to this
    /// subscriber only. The acknowledgement always precedes the initial
    /// value on the connection.
    pub fn handle_subscription(
        &self,
        sink: &std::sync::Arc<dyn NotificationSink>,
        header: &SubscriptionHeader,
    ) {
        // Holding the cache lock blocks a concurrent send from publishing a
        // stale initial value between the insert and the replay.
        let cache = if self.is_field {
            Some(self.lock_sending())
        } else {
            None
        };

        let connection_id = sink.connection_id();

        {
            let mut subscribers = self.lock_subscribers();

            let entry = subscribers.entry(connection_id).or_insert_with(|| Subscriber {
                sink: std::sync::Arc::downgrade(sink),
                refcount: 0,
            });
            entry.refcount += 1;

            logging::debug!(self.log, "subscription registered";
                            "context" => "handle_subscription",
                            "connection_id" => connection_id,
                            "refcount" => entry.refcount);
        }

        sink.send_subscribe_ack(Packet::subscribe_ack(*header));

        if let Some(cache) = cache {
            if let Some(value) = cache.as_ref() {
                let packet = Packet::notification(
                    EventHeader {
                        service_id: self.provided.service_id,
                        instance_id: self.provided.instance_id,
                        major_version: self.provided.major_version,
                        event_id: self.event_id,
                        session_id: self.session.get(),
                    },
                    value,
                );

                sink.send_notification(packet);
            }
        }
    }

    /// Drops one subscription reference; the entry disappears when the
    /// count reaches zero, so repeated subscriptions cancel symmetrically.
    pub fn handle_unsubscription(&self, connection_id: ConnectionId) {
        let mut subscribers = self.lock_subscribers();

        if let Some(entry) = subscribers.get_mut(&connection_id) {
            entry.refcount -= 1;

            if entry.refcount == 0 {
                subscribers.remove(&connection_id);
            }
        }
    }

    /// Removes the subscriber unconditionally, regardless of its count.
    pub fn handle_disconnect(&self, connection_id: ConnectionId) {
        self.lock_subscribers().remove(&connection_id);
    }

    /// Clears all subscribers when the instance stops being offered.
    pub fn handle_stop_offer(&self) {
        self.lock_subscribers().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    #[inline]
    fn lock_sending(&self) -> MutexGuard<Option<Vec<u8>>> {
        self.sending.lock().expect("event cache poisoned")
    }

    #[inline]
    fn lock_subscribers(&self) -> MutexGuard<HashMap<ConnectionId, Subscriber>> {
        self.subscribers.lock().expect("subscriber map poisoned")
    }
}
