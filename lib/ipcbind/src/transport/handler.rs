//! Per-connection message handler: a non-blocking send pipeline with
//! queueing and an asynchronous receive loop feeding parsed packets upward.
//! A transport or protocol error invalidates the handler permanently.

use crate::error::{TransportError, TransportResult};
use crate::pool::BufferPool;
use crate::protocol::message::Packet;
use crate::transport::connection::{Connection, SendOutcome};
use keel::logging;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type ErrorCallback = Box<dyn FnOnce(TransportError) + Send>;
pub type MessageCallback = Box<dyn Fn(Packet) + Send + Sync>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendState {
    Idle,
    Sending,
    Error,
}

struct Pipeline {
    state: SendState,
    queue: VecDeque<Packet>,
}

/// Owns the send queue and receive dispatch of one connection. The `Error`
/// state is terminal; the error callback fires at most once per handler
/// lifetime.
pub struct MessageHandler {
    weak: Weak<MessageHandler>,
    conn: Arc<Connection>,
    pool: BufferPool,
    pipeline: Mutex<Pipeline>,
    error_cb: Mutex<Option<ErrorCallback>>,
    log: logging::Logger,
}

impl MessageHandler {
    pub fn new(conn: Arc<Connection>, pool: BufferPool, log: &logging::Logger) -> Arc<MessageHandler> {
        Arc::new_cyclic(|weak| MessageHandler {
            weak: weak.clone(),
            conn,
            pool,
            pipeline: Mutex::new(Pipeline {
                state: SendState::Idle,
                queue: VecDeque::new(),
            }),
            error_cb: Mutex::new(None),
            log: log.new(logging::o!("component" => "message_handler")),
        })
    }

    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Registers the callback fired exactly once when the handler enters the
    /// `Error` state.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        let mut slot = self.error_cb.lock().expect("error callback slot poisoned");

        if slot.is_some() {
            panic!("Error callback registered twice on a message handler");
        }

        *slot = Some(callback);
    }

    /// Enqueues the packet and, when the pipeline is idle, immediately pumps
    /// it towards the socket. Returns false when the handler is in the
    /// `Error` state and the packet was dropped.
    pub fn send(&self, packet: Packet) -> bool {
        {
            let mut pipeline = self.lock_pipeline();

            match pipeline.state {
                SendState::Error => {
                    logging::trace!(self.log, "packet dropped in error state"; "context" => "send");
                    return false;
                }
                SendState::Sending => {
                    pipeline.queue.push_back(packet);
                    return true;
                }
                SendState::Idle => {
                    pipeline.queue.push_back(packet);
                    pipeline.state = SendState::Sending;
                }
            }
        }

        self.drive();
        true
    }

    /// Enqueues without attempting transmission. Paired with `send_queued`,
    /// which is typically scheduled onto the reactor thread by a producer.
    pub fn add_to_send_queue(&self, packet: Packet) -> bool {
        let mut pipeline = self.lock_pipeline();

        match pipeline.state {
            SendState::Error => false,
            _ => {
                pipeline.queue.push_back(packet);
                true
            }
        }
    }

    /// Starts transmitting queued packets if the pipeline is idle.
    pub fn send_queued(&self) {
        {
            let mut pipeline = self.lock_pipeline();

            if pipeline.state != SendState::Idle || pipeline.queue.is_empty() {
                return;
            }

            pipeline.state = SendState::Sending;
        }

        self.drive();
    }

    /// Arms the receive loop. Every well-formed frame is parsed and handed
    /// to `on_message`; a malformed frame is a protocol violation that
    /// closes the connection and invalidates the handler.
    pub fn start_receive(&self, on_message: MessageCallback) -> TransportResult<()> {
        let pool = self.pool.clone();
        let weak = self.weak.clone();
        let log = self.log.clone();

        self.conn.receive_async(
            Box::new(move |len| pool.alloc(len)),
            Box::new(move |result| {
                let handler = match weak.upgrade() {
                    Some(handler) => handler,
                    None => return false,
                };

                match result {
                    Ok(buf) => match Packet::parse(buf) {
                        Ok(packet) => {
                            on_message(packet);
                            true
                        }
                        Err(err) => {
                            logging::error!(log, "malformed message";
                                            "context" => "receive",
                                            "error" => ?err);
                            handler.conn.close();
                            handler.enter_error(TransportError::ProtocolError);
                            false
                        }
                    },
                    Err(err) => {
                        handler.enter_error(err);
                        false
                    }
                }
            }),
        )
    }

    /// Forces the handler into the `Error` state and closes the connection.
    /// Used for protocol violations detected above the framing layer.
    pub fn invalidate(&self, err: TransportError) {
        self.conn.close();
        self.enter_error(err);
    }

    #[inline]
    pub fn is_in_error(&self) -> bool {
        self.lock_pipeline().state == SendState::Error
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.conn.is_in_use()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.lock_pipeline().queue.len()
    }

    /// Pumps the head of the queue into the socket until the socket goes
    /// asynchronous, the queue drains, or a send fails. The loop is bounded
    /// by the queue length.
    fn drive(&self) {
        loop {
            let packet = {
                let mut pipeline = self.lock_pipeline();

                if pipeline.state != SendState::Sending {
                    return;
                }

                match pipeline.queue.front().cloned() {
                    Some(packet) => packet,
                    None => {
                        pipeline.state = SendState::Idle;
                        return;
                    }
                }
            };

            // The pipeline lock is not held across the socket send.
            let weak = self.weak.clone();
            let result = self.conn.send(
                packet.buffer(),
                Box::new(move |completion| {
                    if let Some(handler) = weak.upgrade() {
                        handler.on_send_complete(completion);
                    }
                }),
            );

            match result {
                Ok(SendOutcome::Completed) => {
                    let mut pipeline = self.lock_pipeline();
                    pipeline.queue.pop_front();

                    if pipeline.queue.is_empty() {
                        pipeline.state = SendState::Idle;
                        return;
                    }
                }
                Ok(SendOutcome::AsyncProcessingNecessary) => return,
                Err(err) => {
                    self.enter_error(err);
                    return;
                }
            }
        }
    }

    fn on_send_complete(&self, result: TransportResult<()>) {
        match result {
            Ok(()) => {
                let drained = {
                    let mut pipeline = self.lock_pipeline();

                    if pipeline.state != SendState::Sending {
                        return;
                    }

                    pipeline.queue.pop_front();

                    if pipeline.queue.is_empty() {
                        pipeline.state = SendState::Idle;
                        true
                    } else {
                        false
                    }
                };

                if !drained {
                    self.drive();
                }
            }
            Err(err) => self.enter_error(err),
        }
    }

    /// Terminal transition. Drops all queued packets and fires the error
    /// callback once.
    fn enter_error(&self, err: TransportError) {
        let first = {
            let mut pipeline = self.lock_pipeline();

            if pipeline.state == SendState::Error {
                false
            } else {
                pipeline.state = SendState::Error;
                pipeline.queue.clear();
                true
            }
        };

        if !first {
            return;
        }

        logging::warn!(self.log, "handler entered error state";
                       "context" => "enter_error",
                       "error" => ?err);

        let callback = self.error_cb.lock().expect("error callback slot poisoned").take();

        if let Some(callback) = callback {
            callback(err);
        }
    }

    #[inline]
    fn lock_pipeline(&self) -> MutexGuard<Pipeline> {
        self.pipeline.lock().expect("send pipeline poisoned")
    }
}
