//! Generic connection over a Unix stream socket. Every message travels as a
//! 4 byte little-endian length prefix followed by the frame, so the layers
//! above only ever see whole messages. All completion callbacks execute on
//! the reactor thread.

use crate::error::{TransportError, TransportResult};
use crate::pool::PooledBuf;
use keel::cred::{self, Credentials, IntegrityLevel};
use keel::logging;
use keel::reactor::{Ready, ReactorHandle};
use mio::net::UnixStream;
use mio::{Interest, Token};
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Upper bound on a single frame. A larger length prefix is a protocol
/// violation and invalidates the connection before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Result of a synchronous send attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Completed,
    AsyncProcessingNecessary,
}

pub type ConnectCallback = Box<dyn FnOnce(TransportResult<()>) + Send>;
pub type SendCompletion = Box<dyn FnOnce(TransportResult<()>) + Send>;
/// Supplies a writable buffer of exactly the requested length.
pub type MessageAvailable = Box<dyn FnMut(usize) -> PooledBuf + Send>;
/// Consumes a completed frame (or the terminal error). Returning true
/// re-arms the receive path for the next frame.
pub type ReceiveComplete = Box<dyn FnMut(TransportResult<PooledBuf>) -> bool + Send>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct SendInFlight {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    frame: Arc<PooledBuf>,
    written: usize,
    on_complete: Option<SendCompletion>,
}

enum RecvState {
    Disarmed,
    Header { buf: [u8; LENGTH_PREFIX_SIZE], filled: usize },
    Body { buf: PooledBuf, filled: usize },
}

struct RecvHooks {
    on_message_available: MessageAvailable,
    on_receive_complete: ReceiveComplete,
}

enum ReadStep {
    Complete(PooledBuf),
    NeedBuffer(usize),
    Blocked,
    Disarmed,
    Failed(TransportError),
}

struct Inner {
    stream: Option<UnixStream>,
    token: Option<Token>,
    state: State,
    peer: Option<Credentials>,
    connect_cb: Option<ConnectCallback>,
    send: Option<SendInFlight>,
    recv_state: RecvState,
    recv_hooks: Option<RecvHooks>,
    in_callback: bool,
    pumping: bool,
}

/// A reliable, message-framed local socket connection.
pub struct Connection {
    weak: Weak<Connection>,
    inner: Mutex<Inner>,
    reactor: ReactorHandle,
    log: logging::Logger,
}

impl Connection {
    /// Creates an unconnected client side connection. `connect_async` must
    /// be called before any other operation.
    pub fn new(reactor: &ReactorHandle, log: &logging::Logger) -> Arc<Connection> {
        Arc::new_cyclic(|weak| Connection {
            weak: weak.clone(),
            inner: Mutex::new(Inner::empty(State::Idle)),
            reactor: reactor.clone(),
            log: log.new(logging::o!("component" => "connection")),
        })
    }

    /// Wraps an accepted stream. The connection is open immediately and its
    /// peer credentials are read from the OS.
    pub fn from_accepted(
        stream: UnixStream,
        reactor: &ReactorHandle,
        log: &logging::Logger,
    ) -> TransportResult<Arc<Connection>> {
        let peer = cred::peer_credentials(stream.as_raw_fd())?;

        let conn = Arc::new_cyclic(|weak| Connection {
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                stream: Some(stream),
                peer: Some(peer),
                ..Inner::empty(State::Open)
            }),
            reactor: reactor.clone(),
            log: log.new(logging::o!("component" => "connection")),
        });

        conn.register(Interest::READABLE)?;

        Ok(conn)
    }

    /// Starts an asynchronous connect towards the socket at `path`. The
    /// completion is delivered on the reactor thread.
    pub fn connect_async(&self, path: &Path, on_complete: ConnectCallback) -> TransportResult<()> {
        {
            let mut inner = self.lock();

            match inner.state {
                State::Idle => (),
                State::Connecting | State::Open => return Err(TransportError::AlreadyConnected),
                State::Closed => return Err(TransportError::Disconnected),
            }

            let stream = UnixStream::connect(path)?;

            inner.stream = Some(stream);
            inner.state = State::Connecting;
            inner.connect_cb = Some(on_complete);
        }

        logging::debug!(self.log, "connecting"; "context" => "connect_async", "path" => %path.display());

        self.register(Interest::WRITABLE)
    }

    /// Attempts to send the frame synchronously. If the socket would block,
    /// `AsyncProcessingNecessary` is returned and `on_complete` fires later
    /// on the reactor thread. At most one send may be outstanding.
    pub fn send(
        &self,
        frame: Arc<PooledBuf>,
        on_complete: SendCompletion,
    ) -> TransportResult<SendOutcome> {
        let mut inner = self.lock();

        match inner.state {
            State::Open => (),
            State::Idle | State::Connecting => return Err(TransportError::Uninitialized),
            State::Closed => return Err(TransportError::Disconnected),
        }

        if inner.send.is_some() {
            return Err(TransportError::Busy);
        }

        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Size);
        }

        inner.send = Some(SendInFlight {
            prefix: (frame.len() as u32).to_le_bytes(),
            frame,
            written: 0,
            on_complete: None,
        });

        match Self::try_write(&mut inner) {
            Ok(true) => {
                inner.send = None;
                Ok(SendOutcome::Completed)
            }
            Ok(false) => {
                inner.send.as_mut().expect("send slot vanished").on_complete = Some(on_complete);
                self.update_interest(&mut inner, Interest::READABLE | Interest::WRITABLE);
                Ok(SendOutcome::AsyncProcessingNecessary)
            }
            Err(err) => {
                inner.send = None;
                Err(err)
            }
        }
    }

    /// Arms the receive path. `on_message_available` is asked for a buffer
    /// whenever a frame header arrives; `on_receive_complete` consumes the
    /// filled buffer and decides whether to keep receiving.
    pub fn receive_async(
        &self,
        on_message_available: MessageAvailable,
        on_receive_complete: ReceiveComplete,
    ) -> TransportResult<()> {
        {
            let mut inner = self.lock();

            match inner.state {
                State::Open => (),
                State::Idle | State::Connecting => return Err(TransportError::Uninitialized),
                State::Closed => return Err(TransportError::Disconnected),
            }

            if !matches!(inner.recv_state, RecvState::Disarmed) {
                return Err(TransportError::ApiError);
            }

            inner.recv_hooks = Some(RecvHooks {
                on_message_available,
                on_receive_complete,
            });
            inner.recv_state = RecvState::Header {
                buf: [0; LENGTH_PREFIX_SIZE],
                filled: 0,
            };
        }

        self.pump_receive();

        Ok(())
    }

    /// True only when the peer holds at least the requested integrity level.
    pub fn check_peer_integrity_level(&self, minimum: IntegrityLevel) -> bool {
        match self.peer_identity() {
            Ok(creds) => creds.integrity_level() >= minimum,
            Err(_) => false,
        }
    }

    /// OS reported identity of the peer process.
    pub fn peer_identity(&self) -> TransportResult<Credentials> {
        self.lock().peer.ok_or(TransportError::Uninitialized)
    }

    /// Closes the connection. Outstanding completions are dropped without
    /// being invoked; an in-flight reactor callback still counts towards
    /// `is_in_use`.
    pub fn close(&self) {
        let (stream, token) = {
            let mut inner = self.lock();

            if inner.state == State::Closed {
                return;
            }

            inner.state = State::Closed;
            inner.recv_state = RecvState::Disarmed;
            inner.recv_hooks = None;
            inner.connect_cb = None;
            inner.send = None;

            (inner.stream.take(), inner.token.take())
        };

        if let (Some(mut stream), Some(token)) = (stream, token) {
            if let Err(err) = self.reactor.deregister(&mut stream, token) {
                logging::warn!(self.log, "error deregistering stream"; "context" => "close", "error" => ?err);
            }
        }

        logging::debug!(self.log, "connection closed"; "context" => "close");
    }

    #[inline]
    pub fn check_is_open(&self) -> bool {
        self.lock().state == State::Open
    }

    /// True while callbacks registered through this connection may still
    /// execute. Callers must wait for false before destruction.
    pub fn is_in_use(&self) -> bool {
        let inner = self.lock();
        inner.in_callback || inner.pumping || inner.token.is_some()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("connection state poisoned")
    }

    fn register(&self, interest: Interest) -> TransportResult<()> {
        let weak = self.weak.clone();
        let mut inner = self.lock();

        let stream = inner
            .stream
            .as_mut()
            .expect("Connection must have a stream to register");

        let token = self.reactor.register(
            stream,
            interest,
            Box::new(move |ready| {
                if let Some(conn) = weak.upgrade() {
                    conn.on_ready(ready);
                }
            }),
        )?;

        inner.token = Some(token);

        Ok(())
    }

    fn update_interest(&self, inner: &mut Inner, interest: Interest) {
        let token = match inner.token {
            Some(token) => token,
            None => return,
        };

        let stream = match inner.stream.as_mut() {
            Some(stream) => stream,
            None => return,
        };

        if let Err(err) = self.reactor.reregister(stream, token, interest) {
            logging::warn!(self.log, "error updating interest"; "context" => "update_interest", "error" => ?err);
        }
    }

    fn on_ready(&self, ready: Ready) {
        {
            let mut inner = self.lock();

            if inner.state == State::Closed {
                return;
            }

            inner.in_callback = true;
        }

        if ready.writable {
            self.handle_writable();
        }

        if ready.readable {
            self.pump_receive();
        }

        self.lock().in_callback = false;
    }

    fn handle_writable(&self) {
        // Connect completion.
        let connect_result = {
            let mut inner = self.lock();

            match inner.state {
                State::Connecting => {
                    let stream = inner.stream.as_ref().expect("connecting without a stream");

                    match stream.take_error() {
                        Ok(Some(err)) => Some(Err(TransportError::from(err))),
                        Err(err) => Some(Err(TransportError::from(err))),
                        Ok(None) => match cred::peer_credentials(stream.as_raw_fd()) {
                            Ok(creds) => {
                                inner.peer = Some(creds);
                                inner.state = State::Open;
                                self.update_interest(&mut inner, Interest::READABLE);
                                Some(Ok(()))
                            }
                            Err(err) => Some(Err(TransportError::from(err))),
                        },
                    }
                }
                _ => None,
            }
        };

        if let Some(result) = connect_result {
            let callback = self.lock().connect_cb.take();

            if result.is_err() {
                self.close();
            }

            logging::debug!(self.log, "connect completed"; "context" => "handle_writable", "result" => ?result);

            if let Some(callback) = callback {
                callback(result);
            }

            return;
        }

        // In-flight send progress.
        let completion = {
            let mut inner = self.lock();

            if inner.state != State::Open || inner.send.is_none() {
                None
            } else {
                match Self::try_write(&mut inner) {
                    Ok(true) => {
                        let send = inner.send.take().expect("send slot vanished");
                        self.update_interest(&mut inner, Interest::READABLE);
                        send.on_complete.map(|callback| (callback, Ok(())))
                    }
                    Ok(false) => None,
                    Err(err) => {
                        let send = inner.send.take().expect("send slot vanished");
                        self.update_interest(&mut inner, Interest::READABLE);
                        send.on_complete.map(|callback| (callback, Err(err)))
                    }
                }
            }
        };

        if let Some((callback, result)) = completion {
            callback(result);
        }
    }

    /// Writes as much of the in-flight frame as the socket accepts.
    /// Returns true once prefix and frame are fully written.
    fn try_write(inner: &mut Inner) -> TransportResult<bool> {
        let Inner { stream, send, .. } = inner;

        let send = send.as_mut().expect("no send in flight");
        let stream = stream.as_ref().expect("open connection without a stream");

        let total = LENGTH_PREFIX_SIZE + send.frame.len();

        loop {
            if send.written == total {
                return Ok(true);
            }

            let result = if send.written < LENGTH_PREFIX_SIZE {
                let slices = [
                    IoSlice::new(&send.prefix[send.written..]),
                    IoSlice::new(&send.frame[..]),
                ];
                (&*stream).write_vectored(&slices)
            } else {
                (&*stream).write(&send.frame[send.written - LENGTH_PREFIX_SIZE..])
            };

            match result {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(count) => send.written += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drains the socket frame by frame, delivering each completed frame to
    /// the receive hooks. Runs until the socket would block, the hooks stop
    /// re-arming, or an error invalidates the receive path.
    fn pump_receive(&self) {
        {
            let mut inner = self.lock();

            if inner.pumping {
                return;
            }

            inner.pumping = true;
        }

        loop {
            match self.read_step() {
                ReadStep::Blocked | ReadStep::Disarmed => break,
                ReadStep::NeedBuffer(len) => {
                    let hooks = self.lock().recv_hooks.take();

                    let mut hooks = match hooks {
                        Some(hooks) => hooks,
                        None => {
                            self.lock().recv_state = RecvState::Disarmed;
                            break;
                        }
                    };

                    let buf = (hooks.on_message_available)(len);
                    debug_assert_eq!(buf.len(), len);

                    let mut inner = self.lock();
                    inner.recv_hooks = Some(hooks);
                    inner.recv_state = RecvState::Body { buf, filled: 0 };
                }
                ReadStep::Complete(buf) => {
                    let hooks = self.lock().recv_hooks.take();

                    let mut hooks = match hooks {
                        Some(hooks) => hooks,
                        None => break,
                    };

                    let rearm = (hooks.on_receive_complete)(Ok(buf));

                    let mut inner = self.lock();

                    if rearm && inner.state == State::Open {
                        inner.recv_hooks = Some(hooks);
                        inner.recv_state = RecvState::Header {
                            buf: [0; LENGTH_PREFIX_SIZE],
                            filled: 0,
                        };
                    } else {
                        inner.recv_state = RecvState::Disarmed;
                        break;
                    }
                }
                ReadStep::Failed(err) => {
                    let hooks = self.lock().recv_hooks.take();

                    logging::warn!(self.log, "receive failed"; "context" => "pump_receive", "error" => ?err);

                    self.lock().recv_state = RecvState::Disarmed;

                    if let Some(mut hooks) = hooks {
                        (hooks.on_receive_complete)(Err(err));
                    }

                    break;
                }
            }
        }

        self.lock().pumping = false;
    }

    /// Advances the receive state machine by at most one phase transition.
    fn read_step(&self) -> ReadStep {
        let mut inner = self.lock();

        if inner.state != State::Open {
            return ReadStep::Disarmed;
        }

        let Inner { stream, recv_state, .. } = &mut *inner;

        let stream = match stream.as_ref() {
            Some(stream) => stream,
            None => return ReadStep::Disarmed,
        };

        match recv_state {
            RecvState::Disarmed => ReadStep::Disarmed,
            RecvState::Header { buf, filled } => loop {
                match (&*stream).read(&mut buf[*filled..]) {
                    Ok(0) => return ReadStep::Failed(TransportError::Disconnected),
                    Ok(count) => {
                        *filled += count;

                        if *filled == LENGTH_PREFIX_SIZE {
                            let len = u32::from_le_bytes(*buf) as usize;

                            if len == 0 || len > MAX_FRAME_SIZE {
                                return ReadStep::Failed(TransportError::ProtocolError);
                            }

                            return ReadStep::NeedBuffer(len);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return ReadStep::Blocked
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
                    Err(err) => return ReadStep::Failed(err.into()),
                }
            },
            RecvState::Body { buf, filled } => loop {
                match (&*stream).read(&mut buf[*filled..]) {
                    Ok(0) => return ReadStep::Failed(TransportError::Disconnected),
                    Ok(count) => {
                        *filled += count;

                        if *filled == buf.len() {
                            let complete = mem::replace(recv_state, RecvState::Disarmed);

                            match complete {
                                RecvState::Body { buf, .. } => return ReadStep::Complete(buf),
                                _ => unreachable!(),
                            }
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return ReadStep::Blocked
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
                    Err(err) => return ReadStep::Failed(err.into()),
                }
            },
        }
    }
}

impl Inner {
    fn empty(state: State) -> Inner {
        Inner {
            stream: None,
            token: None,
            state,
            peer: None,
            connect_cb: None,
            send: None,
            recv_state: RecvState::Disarmed,
            recv_hooks: None,
            in_callback: false,
            pumping: false,
        }
    }
}
