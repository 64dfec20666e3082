//! Passive side of the transport: binds a unicast address, listens and
//! hands accepted connections to its owner.

use crate::error::{TransportError, TransportResult};
use crate::transport::connection::Connection;
use keel::logging;
use keel::reactor::ReactorHandle;
use mio::net::UnixListener;
use mio::{Interest, Token};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type AcceptCallback = Box<dyn FnMut(TransportResult<Arc<Connection>>) + Send>;

struct Inner {
    listener: Option<UnixListener>,
    token: Option<Token>,
    path: Option<PathBuf>,
    accept_cb: Option<AcceptCallback>,
    in_callback: bool,
}

/// Listens on a bound socket path and yields accepted connections through
/// the registered callback, on the reactor thread.
pub struct Acceptor {
    weak: Weak<Acceptor>,
    inner: Mutex<Inner>,
    reactor: ReactorHandle,
    log: logging::Logger,
}

impl Acceptor {
    pub fn new(reactor: &ReactorHandle, log: &logging::Logger) -> Arc<Acceptor> {
        Arc::new_cyclic(|weak| Acceptor {
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                listener: None,
                token: None,
                path: None,
                accept_cb: None,
                in_callback: false,
            }),
            reactor: reactor.clone(),
            log: log.new(logging::o!("component" => "acceptor")),
        })
    }

    /// Binds and listens on the socket at `path`. A stale socket file from a
    /// previous run is removed before binding.
    pub fn init(&self, path: PathBuf) -> TransportResult<()> {
        let mut inner = self.lock();

        if inner.listener.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(TransportError::from)?;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                logging::debug!(self.log, "removed stale socket"; "context" => "init", "path" => %path.display());
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }

        let mut listener = UnixListener::bind(&path)?;

        let weak = self.weak.clone();
        let token = self.reactor.register(
            &mut listener,
            Interest::READABLE,
            Box::new(move |_| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.on_acceptable();
                }
            }),
        )?;

        inner.listener = Some(listener);
        inner.token = Some(token);
        inner.path = Some(path);

        Ok(())
    }

    /// Registers the accept completion callback. Invoked once per accepted
    /// connection until the acceptor is closed.
    pub fn accept_async(&self, callback: AcceptCallback) {
        let mut inner = self.lock();

        if inner.accept_cb.is_some() {
            panic!("Acceptor already has an accept callback registered");
        }

        inner.accept_cb = Some(callback);
    }

    /// Closes the listener, unlinks the socket path and drops the accept
    /// callback.
    pub fn close(&self) {
        let (listener, token, path) = {
            let mut inner = self.lock();
            inner.accept_cb = None;
            (inner.listener.take(), inner.token.take(), inner.path.take())
        };

        if let (Some(mut listener), Some(token)) = (listener, token) {
            if let Err(err) = self.reactor.deregister(&mut listener, token) {
                logging::warn!(self.log, "error deregistering listener"; "context" => "close", "error" => ?err);
            }
        }

        if let Some(path) = path {
            drop(fs::remove_file(path));
        }
    }

    pub fn is_in_use(&self) -> bool {
        let inner = self.lock();
        inner.in_callback || inner.token.is_some()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("acceptor state poisoned")
    }

    fn on_acceptable(&self) {
        self.lock().in_callback = true;

        loop {
            let accepted = {
                let inner = self.lock();

                let listener = match inner.listener.as_ref() {
                    Some(listener) => listener,
                    None => break,
                };

                listener.accept()
            };

            let result = match accepted {
                Ok((stream, _)) => Connection::from_accepted(stream, &self.reactor, &self.log),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "context" => "on_acceptable", "error" => ?err);
                    Err(err.into())
                }
            };

            // Take the callback out for the call so it may close the
            // acceptor without deadlocking.
            let callback = self.lock().accept_cb.take();

            match callback {
                Some(mut callback) => {
                    callback(result);

                    let mut inner = self.lock();
                    if inner.accept_cb.is_none() {
                        inner.accept_cb = Some(callback);
                    }
                }
                None => {
                    logging::debug!(self.log, "accepted connection without callback dropped";
                                    "context" => "on_acceptable");
                }
            }
        }

        self.lock().in_callback = false;
    }
}
