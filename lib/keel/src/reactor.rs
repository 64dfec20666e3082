//! Single-threaded event demultiplexer. All socket completions, accept
//! completions and software events execute on the one thread that drives
//! `handle_events`. Other threads interact with the reactor only through
//! registration and `post`.

use crate::logging;
use hashbrown::HashMap;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

/// Readiness state delivered to an I/O callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

pub type IoCallback = Box<dyn FnMut(Ready) + Send>;
pub type Task = Box<dyn FnOnce() + Send>;

type CallbackCell = Arc<Mutex<IoCallback>>;

struct Shared {
    registry: mio::Registry,
    waker: Waker,
    callbacks: Mutex<HashMap<Token, CallbackCell>>,
    tasks: Mutex<Vec<Task>>,
    next_token: AtomicUsize,
    thread: Mutex<Option<ThreadId>>,
}

/// Owns the OS poll. Lives on the reactor thread.
pub struct Reactor {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    log: logging::Logger,
}

/// Cloneable, thread-safe handle used by components to register event
/// sources and schedule software events.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let reactor_log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "reactor")),
            _ => logging::discard(),
        };

        Ok(Reactor {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            shared: Arc::new(Shared {
                registry,
                waker,
                callbacks: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_token: AtomicUsize::new(1),
                thread: Mutex::new(None),
            }),
            log: reactor_log,
        })
    }

    #[inline]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Dispatches pending I/O events and software tasks once, blocking for at
    /// most `timeout`. Returns the number of callbacks invoked.
    pub fn handle_events(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.claim_thread();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut dispatched = 0;

        for event in self.events.iter() {
            let token = event.token();

            if token == WAKER_TOKEN {
                continue;
            }

            let ready = Ready {
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            };

            // Clone the cell out of the registry so the callback can
            // deregister itself or register new sources without deadlocking.
            let cell = {
                let callbacks = self.shared.callbacks.lock().expect("callback registry poisoned");
                callbacks.get(&token).cloned()
            };

            match cell {
                Some(cell) => {
                    let mut callback = cell.lock().expect("callback cell poisoned");
                    (*callback)(ready);
                    dispatched += 1;
                }
                None => {
                    logging::trace!(self.log, "event for unregistered token";
                                    "context" => "handle_events",
                                    "token" => token.0);
                }
            }
        }

        dispatched += self.run_tasks();

        Ok(dispatched)
    }

    /// Runs `handle_events` until `stop` returns true. Intended as the body
    /// of the dedicated reactor thread.
    pub fn handle_events_loop<F: FnMut() -> bool>(&mut self, mut stop: F) -> io::Result<()> {
        while !stop() {
            self.handle_events(Some(Duration::from_millis(100)))?;
        }

        Ok(())
    }

    fn run_tasks(&mut self) -> usize {
        // Swap the queue out so tasks posting further tasks do not deadlock.
        let tasks: Vec<Task> = {
            let mut queue = self.shared.tasks.lock().expect("task queue poisoned");
            std::mem::replace(&mut *queue, Vec::new())
        };

        let count = tasks.len();

        for task in tasks {
            task();
        }

        count
    }

    fn claim_thread(&self) {
        let mut owner = self.shared.thread.lock().expect("thread slot poisoned");

        match *owner {
            Some(id) => {
                if id != thread::current().id() {
                    panic!("Reactor driven from more than one thread");
                }
            }
            None => *owner = Some(thread::current().id()),
        }
    }
}

impl ReactorHandle {
    /// Registers an event source together with its callback. The callback is
    /// invoked on the reactor thread whenever the source becomes ready.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interest: Interest,
        callback: IoCallback,
    ) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));

        {
            let mut callbacks = self.shared.callbacks.lock().expect("callback registry poisoned");
            callbacks.insert(token, Arc::new(Mutex::new(callback)));
        }

        if let Err(err) = self.shared.registry.register(source, token, interest) {
            let mut callbacks = self.shared.callbacks.lock().expect("callback registry poisoned");
            callbacks.remove(&token);
            return Err(err);
        }

        Ok(token)
    }

    /// Changes the interest set of a registered source.
    #[inline]
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.shared.registry.reregister(source, token, interest)
    }

    /// Removes a source and drops its callback. After this returns no new
    /// invocation of the callback will start.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        let result = self.shared.registry.deregister(source);

        let mut callbacks = self.shared.callbacks.lock().expect("callback registry poisoned");
        callbacks.remove(&token);

        result
    }

    /// Schedules a one-shot task onto the reactor thread and wakes the poll.
    /// Tasks run in FIFO order after I/O dispatch.
    pub fn post(&self, task: Task) {
        {
            let mut tasks = self.shared.tasks.lock().expect("task queue poisoned");
            tasks.push(task);
        }

        self.shared.waker.wake().expect("Error waking reactor");
    }

    /// Wakes a blocked `handle_events` call without scheduling work.
    #[inline]
    pub fn unblock(&self) {
        self.shared.waker.wake().expect("Error waking reactor");
    }

    /// True when called on the thread driving `handle_events`, or when no
    /// thread has driven the reactor yet (the initialization phase).
    pub fn is_reactor_thread(&self) -> bool {
        let owner = self.shared.thread.lock().expect("thread slot poisoned");

        match *owner {
            Some(id) => id == thread::current().id(),
            None => true,
        }
    }

    /// Debug guard for APIs with a "reactor context only" contract.
    #[inline]
    pub fn assert_reactor_context(&self) {
        debug_assert!(
            self.is_reactor_thread(),
            "API restricted to the reactor thread called from another thread"
        );
    }
}
