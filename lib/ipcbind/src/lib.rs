//! Runtime of a local IPC service binding. Processes expose service
//! instances (skeletons) and consume them (proxies) over length-prefixed
//! message streams on Unix sockets, multiplexed over a single reactor
//! thread.

pub mod config;
pub mod discovery;
pub mod error;
pub mod ids;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod runtime;
pub mod skeleton;
pub mod transport;
