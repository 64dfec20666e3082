//! Socket layer: addressing, the generic length-prefixed connection, the
//! acceptor and the per-connection message handler.

pub mod acceptor;
pub mod address;
pub mod connection;
pub mod handler;
