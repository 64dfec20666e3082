//! Client side of the binding: per-server connections with state change
//! fan-out, the connection manager, per-proxy routing and the shared
//! remote-server objects.

pub mod connection;
pub mod manager;
pub mod remote;
pub mod router;
