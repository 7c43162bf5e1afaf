//! WebSocket gateway: authentication, the socket transport, and the
//! per-socket session loop.

pub mod session;
pub mod transport;
