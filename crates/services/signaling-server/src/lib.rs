//! WebSocket relay for SecureDrop signaling
//!
//! Members connect, `register` their member id and then exchange
//! `secureDrop:*` JSON-RPC notifications addressed by id. The relay checks
//! that each envelope's `fromUserId` matches the sender's registration and
//! forwards it to the addressed member if that member is online. Nothing is
//! queued for offline members.

pub mod handler;
pub mod server;

pub use handler::SharedState;
pub use server::{RelayHandle, RelayServer};
