//! Wire types shared by the Murmur server crates: REST request/response
//! bodies, gateway commands and events, and the message view sent to clients.

pub mod api;
pub mod events;
pub mod models;
