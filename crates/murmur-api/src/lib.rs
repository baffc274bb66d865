//! HTTP side of Murmur: account registration and login.

pub mod accounts;
pub mod auth;

pub use accounts::Accounts;
pub use auth::{ApiError, AppState, AppStateInner};
