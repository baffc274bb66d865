//! Real-time side of Murmur: who is connected, how messages reach them, and
//! how stored history ages out.

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod retention;
pub mod session;

pub use auth::{AuthError, AuthService, Identity};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, GatewayError};
pub use registry::{ConnectionId, EventSender, Registry};
pub use retention::{RetentionPolicy, RetentionScheduler, SweepReport};
pub use session::{Flow, Session, SessionState};
