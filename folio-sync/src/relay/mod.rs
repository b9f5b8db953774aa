//! Realtime relay: authenticates connections, binds them to a document and
//! fans frames out to every session bound to that document.

pub mod auth;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::{AllowAll, PermissionCheck, StaticPermissions, TokenExchange};
pub use registry::{RegistryStats, SessionRegistry};
pub use server::{RelayConfig, RelayError, RelayServer};
pub use session::{
    RelayHandler, Session, SessionAction, SessionState, CLOSE_BAD_REQUEST, CLOSE_FORBIDDEN,
    CLOSE_UNAUTHORIZED,
};
