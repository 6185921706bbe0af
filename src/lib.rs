//! Session fan-out and upstream routing for an intercepting HTTP proxy.
//!
//! Completed sessions from the host engine are re-broadcast on a multicast
//! stream, game-API calls are split onto a second stream, whitelisted API
//! calls are relayed (redacted) to a statistics collector, and outbound
//! requests are optionally rerouted through an upstream gateway.

pub mod classifier;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod relay;
pub mod router;
pub mod session;
pub mod settings;
pub mod stream;

pub use classifier::is_secure;
pub use error::{ProxyError, Result};
pub use lifecycle::{ProxyParts, ProxyState, SessionProxy};
pub use session::{PendingRequest, Session, SessionId, SharedSession};
pub use settings::ProxySettings;
pub use stream::Multicast;
