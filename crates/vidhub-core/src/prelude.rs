/*!
 * Prelude module for vidhub core.
 *
 * This module re-exports commonly used types and functions from the vidhub
 * core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export connection types
pub use crate::connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, StateChange,
    SyncronizedConnectionManager,
};

// Re-export event types
pub use crate::event::{EventChannel, EventReceiver};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, ConnectionConfig, SharedConfig};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, with_optional_timeout, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
