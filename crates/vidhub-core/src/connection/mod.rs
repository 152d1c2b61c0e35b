/*!
 * Connection lifecycle model.
 *
 * [`ConnectionState`] is the value type, [`ConnectionManager`] holds one state
 * and lets any number of tasks wait on it, and
 * [`SyncronizedConnectionManager`] mirrors another manager.
 */

mod manager;
mod state;
mod sync;

pub use manager::{ConnectionManager, ConnectionStatus, FailureError, StateChange};
pub use state::ConnectionState;
pub use sync::{SyncronizedConnectionManager, DEFAULT_POLL_INTERVAL};
