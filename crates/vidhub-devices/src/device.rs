/*!
 * Device trait and shared device types.
 *
 * Every device model speaks the same block-structured line protocol, so
 * the trait here only covers the connection lifecycle and identity. The
 * model-specific state lives on the concrete device types.
 */
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vidhub_core::connection::{ConnectionManager, ConnectionState};
use vidhub_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// An index is outside the bounds of a device array
    #[error("Index {index} out of range for {property} (length {len})")]
    IndexOutOfRange {
        /// The array that was addressed
        property: String,
        /// The offending index
        index: usize,
        /// The array length at the time of the call
        len: usize,
    },

    /// A value cannot be sent to the device
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The device did not answer in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl DeviceError {
    /// Create an out of range error for `property`
    pub fn out_of_range(property: impl Into<String>, index: usize, len: usize) -> Self {
        DeviceError::IndexOutOfRange {
            property: property.into(),
            index,
            len,
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        DeviceError::InvalidValue(msg.into())
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// The device families the crate can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Videohub routers
    Videohub,
    /// SmartView monitors
    SmartView,
    /// SmartScope monitors with scope modes
    SmartScope,
}

impl DeviceKind {
    /// Get the kind as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Videohub => "videohub",
            DeviceKind::SmartView => "smartview",
            DeviceKind::SmartScope => "smartscope",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a device as reported in its prelude
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device family
    pub kind: DeviceKind,
    /// Host address the client connects to
    pub hostaddr: String,
    /// Port the client connects to
    pub hostport: u16,
    /// Unique id, once the device has reported one
    pub device_id: Option<String>,
    /// Model name
    pub model: Option<String>,
    /// User-assigned device name
    pub name: Option<String>,
    /// Protocol version from the preamble
    pub protocol_version: Option<String>,
}

/// A network device driven over the line protocol
#[async_trait]
pub trait Device: Send + Sync {
    /// Identity snapshot
    fn info(&self) -> DeviceInfo;

    /// Connection state tracker for this device
    fn connection_manager(&self) -> &Arc<ConnectionManager>;

    /// Current connection state
    fn state(&self) -> ConnectionState {
        self.connection_manager().state()
    }

    /// Whether the prelude has been fully received on the current connection
    fn prelude_parsed(&self) -> bool;

    /// Connect and wait for the prelude
    ///
    /// Failures are recorded on the connection manager; the returned state
    /// tells the caller how the attempt ended.
    async fn connect(&self) -> ConnectionState;

    /// Disconnect; idempotent
    async fn disconnect(&self) -> ConnectionState;

    /// Move the device to a new address, reconnecting if it was connected
    async fn reset_hostaddr(&self, hostaddr: &str, hostport: u16) -> ConnectionState;
}
