/*!
 * Vidhub Devices
 *
 * Clients for broadcast video hardware that speaks the block-structured
 * line protocol: Videohub routers and SmartView/SmartScope monitors.
 */

#![warn(missing_docs)]

// Re-export core types
pub use vidhub_core::prelude;

pub mod device;
pub mod devices;
pub mod preset;
pub mod protocol;
pub mod telnet;
pub mod transport;

pub use device::{Device, DeviceError, DeviceInfo, DeviceKind, Result};
pub use devices::{SmartViewDevice, VideohubDevice};
pub use preset::{Preset, PresetStore};
pub use protocol::{ProtocolViolation, TelnetProtocol};
pub use telnet::{ClientOptions, TelnetClient, DEFAULT_PORT};
pub use transport::{Connector, TcpConnector};

/// Vidhub devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging and report the device crate version
pub fn init() -> std::result::Result<(), vidhub_core::error::Error> {
    vidhub_core::init()?;
    tracing::info!("Vidhub Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the supported device protocols
pub fn available_protocols() -> Vec<&'static str> {
    use crate::devices::smartview::SmartViewProtocol;
    use crate::devices::videohub::VideohubProtocol;

    vec![VideohubProtocol::NAME, SmartViewProtocol::NAME]
}
