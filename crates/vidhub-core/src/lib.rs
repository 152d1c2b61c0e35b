/*!
 * vidhub Core
 *
 * This crate provides the connection lifecycle model shared by every vidhub
 * device, together with the event channel, configuration, logging and async
 * helpers the device crates build on.
 */

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use tokio;
    pub use tracing;
}

/// vidhub core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("vidhub core {} initialized", VERSION);
    Ok(())
}
