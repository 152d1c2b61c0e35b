/*!
 * Device model implementations.
 */

pub mod smartview;
pub mod videohub;

pub use smartview::{MonitorProperty, SmartViewDevice, SmartViewEvent, SmartViewProtocol};
pub use videohub::{LockRequest, LockState, VideohubDevice, VideohubEvent, VideohubProtocol};
