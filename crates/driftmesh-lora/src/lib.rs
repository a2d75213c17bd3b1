//! Long-range radio transport for driftmesh
//!
//! Drives a narrow-band serial radio (LoRa-class) as a mesh transport:
//!
//! - [`driver`] — exclusive serial ownership, native binary or KISS
//!   framing, a dedicated blocking reader thread, CAD probing.
//! - [`duty_cycle`] — regulatory airtime budgets over a rolling hour.
//! - [`framing`] / [`kiss`] — the two wire framings behind one driver.
//! - [`transport`] — the [`Transport`](driftmesh_core::Transport)
//!   implementation: priority queue, CSMA, fragmentation pacing.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftmesh_lora::{
//!     config::{LongRangeConfig, RadioConfig, UsbId},
//!     driver::RadioDriver,
//!     transport::LongRangeTransport,
//! };
//!
//! # fn main() -> driftmesh_core::Result<()> {
//! let usb_id = Some(UsbId { vendor: 0x10C4, product: 0xEA60 });
//! let driver = Arc::new(RadioDriver::open("/dev/ttyUSB0", 115_200, usb_id)?);
//! let transport = LongRangeTransport::new(
//!     driver,
//!     RadioConfig::default(),
//!     LongRangeConfig::default(),
//! );
//! // manager.add_transport(Arc::new(transport))
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod duty_cycle;
pub mod framing;
pub mod kiss;
pub mod transport;

pub use config::{FramingKind, LongRangeConfig, RadioConfig, UsbId};
pub use driver::{DriverState, RadioDriver, RadioMetrics, RxEvent};
pub use duty_cycle::{DutyCycleGovernor, RegionProfile};
pub use transport::LongRangeTransport;
