//! vpsim: a loosely-timed virtual platform simulator
//!
//! Instruction-set simulators run as cooperative processes of a
//! discrete-event [`kernel`] and reach memory and peripherals through a
//! transaction fabric (buses, bridges or a [`Noc`](interconnect::noc::Noc)).
//! Parameters attached to the fabric graph decide, per address range,
//! whether an access may use direct memory access and how much delay it
//! accrues. A [`Platform`] assembles all of it from a TOML description.

pub mod addr;
pub mod config;
pub mod devices;
pub mod error;
pub mod gic;
pub mod interconnect;
pub mod irq;
pub mod iss;
pub mod kernel;
pub mod param;
pub mod payload;
pub mod platform;
pub mod quantum;
pub mod snapshot;
pub mod target;
pub mod time;

pub use config::PlatformConfig;
pub use error::{Result, VpError};
pub use kernel::Kernel;
pub use platform::Platform;
pub use snapshot::PlatformSnapshot;
pub use time::SimTime;
