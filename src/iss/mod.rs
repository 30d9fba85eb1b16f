//! Instruction-set simulators
//!
//! A CPU is an [`IssWrapper`] driving a [`Backend`]. Native backends are
//! shared libraries found by [`IssFinder`] and loaded per CPU by
//! [`BackendLoader`]; they talk to the fabric through the C tables of
//! [`abi`].

pub mod abi;
pub mod backend;
pub mod callbacks;
pub mod finder;
pub mod loader;
pub mod wrapper;

pub use backend::{Backend, ClosureBackend, NativeBackend};
pub use finder::IssFinder;
pub use loader::BackendLoader;
pub use wrapper::{AccessStats, CpuConfig, IssWrapper};
