//! Devices module
//!
//! Contains RAM/ROM, a register-file peripheral and a traffic generator

pub mod generator;
pub mod memory;
pub mod peripheral;

pub use generator::{GeneratorConfig, GeneratorStats, TrafficGenerator};
pub use memory::{Memory, MemoryConfig, PAGE_SIZE};
pub use peripheral::{IrqOutput, Peripheral};
