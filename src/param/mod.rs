//! Fabric parameters: values, address-keyed sets, the module graph that
//! propagates them, and dated changes.

pub mod graph;
pub mod manager;
pub mod modifier;
pub mod scheduler;
pub mod set;
pub mod value;

pub use graph::{ModuleGraph, ModuleId, ModuleKind};
pub use manager::{ModuleHandle, ParamManager};
pub use modifier::{Modifier, ModifierChain, Sign};
pub use scheduler::{Appointment, ParamScheduler};
pub use set::ParameterSet;
pub use value::{BlockingTlm, ParamKind, Parameter};
