//! Shared handle on the module graph

use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{AddrSpace, SpaceSet};
use crate::error::{Result, VpError};
use crate::param::graph::{ModuleGraph, ModuleId, ModuleKind, UpdateHook};
use crate::param::modifier::Modifier;
use crate::param::set::ParameterSet;
use crate::param::value::Parameter;

/// Cloneable context handle through which every module registers itself
/// and every run-time parameter change goes.
#[derive(Clone, Default)]
pub struct ParamManager {
    graph: Arc<Mutex<ModuleGraph>>,
}

/// Registration of one module. Dropping it removes the module from the graph.
pub struct ModuleHandle {
    id: ModuleId,
    manager: ParamManager,
}

impl ModuleHandle {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn manager(&self) -> &ParamManager {
        &self.manager
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        let res = self.manager.graph.lock().deregister(self.id);
        match res {
            Ok(hooks) => run_hooks(hooks),
            Err(e) => tracing::warn!("deregistering {}: {}", self.id, e),
        }
    }
}

fn run_hooks(hooks: Vec<UpdateHook>) {
    for hook in hooks {
        hook();
    }
}

impl ParamManager {
    pub fn new() -> Self {
        ParamManager::default()
    }

    pub fn register(&self, name: &str, kind: ModuleKind, space: Option<AddrSpace>) -> Result<ModuleHandle> {
        let id = self.graph.lock().register(name, kind, space)?;
        Ok(ModuleHandle { id, manager: self.clone() })
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.graph.lock().find(name)
    }

    pub fn name(&self, id: ModuleId) -> Option<String> {
        self.graph.lock().name(id).map(str::to_string)
    }

    pub fn add_successor(&self, id: ModuleId, succ: ModuleId, port: usize) -> Result<()> {
        let hooks = self.graph.lock().add_successor(id, succ, port)?;
        run_hooks(hooks);
        Ok(())
    }

    pub fn add_modifier(&self, id: ModuleId, m: Modifier) -> Result<()> {
        let hooks = self.graph.lock().add_modifier(id, m)?;
        run_hooks(hooks);
        Ok(())
    }

    /// Change an intrinsic parameter and refresh everything upstream.
    pub fn set_parameter(&self, id: ModuleId, space: Option<AddrSpace>, p: Parameter) -> Result<()> {
        let hooks = self.graph.lock().set_parameter(id, space, p)?;
        run_hooks(hooks);
        Ok(())
    }

    pub fn set_parameter_by_name(&self, name: &str, space: Option<AddrSpace>, p: Parameter) -> Result<()> {
        let id = self
            .find(name)
            .ok_or_else(|| VpError::invalid(format!("no module named '{}'", name)))?;
        self.set_parameter(id, space, p)
    }

    pub fn register_update_hook<F>(&self, id: ModuleId, f: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.graph.lock().register_update_hook(id, Arc::new(f))
    }

    /// Parameters as seen through output `port` of `id` (empty if unbound).
    pub fn effective(&self, id: ModuleId, port: usize) -> ParameterSet {
        self.graph.lock().effective(id, port).cloned().unwrap_or_default()
    }

    pub fn exported(&self, id: ModuleId) -> ParameterSet {
        self.graph.lock().exported(id).cloned().unwrap_or_default()
    }

    pub fn allowed_spaces(&self, id: ModuleId) -> Result<SpaceSet> {
        self.graph.lock().allowed_spaces(id)
    }

    pub fn with_graph<R>(&self, f: impl FnOnce(&ModuleGraph) -> R) -> R {
        f(&self.graph.lock())
    }
}
