//! Backends driven by an [`IssWrapper`]
//!
//! [`NativeBackend`] talks to a shared library through the C tables of
//! [`abi`](crate::iss::abi). [`ClosureBackend`] runs a Rust closure as the
//! instruction stream, which is how traffic scripts and tests drive a CPU.

use std::ffi::{c_int, c_void, CString};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VpError};
use crate::iss::abi::{IssContext, IssPlugin};
use crate::iss::callbacks;
use crate::iss::loader::BackendLoader;
use crate::iss::wrapper::IssWrapper;
use crate::target::DmiRegion;

/// Operations the fabric invokes on a CPU model.
pub trait Backend: Send + Sync {
    /// Enter the translation loop. Returns when the model is done or stops.
    fn run(&self, cpu: &IssWrapper) -> Result<()>;

    fn update_irq(&self, value: u64, line: u32);

    fn tb_cache_flush(&self) {}

    fn do_cpu_reset(&self, _pc: u64) {}

    /// Advertise host memory the model may access directly.
    fn map_dmi(&self, _name: &str, _region: &DmiRegion) -> Result<()> {
        Ok(())
    }

    fn create_rom(&self, _name: &str, _region: &DmiRegion) -> Result<()> {
        Ok(())
    }

    fn linux_mem_init(&self, _base: u64, _size: u64) {}

    fn load_elf(&self, path: &Path) -> Result<()> {
        Err(VpError::Backend(format!("cannot load {}: backend has no ELF loader", path.display())))
    }

    fn set_done(&self, _done: bool) {}

    fn is_done(&self) -> bool {
        false
    }

    fn reset_done(&self) {
        self.set_done(false);
    }

    fn clean(&self) {}

    fn result_buffer(&self) -> *mut c_void {
        ptr::null_mut()
    }
}

/// A backend shared library bound to one CPU.
pub struct NativeBackend {
    model: CString,
    ctx: Box<IssContext>,
    loader: BackendLoader,
}

// The context and instance pointers are only dereferenced by the backend,
// and the cooperative kernel runs one CPU at a time.
unsafe impl Send for NativeBackend {}
unsafe impl Sync for NativeBackend {}

impl NativeBackend {
    /// Load a private copy of `lib` for `cpu` and run its `plugin_init`.
    pub fn open(lib: &Path, cpu: &IssWrapper, model: &str, is_gdb: bool, init_pc: u64) -> Result<Self> {
        let loader = BackendLoader::open(lib, cpu.name())?;
        let init = loader.plugin_init()?;
        let model = CString::new(model).map_err(|e| VpError::Backend(format!("model name: {}", e)))?;
        let mut ctx = Box::new(IssContext {
            cpu_id: cpu.cpu_id(),
            model: model.as_ptr(),
            instr_quantum: cpu.instr_quantum(),
            wrapper: cpu as *const IssWrapper as *mut c_void,
            vpsim: callbacks::fabric_table(),
            iss: IssPlugin::default(),
            instance: ptr::null_mut(),
        });
        let ctx_ptr: *mut IssContext = &mut *ctx;
        // SAFETY: ctx lives in a Box owned by the returned backend
        let rc = BackendLoader::locked(|| unsafe { init(ctx_ptr, model.as_ptr(), is_gdb as c_int, init_pc) });
        if rc != 0 {
            return Err(VpError::Backend(format!("{}: plugin_init returned {}", cpu.name(), rc)));
        }
        if ctx.iss.run.is_none() || ctx.iss.update_irq.is_none() {
            return Err(VpError::Backend(format!("{}: plugin_init left run/update_irq unset", cpu.name())));
        }
        Ok(NativeBackend { model, ctx, loader })
    }

    pub fn model(&self) -> &str {
        self.model.to_str().unwrap_or("?")
    }

    pub fn library_copy(&self) -> &Path {
        self.loader.copy()
    }

    fn table(&self) -> &IssPlugin {
        &self.ctx.iss
    }

    fn instance(&self) -> *mut c_void {
        self.ctx.instance
    }

    fn map(&self, name: &str, region: &DmiRegion, rom: bool) -> Result<()> {
        let f = if rom { self.table().create_rom } else { self.table().map_dmi };
        let Some(f) = f else {
            return Err(VpError::Backend(format!("backend does not support {}", if rom { "create_rom" } else { "map_dmi" })));
        };
        let cname = CString::new(name).map_err(|e| VpError::Backend(e.to_string()))?;
        let size = region.space.size()?;
        // SAFETY: the region pointer stays valid for the life of the target
        unsafe { f(self.instance(), cname.as_ptr(), region.space.base(), size, region.ptr.as_ptr().cast()) };
        Ok(())
    }
}

impl Backend for NativeBackend {
    fn run(&self, _cpu: &IssWrapper) -> Result<()> {
        if let Some(run) = self.table().run {
            // SAFETY: instance was produced by plugin_init for this table
            unsafe { run(self.instance()) };
        }
        Ok(())
    }

    fn update_irq(&self, value: u64, line: u32) {
        if let Some(f) = self.table().update_irq {
            unsafe { f(self.instance(), value, line) };
        }
    }

    fn tb_cache_flush(&self) {
        if let Some(f) = self.table().tb_cache_flush {
            unsafe { f(self.instance()) };
        }
    }

    fn do_cpu_reset(&self, pc: u64) {
        if let Some(f) = self.table().do_cpu_reset {
            unsafe { f(self.instance(), pc) };
        }
    }

    fn map_dmi(&self, name: &str, region: &DmiRegion) -> Result<()> {
        self.map(name, region, false)
    }

    fn create_rom(&self, name: &str, region: &DmiRegion) -> Result<()> {
        self.map(name, region, true)
    }

    fn linux_mem_init(&self, base: u64, size: u64) {
        if let Some(f) = self.table().linux_mem_init {
            unsafe { f(self.instance(), base, size) };
        }
    }

    fn load_elf(&self, path: &Path) -> Result<()> {
        let Some(f) = self.table().load_elf else {
            return Err(VpError::Backend("backend does not support load_elf".into()));
        };
        let cpath = CString::new(path.display().to_string()).map_err(|e| VpError::Backend(e.to_string()))?;
        let rc = unsafe { f(self.instance(), cpath.as_ptr()) };
        if rc != 0 {
            return Err(VpError::Backend(format!("load_elf {} returned {}", path.display(), rc)));
        }
        Ok(())
    }

    fn set_done(&self, done: bool) {
        if let Some(f) = self.table().set_done {
            unsafe { f(self.instance(), done as c_int) };
        }
    }

    fn is_done(&self) -> bool {
        self.table().is_done.is_some_and(|f| unsafe { f(self.instance()) } != 0)
    }

    fn reset_done(&self) {
        if let Some(f) = self.table().reset_done {
            unsafe { f(self.instance()) };
        }
    }

    fn clean(&self) {
        if let Some(f) = self.table().clean {
            unsafe { f(self.instance()) };
        }
    }

    fn result_buffer(&self) -> *mut c_void {
        match self.table().get_result_buffer {
            Some(f) => unsafe { f(self.instance()) },
            None => ptr::null_mut(),
        }
    }
}

type Program = Box<dyn FnOnce(&IssWrapper, &ClosureBackend) -> Result<()> + Send>;

/// Runs a closure as the CPU program. Interrupt updates are recorded.
pub struct ClosureBackend {
    program: Mutex<Option<Program>>,
    irqs: Mutex<Vec<(u64, u32)>>,
    done: Mutex<bool>,
}

impl ClosureBackend {
    pub fn new<F>(program: F) -> Arc<Self>
    where
        F: FnOnce(&IssWrapper, &ClosureBackend) -> Result<()> + Send + 'static,
    {
        Arc::new(ClosureBackend {
            program: Mutex::new(Some(Box::new(program))),
            irqs: Mutex::new(Vec::new()),
            done: Mutex::new(false),
        })
    }

    /// Every `(value, line)` delivered so far.
    pub fn irq_log(&self) -> Vec<(u64, u32)> {
        self.irqs.lock().clone()
    }

    /// Current level of `line`.
    pub fn irq_level(&self, line: u32) -> bool {
        self.irqs.lock().iter().rev().find(|(_, l)| *l == line).is_some_and(|(v, _)| *v != 0)
    }
}

impl Backend for ClosureBackend {
    fn run(&self, cpu: &IssWrapper) -> Result<()> {
        let program = self.program.lock().take();
        match program {
            Some(p) => {
                let r = p(cpu, self);
                self.set_done(true);
                r
            }
            None => Ok(()),
        }
    }

    fn update_irq(&self, value: u64, line: u32) {
        self.irqs.lock().push((value, line));
    }

    fn set_done(&self, done: bool) {
        *self.done.lock() = done;
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }
}
