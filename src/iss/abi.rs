//! C ABI shared with ISS backend libraries
//!
//! A backend exports `plugin_init`, which receives an [`IssContext`] whose
//! `vpsim` table is already filled by the simulator, fills the `iss` table
//! and `instance`, and returns 0 on success. Every callback takes the
//! opaque pointer of the side it calls into as first argument: `wrapper`
//! for `vpsim` callbacks, `instance` for `iss` ones.

use std::ffi::{c_char, c_int, c_void};

pub const PLUGIN_INIT_SYMBOL: &[u8] = b"plugin_init\0";

/// `rw` argument of `rwsync`.
pub const RW_READ: u32 = 0;
pub const RW_WRITE: u32 = 1;
pub const RW_READ_EXCLUSIVE: u32 = 2;
pub const RW_WRITE_EXCLUSIVE: u32 = 3;

/// `rwsync` return codes.
pub const RW_OK: c_int = 0;
pub const RW_BUS_ERROR: c_int = 1;
pub const RW_EXCLUSIVE_FAILED: c_int = 2;

pub type TimeoutFn = unsafe extern "C" fn(provider: *mut c_void);

/// Fabric callbacks handed to the backend.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VpsimPlugin {
    pub rwsync: unsafe extern "C" fn(wrapper: *mut c_void, addr: u64, rw: u32, ltime: u64, nbytes: u32, val: *mut u64) -> c_int,
    pub fsync: unsafe extern "C" fn(wrapper: *mut c_void, addr: u64, cnt: u64, instr_quantum: u64, call: c_int),
    pub force_sync: unsafe extern "C" fn(wrapper: *mut c_void, no_sync_instrs: u64),
    pub get_time: unsafe extern "C" fn(wrapper: *mut c_void, no_sync: c_int) -> u64,
    pub stop: unsafe extern "C" fn(wrapper: *mut c_void),
    pub atomic_set_flag: unsafe extern "C" fn(wrapper: *mut c_void),
    pub atomic_reset_flag: unsafe extern "C" fn(wrapper: *mut c_void),
    pub get_dotlm: unsafe extern "C" fn(wrapper: *mut c_void, base: u64, end: u64, is_fetch: c_int) -> *mut u8,
    pub interrupt_me: unsafe extern "C" fn(wrapper: *mut c_void, val: u64, line: u32),
    pub request_timeout:
        unsafe extern "C" fn(wrapper: *mut c_void, ticks: u64, cb: Option<TimeoutFn>, provider: *mut c_void, nosync: u64),
    pub wait_for_interrupt: unsafe extern "C" fn(wrapper: *mut c_void),
}

/// Backend entry points, filled by `plugin_init`. Unset entries stay null.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct IssPlugin {
    pub run: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub set_done: Option<unsafe extern "C" fn(instance: *mut c_void, done: c_int)>,
    pub is_done: Option<unsafe extern "C" fn(instance: *mut c_void) -> c_int>,
    pub reset_done: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub clean: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub map_dmi:
        Option<unsafe extern "C" fn(instance: *mut c_void, name: *const c_char, base: u64, size: u64, ptr: *mut c_void)>,
    pub create_rom:
        Option<unsafe extern "C" fn(instance: *mut c_void, name: *const c_char, base: u64, size: u64, ptr: *mut c_void)>,
    pub linux_mem_init: Option<unsafe extern "C" fn(instance: *mut c_void, base: u64, size: u64)>,
    pub get_result_buffer: Option<unsafe extern "C" fn(instance: *mut c_void) -> *mut c_void>,
    pub load_elf: Option<unsafe extern "C" fn(instance: *mut c_void, path: *const c_char) -> c_int>,
    pub update_irq: Option<unsafe extern "C" fn(instance: *mut c_void, val: u64, line: u32)>,
    pub tb_cache_flush: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub do_cpu_reset: Option<unsafe extern "C" fn(instance: *mut c_void, pc: u64)>,
}

#[repr(C)]
pub struct IssContext {
    pub cpu_id: u32,
    pub model: *const c_char,
    pub instr_quantum: u64,
    pub wrapper: *mut c_void,
    pub vpsim: VpsimPlugin,
    pub iss: IssPlugin,
    pub instance: *mut c_void,
}

pub type PluginInitFn =
    unsafe extern "C" fn(ctx: *mut IssContext, model: *const c_char, is_gdb: c_int, init_pc: u64) -> c_int;
