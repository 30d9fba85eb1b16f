//! `extern "C"` entry points handed to native backends
//!
//! Each shim recovers the [`IssWrapper`] from the opaque pointer the backend
//! was given in its [`IssContext`](crate::iss::abi::IssContext).

use std::ffi::{c_int, c_void};
use std::ptr;

use crate::iss::abi::{TimeoutFn, VpsimPlugin};
use crate::iss::wrapper::IssWrapper;

/// # Safety
/// `w` must be the `wrapper` pointer of a live context.
unsafe fn wrapper<'a>(w: *mut c_void) -> &'a IssWrapper {
    &*(w as *const IssWrapper)
}

unsafe extern "C" fn rwsync(w: *mut c_void, addr: u64, rw: u32, ltime: u64, nbytes: u32, val: *mut u64) -> c_int {
    let cpu = wrapper(w);
    let mut v = if val.is_null() { 0 } else { *val };
    let rc = cpu.rwsync(addr, rw, ltime, nbytes, &mut v);
    if !val.is_null() {
        *val = v;
    }
    rc
}

unsafe extern "C" fn fsync(w: *mut c_void, addr: u64, cnt: u64, instr_quantum: u64, call: c_int) {
    wrapper(w).fsync(addr, cnt, instr_quantum, call != 0);
}

unsafe extern "C" fn force_sync(w: *mut c_void, no_sync_instrs: u64) {
    wrapper(w).force_sync(no_sync_instrs);
}

unsafe extern "C" fn get_time(w: *mut c_void, no_sync: c_int) -> u64 {
    wrapper(w).get_time(no_sync != 0)
}

unsafe extern "C" fn stop(w: *mut c_void) {
    wrapper(w).stop();
}

unsafe extern "C" fn atomic_set_flag(w: *mut c_void) {
    wrapper(w).atomic_set_flag();
}

unsafe extern "C" fn atomic_reset_flag(w: *mut c_void) {
    wrapper(w).atomic_reset_flag();
}

unsafe extern "C" fn get_dotlm(w: *mut c_void, base: u64, end: u64, is_fetch: c_int) -> *mut u8 {
    wrapper(w).get_dotlm(base, end, is_fetch != 0).unwrap_or(ptr::null_mut())
}

unsafe extern "C" fn interrupt_me(w: *mut c_void, val: u64, line: u32) {
    wrapper(w).interrupt_me(val, line);
}

/// Backend-owned timeout target.
struct Provider(*mut c_void);

// The provider is only touched from the scheduler while the backend's
// process is suspended.
unsafe impl Send for Provider {}

unsafe extern "C" fn request_timeout(w: *mut c_void, ticks: u64, cb: Option<TimeoutFn>, provider: *mut c_void, nosync: u64) {
    let cpu = wrapper(w);
    let provider = Provider(provider);
    cpu.request_timeout(ticks, nosync, move || {
        let provider = provider;
        if let Some(cb) = cb {
            // SAFETY: the backend keeps provider alive until its callback ran
            unsafe { cb(provider.0) };
        }
    });
}

unsafe extern "C" fn wait_for_interrupt(w: *mut c_void) {
    wrapper(w).wait_for_interrupt();
}

/// The callback table every native backend receives.
pub fn fabric_table() -> VpsimPlugin {
    VpsimPlugin {
        rwsync,
        fsync,
        force_sync,
        get_time,
        stop,
        atomic_set_flag,
        atomic_reset_flag,
        get_dotlm,
        interrupt_me,
        request_timeout,
        wait_for_interrupt,
    }
}
