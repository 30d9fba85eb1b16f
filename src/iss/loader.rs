//! Per-CPU private copies of backend libraries
//!
//! Many backends keep process-wide globals, so every CPU loads its own copy
//! of the library file with local symbol visibility. Opening and closing
//! libraries goes through one process-wide lock.

use std::ffi::{c_void, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, VpError};
use crate::iss::abi::{PluginInitFn, PLUGIN_INIT_SYMBOL};

static BACKEND_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn dl_error() -> String {
    // SAFETY: dlerror returns null or a NUL-terminated string owned by libc
    unsafe {
        let e = libc::dlerror();
        if e.is_null() {
            "unknown dynamic loader error".to_string()
        } else {
            CStr::from_ptr(e).to_string_lossy().into_owned()
        }
    }
}

/// An opened private copy. Closing and deleting happen on drop.
pub struct BackendLoader {
    handle: *mut c_void,
    copy: PathBuf,
}

// The handle is only used under BACKEND_LOCK or through resolved symbols.
unsafe impl Send for BackendLoader {}
unsafe impl Sync for BackendLoader {}

impl BackendLoader {
    /// Path of the private copy of `lib` for `cpu`.
    pub fn copy_path(lib: &Path, cpu: &str) -> PathBuf {
        let mut name = lib.as_os_str().to_owned();
        name.push(format!(".{}.{}", cpu, std::process::id()));
        PathBuf::from(name)
    }

    pub fn open(lib: &Path, cpu: &str) -> Result<Self> {
        let _guard = BACKEND_LOCK.lock();
        let copy = Self::copy_path(lib, cpu);
        fs::copy(lib, &copy)
            .map_err(|e| VpError::Backend(format!("copying {} to {}: {}", lib.display(), copy.display(), e)))?;

        let cpath = match CString::new(copy.as_os_str().to_string_lossy().into_owned()) {
            Ok(c) => c,
            Err(e) => {
                let _ = fs::remove_file(&copy);
                return Err(VpError::Backend(format!("{}: {}", copy.display(), e)));
            }
        };
        // SAFETY: cpath is a valid NUL-terminated path
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_NOW) };
        if handle.is_null() {
            let msg = dl_error();
            let _ = fs::remove_file(&copy);
            return Err(VpError::Backend(format!("dlopen {}: {}", copy.display(), msg)));
        }
        tracing::info!("backend {} loaded for {}", lib.display(), cpu);
        Ok(BackendLoader { handle, copy })
    }

    pub fn copy(&self) -> &Path {
        &self.copy
    }

    pub fn plugin_init(&self) -> Result<PluginInitFn> {
        let _guard = BACKEND_LOCK.lock();
        // SAFETY: handle is live until drop and the symbol name is NUL-terminated
        let sym = unsafe { libc::dlsym(self.handle, PLUGIN_INIT_SYMBOL.as_ptr().cast()) };
        if sym.is_null() {
            return Err(VpError::Backend(format!("{}: plugin_init not found: {}", self.copy.display(), dl_error())));
        }
        // SAFETY: plugin_init has the PluginInitFn signature by contract
        Ok(unsafe { std::mem::transmute::<*mut c_void, PluginInitFn>(sym) })
    }

    /// Run `f` under the backend lock.
    pub fn locked<R>(f: impl FnOnce() -> R) -> R {
        let _guard = BACKEND_LOCK.lock();
        f()
    }
}

impl Drop for BackendLoader {
    fn drop(&mut self) {
        let _guard = BACKEND_LOCK.lock();
        // SAFETY: handle came from dlopen and is closed exactly once
        unsafe {
            libc::dlclose(self.handle);
        }
        if let Err(e) = fs::remove_file(&self.copy) {
            tracing::warn!("could not remove {}: {}", self.copy.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_path_names_cpu_and_pid() {
        let p = BackendLoader::copy_path(Path::new("/opt/libqemu_arm.so"), "cpu1");
        assert_eq!(p, PathBuf::from(format!("/opt/libqemu_arm.so.cpu1.{}", std::process::id())));
    }

    #[test]
    fn test_bad_library_is_a_backend_error_and_copy_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libbogus_arm.so");
        fs::write(&lib, b"not an ELF file").unwrap();
        match BackendLoader::open(&lib, "cpu0") {
            Err(VpError::Backend(msg)) => assert!(msg.contains("dlopen")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("garbage library loaded"),
        }
        assert!(!BackendLoader::copy_path(&lib, "cpu0").exists());

        let missing = dir.path().join("libnone.so");
        assert!(matches!(BackendLoader::open(&missing, "cpu0"), Err(VpError::Backend(_))));
    }
}
