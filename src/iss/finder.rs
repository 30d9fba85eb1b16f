//! Backend library lookup

use std::path::{Path, PathBuf};

use crate::error::{Result, VpError};

/// Candidate directories from a `base:sub1,sub2,...` search spec. An empty
/// sub-directory list searches `base` itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssFinder {
    dirs: Vec<PathBuf>,
}

impl IssFinder {
    pub fn new(spec: &str) -> Self {
        let (base, subs) = match spec.split_once(':') {
            Some((b, s)) => (b, s),
            None => (spec, ""),
        };
        let base = Path::new(base);
        let mut dirs: Vec<PathBuf> = subs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| base.join(s))
            .collect();
        if dirs.is_empty() {
            dirs.push(base.to_path_buf());
        }
        IssFinder { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn library_name(prefix: &str, arch: &str, suffix: &str) -> String {
        format!("lib{}_{}{}", prefix, arch, suffix)
    }

    /// First `lib{prefix}_{arch}{suffix}` found, in directory order.
    pub fn find(&self, prefix: &str, arch: &str, suffix: &str) -> Result<PathBuf> {
        let name = Self::library_name(prefix, arch, suffix);
        for dir in &self.dirs {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                tracing::debug!("ISS backend for {} at {}", arch, candidate.display());
                return Ok(candidate);
            }
        }
        Err(VpError::Backend(format!(
            "{} not found in {}",
            name,
            self.dirs.iter().map(|d| d.display().to_string()).collect::<Vec<_>>().join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_first_hit_wins() {
        let root = tempfile::tempdir().unwrap();
        for sub in ["a", "b", "c"] {
            fs::create_dir(root.path().join(sub)).unwrap();
        }
        fs::write(root.path().join("b/libqemu_arm.so"), b"").unwrap();
        fs::write(root.path().join("c/libqemu_arm.so"), b"").unwrap();

        let spec = format!("{}:a, b,c", root.path().display());
        let f = IssFinder::new(&spec);
        assert_eq!(f.dirs().len(), 3);
        assert_eq!(f.find("qemu", "arm", ".so").unwrap(), root.path().join("b/libqemu_arm.so"));
        assert!(matches!(f.find("qemu", "riscv", ".so"), Err(VpError::Backend(_))));

        let plain = IssFinder::new(&root.path().join("c").display().to_string());
        assert!(plain.find("qemu", "arm", ".so").is_ok());
    }
}
