use crate::global_var::LOGGER;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A directory that is removed, with everything below it, when dropped.
#[derive(Debug)]
pub struct TmpDirGuard(pub PathBuf);

impl TmpDirGuard {
    /// Create a fresh, uniquely named directory under the system temp dir.
    pub fn new(prefix: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut p = std::env::temp_dir();
        p.push(format!("{}_{}_{}_{}", prefix, std::process::id(), millis, n));
        if let Err(e) = std::fs::create_dir_all(&p) {
            LOGGER.warn(format!("Failed to create temporary directory {:?}: {}", &p, e));
        }
        Self(p)
    }
}

impl Drop for TmpDirGuard {
    fn drop(&mut self) {
        LOGGER.trace(format!(
            "TmpDirGuard dropping, removing temporary directory: {:?}",
            &self.0
        ));
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

impl From<PathBuf> for TmpDirGuard {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl AsRef<Path> for TmpDirGuard {
    fn as_ref(&self) -> &Path {
        self.0.as_path()
    }
}

impl Deref for TmpDirGuard {
    type Target = PathBuf;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_creates_unique_dirs_and_removes_on_drop() {
        let a = TmpDirGuard::new("guard");
        let b = TmpDirGuard::new("guard");
        assert_ne!(a.as_path(), b.as_path());
        assert!(a.is_dir());

        std::fs::write(a.join("f.txt"), b"x").unwrap();
        let path = a.to_path_buf();
        drop(a);
        assert!(!path.exists());
    }
}
