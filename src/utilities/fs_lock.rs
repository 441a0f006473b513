use crate::err::Result;
use crate::orch_error_with_source;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

pub const LOCK_FILE_NAME: &str = ".lock";

/// Exclusive, cross-process ownership of a state directory.
/// At most one job manager may supervise the jobs persisted under a directory,
/// otherwise two processes would race on the same records.
#[derive(Debug)]
pub struct StateDirLock {
    inner: File,
}

impl StateDirLock {
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE_NAME);
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if let Err(e) = f.try_lock_exclusive() {
            return Err(orch_error_with_source!(
                e,
                "state directory {} is locked by another process",
                dir.as_ref().display()
            )
            .into());
        }
        Ok(Self { inner: f })
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::TmpDirGuard;

    #[test]
    fn second_lock_on_same_dir_fails_until_released() {
        let tmp = TmpDirGuard::new("state_lock");
        let first = StateDirLock::acquire(tmp.as_path()).expect("first lock");
        assert!(tmp.join(LOCK_FILE_NAME).is_file());

        let err = StateDirLock::acquire(tmp.as_path()).expect_err("second lock must fail");
        assert!(err.to_string().contains("locked by another process"));

        drop(first);
        StateDirLock::acquire(tmp.as_path()).expect("lock after release");
    }
}
