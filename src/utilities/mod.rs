pub mod fs_lock;
pub mod logger;
pub mod temp_dir;

pub use fs_lock::StateDirLock;
pub use logger::{AsyncLogger, init_file_logger};
pub use temp_dir::TmpDirGuard;
