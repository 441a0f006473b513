mod log_sink;
mod runner;

pub use log_sink::{LogSink, LogTail, read_tail};
pub use runner::{
    ExitReport, KILL_WAIT, PUMP_DRAIN, ProcessControl, ProcessHandle, ProcessRunner,
    ResolvedCommand,
};
