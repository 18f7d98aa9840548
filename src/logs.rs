//! Log file locations.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// File name of the supervisor's own log inside the logs directory.
pub const SUPERVISOR_LOG: &str = "supervisor.log";

/// Returns the file a service's stdout and stderr are appended to.
pub fn service_log_path(logs_dir: &Path, service_name: &str) -> PathBuf {
    logs_dir.join(format!("{service_name}.log"))
}

/// Returns the path of the supervisor log.
pub fn supervisor_log_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(SUPERVISOR_LOG)
}

/// Opens the supervisor log for appending, creating the directory if needed.
pub fn open_supervisor_log(logs_dir: &Path) -> io::Result<File> {
    fs::create_dir_all(logs_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(supervisor_log_path(logs_dir))
}
