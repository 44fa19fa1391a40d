//! Rendezvous addressing.
//!
//! A service name maps deterministically onto a Unix socket path:
//! `<socket_dir>/local_comm_<sanitized-name>.sock`.

use crate::config::LocalCommConfig;
use std::path::{Path, PathBuf};

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Rendezvous socket path for `name` under `dir`.
pub fn socket_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(
        "{}{}{}",
        LocalCommConfig::SOCKET_PREFIX,
        sanitize_service_name(name),
        LocalCommConfig::SOCKET_SUFFIX
    ))
}

/// Remove a leftover socket file. A missing file is not an error.
pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
