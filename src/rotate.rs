//! Access log rotation for file mode
//!
//! Traefik reopens its access log on `SIGUSR1`, so rotation is: find the
//! Traefik process, replace the file with an empty one, signal.

use crate::{OfficerError, Result};
use std::path::Path;

/// Rough size of one access log line, used to turn megabytes into lines
pub const EST_BYTES_PER_LINE: i64 = 150;
pub const MIN_ROTATE_LINES: u64 = 1000;
pub const DEFAULT_MAX_SIZE_MB: i64 = 10;

/// Number of lines after which the file is rotated
pub fn rotate_every_lines(max_size_mb: i64) -> u64 {
    let max_size_mb = if max_size_mb <= 0 {
        DEFAULT_MAX_SIZE_MB
    } else {
        max_size_mb
    };

    let lines = max_size_mb.saturating_mul(1_000_000) / EST_BYTES_PER_LINE;
    (lines as u64).max(MIN_ROTATE_LINES)
}

#[cfg(target_os = "linux")]
pub fn rotate(path: &Path) -> Result<()> {
    use tracing::info;

    if path.as_os_str().is_empty() {
        return Err(OfficerError::RotationError(
            "access log location cannot be empty".to_string(),
        ));
    }

    let pid = find_process(Path::new("/proc"), "traefik")?
        .ok_or_else(|| OfficerError::RotationError("traefik process not found".to_string()))?;
    info!(pid, "Found Traefik process");

    recreate(path)?;

    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGUSR1) };
    if rc != 0 {
        return Err(OfficerError::RotationError(format!(
            "failed to send SIGUSR1 to {}: {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }

    info!(path = %path.display(), "Rotated access log and signaled Traefik");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn rotate(_path: &Path) -> Result<()> {
    Err(OfficerError::UnsupportedFeature(
        "access log rotation requires Linux".to_string(),
    ))
}

/// First pid under `proc_root` whose `comm` is `name`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn find_process(proc_root: &Path, name: &str) -> Result<Option<i32>> {
    for entry in std::fs::read_dir(proc_root)? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };

        // Processes may exit between listing and reading
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end() == name {
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

/// Delete the file and leave an empty one in its place
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn recreate(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(OfficerError::RotationError(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            )))
        }
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::File::create(path).map_err(|e| {
        OfficerError::RotationError(format!("failed to create {}: {}", path.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_every_lines() {
        assert_eq!(rotate_every_lines(10), 66_666);
        assert_eq!(rotate_every_lines(1), 6_666);
        // Non-positive sizes fall back to 10MB
        assert_eq!(rotate_every_lines(0), 66_666);
        assert_eq!(rotate_every_lines(-3), 66_666);
    }

    #[test]
    fn test_find_process() {
        let root = tempfile::tempdir().unwrap();
        for (pid, comm) in [("12", "sh\n"), ("345", "traefik\n"), ("self", "traefik\n")] {
            let dir = root.path().join(pid);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("comm"), comm).unwrap();
        }
        std::fs::create_dir(root.path().join("77")).unwrap();

        assert_eq!(find_process(root.path(), "traefik").unwrap(), Some(345));
        assert_eq!(find_process(root.path(), "nginx").unwrap(), None);
    }

    #[test]
    fn test_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("access.log");

        recreate(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        std::fs::write(&path, "old lines\n").unwrap();
        recreate(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
