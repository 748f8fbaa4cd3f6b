// Per-job scratch directories on the volume shared with sandbox containers.
//
// The worker sees the shared volume at the configured host path (default
// /tmp/executions); sandboxes mount the same volume read-only at /code. A
// job's code therefore lands at <host>/<jobId>/script<ext> on this side and
// /code/<jobId>/script<ext> inside the sandbox.
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Mount point of the shared volume inside sandbox containers.
pub const SANDBOX_MOUNT: &str = "/code";

pub struct ScratchManager {
    host_root: PathBuf,
}

/// A per-job directory on the shared volume, owned by exactly one job for
/// its lifetime. Naming by job id keeps concurrent slots disjoint.
#[derive(Debug)]
pub struct ScratchSlot {
    job_id: String,
    host_path: PathBuf,
}

impl ScratchManager {
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
        }
    }

    /// Create the scratch root if missing. Called once at startup.
    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.host_root)
    }

    /// Create `<root>/<jobId>/`, mode 0755.
    pub fn allocate(&self, job_id: &str) -> io::Result<ScratchSlot> {
        let host_path = self.host_root.join(job_id);
        fs::create_dir_all(&host_path)?;
        fs::set_permissions(&host_path, fs::Permissions::from_mode(0o755))?;
        Ok(ScratchSlot {
            job_id: job_id.to_string(),
            host_path,
        })
    }

    /// Recursively remove the job's directory. Best-effort: failures are
    /// logged and left for a janitor sweep, never surfaced to the job.
    /// Runs after container removal so the read-only mount is never pulled
    /// out from under a live sandbox.
    pub fn release(&self, slot: &ScratchSlot) {
        if let Err(e) = fs::remove_dir_all(&slot.host_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(job_id = %slot.job_id, error = %e, "failed to clean up scratch directory");
            }
        }
    }
}

impl ScratchSlot {
    /// Write `<filename>` into the slot, mode 0644, overwriting.
    pub fn write_code(&self, filename: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.host_path.join(filename);
        fs::write(&path, bytes)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Path of the materialized script as seen from inside the sandbox.
    pub fn sandbox_script_path(&self, filename: &str) -> String {
        format!("{}/{}/{}", SANDBOX_MOUNT, self.job_id, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_manager() -> (ScratchManager, PathBuf) {
        let root = std::env::temp_dir().join(format!("rce-scratch-{}", Uuid::new_v4()));
        let manager = ScratchManager::new(&root);
        manager.ensure_root().unwrap();
        (manager, root)
    }

    #[test]
    fn allocate_write_release_round_trip() {
        let (manager, root) = test_manager();

        let slot = manager.allocate("job-1").unwrap();
        assert_eq!(slot.host_path(), root.join("job-1"));
        let mode = fs::metadata(slot.host_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        slot.write_code("script.py", b"print('hi')").unwrap();
        let file = slot.host_path().join("script.py");
        assert_eq!(fs::read(&file).unwrap(), b"print('hi')");
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        manager.release(&slot);
        assert!(!slot.host_path().exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn write_code_overwrites() {
        let (manager, root) = test_manager();
        let slot = manager.allocate("job-2").unwrap();

        slot.write_code("script.js", b"console.log(1)").unwrap();
        slot.write_code("script.js", b"console.log(2)").unwrap();
        assert_eq!(
            fs::read(slot.host_path().join("script.js")).unwrap(),
            b"console.log(2)"
        );

        manager.release(&slot);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn sandbox_script_path_uses_the_container_mount() {
        let (manager, root) = test_manager();
        let slot = manager.allocate("abc-123").unwrap();
        assert_eq!(
            slot.sandbox_script_path("script.py"),
            "/code/abc-123/script.py"
        );
        manager.release(&slot);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn release_tolerates_a_missing_directory() {
        let (manager, root) = test_manager();
        let slot = manager.allocate("job-3").unwrap();
        manager.release(&slot);
        // Second release is a no-op, not a panic.
        manager.release(&slot);
        fs::remove_dir_all(&root).unwrap();
    }
}
