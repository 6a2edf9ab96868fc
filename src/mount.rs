//! Kernel mount-table operations.
//!
//! The node plugin needs four things from the kernel: enumerate the mount
//! table, mount a block device, unmount a path, and drop permissions on a
//! target directory. Mount and unmount shell out to the system binaries;
//! the mount table is read from `/proc/mounts`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

/// One entry of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: String,
    pub options: Vec<String>,
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },

    #[error("{tool} failed: {stderr}")]
    CommandFailed { tool: &'static str, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumerate the mounts currently visible to this process.
pub fn list_mounts() -> Result<Vec<MountPoint>, MountError> {
    let raw = fs::read_to_string("/proc/mounts")?;
    Ok(parse_mount_table(&raw))
}

/// Parse `/proc/mounts` content. Lines that do not carry the expected
/// `device path fstype options ...` fields are skipped.
pub fn parse_mount_table(raw: &str) -> Vec<MountPoint> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let _fs_type = fields.next()?;
            let options = fields.next()?;
            Some(MountPoint {
                device: device.to_string(),
                path: path.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Find the mount table entry for a path, if any.
pub fn find_mount<'a>(mounts: &'a [MountPoint], path: &str) -> Option<&'a MountPoint> {
    mounts.iter().find(|m| m.path == path)
}

/// Whether `opts` contains the desired mount option.
pub fn verify_mount_opts(opts: &[String], desired: &str) -> bool {
    opts.iter().any(|opt| opt == desired)
}

/// Whether a path is currently mounted.
pub fn is_mounted(path: &str) -> Result<bool, MountError> {
    Ok(find_mount(&list_mounts()?, path).is_some())
}

/// Mount a block device at `path` with the given options.
///
/// The target directory is created first; `fs_type` may be empty to let
/// the kernel probe it.
pub fn mount_device(
    device: &str,
    path: &str,
    fs_type: &str,
    options: &[String],
) -> Result<(), MountError> {
    fs::create_dir_all(path)?;

    let mut cmd = Command::new("mount");
    if !fs_type.is_empty() {
        cmd.args(["-t", fs_type]);
    }
    if !options.is_empty() {
        cmd.args(["-o", &options.join(",")]);
    }
    cmd.arg(device).arg(path);

    let output = cmd.output().map_err(|source| MountError::Spawn {
        tool: "mount",
        source,
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(MountError::CommandFailed {
            tool: "mount",
            stderr,
        });
    }
    Ok(())
}

/// Unmount a path. A path that is not mounted is not an error.
pub fn unmount(path: &str) -> Result<(), MountError> {
    if !is_mounted(path)? {
        debug!(path = %path, "path is not mounted, skipping unmount");
        return Ok(());
    }

    let output = Command::new("umount")
        .arg(path)
        .output()
        .map_err(|source| MountError::Spawn {
            tool: "umount",
            source,
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(path = %path, "path was not mounted");
            return Ok(());
        }
        return Err(MountError::CommandFailed {
            tool: "umount",
            stderr,
        });
    }
    Ok(())
}

/// Remove all permissions from the target directory.
///
/// While the volume is mounted on top the kernel presents the mounted
/// filesystem's permissions instead; once unmounted, applications can no
/// longer write to the bare local directory unnoticed.
pub fn chmod_mount_path(path: &str) -> std::io::Result<()> {
    fs::set_permissions(Path::new(path), fs::Permissions::from_mode(0o000))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime,errors=remount-ro 0 0
/dev/sdb /var/lib/kubelet/pods/p/volumes/v/mount ext4 ro,relatime 0 0
broken-line
";

    #[test]
    fn parse_mount_table_extracts_device_path_and_options() {
        let mounts = parse_mount_table(SAMPLE);
        assert_eq!(mounts.len(), 3);

        let root = find_mount(&mounts, "/").unwrap();
        assert_eq!(root.device, "/dev/sda1");
        assert!(verify_mount_opts(&root.options, "rw"));

        let vol = find_mount(&mounts, "/var/lib/kubelet/pods/p/volumes/v/mount").unwrap();
        assert_eq!(vol.device, "/dev/sdb");
        assert!(verify_mount_opts(&vol.options, "ro"));
        assert!(!verify_mount_opts(&vol.options, "rw"));
    }

    #[test]
    fn find_mount_misses_unknown_path() {
        let mounts = parse_mount_table(SAMPLE);
        assert!(find_mount(&mounts, "/mnt/absent").is_none());
    }

    #[test]
    fn verify_mount_opts_matches_whole_option_only() {
        let opts = vec!["rw".to_string(), "relatime".to_string()];
        assert!(verify_mount_opts(&opts, "rw"));
        assert!(!verify_mount_opts(&opts, "r"));
        assert!(!verify_mount_opts(&opts, "noatime"));
    }

    #[test]
    fn unmount_of_unmounted_path_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        assert!(unmount(path).is_ok());
    }

    #[test]
    fn chmod_mount_path_strips_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        chmod_mount_path(path).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0);
        // Restore so the tempdir can be cleaned up.
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
