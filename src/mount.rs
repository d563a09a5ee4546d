//! Mount plumbing for the node service
//!
//! Everything here manipulates the node mount namespace: bind mounts for
//! publishing, device mounts for staging, and the `/proc/mounts` probe that
//! makes all of it idempotent.

use log::{debug, info};
use nix::mount::{self, MntFlags, MsFlags};
use std::convert::TryFrom;
use std::fs;
use std::path::Path;
use std::process::Command;

use super::error::{DriverError, DriverResult};

/// Mount table of the current mount namespace
const PROC_MOUNTS_PATH: &str = "/proc/mounts";

/// Undo the octal escaping (`\040` for space etc.) applied to mount points
/// in `/proc/mounts`
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = u32::from(bytes[i + 1] - b'0') * 64
                + u32::from(bytes[i + 2] - b'0') * 8
                + u32::from(bytes[i + 3] - b'0');
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether the mount table content lists `target` as a mount point
fn mounts_contain_target(content: &str, target: &Path) -> bool {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            fields.next().map(unescape_mount_path)
        })
        .any(|mount_point| Path::new(&mount_point) == target)
}

/// Whether `target` is an active mount point
pub fn is_mount_point(target: &Path) -> DriverResult<bool> {
    let content = fs::read_to_string(PROC_MOUNTS_PATH).map_err(|e| {
        DriverError::Internal(format!(
            "failed to read {}, the error is: {}",
            PROC_MOUNTS_PATH, e,
        ))
    })?;
    Ok(mounts_contain_target(&content, target))
}

/// Make sure `path` exists and is a directory
pub fn ensure_dir(path: &Path) -> DriverResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(..) => Err(DriverError::Internal(format!(
            "staging path {:?} exists but is not a directory",
            path,
        ))),
        Err(..) => fs::create_dir_all(path).map_err(|e| {
            DriverError::Internal(format!(
                "failed to create directory {:?}, the error is: {}",
                path, e,
            ))
        }),
    }
}

/// Make sure `path` exists and is a regular file
pub fn ensure_file(path: &Path) -> DriverResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(..) => Err(DriverError::Internal(format!(
            "staging path {:?} exists but is not a regular file",
            path,
        ))),
        Err(..) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    DriverError::Internal(format!(
                        "failed to create directory {:?}, the error is: {}",
                        parent, e,
                    ))
                })?;
            }
            fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(path)
                .map(|_| ())
                .map_err(|e| {
                    DriverError::Internal(format!(
                        "failed to create file {:?}, the error is: {}",
                        path, e,
                    ))
                })
        }
    }
}

/// Bind mount `source` onto `target`, optionally applying a read-only
/// remount on top
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> DriverResult<()> {
    mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        DriverError::Internal(format!(
            "failed to bind mount {:?} to {:?}, the error is: {}",
            source, target, e,
        ))
    })?;
    if read_only {
        // A bind mount ignores MS_RDONLY on creation, it only takes effect
        // on remount.
        mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| {
            DriverError::Internal(format!(
                "failed to remount {:?} read-only, the error is: {}",
                target, e,
            ))
        })?;
    }
    info!(
        "bind mounted {:?} to {:?} (read_only={})",
        source, target, read_only,
    );
    Ok(())
}

/// Mount the filesystem on `device` at `target`
pub fn mount_device(
    device: &Path,
    target: &Path,
    fs_type: &str,
    options: &[String],
) -> DriverResult<()> {
    let data = options.join(",");
    mount::mount(
        Some(device),
        target,
        Some(fs_type),
        MsFlags::empty(),
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .map_err(|e| {
        DriverError::Internal(format!(
            "failed to mount device {:?} to {:?} as {}, the error is: {}",
            device, target, fs_type, e,
        ))
    })?;
    info!("mounted device {:?} to {:?} as {}", device, target, fs_type);
    Ok(())
}

/// Un-mount target path, if fail try force un-mount again. Un-mounting a
/// path that is not a mount point is a no-op.
pub fn unmount(target: &Path) -> DriverResult<()> {
    if !is_mount_point(target)? {
        debug!("{:?} is not a mount point, nothing to un-mount", target);
        return Ok(());
    }
    if let Err(umount_e) = mount::umount(target) {
        mount::umount2(target, MntFlags::MNT_FORCE).map_err(|umount_force_e| {
            DriverError::Internal(format!(
                "failed to un-mount the target path={:?}, \
                    the un-mount error is: {:?} and the force un-mount error is: {}",
                target, umount_e, umount_force_e,
            ))
        })?;
    }
    info!("un-mounted target path {:?}", target);
    Ok(())
}

/// Remove a staging or publish artifact. A missing path is a no-op.
pub fn remove_mount_point(path: &Path) -> DriverResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(DriverError::Internal(format!(
                "failed to stat mount point {:?}, the error is: {}",
                path, e,
            )));
        }
    };
    let remove_res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    remove_res.map_err(|e| {
        DriverError::Internal(format!(
            "failed to remove mount point {:?}, the error is: {}",
            path, e,
        ))
    })
}

/// Whether the device already carries a filesystem signature
pub fn has_filesystem_signature(device: &Path) -> DriverResult<bool> {
    let output = Command::new("blkid")
        .arg("-p")
        .arg("-s")
        .arg("TYPE")
        .arg("-o")
        .arg("value")
        .arg(device)
        .output()
        .map_err(|e| {
            DriverError::Internal(format!(
                "blkid command failed to start, the error is: {}",
                e,
            ))
        })?;
    match output.status.code() {
        Some(0) => Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty()),
        // blkid exits 2 when it finds no recognizable signature
        Some(2) => Ok(false),
        _ => Err(DriverError::Internal(format!(
            "blkid failed to probe {:?}, the error is: {}",
            device,
            String::from_utf8_lossy(&output.stderr),
        ))),
    }
}

/// Format the device with the given filesystem. Callers must have probed
/// for an existing signature first, a formatted device is never formatted
/// again.
pub fn format_device(device: &Path, fs_type: &str) -> DriverResult<()> {
    let output = Command::new(format!("mkfs.{}", fs_type))
        .arg("-q")
        .arg(device)
        .output()
        .map_err(|e| {
            DriverError::Internal(format!(
                "mkfs.{} command failed to start, the error is: {}",
                fs_type, e,
            ))
        })?;
    if !output.status.success() {
        return Err(DriverError::Internal(format!(
            "failed to format {:?} as {}, the error is: {}",
            device,
            fs_type,
            String::from_utf8_lossy(&output.stderr),
        )));
    }
    info!("formatted device {:?} as {}", device, fs_type);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_paths_are_unescaped() {
        assert_eq!(unescape_mount_path("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_path("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(
            unescape_mount_path("/mnt/back\\134slash"),
            "/mnt/back\\slash",
        );
        // A trailing backslash without octal digits stays as-is.
        assert_eq!(unescape_mount_path("/mnt/odd\\"), "/mnt/odd\\");
    }

    #[test]
    fn mount_table_lookup_matches_exact_targets() {
        let content = "\
/dev/sda1 / ext4 rw,relatime 0 0
tmpfs /tmp tmpfs rw,nosuid 0 0
/dev/mapper/vg-lv /mnt/with\\040space ext4 rw 0 0
";
        assert!(mounts_contain_target(content, Path::new("/")));
        assert!(mounts_contain_target(content, Path::new("/tmp")));
        assert!(mounts_contain_target(content, Path::new("/mnt/with space")));
        assert!(!mounts_contain_target(content, Path::new("/mnt")));
        assert!(!mounts_contain_target(content, Path::new("/tmp/sub")));
    }

    #[test]
    fn malformed_mount_lines_are_skipped() {
        let content = "incomplete\n\n/dev/sdb1 /data xfs rw 0 0\n";
        assert!(mounts_contain_target(content, Path::new("/data")));
        assert!(!mounts_contain_target(content, Path::new("incomplete")));
    }
}
