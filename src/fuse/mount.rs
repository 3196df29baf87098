//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::passthrough::PassthroughFs;

/// Build default mount options.
fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("mirrorfs")
        .uid(unsafe { libc::getuid() })
        .gid(unsafe { libc::getgid() });
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount onto the given empty directory using unprivileged mode
/// (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: PassthroughFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Mount onto the given empty directory with a privileged mount syscall
/// (needs CAP_SYS_ADMIN or root).
#[cfg(target_os = "linux")]
pub async fn mount_privileged(
    fs: PassthroughFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: PassthroughFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_privileged(
    _fs: PassthroughFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
