//! Rootfs disk materialisation.
//!
//! Creates a machine's root disk file from a cached image rootfs. On Linux
//! a reflink (`FICLONE`) is attempted first so machines sharing an image
//! share extents; filesystems without reflink support fall back to a block
//! copy.

use std::path::Path;
use std::path::PathBuf;

use snafu::Snafu;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum RawError {
    #[snafu(display("failed to create disk {} from {}: {source}", dest.display(), source_file.display()))]
    Create {
        dest: PathBuf,
        source_file: PathBuf,
        source: std::io::Error,
    },
}

/// Create `dest` with the contents of `source_file`. `dest` must not exist.
pub async fn create_from_source(dest: &Path, source_file: &Path) -> Result<(), RawError> {
    let dest_owned = dest.to_path_buf();
    let source_owned = source_file.to_path_buf();

    let cloned = tokio::task::spawn_blocking(move || copy_blocking(&dest_owned, &source_owned))
        .await
        .map_err(|join| RawError::Create {
            dest: dest.to_path_buf(),
            source_file: source_file.to_path_buf(),
            source: std::io::Error::other(join),
        })?;

    match cloned {
        Ok(reflinked) => {
            debug!(
                dest = %dest.display(),
                reflinked,
                "materialised root disk"
            );
            Ok(())
        }
        Err(source) => Err(RawError::Create {
            dest: dest.to_path_buf(),
            source_file: source_file.to_path_buf(),
            source,
        }),
    }
}

/// Returns whether the file was reflinked (vs block-copied).
fn copy_blocking(dest: &Path, source_file: &Path) -> std::io::Result<bool> {
    let src = std::fs::File::open(source_file)?;
    let dst = std::fs::OpenOptions::new().write(true).create_new(true).open(dest)?;

    if try_reflink(&src, &dst).is_ok() {
        return Ok(true);
    }

    // Reflink unsupported on this filesystem, fall back to a full copy.
    drop(dst);
    std::fs::remove_file(dest)?;
    std::fs::copy(source_file, dest)?;
    Ok(false)
}

#[cfg(target_os = "linux")]
fn try_reflink(src: &std::fs::File, dst: &std::fs::File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    const FICLONE: libc::c_ulong = 0x4004_9409;
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn try_reflink(_src: &std::fs::File, _dst: &std::fs::File) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_source_contents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("image-rootfs");
        let dest = dir.path().join("rootfs");
        tokio::fs::write(&src, b"boot sector").await.unwrap();

        create_from_source(&dest, &src).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"boot sector");
    }

    #[tokio::test]
    async fn refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("image-rootfs");
        let dest = dir.path().join("rootfs");
        tokio::fs::write(&src, b"new").await.unwrap();
        tokio::fs::write(&dest, b"existing").await.unwrap();

        assert!(create_from_source(&dest, &src).await.is_err());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"existing");
    }
}
