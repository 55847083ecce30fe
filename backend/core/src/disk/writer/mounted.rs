//! loop 挂载写入（需要 root 与 `mount`/`umount` 命令）。

use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::{debug, warn};

use super::{FilesystemWriter, WriterKind};
use crate::disk::VirtualDisk;
use crate::error::{classify_io, DiskError, Result};
use crate::paths;

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

fn run_command(program: &str, args: &[&OsStr]) -> io::Result<()> {
    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("{} exited with {}: {}", program, output.status, stderr.trim()),
    ))
}

fn mount_image(image: &Path, mount_point: &Path) -> io::Result<()> {
    run_command(
        "mount",
        &[
            OsStr::new("-o"),
            OsStr::new("loop"),
            image.as_os_str(),
            mount_point.as_os_str(),
        ],
    )
}

fn unmount(mount_point: &Path) -> io::Result<()> {
    run_command("umount", &[mount_point.as_os_str()])
}

/// 挂载写入器；`mount_dir` 只在 begin/end 之间存在
#[derive(Debug, Default)]
pub struct MountedWriter {
    mount_dir: Option<TempDir>,
}

impl MountedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_dir.as_ref().map(|d| d.path())
    }

    fn target(&self, path: &str) -> Result<PathBuf> {
        let dir = self.mount_dir.as_ref().ok_or(DiskError::NotInitialized)?;
        Ok(dir.path().join(paths::relative(path)))
    }
}

impl FilesystemWriter for MountedWriter {
    fn begin(&mut self, disk: &mut VirtualDisk) -> Result<()> {
        if !disk.is_open() {
            return Err(DiskError::NotInitialized);
        }
        if self.mount_dir.is_some() {
            return Ok(());
        }

        let dir = tempfile::Builder::new()
            .prefix("embroidery-mount-")
            .tempdir()
            .map_err(|e| DiskError::backend("failed to create mount directory", e))?;

        // 内核接管镜像期间不能再持有 fatfs 句柄
        disk.detach()?;
        if let Err(e) = mount_image(disk.image_path(), dir.path()) {
            if let Err(re) = disk.attach() {
                warn!("failed to reopen disk after mount failure: {}", re);
            }
            return Err(DiskError::backend("failed to mount disk image", e));
        }

        debug!("mounted {} at {}", disk.image_path().display(), dir.path().display());
        self.mount_dir = Some(dir);
        Ok(())
    }

    fn write_file(
        &mut self,
        _disk: &mut VirtualDisk,
        path: &str,
        source: &mut dyn Read,
        expected_size: u64,
    ) -> Result<()> {
        let target = self.target(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| classify_io(path, "failed to create directory", e))?;
        }

        let file = fs::File::create(&target)
            .map_err(|e| classify_io(path, "failed to create file", e))?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        io::copy(&mut (&mut *source).take(expected_size), &mut out)
            .map_err(|e| classify_io(path, "failed to write file", e))?;
        let file = out
            .into_inner()
            .map_err(|e| classify_io(path, "failed to flush file", e.into_error()))?;
        file.sync_all()
            .map_err(|e| classify_io(path, "failed to sync file", e))?;
        Ok(())
    }

    fn end(&mut self, disk: &mut VirtualDisk) -> Result<()> {
        let Some(dir) = self.mount_dir.take() else {
            return disk.attach();
        };

        if let Err(e) = unmount(dir.path()) {
            // 仍挂载着，保留目录，交给 Drop 再试一次
            self.mount_dir = Some(dir);
            return Err(DiskError::backend("failed to unmount disk image", e));
        }
        if let Err(e) = dir.close() {
            warn!("failed to remove mount directory: {}", e);
        }
        disk.attach()
    }

    fn kind(&self) -> WriterKind {
        WriterKind::Mounted
    }
}

impl Drop for MountedWriter {
    fn drop(&mut self) {
        if let Some(dir) = self.mount_dir.take() {
            if let Err(e) = unmount(dir.path()) {
                warn!("failed to unmount {}: {}", dir.path().display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::create_disk_image;

    #[test]
    fn test_write_outside_burst_is_rejected() {
        let mut writer = MountedWriter::new();
        let mut disk = VirtualDisk::unopened("/tmp/none.img");
        let err = writer
            .write_file(&mut disk, "/a.txt", &mut &b"x"[..], 1)
            .unwrap_err();
        assert!(matches!(err, DiskError::NotInitialized));
        assert!(matches!(writer.begin(&mut disk), Err(DiskError::NotInitialized)));
    }

    #[test]
    fn test_mount_failure_leaves_no_mount_point() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.img");
        create_disk_image(&path, 10).unwrap();
        let mut disk = VirtualDisk::open(&path).unwrap();
        // 镜像被删掉后 mount 必然失败（无论是否有 root 权限）
        fs::remove_file(&path).unwrap();

        let mut writer = MountedWriter::new();
        assert!(writer.begin(&mut disk).is_err());
        assert!(writer.mount_point().is_none());
    }

    #[test]
    fn test_end_without_begin_keeps_disk_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.img");
        create_disk_image(&path, 10).unwrap();
        let mut disk = VirtualDisk::open(&path).unwrap();

        let mut writer = MountedWriter::new();
        writer.end(&mut disk).unwrap();
        assert!(disk.is_open());
    }
}
