use std::io::{self, Read, Write};

use tracing::debug;

use super::{FilesystemWriter, WriterKind};
use crate::disk::{mount, VirtualDisk};
use crate::error::{classify_io, DiskError, Result};
use crate::paths;

/// 通过 fatfs 直接写镜像
#[derive(Debug, Default)]
pub struct DirectWriter;

impl DirectWriter {
    pub fn new() -> Self {
        Self
    }
}

impl FilesystemWriter for DirectWriter {
    fn begin(&mut self, disk: &mut VirtualDisk) -> Result<()> {
        disk.image_mut().map(|_| ())
    }

    fn write_file(
        &mut self,
        disk: &mut VirtualDisk,
        path: &str,
        source: &mut dyn Read,
        expected_size: u64,
    ) -> Result<()> {
        let volume = mount(disk.image_mut()?)?;

        let copied = {
            let root = volume.root_dir();
            for dir in paths::parent_dirs(path) {
                root.create_dir(paths::relative(dir)).map_err(|e| {
                    classify_io(path, format!("failed to create directory {}", dir), e)
                })?;
            }

            let mut file = root
                .create_file(paths::relative(path))
                .map_err(|e| classify_io(path, "failed to create file", e))?;
            file.truncate()
                .map_err(|e| classify_io(path, "failed to truncate file", e))?;

            let copied = io::copy(&mut (&mut *source).take(expected_size), &mut file)
                .map_err(|e| classify_io(path, "failed to write file", e))?;
            file.flush()
                .map_err(|e| classify_io(path, "failed to flush file", e))?;
            copied
        };

        // 每个文件单独落盘（FSInfo 与脏标记）
        volume
            .unmount()
            .map_err(|e| classify_io(path, "failed to flush filesystem", e))?;
        debug!("wrote {} ({} of {} bytes)", path, copied, expected_size);
        Ok(())
    }

    fn end(&mut self, disk: &mut VirtualDisk) -> Result<()> {
        disk.image_mut()?
            .sync_data()
            .map_err(|e| DiskError::backend("failed to sync disk", e))
    }

    fn kind(&self) -> WriterKind {
        WriterKind::Direct
    }
}
