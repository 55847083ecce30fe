//! 虚拟磁盘：镜像文件 + 由其打开的 FAT 文件系统句柄。
//!
//! 镜像不带分区表，整个文件就是一个 FAT 卷，既能交给 fatfs 直接操作，也能 `mount -o loop`。

pub mod writer;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use tracing::{info, warn};

use crate::error::{DiskError, Result};
use crate::paths;

pub(crate) type FatVolume<'a> = FileSystem<&'a mut File>;

pub const SECTOR_SIZE: u64 = 512;
pub const VOLUME_LABEL: [u8; 11] = *b"EMBROIDERY ";

const MIN_FAT32_CLUSTERS: u64 = 65525;
const FAT32_RESERVED_SECTORS: u64 = 32;

/// 能容纳 65525 个 512 字节簇（外加保留区与两份 FAT）的最小卷；达到该大小才强制 FAT32。
///
/// 更小的卷是 FAT16，根目录项数固定（512 个短名项，长文件名会占用多项）。
pub const MIN_FAT32_BYTES: u64 = {
    let fat_sectors = ((MIN_FAT32_CLUSTERS + 2) * 4).div_ceil(SECTOR_SIZE);
    (MIN_FAT32_CLUSTERS + FAT32_RESERVED_SECTORS + 2 * fat_sectors) * SECTOR_SIZE
};

/// MB 数换算为字节，并检查扇区数能用 32 位表示
fn image_geometry(size_mb: u64) -> Result<(u64, u32)> {
    let size_bytes = size_mb
        .checked_mul(1024 * 1024)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| DiskError::Config(format!("invalid disk size: {}MB", size_mb)))?;
    let sectors = u32::try_from(size_bytes / SECTOR_SIZE).map_err(|_| {
        DiskError::Config(format!(
            "disk size {}MB exceeds the FAT sector limit",
            size_mb
        ))
    })?;
    Ok((size_bytes, sectors))
}

fn format_options(size_bytes: u64, sectors: u32) -> FormatVolumeOptions {
    let mut options = FormatVolumeOptions::new()
        .volume_label(VOLUME_LABEL)
        .total_sectors(sectors);
    if size_bytes >= MIN_FAT32_BYTES {
        options = options.fat_type(FatType::Fat32);
    }
    options
}

fn format_image(file: &mut File, size_bytes: u64) -> Result<()> {
    let sectors = u32::try_from(size_bytes / SECTOR_SIZE)
        .map_err(|_| DiskError::Config("disk image exceeds the FAT sector limit".to_string()))?;
    fatfs::format_volume(&mut *file, format_options(size_bytes, sectors))
        .map_err(|e| DiskError::backend("failed to create filesystem", e))?;
    file.sync_all()
        .map_err(|e| DiskError::backend("failed to sync disk image", e))
}

/// 创建固定大小的镜像并格式化。目标已存在时失败，不会覆盖已有镜像。
pub fn create_disk_image(path: &Path, size_mb: u64) -> Result<()> {
    let (size_bytes, _) = image_geometry(size_mb)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| DiskError::backend("failed to create disk image directory", e))?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| DiskError::backend(format!("failed to create disk {}", path.display()), e))?;
    file.set_len(size_bytes)
        .map_err(|e| DiskError::backend("failed to allocate disk image", e))?;

    format_image(&mut file, size_bytes)?;
    info!("created disk image {} ({}MB)", path.display(), size_mb);
    Ok(())
}

fn open_image(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| DiskError::backend("failed to open disk", e))?;
    // 打开时校验一次文件系统
    mount(&mut file)?
        .unmount()
        .map_err(|e| DiskError::backend("failed to get filesystem", e))?;
    Ok(file)
}

/// 在镜像文件上挂出一个短生命周期的 fatfs 句柄
pub(crate) fn mount(file: &mut File) -> Result<FatVolume<'_>> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| DiskError::backend("failed to seek disk", e))?;
    FileSystem::new(file, FsOptions::new())
        .map_err(|e| DiskError::backend("failed to get filesystem", e))
}

/// 读出的文件内容
#[derive(Debug)]
pub struct FileContents {
    data: io::Cursor<Vec<u8>>,
}

impl FileContents {
    pub fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl Read for FileContents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

/// 虚拟磁盘
pub struct VirtualDisk {
    image_path: PathBuf,
    size_bytes: u64,
    /// 已校验过的镜像文件，只给写路径使用
    handle: Option<File>,
}

impl VirtualDisk {
    /// 打开已存在的镜像并绑定文件系统句柄
    pub fn open(image_path: impl Into<PathBuf>) -> Result<Self> {
        let image_path = image_path.into();
        let meta = std::fs::metadata(&image_path).map_err(|_| DiskError::ImageMissing {
            path: image_path.clone(),
        })?;
        let file = open_image(&image_path)?;
        Ok(Self {
            image_path,
            size_bytes: meta.len(),
            handle: Some(file),
        })
    }

    /// 没有打开任何文件系统的磁盘，所有读写都返回 `NotInitialized`
    pub fn unopened(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            size_bytes: 0,
            handle: None,
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn image_mut(&mut self) -> Result<&mut File> {
        self.handle.as_mut().ok_or(DiskError::NotInitialized)
    }

    /// 读取整个文件；`path` 需已规范化。
    ///
    /// 每次读取以只读方式单独打开镜像，多个读者互不阻塞；调用方负责保证读取期间没有写入。
    pub fn read_file(&self, path: &str) -> Result<FileContents> {
        if self.handle.is_none() {
            return Err(DiskError::NotInitialized);
        }
        let mut image =
            File::open(&self.image_path).map_err(|e| DiskError::backend("failed to open disk", e))?;
        let volume = mount(&mut image)?;

        let mut data = Vec::new();
        {
            let root = volume.root_dir();
            let mut file = root.open_file(paths::relative(path)).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DiskError::NotFound {
                        path: path.to_string(),
                    }
                } else {
                    DiskError::backend("failed to open file", e)
                }
            })?;
            file.read_to_end(&mut data)
                .map_err(|e| DiskError::backend("failed to read file", e))?;
        }
        Ok(FileContents {
            data: io::Cursor::new(data),
        })
    }

    /// 落盘后释放文件系统句柄，镜像可以交给其他写入方式；落盘失败时句柄保留
    pub(crate) fn detach(&mut self) -> Result<()> {
        let Some(file) = self.handle.as_ref() else {
            return Ok(());
        };
        file.sync_all()
            .map_err(|e| DiskError::backend("failed to flush disk", e))?;
        self.handle = None;
        Ok(())
    }

    /// 重新打开文件系统句柄
    pub(crate) fn attach(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let file = open_image(&self.image_path)?;
        self.handle = Some(file);
        Ok(())
    }

    /// 重新格式化，丢弃全部内容
    pub(crate) fn reformat(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(DiskError::NotInitialized);
        }
        self.detach()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.image_path)
            .map_err(|e| DiskError::backend("failed to open disk", e))?;
        let formatted = format_image(&mut file, self.size_bytes);
        drop(file);

        // 格式化失败也尽量恢复句柄，原内容可能仍然有效
        let attached = self.attach();
        formatted?;
        attached
    }

    /// 清空句柄（不可逆）
    pub(crate) fn close(&mut self) {
        if let Err(e) = self.detach() {
            warn!("failed to flush disk {}: {}", self.image_path.display(), e);
        }
        self.handle = None;
    }
}
