//! 磁盘事务协调器：镜像修改的唯一入口。
//!
//! 一把读写锁同时保护文件系统句柄与设备链路：
//! - 写类操作（`begin_transaction` / `clear_files` / `close`）持独占锁，期间 gadget 断开；
//! - 读类操作（`read_file`）持共享锁，可以并发，但不会与事务同时发生。

use std::io::Read;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::config::DiskConfig;
use crate::device_link::{DeviceLink, LinkState};
use crate::disk::writer::{new_filesystem_writer, FilesystemWriter};
use crate::disk::{FileContents, VirtualDisk};
use crate::error::{DiskError, Result};
use crate::paths;

struct Inner {
    disk: VirtualDisk,
    writer: Box<dyn FilesystemWriter>,
    link: Box<dyn DeviceLink>,
}

/// 链路静默守卫：构造时断开 gadget，析构时（含 panic 展开）结束未结束的写入批次并重新连接。
struct QuiescedLink<'a> {
    inner: &'a mut Inner,
    burst_open: bool,
}

impl<'a> QuiescedLink<'a> {
    /// 断开失败时直接返回错误，守卫不存在，也就不会尝试重连
    fn engage(inner: &'a mut Inner) -> Result<Self> {
        inner.link.disconnect()?;
        Ok(Self {
            inner,
            burst_open: false,
        })
    }

    fn begin_burst(&mut self) -> Result<()> {
        let Inner { disk, writer, .. } = &mut *self.inner;
        writer.begin(disk)?;
        self.burst_open = true;
        Ok(())
    }

    fn end_burst(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.burst_open) {
            return Ok(());
        }
        let Inner { disk, writer, .. } = &mut *self.inner;
        writer.end(disk)
    }

    fn transaction(&mut self) -> Transaction<'_> {
        let Inner { disk, writer, .. } = &mut *self.inner;
        Transaction {
            disk,
            writer: &mut **writer,
        }
    }

    fn disk_mut(&mut self) -> &mut VirtualDisk {
        &mut self.inner.disk
    }
}

impl Drop for QuiescedLink<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.end_burst() {
            warn!("failed to finish disk writes: {}", e);
        }
        if let Err(e) = self.inner.link.reconnect() {
            warn!("failed to reconnect USB gadget: {}", e);
        }
    }
}

/// 一次事务内的写句柄，只在 `begin_transaction` 的闭包内存在
pub struct Transaction<'a> {
    disk: &'a mut VirtualDisk,
    writer: &'a mut dyn FilesystemWriter,
}

impl Transaction<'_> {
    /// 写入（创建或覆盖）一个文件；路径先规范化，缺失的上级目录自动创建。
    ///
    /// 最多写入 `size` 字节；源提前结束时文件只包含实际读到的内容。
    pub fn write_file<R: Read>(&mut self, path: &str, mut source: R, size: u64) -> Result<()> {
        let normalized = paths::resolve_file_path(path)?;
        self.writer
            .write_file(&mut *self.disk, &normalized, &mut source, size)
    }
}

/// 磁盘协调器
pub struct DiskCoordinator {
    inner: RwLock<Inner>,
}

impl DiskCoordinator {
    /// 打开已存在的镜像，再初始化设备链路；任何一步失败都会释放已获得的资源。
    pub fn new(config: &DiskConfig, mut link: Box<dyn DeviceLink>) -> Result<Self> {
        let mut disk = VirtualDisk::open(&config.path)?;
        if let Err(e) = link.initialize() {
            link.destroy();
            disk.close();
            return Err(e);
        }

        info!(
            "disk coordinator ready: image={}, writer={}, controller={}",
            config.path.display(),
            config.writer,
            link.controller().unwrap_or("-")
        );
        Ok(Self::from_parts(disk, new_filesystem_writer(config.writer), link))
    }

    /// 由现成的部件组装，不会再调用 `initialize`（链路按传入时的状态使用）
    pub fn from_parts(
        disk: VirtualDisk,
        writer: Box<dyn FilesystemWriter>,
        link: Box<dyn DeviceLink>,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner { disk, writer, link }),
        }
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在 gadget 断开期间执行 `body`，返回 `body` 的结果。
    ///
    /// - 断开失败：`body` 不会执行，也不会尝试重连，直接返回断开错误；
    /// - 否则无论 `body` 成功、失败还是 panic，都会结束写入批次并尝试重连；
    ///   重连失败只记录警告，不影响返回值。
    ///
    /// 一个事务内写多个文件时，每个文件独立提交：后面的文件失败（例如空间不足）
    /// 不会撤销前面已经写成功的文件。
    pub fn begin_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut inner = self.write_lock();
        if !inner.disk.is_open() {
            return Err(DiskError::NotInitialized);
        }

        let mut guard = QuiescedLink::engage(&mut *inner)?;
        guard.begin_burst()?;
        let result = body(&mut guard.transaction());
        let ended = guard.end_burst();
        drop(guard);

        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), ended) => {
                if let Err(end_err) = ended {
                    warn!("failed to finish disk writes after error: {}", end_err);
                }
                Err(e)
            }
        }
    }

    /// 读取整个文件（共享锁）
    pub fn read_file(&self, path: &str) -> Result<FileContents> {
        let inner = self.read_lock();
        if !inner.disk.is_open() {
            return Err(DiskError::NotInitialized);
        }
        let normalized = paths::resolve_file_path(path)?;
        inner.disk.read_file(&normalized)
    }

    /// 重新格式化镜像，丢弃全部内容；与事务一样在 gadget 断开期间进行
    pub fn clear_files(&self) -> Result<()> {
        let mut inner = self.write_lock();
        if !inner.disk.is_open() {
            return Err(DiskError::NotInitialized);
        }

        let mut guard = QuiescedLink::engage(&mut *inner)?;
        guard.disk_mut().reformat()?;
        info!("disk cleared");
        Ok(())
    }

    /// 拆除 gadget 并清空文件系统句柄；可重复调用
    pub fn close(&self) {
        let mut inner = self.write_lock();
        Self::close_inner(&mut inner);
    }

    fn close_inner(inner: &mut Inner) {
        if inner.link.state() != LinkState::Destroyed {
            inner.link.destroy();
        }
        if inner.disk.is_open() {
            inner.disk.close();
            debug!("disk closed: {}", inner.disk.image_path().display());
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.read_lock().disk.is_open()
    }

    pub fn link_state(&self) -> LinkState {
        self.read_lock().link.state()
    }

    pub fn image_path(&self) -> PathBuf {
        self.read_lock().disk.image_path().to_path_buf()
    }
}

impl Drop for DiskCoordinator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::close_inner(inner);
    }
}

impl std::fmt::Debug for DiskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read_lock();
        f.debug_struct("DiskCoordinator")
            .field("image_path", &inner.disk.image_path())
            .field("open", &inner.disk.is_open())
            .field("writer", &inner.writer.kind())
            .field("link", &inner.link.state())
            .finish()
    }
}
