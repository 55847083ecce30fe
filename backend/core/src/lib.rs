//! Embroidery Buddy 后端核心库入口（供 daemon 与维护命令复用）。
//!
//! 一个可写的磁盘镜像同时被两方使用：
//! - USB host 通过 gadget（mass storage）把它当作 U 盘读取；
//! - 本进程在 gadget 断开期间修改其中的文件。
//!
//! 所有修改都必须走 [`DiskCoordinator::begin_transaction`]，保证 host 不会看到写了一半的文件系统。

pub mod config;
pub mod coordinator;
pub mod device_link;
pub mod disk;
pub mod error;
pub mod paths;
pub mod system;

pub use config::{Config, DiskConfig, GadgetConfig};
pub use coordinator::{DiskCoordinator, Transaction};
pub use device_link::{new_device_link, DeviceLink, GadgetDescriptor, LinkState};
pub use disk::writer::{new_filesystem_writer, FilesystemWriter, WriterKind};
pub use disk::{create_disk_image, FileContents, VirtualDisk};
pub use error::{DiskError, Result};
