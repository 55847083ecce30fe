//! 文件写入方式（可替换）。
//!
//! - `direct`：通过 fatfs 直接改写镜像，不需要任何权限；
//! - `mounted`：把镜像 loop 挂载到临时目录后用普通文件 API 写入，大文件更快，但需要 root。
//!
//! 两种方式对外的效果一致：同样的写入序列得到同样的文件内容。

mod direct;
mod mounted;

use std::io::Read;

use serde::{Deserialize, Serialize};

use super::VirtualDisk;
use crate::error::Result;

pub use direct::DirectWriter;
pub use mounted::MountedWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    #[default]
    Direct,
    Mounted,
}

impl std::fmt::Display for WriterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterKind::Direct => f.write_str("direct"),
            WriterKind::Mounted => f.write_str("mounted"),
        }
    }
}

/// 写入方式 trait。
///
/// 一次事务内的调用顺序固定为 `begin`、若干 `write_file`、`end`；`end` 之后 `disk` 的句柄必须可用。
pub trait FilesystemWriter: Send + Sync {
    /// 开始一批写入
    fn begin(&mut self, disk: &mut VirtualDisk) -> Result<()>;

    /// 写入（创建或覆盖）一个文件，缺失的上级目录自动创建。
    ///
    /// `path` 需已规范化；最多复制 `expected_size` 字节，源提前结束时只写实际读到的部分。
    fn write_file(
        &mut self,
        disk: &mut VirtualDisk,
        path: &str,
        source: &mut dyn Read,
        expected_size: u64,
    ) -> Result<()>;

    /// 结束这一批写入，把改动落盘
    fn end(&mut self, disk: &mut VirtualDisk) -> Result<()>;

    fn kind(&self) -> WriterKind;
}

pub fn new_filesystem_writer(kind: WriterKind) -> Box<dyn FilesystemWriter> {
    match kind {
        WriterKind::Direct => Box::new(DirectWriter::new()),
        WriterKind::Mounted => Box::new(MountedWriter::new()),
    }
}
