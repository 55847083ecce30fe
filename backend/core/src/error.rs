//! 统一错误类型。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 磁盘 / gadget / 事务相关的所有错误。
///
/// `InsufficientSpace` 与 `NotInitialized` 需要与普通失败区分开，上层可以据此提示用户。
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk not initialized")]
    NotInitialized,

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("disk full while writing {path}")]
    InsufficientSpace { path: String },

    #[error("invalid path: {path:?}")]
    InvalidPath { path: String },

    #[error("gadget {name} already configured")]
    LinkConflict { name: String },

    #[error("USB device controller unavailable: {reason}")]
    LinkUnavailable { reason: String },

    /// 写 configfs 属性失败
    #[error("failed to write gadget attribute {attr}: {source}")]
    ControlPort {
        attr: String,
        #[source]
        source: io::Error,
    },

    #[error("disk image {} doesn't exist", path.display())]
    ImageMissing { path: PathBuf },

    /// 文件系统后端的 I/O 失败
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = DiskError> = std::result::Result<T, E>;

impl DiskError {
    pub fn backend(context: impl Into<String>, source: io::Error) -> Self {
        DiskError::Backend {
            context: context.into(),
            source,
        }
    }

    /// 面向最终用户的提示语；只有用户能处理的错误才有。
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            DiskError::InsufficientSpace { .. } => {
                Some("Disk is full. Please clear some files and try again.")
            }
            DiskError::NotInitialized => Some("Disk not initialized. Please contact support."),
            _ => None,
        }
    }
}

/// 判断 I/O 错误是否为“空间不足”。
///
/// - 挂载方式：内核返回 ENOSPC
/// - fatfs：分配簇失败时返回带 "No space left" 文本的错误，部分路径表现为 0 字节写入
pub(crate) fn is_out_of_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    if err.kind() == io::ErrorKind::WriteZero {
        return true;
    }
    err.to_string().to_ascii_lowercase().contains("no space left")
}

/// 把后端 I/O 错误归类：空间不足单独映射，其余带上下文包装。
pub(crate) fn classify_io(path: &str, context: impl Into<String>, err: io::Error) -> DiskError {
    if is_out_of_space(&err) {
        DiskError::InsufficientSpace {
            path: path.to_string(),
        }
    } else {
        DiskError::backend(context, err)
    }
}
