//! 镜像内路径的规范化（纯字符串规则，不访问文件系统）。

use crate::error::{DiskError, Result};

/// 规范化路径：补前导 `/`，再按字面规则折叠 `.`、`..` 与重复分隔符。
///
/// 根目录之上的 `..` 被丢弃，因此结果总是不含穿越的绝对路径。
/// 对任意输入幂等：`normalize_path(&normalize_path(p)) == normalize_path(p)`。
pub fn normalize_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    let mut out = String::with_capacity(p.len() + 1);
    for seg in &parts {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// 规范化一个“文件”路径；空串、含 NUL、或折叠后只剩根目录的输入都会被拒绝。
pub fn resolve_file_path(p: &str) -> Result<String> {
    if p.trim().is_empty() || p.contains('\0') {
        return Err(DiskError::InvalidPath {
            path: p.to_string(),
        });
    }
    let normalized = normalize_path(p);
    if normalized == "/" {
        return Err(DiskError::InvalidPath {
            path: p.to_string(),
        });
    }
    Ok(normalized)
}

/// 已规范化路径的所有祖先目录（由浅到深，不含根目录）。
///
/// `/a/b/c.txt` -> `/a`, `/a/b`
pub fn parent_dirs(normalized: &str) -> impl Iterator<Item = &str> {
    normalized
        .match_indices('/')
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .map(move |i| &normalized[..i])
}

/// 去掉前导 `/`，得到相对镜像根目录的路径（fatfs 与挂载点拼接都用它）。
pub(crate) fn relative(normalized: &str) -> &str {
    normalized.trim_start_matches('/')
}
