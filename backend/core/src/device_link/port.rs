//! 设备控制端口：gadget 配置所需的最小“命名属性”操作集合。
//!
//! 路径均相对于 gadget 根目录（configfs 的 `usb_gadget/`）。

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const DEFAULT_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";
pub const DEFAULT_UDC_ROOT: &str = "/sys/class/udc";

/// 控制端口 trait
pub trait ControlPort: Send + Sync {
    /// 内核设施是否可用（configfs 已挂载、libcomposite 已加载）
    fn is_available(&self) -> bool;

    fn exists(&self, rel: &str) -> bool;

    /// 创建目录（含缺失的上级目录）
    fn create_dir(&self, rel: &str) -> io::Result<()>;

    fn write_attr(&self, rel: &str, value: &str) -> io::Result<()>;

    /// 在 `link` 处建立指向 `target` 的链接
    fn link(&self, target: &str, link: &str) -> io::Result<()>;

    fn remove_link(&self, rel: &str) -> io::Result<()>;

    /// 只删除空目录（configfs 语义：属性文件随目录一起消失）
    fn remove_dir(&self, rel: &str) -> io::Result<()>;

    /// 可用的 USB 设备控制器（UDC）名称，已排序
    fn list_controllers(&self) -> io::Result<Vec<String>>;
}

/// 真实的 configfs 端口
#[derive(Debug, Clone)]
pub struct ConfigFsPort {
    gadget_root: PathBuf,
    udc_root: PathBuf,
}

impl Default for ConfigFsPort {
    fn default() -> Self {
        Self {
            gadget_root: PathBuf::from(DEFAULT_GADGET_ROOT),
            udc_root: PathBuf::from(DEFAULT_UDC_ROOT),
        }
    }
}

impl ConfigFsPort {
    pub fn with_roots(gadget_root: impl Into<PathBuf>, udc_root: impl Into<PathBuf>) -> Self {
        Self {
            gadget_root: gadget_root.into(),
            udc_root: udc_root.into(),
        }
    }

    pub fn gadget_root(&self) -> &Path {
        &self.gadget_root
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.gadget_root.join(rel)
    }
}

impl ControlPort for ConfigFsPort {
    fn is_available(&self) -> bool {
        self.gadget_root.is_dir()
    }

    fn exists(&self, rel: &str) -> bool {
        fs::symlink_metadata(self.path(rel)).is_ok()
    }

    fn create_dir(&self, rel: &str) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o775);
        }
        builder.create(self.path(rel))
    }

    fn write_attr(&self, rel: &str, value: &str) -> io::Result<()> {
        fs::write(self.path(rel), value.as_bytes())
    }

    fn link(&self, target: &str, link: &str) -> io::Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(self.path(target), self.path(link))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "configfs links require a unix host",
            ))
        }
    }

    fn remove_link(&self, rel: &str) -> io::Result<()> {
        fs::remove_file(self.path(rel))
    }

    fn remove_dir(&self, rel: &str) -> io::Result<()> {
        fs::remove_dir(self.path(rel))
    }

    fn list_controllers(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.udc_root)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    available: bool,
    dirs: BTreeSet<String>,
    attrs: BTreeMap<String, String>,
    links: BTreeMap<String, String>,
    controllers: Vec<String>,
    failing: BTreeSet<String>,
    history: Vec<(String, String)>,
}

/// 内存中的假端口（测试用）。
///
/// clone 出来的句柄共享同一份状态，交给 [`super::GadgetLink`] 之后仍可检查属性与注入故障。
#[derive(Debug, Clone, Default)]
pub struct MemoryPort {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPort {
    /// 可用，且有一个控制器 `fe980000.usb`
    pub fn new() -> Self {
        Self::with_controllers(&["fe980000.usb"])
    }

    pub fn with_controllers(names: &[&str]) -> Self {
        let port = Self::default();
        {
            let mut st = port.lock();
            st.available = true;
            st.controllers = names.iter().map(|s| s.to_string()).collect();
            st.controllers.sort();
        }
        port
    }

    /// 模拟 configfs 未挂载
    pub fn unavailable() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attr(&self, rel: &str) -> Option<String> {
        self.lock().attrs.get(rel).cloned()
    }

    pub fn has_dir(&self, rel: &str) -> bool {
        self.lock().dirs.contains(rel)
    }

    pub fn link_target(&self, rel: &str) -> Option<String> {
        self.lock().links.get(rel).cloned()
    }

    /// 没有任何目录、属性和链接
    pub fn is_empty(&self) -> bool {
        let st = self.lock();
        st.dirs.is_empty() && st.attrs.is_empty() && st.links.is_empty()
    }

    /// 之后对该属性的写入全部失败
    pub fn fail_writes_to(&self, rel: &str) {
        self.lock().failing.insert(rel.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// 某属性被写入过的所有值（按时间顺序）
    pub fn writes_to(&self, rel: &str) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .filter(|(k, _)| k == rel)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

fn under(parent: &str, child: &str) -> bool {
    child.len() > parent.len() && child.starts_with(parent) && child[parent.len()..].starts_with('/')
}

impl ControlPort for MemoryPort {
    fn is_available(&self) -> bool {
        self.lock().available
    }

    fn exists(&self, rel: &str) -> bool {
        let st = self.lock();
        st.dirs.contains(rel) || st.attrs.contains_key(rel) || st.links.contains_key(rel)
    }

    fn create_dir(&self, rel: &str) -> io::Result<()> {
        let mut st = self.lock();
        if !st.available {
            return Err(io::Error::new(io::ErrorKind::NotFound, "configfs not mounted"));
        }
        st.dirs.insert(rel.to_string());
        Ok(())
    }

    fn write_attr(&self, rel: &str, value: &str) -> io::Result<()> {
        let mut st = self.lock();
        if st.failing.contains(rel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure writing {}", rel),
            ));
        }
        st.attrs.insert(rel.to_string(), value.to_string());
        st.history.push((rel.to_string(), value.to_string()));
        Ok(())
    }

    fn link(&self, target: &str, link: &str) -> io::Result<()> {
        let mut st = self.lock();
        if st.links.contains_key(link) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, link.to_string()));
        }
        st.links.insert(link.to_string(), target.to_string());
        Ok(())
    }

    fn remove_link(&self, rel: &str) -> io::Result<()> {
        match self.lock().links.remove(rel) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, rel.to_string())),
        }
    }

    fn remove_dir(&self, rel: &str) -> io::Result<()> {
        let mut st = self.lock();
        if !st.dirs.contains(rel) {
            return Err(io::Error::new(io::ErrorKind::NotFound, rel.to_string()));
        }
        let busy = st.dirs.iter().any(|d| under(rel, d)) || st.links.keys().any(|l| under(rel, l));
        if busy {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("directory not empty: {}", rel),
            ));
        }
        st.dirs.remove(rel);
        st.attrs.retain(|k, _| !under(rel, k));
        Ok(())
    }

    fn list_controllers(&self) -> io::Result<Vec<String>> {
        let st = self.lock();
        if !st.available {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no udc class"));
        }
        Ok(st.controllers.clone())
    }
}
