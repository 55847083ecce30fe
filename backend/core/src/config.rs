//! 配置文件（JSON）。
//!
//! 缺失的键取默认值，未知的键忽略，因此旧版本的配置文件（含 `server`、`mdns` 等段）可以直接读取。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device_link::GadgetDescriptor;
use crate::disk::create_disk_image;
use crate::disk::writer::WriterKind;
use crate::error::{DiskError, Result};

pub const DEFAULT_DISK_PATH: &str = "/var/lib/embroidery-buddy/disk.img";
pub const DEVELOPMENT_DISK_PATH: &str = "/tmp/embroidery.img";

fn atomic_replace_file(tmp: &Path, dest: &Path) -> Result<()> {
    if !tmp.exists() {
        return Err(DiskError::Config(format!(
            "temporary file does not exist: {}",
            tmp.display()
        )));
    }
    fs::rename(tmp, dest).map_err(|e| DiskError::backend("failed to replace config file", e))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub size_mb: u64,
    /// 镜像不存在时自动创建
    pub auto_create: bool,
    pub writer: WriterKind,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DISK_PATH),
            size_mb: 100,
            auto_create: true,
            writer: WriterKind::Direct,
        }
    }
}

impl DiskConfig {
    /// 镜像缺失且允许自动创建时创建它；返回是否新建了镜像
    pub fn ensure_image(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        if !self.auto_create {
            return Err(DiskError::ImageMissing {
                path: self.path.clone(),
            });
        }
        info!(
            "disk image not found, creating {} ({}MB)",
            self.path.display(),
            self.size_mb
        );
        create_disk_image(&self.path, self.size_mb)?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    pub short_name: String,
    pub vendor_id: String,
    pub product_id: String,
    pub bcd_device: String,
    pub bcd_usb: String,
    pub product_name: String,
    pub manufacturer: String,
    /// 不填则取 WiFi 网卡 MAC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// 使用内存模拟链路（开发/测试环境）
    #[serde(alias = "use_noop")]
    pub simulated: bool,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            short_name: "embroidery".to_string(),
            vendor_id: "0x1d6b".to_string(),
            product_id: "0x0104".to_string(),
            bcd_device: "0x0100".to_string(),
            bcd_usb: "0x0200".to_string(),
            product_name: "Embroidery USB Storage".to_string(),
            manufacturer: "Embroidery Buddy".to_string(),
            serial_number: None,
            simulated: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub disk: DiskConfig,
    pub usb_gadget: GadgetConfig,
}

impl Config {
    /// 读取配置；文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| DiskError::backend("failed to read config file", e))?;
        serde_json::from_str(&content)
            .map_err(|e| DiskError::Config(format!("failed to parse config file: {}", e)))
    }

    /// 写入配置：先写临时文件再原子替换
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DiskError::backend("failed to create config directory", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DiskError::Config(format!("failed to serialize config: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| DiskError::backend("failed to write temp config file", e))?;
        atomic_replace_file(&tmp, path)
    }

    /// 开发环境：镜像放在 /tmp，使用模拟链路
    pub fn development() -> Self {
        let mut config = Self::default();
        config.disk.path = PathBuf::from(DEVELOPMENT_DISK_PATH);
        config.usb_gadget.simulated = true;
        config
    }

    /// 生成 gadget 描述；`serial` 在配置里没有指定序列号时使用
    pub fn gadget_descriptor(&self, serial: &str) -> Result<GadgetDescriptor> {
        let g = &self.usb_gadget;
        Ok(GadgetDescriptor {
            short_name: g.short_name.clone(),
            vendor_id: parse_hex(&g.vendor_id)?,
            product_id: parse_hex(&g.product_id)?,
            bcd_device: parse_hex(&g.bcd_device)?,
            bcd_usb: parse_hex(&g.bcd_usb)?,
            manufacturer: g.manufacturer.clone(),
            product: g.product_name.clone(),
            serial_number: g
                .serial_number
                .clone()
                .unwrap_or_else(|| serial.to_string()),
            backing_file: self.disk.path.clone(),
        })
    }
}

/// 解析 16 位十六进制标识（`0x1d6b`，前缀可省略）
pub fn parse_hex(s: &str) -> Result<u16> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map_err(|e| DiskError::Config(format!("invalid hex value {}: {}", s, e)))
}
