//! 系统信息：从 WiFi 网卡 MAC 生成 USB 序列号。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::{DiskError, Result};

pub const DEFAULT_NET_ROOT: &str = "/sys/class/net";
pub const FALLBACK_SERIAL: &str = "000000000000";

const COMMON_WIFI_NAMES: [&str; 4] = ["wlan0", "wlan1", "wlp2s0", "wlp3s0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacFormat {
    /// aa:bb:cc:dd:ee:ff
    #[default]
    Colon,
    /// aa-bb-cc-dd-ee-ff
    Hyphen,
    /// aabbccddeeff
    None,
    /// USB 序列号：12 个十六进制字符
    Usb,
}

impl FromStr for MacFormat {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "colon" => Ok(MacFormat::Colon),
            "hyphen" => Ok(MacFormat::Hyphen),
            "none" => Ok(MacFormat::None),
            "usb" => Ok(MacFormat::Usb),
            other => Err(DiskError::Config(format!(
                "invalid MAC format {} (use: colon, hyphen, none, usb)",
                other
            ))),
        }
    }
}

pub fn format_mac(mac: &str, format: MacFormat) -> String {
    let cleaned: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    match format {
        MacFormat::Hyphen => mac.replace(':', "-"),
        MacFormat::None | MacFormat::Usb => cleaned,
        MacFormat::Colon => {
            if cleaned.len() != 12 || !cleaned.is_ascii() {
                return mac.to_string();
            }
            (0..6)
                .map(|i| &cleaned[i * 2..i * 2 + 2])
                .collect::<Vec<_>>()
                .join(":")
        }
    }
}

/// 读取某个网卡的 MAC；没有硬件地址（如 lo）时返回 None
pub fn mac_address(net_root: &Path, iface: &str) -> Option<String> {
    let raw = fs::read_to_string(net_root.join(iface).join("address")).ok()?;
    let mac = raw.trim();
    if mac.is_empty() || mac.chars().all(|c| c == '0' || c == ':') {
        return None;
    }
    Some(mac.to_string())
}

/// 所有带硬件地址的网卡（按名称排序）
pub fn list_mac_addresses(net_root: &Path) -> Result<BTreeMap<String, String>> {
    let entries = fs::read_dir(net_root)
        .map_err(|e| DiskError::backend("failed to list network interfaces", e))?;
    let mut result = BTreeMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(mac) = mac_address(net_root, &name) {
            result.insert(name, mac);
        }
    }
    Ok(result)
}

/// 找到第一个 WiFi 网卡：先试常见名称，再找任意以 `wl` 开头的网卡
pub fn find_wifi_interface(net_root: &Path) -> Option<(String, String)> {
    for name in COMMON_WIFI_NAMES {
        if let Some(mac) = mac_address(net_root, name) {
            return Some((name.to_string(), mac));
        }
    }
    list_mac_addresses(net_root)
        .ok()?
        .into_iter()
        .find(|(name, _)| name.starts_with("wl"))
}

/// USB 序列号；找不到 WiFi 网卡时退回全零
pub fn usb_serial_number(net_root: &Path) -> String {
    match find_wifi_interface(net_root) {
        Some((_, mac)) => format_mac(&mac, MacFormat::Usb),
        None => {
            warn!(
                "no WiFi interface found, using fallback serial {}",
                FALLBACK_SERIAL
            );
            FALLBACK_SERIAL.to_string()
        }
    }
}
