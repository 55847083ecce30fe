//! USB gadget（设备链路）模块。
//!
//! - `gadget`：基于 configfs 的真实实现，通过 [`ControlPort`] 写属性文件；
//! - `simulated`：纯内存实现，没有外部副作用，供开发环境与测试使用。
//!
//! 具体用哪个由配置决定（[`new_device_link`]），而不是编译目标。

mod gadget;
mod port;
mod simulated;

use std::path::PathBuf;

use crate::error::Result;

pub use gadget::GadgetLink;
pub use port::{ConfigFsPort, ControlPort, MemoryPort};
pub use simulated::{LinkEvent, LinkEventKind, LinkProbe, SimulatedLink};

/// 链路状态。
///
/// `Uninitialized -> Connected <-> Disconnected`，任意状态 `-> Destroyed`（终态）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Uninitialized,
    Connected,
    Disconnected,
    Destroyed,
}

/// gadget 描述信息（不可变值对象），写入 configfs 后由 host 枚举时读取。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GadgetDescriptor {
    /// configfs 下的目录名
    pub short_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub bcd_usb: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// mass storage LUN 指向的镜像文件
    pub backing_file: PathBuf,
}

/// 16 位标识的属性文本：`0x%04x`
pub fn hex_attr(value: u16) -> String {
    format!("0x{:04x}", value)
}

/// 设备链路 trait（所有实现必须满足的契约）。
///
/// 以 `Box<dyn DeviceLink>` 的形式交给 [`crate::DiskCoordinator`] 独占持有。
pub trait DeviceLink: Send + Sync {
    /// 建立完整的 gadget 描述树、选定控制器并首次连接。
    ///
    /// 同名 gadget 已存在时返回 `LinkConflict`；内核设施不可用时返回 `LinkUnavailable`。
    fn initialize(&mut self) -> Result<()>;

    /// 断开与 host 的连接（保留配置）。已断开时直接成功。
    fn disconnect(&mut self) -> Result<()>;

    /// 重新连接。已连接时直接成功；从未绑定过控制器时报错。
    fn reconnect(&mut self) -> Result<()>;

    /// 是否对 host 可见
    fn is_connected(&self) -> bool;

    /// 尽力拆除 initialize 建立的一切；幂等，错误全部忽略。
    fn destroy(&mut self);

    /// 当前状态
    fn state(&self) -> LinkState;

    /// 已绑定的控制器名（首次成功连接后不再变化）
    fn controller(&self) -> Option<&str>;
}

/// 按配置选择实现：`simulated = true` 时返回内存实现，否则返回 configfs 实现。
pub fn new_device_link(descriptor: GadgetDescriptor, simulated: bool) -> Box<dyn DeviceLink> {
    if simulated {
        Box::new(SimulatedLink::with_descriptor(descriptor))
    } else {
        Box::new(GadgetLink::new(descriptor, ConfigFsPort::default()))
    }
}
