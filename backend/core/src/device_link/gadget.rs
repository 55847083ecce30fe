//! 基于 configfs 的 USB mass storage gadget。

use tracing::{debug, info, warn};

use super::port::ControlPort;
use super::{hex_attr, DeviceLink, GadgetDescriptor, LinkState};
use crate::error::{DiskError, Result};

const LANG_DIR: &str = "strings/0x409";
const CONFIG_DIR: &str = "configs/c.1";
const CONFIG_STRINGS_DIR: &str = "configs/c.1/strings/0x409";
const FUNCTION_DIR: &str = "functions/mass_storage.usb0";
const FUNCTION_LINK: &str = "configs/c.1/mass_storage.usb0";

/// 真实 gadget：通过控制端口配置、连接和拆除。
pub struct GadgetLink<P: ControlPort> {
    descriptor: GadgetDescriptor,
    port: P,
    state: LinkState,
    /// 首次选定后不再变化
    controller: Option<String>,
    /// 本实例是否创建过 gadget 目录；决定 destroy 是否需要清理
    created: bool,
}

impl<P: ControlPort> GadgetLink<P> {
    pub fn new(descriptor: GadgetDescriptor, port: P) -> Self {
        Self {
            descriptor,
            port,
            state: LinkState::Uninitialized,
            controller: None,
            created: false,
        }
    }

    pub fn descriptor(&self) -> &GadgetDescriptor {
        &self.descriptor
    }

    fn rel(&self, sub: &str) -> String {
        format!("{}/{}", self.descriptor.short_name, sub)
    }

    fn mkdir(&self, sub: &str) -> Result<()> {
        let rel = self.rel(sub);
        self.port
            .create_dir(&rel)
            .map_err(|source| DiskError::ControlPort { attr: rel, source })
    }

    fn write(&self, sub: &str, value: &str) -> Result<()> {
        let rel = self.rel(sub);
        debug!("gadget attr {} = {:?}", rel, value);
        self.port
            .write_attr(&rel, value)
            .map_err(|source| DiskError::ControlPort { attr: rel, source })
    }

    /// 建立描述树：标识、字符串、配置、mass storage function 及其链接
    fn build_tree(&self) -> Result<()> {
        let d = &self.descriptor;

        self.write("idVendor", &hex_attr(d.vendor_id))?;
        self.write("idProduct", &hex_attr(d.product_id))?;
        self.write("bcdDevice", &hex_attr(d.bcd_device))?;
        self.write("bcdUSB", &hex_attr(d.bcd_usb))?;

        // 0x409 = English (US)
        self.mkdir(LANG_DIR)?;
        self.write(&format!("{}/serialnumber", LANG_DIR), &d.serial_number)?;
        self.write(&format!("{}/manufacturer", LANG_DIR), &d.manufacturer)?;
        self.write(&format!("{}/product", LANG_DIR), &d.product)?;

        self.mkdir(CONFIG_DIR)?;
        self.mkdir(CONFIG_STRINGS_DIR)?;
        self.write(
            &format!("{}/configuration", CONFIG_STRINGS_DIR),
            "Mass Storage",
        )?;
        self.write(&format!("{}/MaxPower", CONFIG_DIR), "250")?;

        self.mkdir(FUNCTION_DIR)?;
        self.write(&format!("{}/stall", FUNCTION_DIR), "1")?;
        self.write(&format!("{}/lun.0/cdrom", FUNCTION_DIR), "0")?;
        self.write(&format!("{}/lun.0/ro", FUNCTION_DIR), "0")?;
        self.write(&format!("{}/lun.0/nofua", FUNCTION_DIR), "0")?;
        self.write(
            &format!("{}/lun.0/file", FUNCTION_DIR),
            &d.backing_file.to_string_lossy(),
        )?;

        let target = self.rel(FUNCTION_DIR);
        let link = self.rel(FUNCTION_LINK);
        self.port
            .link(&target, &link)
            .map_err(|source| DiskError::ControlPort { attr: link, source })
    }

    fn pick_controller(&self) -> Result<String> {
        let names = self
            .port
            .list_controllers()
            .map_err(|e| DiskError::LinkUnavailable {
                reason: format!("failed to read UDC directory: {}", e),
            })?;
        names
            .into_iter()
            .next()
            .ok_or_else(|| DiskError::LinkUnavailable {
                reason: "no UDC available".to_string(),
            })
    }
}

impl<P: ControlPort> DeviceLink for GadgetLink<P> {
    fn initialize(&mut self) -> Result<()> {
        let name = self.descriptor.short_name.clone();
        if self.state != LinkState::Uninitialized {
            return Err(DiskError::LinkConflict { name });
        }
        if !self.port.is_available() {
            return Err(DiskError::LinkUnavailable {
                reason: "usb_gadget configfs is not available".to_string(),
            });
        }
        if self.port.exists(&name) {
            return Err(DiskError::LinkConflict { name });
        }

        self.port
            .create_dir(&name)
            .map_err(|source| DiskError::ControlPort {
                attr: name.clone(),
                source,
            })?;
        self.created = true;

        self.build_tree()?;

        let controller = self.pick_controller()?;
        info!("gadget {} bound to UDC {}", name, controller);
        self.controller = Some(controller);

        self.reconnect()
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.state != LinkState::Connected {
            return Ok(());
        }
        // 写空行清除 UDC 绑定，host 侧设备消失
        self.write("UDC", "\n")?;
        self.state = LinkState::Disconnected;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        if self.state == LinkState::Connected {
            return Ok(());
        }
        if self.state == LinkState::Destroyed {
            return Err(DiskError::NotInitialized);
        }
        let Some(controller) = self.controller.clone() else {
            return Err(DiskError::LinkUnavailable {
                reason: "no UDC name available, gadget may not have been initialized".to_string(),
            });
        };
        self.write("UDC", &controller)?;
        self.state = LinkState::Connected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    fn destroy(&mut self) {
        match self.state {
            LinkState::Destroyed => return,
            LinkState::Uninitialized if !self.created => return,
            _ => {}
        }

        let _ = self.disconnect();

        // 按创建的逆序删除；部分步骤可能因初始化未完成而不存在
        let steps: [(&str, bool); 6] = [
            (FUNCTION_LINK, true),
            (CONFIG_STRINGS_DIR, false),
            (CONFIG_DIR, false),
            (FUNCTION_DIR, false),
            (LANG_DIR, false),
            ("", false),
        ];
        for (sub, is_link) in steps {
            let rel = if sub.is_empty() {
                self.descriptor.short_name.clone()
            } else {
                self.rel(sub)
            };
            let res = if is_link {
                self.port.remove_link(&rel)
            } else {
                self.port.remove_dir(&rel)
            };
            if let Err(e) = res {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove gadget entry {}: {}", rel, e);
                }
            }
        }

        self.state = LinkState::Destroyed;
        info!("gadget {} destroyed", self.descriptor.short_name);
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }
}
