//! 没有 gadget 硬件时的内存实现：契约与真实实现一致，但不产生任何外部副作用。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::{DeviceLink, GadgetDescriptor, LinkState};
use crate::error::{DiskError, Result};

const SIMULATED_CONTROLLER: &str = "simulated.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    Disconnect,
    Reconnect,
}

/// 一次 disconnect/reconnect 调用的记录
#[derive(Debug, Clone, Copy)]
pub struct LinkEvent {
    pub kind: LinkEventKind,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    state: LinkState,
    controller: Option<String>,
    disconnect_calls: usize,
    reconnect_calls: usize,
    events: Vec<LinkEvent>,
    fail_next_disconnect: bool,
    fail_reconnect: bool,
}

fn lock(shared: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 模拟链路
#[derive(Debug, Default)]
pub struct SimulatedLink {
    descriptor: Option<GadgetDescriptor>,
    shared: Arc<Mutex<SimState>>,
}

/// 模拟链路的观测句柄：交出 `SimulatedLink` 所有权后仍能读计数、注入故障。
#[derive(Debug, Clone)]
pub struct LinkProbe {
    shared: Arc<Mutex<SimState>>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带描述的模拟链路（由配置生成时使用）
    pub fn with_descriptor(descriptor: GadgetDescriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            ..Self::default()
        }
    }

    pub fn descriptor(&self) -> Option<&GadgetDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn probe(&self) -> LinkProbe {
        LinkProbe {
            shared: self.shared.clone(),
        }
    }
}

impl LinkProbe {
    pub fn disconnect_calls(&self) -> usize {
        lock(&self.shared).disconnect_calls
    }

    pub fn reconnect_calls(&self) -> usize {
        lock(&self.shared).reconnect_calls
    }

    pub fn reset_counts(&self) {
        let mut st = lock(&self.shared);
        st.disconnect_calls = 0;
        st.reconnect_calls = 0;
        st.events.clear();
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.shared).events.clone()
    }

    pub fn state(&self) -> LinkState {
        lock(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).state == LinkState::Connected
    }

    /// 下一次 disconnect 失败（只生效一次）
    pub fn fail_next_disconnect(&self) {
        lock(&self.shared).fail_next_disconnect = true;
    }

    /// 之后的 reconnect 全部失败，直到再次调用并传入 false
    pub fn set_fail_reconnect(&self, fail: bool) {
        lock(&self.shared).fail_reconnect = fail;
    }
}

impl DeviceLink for SimulatedLink {
    fn initialize(&mut self) -> Result<()> {
        let mut st = lock(&self.shared);
        if st.state != LinkState::Uninitialized {
            return Err(DiskError::LinkConflict {
                name: SIMULATED_CONTROLLER.to_string(),
            });
        }
        st.controller = Some(SIMULATED_CONTROLLER.to_string());
        st.state = LinkState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut st = lock(&self.shared);
        st.disconnect_calls += 1;
        st.events.push(LinkEvent {
            kind: LinkEventKind::Disconnect,
            at: Instant::now(),
        });
        if std::mem::take(&mut st.fail_next_disconnect) {
            return Err(DiskError::LinkUnavailable {
                reason: "simulated disconnect failure".to_string(),
            });
        }
        if st.state == LinkState::Connected {
            st.state = LinkState::Disconnected;
        }
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        let mut st = lock(&self.shared);
        st.reconnect_calls += 1;
        st.events.push(LinkEvent {
            kind: LinkEventKind::Reconnect,
            at: Instant::now(),
        });
        match st.state {
            LinkState::Connected => return Ok(()),
            LinkState::Destroyed => return Err(DiskError::NotInitialized),
            _ => {}
        }
        if st.controller.is_none() {
            return Err(DiskError::LinkUnavailable {
                reason: "no controller binding, link was never initialized".to_string(),
            });
        }
        if st.fail_reconnect {
            return Err(DiskError::LinkUnavailable {
                reason: "simulated reconnect failure".to_string(),
            });
        }
        st.state = LinkState::Connected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared).state == LinkState::Connected
    }

    fn destroy(&mut self) {
        match self.state() {
            LinkState::Uninitialized | LinkState::Destroyed => return,
            LinkState::Connected => {
                let _ = self.disconnect();
            }
            LinkState::Disconnected => {}
        }
        lock(&self.shared).state = LinkState::Destroyed;
    }

    fn state(&self) -> LinkState {
        lock(&self.shared).state
    }

    fn controller(&self) -> Option<&str> {
        // 初始化后固定不变
        if lock(&self.shared).controller.is_some() {
            Some(SIMULATED_CONTROLLER)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_operations() {
        let mut link = SimulatedLink::new();
        let probe = link.probe();
        link.initialize().unwrap();
        assert!(link.is_connected());

        for _ in 0..3 {
            link.disconnect().unwrap();
            assert!(!link.is_connected());
        }
        for _ in 0..3 {
            link.reconnect().unwrap();
            assert!(link.is_connected());
        }
        assert_eq!(probe.disconnect_calls(), 3);
        assert_eq!(probe.reconnect_calls(), 3);

        probe.reset_counts();
        assert_eq!(probe.disconnect_calls(), 0);
        assert!(probe.events().is_empty());
    }

    #[test]
    fn test_reconnect_before_initialize_fails() {
        let mut link = SimulatedLink::new();
        assert!(link.reconnect().is_err());
        assert_eq!(link.controller(), None);
    }

    #[test]
    fn test_fault_injection() {
        let mut link = SimulatedLink::new();
        let probe = link.probe();
        link.initialize().unwrap();

        probe.fail_next_disconnect();
        assert!(link.disconnect().is_err());
        assert!(link.is_connected());
        link.disconnect().unwrap();

        probe.set_fail_reconnect(true);
        assert!(link.reconnect().is_err());
        assert_eq!(probe.state(), LinkState::Disconnected);
        probe.set_fail_reconnect(false);
        link.reconnect().unwrap();
        assert_eq!(link.controller(), Some("simulated.0"));
    }

    #[test]
    fn test_destroy_disconnects_first() {
        let mut link = SimulatedLink::new();
        let probe = link.probe();
        link.initialize().unwrap();

        link.destroy();
        let kinds: Vec<LinkEventKind> = probe.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![LinkEventKind::Disconnect]);
        assert_eq!(probe.state(), LinkState::Destroyed);

        // 断开失败也照样拆除
        let mut link = SimulatedLink::new();
        let probe = link.probe();
        link.initialize().unwrap();
        probe.fail_next_disconnect();
        link.destroy();
        assert_eq!(probe.disconnect_calls(), 1);
        assert_eq!(probe.state(), LinkState::Destroyed);

        // 已断开时不再重复断开
        let mut link = SimulatedLink::new();
        let probe = link.probe();
        link.initialize().unwrap();
        link.disconnect().unwrap();
        link.destroy();
        assert_eq!(probe.disconnect_calls(), 1);
    }

    #[test]
    fn test_with_descriptor() {
        let descriptor = GadgetDescriptor {
            short_name: "embroidery".to_string(),
            vendor_id: 0x1d6b,
            product_id: 0x0104,
            bcd_device: 0x0100,
            bcd_usb: 0x0200,
            manufacturer: "Embroidery Buddy".to_string(),
            product: "Embroidery USB Storage".to_string(),
            serial_number: "b827eb123456".to_string(),
            backing_file: std::path::PathBuf::from("/tmp/embroidery.img"),
        };
        let link = SimulatedLink::with_descriptor(descriptor.clone());
        assert_eq!(link.descriptor(), Some(&descriptor));
        assert_eq!(link.state(), LinkState::Uninitialized);
        assert!(SimulatedLink::new().descriptor().is_none());
    }

    #[test]
    fn test_destroy() {
        let mut link = SimulatedLink::new();
        link.destroy();
        assert_eq!(link.state(), LinkState::Uninitialized);

        link.initialize().unwrap();
        link.destroy();
        link.destroy();
        assert_eq!(link.state(), LinkState::Destroyed);
        assert!(!link.is_connected());
        assert!(link.reconnect().is_err());
    }
}
