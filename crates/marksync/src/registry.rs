//! 连接注册表
//!
//! 维护 "当前在线" 的设备集合：设备 ID 到出站消息发送端的映射，以及
//! 用户到设备集合的倒排索引。注册表是纯内存状态，不落盘，服务端重启
//! 后由各设备重新注册恢复。

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ServerMessage;
use crate::types::BrowserType;

/// 已注册设备的公开信息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: String,
    pub browser: BrowserType,
    pub device_name: Option<String>,
    pub registered_at: i64,
    pub last_seen_at: i64,
}

struct RegisteredDevice {
    info: DeviceInfo,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, RegisteredDevice>,
    user_devices: HashMap<String, HashSet<String>>,
}

/// 在线设备注册表
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册设备连接，返回该连接的出站通道接收端
    ///
    /// 同一设备重复注册（典型场景：断线重连）时旧通道被替换，挂在旧
    /// 通道上的发送会静默失败并在下一次广播时被清理。
    pub fn register(
        &self,
        device_id: &str,
        user_id: &str,
        browser: BrowserType,
        device_name: Option<String>,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.write();
        if inner.devices.contains_key(device_id) {
            debug!("设备重复注册，替换旧连接: device_id={}", device_id);
        }
        inner.devices.insert(
            device_id.to_string(),
            RegisteredDevice {
                info: DeviceInfo {
                    device_id: device_id.to_string(),
                    user_id: user_id.to_string(),
                    browser,
                    device_name,
                    registered_at: now,
                    last_seen_at: now,
                },
                sender: tx,
            },
        );
        inner
            .user_devices
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string());
        info!(
            "设备注册: device_id={}, user_id={}, browser={}",
            device_id, user_id, browser
        );
        rx
    }

    /// 刷新设备活跃时间（心跳或任何入站消息时调用）
    pub fn touch(&self, device_id: &str) {
        let mut inner = self.inner.write();
        if let Some(device) = inner.devices.get_mut(device_id) {
            device.info.last_seen_at = Utc::now().timestamp_millis();
        }
    }

    /// 注销设备连接
    pub fn disconnect(&self, device_id: &str) {
        let mut inner = self.inner.write();
        if let Some(device) = inner.devices.remove(device_id) {
            let user_id = device.info.user_id;
            if let Some(set) = inner.user_devices.get_mut(&user_id) {
                set.remove(device_id);
                if set.is_empty() {
                    inner.user_devices.remove(&user_id);
                }
            }
            info!("设备注销: device_id={}, user_id={}", device_id, user_id);
        }
    }

    /// 向指定设备投递消息，设备不在线返回 false
    pub fn send_to(&self, device_id: &str, message: ServerMessage) -> bool {
        let inner = self.inner.read();
        match inner.devices.get(device_id) {
            Some(device) => device.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// 向某用户的全部在线设备广播，可排除来源设备
    ///
    /// 返回成功投递的设备数。已断开但尚未注销的通道静默跳过。
    pub fn broadcast_to_user(
        &self,
        user_id: &str,
        exclude_device: Option<&str>,
        message: &ServerMessage,
    ) -> usize {
        let inner = self.inner.read();
        let Some(device_ids) = inner.user_devices.get(user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for device_id in device_ids {
            if Some(device_id.as_str()) == exclude_device {
                continue;
            }
            if let Some(device) = inner.devices.get(device_id) {
                if device.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    warn!("广播投递失败（通道已关闭）: device_id={}", device_id);
                }
            }
        }
        debug!(
            "广播完成: user_id={}, delivered={}, exclude={:?}",
            user_id, delivered, exclude_device
        );
        delivered
    }

    /// 某用户的在线设备列表
    pub fn devices_of(&self, user_id: &str) -> Vec<DeviceInfo> {
        let inner = self.inner.read();
        inner
            .user_devices
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.devices.get(id).map(|d| d.info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 在线设备总数
    pub fn online_count(&self) -> usize {
        self.inner.read().devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_broadcast_excludes_source() {
        let registry = ConnectionRegistry::new();
        let mut rx_a = registry.register("dev_a", "u1", BrowserType::Chrome, None);
        let mut rx_b = registry.register("dev_b", "u1", BrowserType::Firefox, None);

        let delivered = registry.broadcast_to_user("u1", Some("dev_a"), &ServerMessage::Pong);
        assert_eq!(delivered, 1);
        assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Pong)));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_isolated_between_users() {
        let registry = ConnectionRegistry::new();
        let mut rx_a = registry.register("dev_a", "u1", BrowserType::Chrome, None);
        let mut rx_c = registry.register("dev_c", "u2", BrowserType::Edge, None);

        registry.broadcast_to_user("u1", None, &ServerMessage::Pong);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reregister_replaces_old_channel() {
        let registry = ConnectionRegistry::new();
        let mut rx_old = registry.register("dev_a", "u1", BrowserType::Chrome, None);
        let mut rx_new = registry.register("dev_a", "u1", BrowserType::Chrome, None);

        assert!(registry.send_to("dev_a", ServerMessage::Pong));
        assert!(rx_new.try_recv().is_ok());
        // 旧通道的发送端已被丢弃
        assert!(matches!(
            rx_old.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_device_and_empty_user() {
        let registry = ConnectionRegistry::new();
        let _rx = registry.register("dev_a", "u1", BrowserType::Chrome, None);

        registry.disconnect("dev_a");
        assert_eq!(registry.online_count(), 0);
        assert!(!registry.send_to("dev_a", ServerMessage::Pong));
        assert_eq!(registry.broadcast_to_user("u1", None, &ServerMessage::Pong), 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_skipped_silently() {
        let registry = ConnectionRegistry::new();
        let rx_a = registry.register("dev_a", "u1", BrowserType::Chrome, None);
        let mut rx_b = registry.register("dev_b", "u1", BrowserType::Firefox, None);
        drop(rx_a);

        // dev_a 的接收端已掉线但尚未注销，广播不应被它拖垮
        let delivered = registry.broadcast_to_user("u1", None, &ServerMessage::Pong);
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }
}
