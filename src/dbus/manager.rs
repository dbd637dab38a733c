use std::sync::Arc;

use tokio::sync::RwLock;
use zbus::interface;

/* DBus API version, bumped on incompatible interface changes. */
pub const API_VERSION: i32 = 1;

/* The org.freedesktop.intellikeys1.Manager interface.
 *
 * Entry point for clients (ikeysctl) to discover connected devices. */
pub struct IntelliKeysManager {
    devices: Arc<RwLock<Vec<String>>>,
}

impl Default for IntelliKeysManager {
    fn default() -> Self {
        Self {
            devices: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl IntelliKeysManager {
    /* Register a new device path (called when a device actor is up). */
    pub async fn add_device(&self, path: String) {
        let mut devices = self.devices.write().await;
        if !devices.contains(&path) {
            devices.push(path);
        }
    }

    pub async fn device_paths(&self) -> Vec<String> {
        self.devices.read().await.clone()
    }

    /* Remove a device path (called when udev detects removal). */
    pub async fn remove_device(&self, path: &str) {
        self.devices.write().await.retain(|p| p != path);
    }
}

#[interface(name = "org.freedesktop.intellikeys1.Manager")]
impl IntelliKeysManager {
    /* The DBus API version (constant, read-only). */
    #[zbus(property)]
    async fn api_version(&self) -> i32 {
        API_VERSION
    }

    /* Array of object paths to the connected devices. */
    #[zbus(property)]
    async fn devices(&self) -> Vec<zbus::zvariant::ObjectPath<'static>> {
        self.devices
            .read()
            .await
            .iter()
            .filter_map(|p| zbus::zvariant::ObjectPath::try_from(p.as_str()).ok())
            .map(|p| p.to_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn device_list_tracks_add_and_remove() {
        let manager = IntelliKeysManager::default();
        manager
            .add_device("/org/freedesktop/intellikeys1/device/hidraw0".to_string())
            .await;
        manager
            .add_device("/org/freedesktop/intellikeys1/device/hidraw0".to_string())
            .await;
        manager
            .add_device("/org/freedesktop/intellikeys1/device/hidraw1".to_string())
            .await;
        assert_eq!(manager.device_paths().await.len(), 2);

        manager
            .remove_device("/org/freedesktop/intellikeys1/device/hidraw0")
            .await;
        assert_eq!(
            manager.device_paths().await,
            vec!["/org/freedesktop/intellikeys1/device/hidraw1".to_string()]
        );
        assert_eq!(manager.devices().await.len(), 1);
    }
}
