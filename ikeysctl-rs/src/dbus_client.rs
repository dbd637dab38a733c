/* ikeysctl DBus client: low-level helper for calling the org.freedesktop.intellikeys1 API,
 * wrapping property access and method calls for the manager and devices. */
//! Low-level DBus client for `org.freedesktop.intellikeys1`.
//!
//! All communication with the daemon goes through this module.

use anyhow::{Context, Result, anyhow};
use zbus::Connection;
use zbus::zvariant::{OwnedValue, Value};

const BUS_NAME: &str = "org.freedesktop.intellikeys1";
const MANAGER_PATH: &str = "/org/freedesktop/intellikeys1";
const MANAGER_IFACE: &str = "org.freedesktop.intellikeys1.Manager";
const DEVICE_IFACE: &str = "org.freedesktop.intellikeys1.Device";

/// A client that talks to the `ikeysd` daemon over the system DBus.
pub struct IkeysClient {
    conn: Connection,
}

impl IkeysClient {
    /// Connect to the system bus.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .context("Cannot connect to the system DBus")?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------------
    // Manager
    // -----------------------------------------------------------------------

    /// Get the DBus API version from the Manager.
    pub async fn get_api_version(&self) -> Result<i32> {
        self.get_i32_property(MANAGER_PATH, MANAGER_IFACE, "APIVersion").await
    }

    /// Get the list of device object paths from the Manager.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let val = self.get_property(MANAGER_PATH, MANAGER_IFACE, "Devices").await?;
        extract_object_path_array(val).context("Failed to parse Devices property")
    }

    /// Resolve a device specifier (numeric index or sysname substring) to a
    /// full object path.
    pub async fn resolve_device(&self, spec: &str) -> Result<String> {
        let devices = self.list_devices().await?;
        pick_device(&devices, spec)
    }

    // -----------------------------------------------------------------------
    // Device
    // -----------------------------------------------------------------------

    pub async fn get_device_name(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "Name").await
    }

    pub async fn get_device_model(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "Model").await
    }

    pub async fn get_device_firmware(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "FirmwareVersion").await
    }

    pub async fn get_serial_number(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "SerialNumber").await
    }

    pub async fn get_calibration_valid(&self, path: &str) -> Result<bool> {
        self.get_bool_property(path, DEVICE_IFACE, "CalibrationValid").await
    }

    pub async fn get_intelliswitch(&self, path: &str) -> Result<bool> {
        self.get_bool_property(path, DEVICE_IFACE, "IntelliSwitch").await
    }

    pub async fn get_current_overlay(&self, path: &str) -> Result<i32> {
        self.get_i32_property(path, DEVICE_IFACE, "CurrentOverlay").await
    }

    pub async fn get_overlay_name(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "OverlayName").await
    }

    pub async fn get_switched_on(&self, path: &str) -> Result<bool> {
        self.get_bool_property(path, DEVICE_IFACE, "SwitchedOn").await
    }

    pub async fn get_modifier_states(&self, path: &str) -> Result<Vec<(String, String)>> {
        let val = self.get_property(path, DEVICE_IFACE, "ModifierStates").await?;
        extract_string_pairs(val).context("Failed to parse ModifierStates property")
    }

    pub async fn get_shift_key_action(&self, path: &str) -> Result<String> {
        self.get_string_property(path, DEVICE_IFACE, "ShiftKeyAction").await
    }

    pub async fn set_shift_key_action(&self, path: &str, action: &str) -> Result<()> {
        self.set_property(path, DEVICE_IFACE, "ShiftKeyAction", Value::from(action))
            .await
    }

    pub async fn get_indicator_lights(&self, path: &str) -> Result<u32> {
        self.get_u32_property(path, DEVICE_IFACE, "IndicatorLights").await
    }

    pub async fn set_indicator_lights(&self, path: &str, count: u32) -> Result<()> {
        self.set_property(path, DEVICE_IFACE, "IndicatorLights", Value::from(count))
            .await
    }

    /// Queue a raw command frame. Returns whether the daemon accepted it.
    pub async fn post_command(&self, path: &str, bytes: &[u8]) -> Result<bool> {
        let reply = self
            .conn
            .call_method(
                Some(BUS_NAME),
                path,
                Some(DEVICE_IFACE),
                "PostCommand",
                &(bytes.to_vec(),),
            )
            .await
            .context("PostCommand call failed")?;
        let accepted: bool = reply.body().deserialize()?;
        Ok(accepted)
    }

    // -----------------------------------------------------------------------
    // Generic helpers
    // -----------------------------------------------------------------------

    async fn get_property(&self, path: &str, iface: &str, prop: &str) -> Result<OwnedValue> {
        let reply = self
            .conn
            .call_method(
                Some(BUS_NAME),
                path,
                Some("org.freedesktop.DBus.Properties"),
                "Get",
                &(iface, prop),
            )
            .await
            .with_context(|| format!("Get {}.{} at {} failed", iface, prop, path))?;
        let val: OwnedValue = reply.body().deserialize()?;
        Ok(val)
    }

    async fn set_property(&self, path: &str, iface: &str, prop: &str, value: Value<'_>) -> Result<()> {
        self.conn
            .call_method(
                Some(BUS_NAME),
                path,
                Some("org.freedesktop.DBus.Properties"),
                "Set",
                &(iface, prop, value),
            )
            .await
            .with_context(|| format!("Set {}.{} at {} failed", iface, prop, path))?;
        Ok(())
    }

    async fn get_string_property(&self, path: &str, iface: &str, prop: &str) -> Result<String> {
        let val = self.get_property(path, iface, prop).await?;
        val.downcast_ref::<String>()
            .with_context(|| format!("Type mismatch for {}.{} at {}", iface, prop, path))
    }

    async fn get_u32_property(&self, path: &str, iface: &str, prop: &str) -> Result<u32> {
        let val = self.get_property(path, iface, prop).await?;
        val.downcast_ref::<u32>()
            .with_context(|| format!("Type mismatch for {}.{} at {}", iface, prop, path))
    }

    async fn get_i32_property(&self, path: &str, iface: &str, prop: &str) -> Result<i32> {
        let val = self.get_property(path, iface, prop).await?;
        val.downcast_ref::<i32>()
            .with_context(|| format!("Type mismatch for {}.{} at {}", iface, prop, path))
    }

    async fn get_bool_property(&self, path: &str, iface: &str, prop: &str) -> Result<bool> {
        let val = self.get_property(path, iface, prop).await?;
        val.downcast_ref::<bool>()
            .with_context(|| format!("Type mismatch for {}.{} at {}", iface, prop, path))
    }
}

// ---------------------------------------------------------------------------
// Free-standing helpers
// ---------------------------------------------------------------------------

/// Pick a device path by index or by sysname substring.
pub fn pick_device(devices: &[String], spec: &str) -> Result<String> {
    anyhow::ensure!(!devices.is_empty(), "No devices found");

    // Try numeric index first.
    if let Ok(idx) = spec.parse::<usize>() {
        return devices
            .get(idx)
            .cloned()
            .with_context(|| format!("Device index {} out of range (0..{})", idx, devices.len()));
    }

    // Otherwise match against the path suffix (sysname).
    devices
        .iter()
        .find(|path| path.ends_with(spec) || path.contains(spec))
        .cloned()
        .with_context(|| format!("No device matching '{}' found", spec))
}

/// Extract a `Vec<String>` of object-path strings from an `OwnedValue`
/// that wraps an array of object-paths.
fn extract_object_path_array(val: OwnedValue) -> Result<Vec<String>> {
    let inner: Value<'_> = val.into();
    match inner {
        Value::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for item in arr.iter() {
                match item {
                    Value::ObjectPath(p) => out.push(p.to_string()),
                    _ => return Err(anyhow!("Array contains non-object-path value")),
                }
            }
            Ok(out)
        }
        _ => Err(anyhow!("Value is not an array of object paths")),
    }
}

/// Extract the `a(ss)` pairs of the ModifierStates property.
fn extract_string_pairs(val: OwnedValue) -> Result<Vec<(String, String)>> {
    let inner: Value<'_> = val.into();
    let Value::Array(arr) = inner else {
        return Err(anyhow!("Value is not an array of string pairs"));
    };

    let mut out = Vec::with_capacity(arr.len());
    for item in arr.iter() {
        let Value::Structure(pair) = item else {
            return Err(anyhow!("Array contains non-struct value"));
        };
        match pair.fields() {
            [Value::Str(key), Value::Str(state)] => out.push((key.to_string(), state.to_string())),
            _ => return Err(anyhow!("Struct is not a string pair")),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<String> {
        vec![
            "/org/freedesktop/intellikeys1/device/hidraw2".to_string(),
            "/org/freedesktop/intellikeys1/device/hidraw5".to_string(),
        ]
    }

    #[test]
    fn pick_by_index_and_name() {
        assert_eq!(pick_device(&paths(), "1").unwrap(), paths()[1]);
        assert_eq!(pick_device(&paths(), "hidraw2").unwrap(), paths()[0]);
        assert!(pick_device(&paths(), "7").is_err());
        assert!(pick_device(&paths(), "hidraw9").is_err());
        assert!(pick_device(&[], "0").is_err());
    }
}
