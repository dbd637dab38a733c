use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::actor::ActorHandle;
use crate::device::DeviceInfo;
use crate::modifier::ShiftKeyAction;
use crate::protocol::{Frame, REPORT_LEN};
use crate::settings::{IndicatorLights, SettingsStore};

/* The org.freedesktop.intellikeys1.Device interface.
 *
 * One object per attached IntelliKeys. Properties mirror the actor's last
 * published `DeviceInfo`; ShiftKeyAction and IndicatorLights write through
 * to the shared settings store, which every actor watches. */
pub struct IntelliKeysDevice {
    info: Arc<RwLock<DeviceInfo>>,
    settings: Arc<SettingsStore>,
    actor: ActorHandle,
}

impl IntelliKeysDevice {
    pub fn new(info: Arc<RwLock<DeviceInfo>>, settings: Arc<SettingsStore>, actor: ActorHandle) -> Self {
        Self {
            info,
            settings,
            actor,
        }
    }
}

#[interface(name = "org.freedesktop.intellikeys1.Device")]
impl IntelliKeysDevice {
    /* Product name reported by the device (constant). */
    #[zbus(property)]
    async fn name(&self) -> String {
        self.info.read().await.name.clone()
    }

    /* "bus:vid:pid:version" model identifier (constant). */
    #[zbus(property)]
    async fn model(&self) -> String {
        self.info.read().await.model.clone()
    }

    /* "major.minor", empty until the device answered GET_VERSION. */
    #[zbus(property)]
    async fn firmware_version(&self) -> String {
        self.info.read().await.firmware_version.clone()
    }

    #[zbus(property)]
    async fn serial_number(&self) -> String {
        self.info.read().await.serial_number.clone()
    }

    #[zbus(property)]
    async fn calibration_valid(&self) -> bool {
        self.info.read().await.calibration_valid
    }

    #[zbus(property, name = "IntelliSwitch")]
    async fn intelliswitch(&self) -> bool {
        self.info.read().await.intelliswitch
    }

    /* Committed standard overlay number, -1 when none is recognized. */
    #[zbus(property)]
    async fn current_overlay(&self) -> i32 {
        self.info
            .read()
            .await
            .current_overlay
            .map_or(-1, i32::from)
    }

    /* Name of the overlay key presses are translated with. */
    #[zbus(property)]
    async fn overlay_name(&self) -> String {
        self.info.read().await.overlay_name.clone()
    }

    #[zbus(property)]
    async fn switched_on(&self) -> bool {
        self.info.read().await.switched_on
    }

    /* (modifier, state) pairs, e.g. ("shift", "latched"). */
    #[zbus(property)]
    async fn modifier_states(&self) -> Vec<(String, String)> {
        self.info.read().await.modifier_states.clone()
    }

    /* "latching", "locking" or "nolatch" (read-write). */
    #[zbus(property)]
    async fn shift_key_action(&self) -> String {
        self.settings.get().shift_key_action.to_string()
    }

    #[zbus(property)]
    async fn set_shift_key_action(&self, action: String) -> zbus::fdo::Result<()> {
        let action: ShiftKeyAction = action.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.settings
            .update(|s| s.shift_key_action = action)
            .map_err(|e| zbus::fdo::Error::Failed(format!("{e:#}")))?;
        info!("ShiftKeyAction set to {}", action);
        Ok(())
    }

    /* 3 or 6 (read-write). */
    #[zbus(property)]
    async fn indicator_lights(&self) -> u32 {
        self.settings.get().indicator_lights.count()
    }

    #[zbus(property)]
    async fn set_indicator_lights(&self, count: u32) -> zbus::fdo::Result<()> {
        let lights = IndicatorLights::from_count(count).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs(format!("indicator lights must be 3 or 6, got {count}"))
        })?;
        self.settings
            .update(|s| s.indicator_lights = lights)
            .map_err(|e| zbus::fdo::Error::Failed(format!("{e:#}")))?;
        info!("IndicatorLights set to {}", count);
        Ok(())
    }

    /* Queue a raw command frame (up to 8 bytes, zero padded). Returns false
     * if the queue rejected it. */
    async fn post_command(&self, bytes: Vec<u8>) -> zbus::fdo::Result<bool> {
        if bytes.is_empty() || bytes.len() > REPORT_LEN {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "command must be 1 to {REPORT_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let frame = Frame::new(bytes[0], &bytes[1..]);
        match self.actor.post_command(frame) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("PostCommand rejected: {}", e);
                Ok(false)
            }
        }
    }

    /* A membrane cell changed; row and column are 0-based. */
    #[zbus(signal)]
    pub async fn membrane_changed(
        emitter: &SignalEmitter<'_>,
        row: u32,
        col: u32,
        pressed: bool,
    ) -> zbus::Result<()>;

    /* A switch jack changed; `number` is 1-based. */
    #[zbus(signal)]
    pub async fn switch_changed(
        emitter: &SignalEmitter<'_>,
        number: u32,
        pressed: bool,
    ) -> zbus::Result<()>;
}
