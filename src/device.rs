use crate::engine::IntelliKeys;
use crate::modifier::ShiftKeyAction;
use crate::settings::IndicatorLights;

/* Device state mirrored out of the engine for the DBus objects. The actor
 * refreshes it after every tick or report; readers never touch the engine. */
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub sysname: String,
    pub name: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub calibration_valid: bool,
    pub intelliswitch: bool,
    pub current_overlay: Option<u8>,
    pub overlay_name: String,
    pub switched_on: bool,
    pub modifier_states: Vec<(String, String)>,
    pub shift_key_action: ShiftKeyAction,
    pub indicator_lights: IndicatorLights,
    pub anomalies: u64,
}

impl DeviceInfo {
    /* Translate a numeric bustype from HID_ID into its short name. */
    fn bustype_to_string(bustype: u16) -> String {
        match bustype {
            0x03 => "usb".to_string(),
            0x05 => "bluetooth".to_string(),
            _ => format!("{:04x}", bustype),
        }
    }

    pub fn new(sysname: &str, name: &str, bustype: u16, vid: u16, pid: u16) -> Self {
        let bus_str = Self::bustype_to_string(bustype);
        let model = format!("{}:{:04x}:{:04x}:0", bus_str, vid, pid);

        Self {
            sysname: sysname.to_string(),
            name: name.to_string(),
            model,
            firmware_version: String::new(),
            serial_number: String::new(),
            calibration_valid: false,
            intelliswitch: false,
            current_overlay: None,
            overlay_name: String::new(),
            switched_on: false,
            modifier_states: Vec::new(),
            shift_key_action: ShiftKeyAction::default(),
            indicator_lights: IndicatorLights::default(),
            anomalies: 0,
        }
    }

    /* Copy everything observable out of `ik`. */
    pub fn sync_from(&mut self, ik: &IntelliKeys) {
        self.firmware_version = ik
            .firmware_version()
            .map(|(major, minor)| format!("{major}.{minor}"))
            .unwrap_or_default();
        self.serial_number = ik.serial_number().unwrap_or_default();
        self.calibration_valid = ik.calibration().is_some();
        self.intelliswitch = ik.is_intelliswitch();
        self.current_overlay = ik.current_overlay();
        self.overlay_name = ik.active_overlay_name().unwrap_or_default().to_string();
        self.switched_on = ik.is_switched_on();
        self.modifier_states = ik.modifier_states();
        self.shift_key_action = ik.settings().shift_key_action;
        self.indicator_lights = ik.settings().indicator_lights;
        self.anomalies = ik.anomalies();
    }
}
