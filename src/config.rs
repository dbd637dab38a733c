/* Daemon configuration.
 *
 * `/etc/ikeysd/ikeysd.conf` (or `$IKEYSD_CONFIG`):
 *
 *   [Daemon]
 *   TickMs = 5
 *   DispatchBudget = 8
 *   CorrectionIntervalMs = 500
 *   MouseRepeatMs = 40
 *
 *   [Firmware]
 *   Loader = /usr/share/ikeysd/firmware/loader.hex
 *   Firmware = /usr/share/ikeysd/firmware/firmware.hex
 *
 *   [Overlays]
 *   Directory = /usr/share/ikeysd/overlays
 *
 *   [Settings]
 *   File = /var/lib/ikeysd/settings.ini */

use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::EngineConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ikeysd/ikeysd.conf";
pub const CONFIG_ENV: &str = "IKEYSD_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {message}")]
    Parse { path: String, message: String },

    #[error("[{section}] {key}: invalid value '{value}'")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub tick: Duration,
    pub dispatch_budget: usize,
    /* `None` disables the periodic correction pass. */
    pub correction_interval: Option<Duration>,
    pub mouse_repeat: Duration,
    pub loader_hex: PathBuf,
    pub firmware_hex: PathBuf,
    pub overlay_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
            dispatch_budget: crate::dispatcher::DEFAULT_BUDGET,
            correction_interval: Some(Duration::from_millis(500)),
            mouse_repeat: Duration::from_millis(40),
            loader_hex: PathBuf::from("/usr/share/ikeysd/firmware/loader.hex"),
            firmware_hex: PathBuf::from("/usr/share/ikeysd/firmware/firmware.hex"),
            overlay_dir: PathBuf::from("/usr/share/ikeysd/overlays"),
            settings_file: PathBuf::from("/var/lib/ikeysd/settings.ini"),
        }
    }
}

impl DaemonConfig {
    /* Resolve the config path from the environment and load it. A missing
     * file is not an error: the daemon runs on defaults. */
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let config = Self::from_file(&path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.load(path).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = number(ini, "daemon", "TickMs")? {
            config.tick = Duration::from_millis(ms.max(1));
        }
        if let Some(budget) = number(ini, "daemon", "DispatchBudget")? {
            config.dispatch_budget = budget.max(1) as usize;
        }
        if let Some(ms) = number(ini, "daemon", "CorrectionIntervalMs")? {
            config.correction_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = number(ini, "daemon", "MouseRepeatMs")? {
            config.mouse_repeat = Duration::from_millis(ms);
        }

        if let Some(p) = ini.get("firmware", "loader") {
            config.loader_hex = PathBuf::from(p);
        }
        if let Some(p) = ini.get("firmware", "firmware") {
            config.firmware_hex = PathBuf::from(p);
        }
        if let Some(p) = ini.get("overlays", "directory") {
            config.overlay_dir = PathBuf::from(p);
        }
        if let Some(p) = ini.get("settings", "file") {
            config.settings_file = PathBuf::from(p);
        }

        Ok(config)
    }

    /* Timing knobs handed to each device engine. */
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            dispatch_budget: self.dispatch_budget,
            correction_interval: self.correction_interval,
            mouse_repeat: self.mouse_repeat,
            ..EngineConfig::default()
        }
    }
}

fn number(ini: &Ini, section: &'static str, key: &'static str) -> Result<Option<u64>, ConfigError> {
    match ini.get(section, key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section,
                key,
                value,
            }),
    }
}
