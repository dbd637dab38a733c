/* User preferences.
 *
 * A small INI file, read at start-up and rewritten whenever a setting is
 * changed over D-Bus. Every device attached to the daemon shares it. */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use configparser::ini::Ini;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::modifier::ShiftKeyAction;

const SECTION: &str = "settings";

pub const MAX_KEY_SOUND: u8 = 4;

/* Indicator LED layout printed on the overlay frame. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndicatorLights {
    Three,
    #[default]
    Six,
}

impl IndicatorLights {
    pub fn from_count(count: u32) -> Option<Self> {
        match count {
            3 => Some(Self::Three),
            6 => Some(Self::Six),
            _ => None,
        }
    }

    pub fn count(self) -> u32 {
        match self {
            Self::Three => 3,
            Self::Six => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub shift_key_action: ShiftKeyAction,
    pub indicator_lights: IndicatorLights,
    /* Key click volume, 0 (off) to 4. */
    pub key_sound: u8,
    /* Named overlay that overrides the bar-code reading. */
    pub use_this_overlay: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shift_key_action: ShiftKeyAction::Latching,
            indicator_lights: IndicatorLights::Six,
            key_sound: 2,
            use_this_overlay: None,
        }
    }
}

impl Settings {
    /* Read from `path`; a missing or broken file falls back to defaults
     * field by field. */
    pub fn load(path: &Path) -> Self {
        let mut ini = Ini::new();
        if let Err(err) = ini.load(path) {
            debug!("No settings at {}: {}", path.display(), err);
            return Self::default();
        }
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Self {
        let mut settings = Self::default();

        if let Some(v) = ini.get(SECTION, "shiftkeyaction") {
            match v.parse() {
                Ok(action) => settings.shift_key_action = action,
                Err(err) => warn!("Settings: {err}"),
            }
        }
        if let Some(v) = ini.get(SECTION, "indicatorlights") {
            match v.trim().parse().ok().and_then(IndicatorLights::from_count) {
                Some(lights) => settings.indicator_lights = lights,
                None => warn!("Settings: IndicatorLights must be 3 or 6, got '{v}'"),
            }
        }
        if let Some(v) = ini.get(SECTION, "keysound") {
            match v.trim().parse::<u8>() {
                Ok(level) if level <= MAX_KEY_SOUND => settings.key_sound = level,
                _ => warn!("Settings: KeySound must be 0..={MAX_KEY_SOUND}, got '{v}'"),
            }
        }
        settings.use_this_overlay = ini
            .get(SECTION, "usethisoverlay")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        settings
    }

    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.set(SECTION, "ShiftKeyAction", Some(self.shift_key_action.to_string()));
        ini.set(
            SECTION,
            "IndicatorLights",
            Some(self.indicator_lights.count().to_string()),
        );
        ini.set(SECTION, "KeySound", Some(self.key_sound.to_string()));
        ini.set(
            SECTION,
            "UseThisOverlay",
            Some(self.use_this_overlay.clone().unwrap_or_default()),
        );
        ini
    }
}

/* Shared, file-backed settings. Device actors subscribe and receive every
 * change as it is made. */
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Self {
        let (tx, _) = watch::channel(Settings::load(path));
        Self {
            path: path.to_path_buf(),
            tx,
        }
    }

    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /* Apply `change`, notify subscribers and persist the result. The
     * in-memory copy is updated even if writing the file fails. */
    pub fn update<F>(&self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        self.tx.send_modify(change);
        let updated = self.get();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating {}", parent.display()))?;
        }
        updated
            .to_ini()
            .write(&self.path)
            .with_context(|| format!("Writing settings to {}", self.path.display()))?;
        debug!("Settings saved to {}", self.path.display());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Settings {
        let mut ini = Ini::new();
        ini.read(text.to_string()).unwrap();
        Settings::from_ini(&ini)
    }

    #[test]
    fn defaults_when_empty() {
        assert_eq!(parse(""), Settings::default());
        assert_eq!(Settings::default().key_sound, 2);
        assert_eq!(Settings::default().indicator_lights, IndicatorLights::Six);
    }

    #[test]
    fn reads_every_field() {
        let settings = parse(
            "[Settings]\nShiftKeyAction = locking\nIndicatorLights = 3\nKeySound = 0\nUseThisOverlay = My Overlay\n",
        );
        assert_eq!(settings.shift_key_action, ShiftKeyAction::Locking);
        assert_eq!(settings.indicator_lights, IndicatorLights::Three);
        assert_eq!(settings.key_sound, 0);
        assert_eq!(settings.use_this_overlay.as_deref(), Some("My Overlay"));
    }

    #[test]
    fn bad_values_keep_defaults() {
        let settings = parse("[Settings]\nShiftKeyAction = sticky\nIndicatorLights = 4\nKeySound = 9\n");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn round_trip_through_ini() {
        let settings = Settings {
            shift_key_action: ShiftKeyAction::NoLatch,
            indicator_lights: IndicatorLights::Three,
            key_sound: 4,
            use_this_overlay: None,
        };
        let text = settings.to_ini().writes();
        assert_eq!(parse(&text), settings);
    }

    #[test]
    fn store_persists_updates() {
        let dir = std::env::temp_dir().join(format!("ikeysd-settings-{}", std::process::id()));
        let path = dir.join("settings.ini");
        let _ = std::fs::remove_file(&path);

        let store = SettingsStore::open(&path);
        assert_eq!(store.get(), Settings::default());
        store
            .update(|s| s.shift_key_action = ShiftKeyAction::Locking)
            .unwrap();

        let reopened = SettingsStore::open(&path);
        assert_eq!(reopened.get().shift_key_action, ShiftKeyAction::Locking);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn subscribers_see_updates() {
        let dir = std::env::temp_dir().join(format!("ikeysd-watch-{}", std::process::id()));
        let store = SettingsStore::open(&dir.join("settings.ini"));
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store
            .update(|s| s.indicator_lights = IndicatorLights::Three)
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().indicator_lights, IndicatorLights::Three);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
