/* Modifier latch state machines.
 *
 * One latch per sticky key (shift, control, alt, command, mouse-down). The
 * shift-key policy decides what an activation does; every transition is
 * rate-limited so contact chatter on the membrane cannot flip a latch twice. */

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::trace;

/* Minimum spacing between two transitions of the same latch. */
pub const MODIFIER_GUARD: Duration = Duration::from_millis(5);

/* Key-down hold time for the no-latch policy. */
pub const NOLATCH_RELEASE: Duration = Duration::from_millis(5);

/* HID boot-keyboard modifier bits */
pub const MOD_LEFT_CTRL: u8 = 0x01;
pub const MOD_LEFT_SHIFT: u8 = 0x02;
pub const MOD_LEFT_ALT: u8 = 0x04;
pub const MOD_LEFT_GUI: u8 = 0x08;
pub const MOD_RIGHT_CTRL: u8 = 0x10;
pub const MOD_RIGHT_SHIFT: u8 = 0x20;
pub const MOD_RIGHT_ALT: u8 = 0x40;
pub const MOD_RIGHT_GUI: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModifierState {
    #[default]
    Off,
    Latched,
    Locked,
}

impl ModifierState {
    pub fn is_active(self) -> bool {
        self != Self::Off
    }
}

impl fmt::Display for ModifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Latched => "latched",
            Self::Locked => "locked",
        })
    }
}

/* User-selected behaviour of sticky keys. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShiftKeyAction {
    #[default]
    Latching,
    Locking,
    NoLatch,
}

impl FromStr for ShiftKeyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latching" => Ok(Self::Latching),
            "locking" => Ok(Self::Locking),
            "nolatch" | "no-latch" => Ok(Self::NoLatch),
            other => Err(format!("unknown shift key action '{other}'")),
        }
    }
}

impl fmt::Display for ShiftKeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latching => "latching",
            Self::Locking => "locking",
            Self::NoLatch => "nolatch",
        })
    }
}

/* Key event requested by an activation. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransition {
    Down,
    Up,
    /* Down, released again after the given hold time. */
    Tap(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct ModifierLatch {
    state: ModifierState,
    last_transition: Option<Instant>,
}

impl ModifierLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn guarded(&mut self, now: Instant) -> bool {
        let inside = self
            .last_transition
            .is_some_and(|last| now.saturating_duration_since(last) <= MODIFIER_GUARD);
        if inside {
            trace!("Modifier activation inside guard, ignored");
            return true;
        }
        self.last_transition = Some(now);
        false
    }

    /* One activation of the key under `policy`. */
    pub fn execute(&mut self, policy: ShiftKeyAction, now: Instant) -> Option<KeyTransition> {
        if self.guarded(now) {
            return None;
        }

        let (next, transition) = match (policy, self.state) {
            (ShiftKeyAction::Latching, ModifierState::Off) => {
                (ModifierState::Latched, Some(KeyTransition::Down))
            }
            (ShiftKeyAction::Latching, _) => (ModifierState::Off, Some(KeyTransition::Up)),

            (ShiftKeyAction::Locking, ModifierState::Off) => {
                (ModifierState::Latched, Some(KeyTransition::Down))
            }
            (ShiftKeyAction::Locking, ModifierState::Latched) => (ModifierState::Locked, None),
            (ShiftKeyAction::Locking, ModifierState::Locked) => {
                (ModifierState::Off, Some(KeyTransition::Up))
            }

            (ShiftKeyAction::NoLatch, _) => {
                (ModifierState::Latched, Some(KeyTransition::Tap(NOLATCH_RELEASE)))
            }
        };
        trace!("Modifier {} -> {} ({:?})", self.state, next, transition);
        self.state = next;
        transition
    }

    /* Flip Off <-> Latched regardless of policy. */
    pub fn toggle_state(&mut self, now: Instant) {
        if self.guarded(now) {
            return;
        }
        self.state = match self.state {
            ModifierState::Off => ModifierState::Latched,
            _ => ModifierState::Off,
        };
    }

    pub fn set_state(&mut self, state: ModifierState) {
        self.state = state;
    }

    pub fn state(&self) -> ModifierState {
        self.state
    }
}

/* Sticky keys backed by a latch. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKey {
    Shift,
    Control,
    Alt,
    Command,
}

impl ModifierKey {
    pub const ALL: [ModifierKey; 4] = [Self::Shift, Self::Control, Self::Alt, Self::Command];

    /* Both sides of the key in the HID modifier byte. */
    pub fn mask(self) -> u8 {
        match self {
            Self::Shift => MOD_LEFT_SHIFT | MOD_RIGHT_SHIFT,
            Self::Control => MOD_LEFT_CTRL | MOD_RIGHT_CTRL,
            Self::Alt => MOD_LEFT_ALT | MOD_RIGHT_ALT,
            Self::Command => MOD_LEFT_GUI | MOD_RIGHT_GUI,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Shift => "shift",
            Self::Control => "control",
            Self::Alt => "alt",
            Self::Command => "command",
        }
    }
}

/* Full latch set owned by one attached device. */
#[derive(Debug, Clone, Default)]
pub struct Modifiers {
    pub shift: ModifierLatch,
    pub control: ModifierLatch,
    pub alt: ModifierLatch,
    pub command: ModifierLatch,
    pub mouse_down: ModifierLatch,
}

impl Modifiers {
    pub fn latch(&self, key: ModifierKey) -> &ModifierLatch {
        match key {
            ModifierKey::Shift => &self.shift,
            ModifierKey::Control => &self.control,
            ModifierKey::Alt => &self.alt,
            ModifierKey::Command => &self.command,
        }
    }

    pub fn latch_mut(&mut self, key: ModifierKey) -> &mut ModifierLatch {
        match key {
            ModifierKey::Shift => &mut self.shift,
            ModifierKey::Control => &mut self.control,
            ModifierKey::Alt => &mut self.alt,
            ModifierKey::Command => &mut self.command,
        }
    }

    /* Everything back to Off, mouse-down included. */
    pub fn lift_all(&mut self) {
        for key in ModifierKey::ALL {
            self.latch_mut(key).set_state(ModifierState::Off);
        }
        self.mouse_down.set_state(ModifierState::Off);
    }

    /* (name, state) pairs for inspection over D-Bus. */
    pub fn states(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = ModifierKey::ALL
            .iter()
            .map(|k| (k.name().to_string(), self.latch(*k).state().to_string()))
            .collect();
        out.push(("mouse-down".to_string(), self.mouse_down.state().to_string()));
        out
    }
}
