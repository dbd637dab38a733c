/* Overlay key maps.
 *
 * An overlay assigns an action to every membrane cell and to each of the
 * external switch jacks. Standard overlays are
 * recognised by the sensor bar code (slots 0..=6); custom overlays are only
 * reachable by name through the user settings. Tables are built once at
 * start-up and shared read-only between devices. */

use thiserror::Error;

use crate::protocol::{NUM_SWITCHES, RESOLUTION_COLS, RESOLUTION_ROWS};

pub const NUM_STANDARD_OVERLAYS: usize = 7;

pub const STANDARD_OVERLAY_NAMES: [&str; NUM_STANDARD_OVERLAYS] = [
    "Web Access USB Overlay",
    "Setup USB Overlay",
    "Math Access USB Overlay",
    "Alphabet USB Overlay",
    "Mouse Access USB Overlay",
    "QWERTY USB Overlay",
    "Basic Writing USB Overlay",
];

pub const OVERLAY_ALPHABET: u8 = 3;

/* Action flags carried in the mouse button byte */
pub const MOUSE_DOUBLE_CLICK: u8 = 1 << 5;
pub const MOUSE_CLICK_HOLD: u8 = 1 << 6;
pub const MOUSE_BUTTON_MASK: u8 = 0x1f;

/* What pressing a cell does. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellAction {
    #[default]
    None,
    Keyboard { modifier: u8, keycode: u8 },
    Mouse { buttons: u8, dx: i8, dy: i8 },
}

impl CellAction {
    /* A keyboard cell that only carries modifier bits. */
    pub fn modifier_only(&self) -> Option<u8> {
        match *self {
            Self::Keyboard { modifier, keycode: 0 } if modifier != 0 => Some(modifier),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverlayError {
    #[error("cell block at ({row}, {col}) size {height}x{width} exceeds the membrane")]
    OutOfRange {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
    },
    #[error("switch {0} does not exist")]
    NoSuchSwitch(u8),
}

pub type CellMap = [[CellAction; RESOLUTION_COLS]; RESOLUTION_ROWS];

#[derive(Debug, Clone)]
pub struct Overlay {
    pub name: String,
    /* Standard slot, if this overlay stands in for a bar-coded one. */
    pub number: Option<u8>,
    cells: Box<CellMap>,
    switches: [CellAction; NUM_SWITCHES],
}

impl Overlay {
    pub fn new(name: impl Into<String>, number: Option<u8>) -> Self {
        Self {
            name: name.into(),
            number,
            cells: Box::new([[CellAction::None; RESOLUTION_COLS]; RESOLUTION_ROWS]),
            switches: [CellAction::None; NUM_SWITCHES],
        }
    }

    /* Assign `action` to a rectangular block of cells. */
    pub fn fill(
        &mut self,
        row: usize,
        col: usize,
        height: usize,
        width: usize,
        action: CellAction,
    ) -> Result<(), OverlayError> {
        let out_of_range = OverlayError::OutOfRange {
            row,
            col,
            height,
            width,
        };
        let (Some(bottom), Some(right)) = (row.checked_add(height), col.checked_add(width)) else {
            return Err(out_of_range);
        };
        if bottom > RESOLUTION_ROWS || right > RESOLUTION_COLS {
            return Err(out_of_range);
        }
        for cells in &mut self.cells[row..bottom] {
            for cell in &mut cells[col..right] {
                *cell = action;
            }
        }
        Ok(())
    }

    pub fn action(&self, row: usize, col: usize) -> CellAction {
        self.cells
            .get(row)
            .and_then(|r| r.get(col))
            .copied()
            .unwrap_or_default()
    }

    /* Assign `action` to switch `number` (1-based). */
    pub fn set_switch(&mut self, number: u8, action: CellAction) -> Result<(), OverlayError> {
        let slot = usize::from(number)
            .checked_sub(1)
            .and_then(|i| self.switches.get_mut(i))
            .ok_or(OverlayError::NoSuchSwitch(number))?;
        *slot = action;
        Ok(())
    }

    /* Action of the switch at 0-based index `index`. */
    pub fn switch_action(&self, index: usize) -> CellAction {
        self.switches.get(index).copied().unwrap_or_default()
    }
}

/* All overlays known to the daemon. */
#[derive(Debug, Clone, Default)]
pub struct OverlayTable {
    standard: [Option<Overlay>; NUM_STANDARD_OVERLAYS],
    custom: Vec<Overlay>,
}

impl OverlayTable {
    /* Table holding only the compiled-in overlays. */
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert(alphabet());
        table
    }

    /* Numbered overlays replace the standard slot; others are custom. */
    pub fn insert(&mut self, overlay: Overlay) {
        match overlay.number.map(usize::from) {
            Some(slot) if slot < NUM_STANDARD_OVERLAYS => self.standard[slot] = Some(overlay),
            _ => {
                self.custom.retain(|o| o.name != overlay.name);
                self.custom.push(overlay);
            }
        }
    }

    pub fn standard(&self, number: u8) -> Option<&Overlay> {
        self.standard.get(usize::from(number))?.as_ref()
    }

    pub fn by_name(&self, name: &str) -> Option<&Overlay> {
        self.custom
            .iter()
            .chain(self.standard.iter().flatten())
            .find(|o| o.name == name)
    }

    /* The overlay the report builder should use: a configured override
     * wins, otherwise the standard overlay for the committed slot. */
    pub fn resolve(&self, committed: Option<u8>, use_this: Option<&str>) -> Option<&Overlay> {
        if let Some(overlay) = use_this.and_then(|name| self.by_name(name)) {
            return Some(overlay);
        }
        self.standard(committed?)
    }

    pub fn len(&self) -> usize {
        self.standard.iter().flatten().count() + self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/* Display name for a committed sensor value. */
pub fn standard_name(number: u8) -> &'static str {
    STANDARD_OVERLAY_NAMES
        .get(usize::from(number))
        .copied()
        .unwrap_or("none")
}

/* HID usage IDs used by the built-in overlay */
mod usage {
    pub const A: u8 = 0x04;
    pub const I: u8 = 0x0c;
    pub const Q: u8 = 0x14;
    pub const W: u8 = 0x1a;
    pub const ONE: u8 = 0x1e;
    pub const ENTER: u8 = 0x28;
    pub const ESCAPE: u8 = 0x29;
    pub const BACKSPACE: u8 = 0x2a;
    pub const SPACE: u8 = 0x2c;
    pub const COMMA: u8 = 0x36;
    pub const PERIOD: u8 = 0x37;
    pub const SLASH: u8 = 0x38;
    pub const CAPS_LOCK: u8 = 0x39;
    pub const RIGHT: u8 = 0x4f;
    pub const LEFT: u8 = 0x50;
    pub const DOWN: u8 = 0x51;
    pub const UP: u8 = 0x52;
}

fn key(keycode: u8) -> CellAction {
    CellAction::Keyboard {
        modifier: 0,
        keycode,
    }
}

fn shifted(keycode: u8) -> CellAction {
    CellAction::Keyboard {
        modifier: crate::modifier::MOD_LEFT_SHIFT,
        keycode,
    }
}

/* (row, col, height, width, action) */
type Block = (usize, usize, usize, usize, CellAction);

/* Alphabet USB Overlay: letters in alphabetical order, arrows top right. */
pub fn alphabet() -> Overlay {
    use crate::modifier::{MOD_LEFT_SHIFT, MOD_RIGHT_SHIFT};

    let mut blocks: Vec<Block> = vec![
        (0, 0, 4, 4, key(usage::ESCAPE)),
        (0, 4, 4, 4, key(usage::CAPS_LOCK)),
        (0, 8, 4, 4, key(usage::BACKSPACE)),
        (1, 14, 4, 3, key(usage::LEFT)),
        (0, 18, 4, 3, key(usage::UP)),
        (1, 21, 4, 2, key(usage::RIGHT)),
        (4, 18, 4, 3, key(usage::DOWN)),
        (4, 1, 4, 2, key(usage::PERIOD)),
        (4, 3, 4, 2, key(usage::COMMA)),
        (4, 5, 4, 2, shifted(usage::SLASH)),
        (4, 7, 4, 2, shifted(usage::ONE)),
    ];
    for i in 0..8u8 {
        blocks.push((8, usize::from(i) * 3, 4, 3, key(usage::A + i)));
        blocks.push((12, usize::from(i) * 3, 4, 3, key(usage::I + i)));
    }
    for i in 0..6u8 {
        blocks.push((16, usize::from(i) * 3, 4, 3, key(usage::Q + i)));
    }
    blocks.push((16, 18, 4, 6, key(usage::ENTER)));
    blocks.push((
        20,
        0,
        4,
        3,
        CellAction::Keyboard {
            modifier: MOD_LEFT_SHIFT,
            keycode: 0,
        },
    ));
    blocks.push((
        20,
        15,
        4,
        3,
        CellAction::Keyboard {
            modifier: MOD_RIGHT_SHIFT,
            keycode: 0,
        },
    ));
    for i in 0..4u8 {
        blocks.push((20, (usize::from(i) + 1) * 3, 4, 3, key(usage::W + i)));
    }
    blocks.push((20, 18, 3, 6, key(usage::SPACE)));

    let mut overlay = Overlay::new(
        STANDARD_OVERLAY_NAMES[usize::from(OVERLAY_ALPHABET)],
        Some(OVERLAY_ALPHABET),
    );
    for (row, col, height, width, action) in blocks {
        /* every block above lies inside the membrane */
        let _ = overlay.fill(row, col, height, width, action);
    }
    overlay
}
