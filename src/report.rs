/* HID report builder.
 *
 * Folds every pressed membrane cell and switch through the active overlay into one boot
 * keyboard report and one relative mouse report. */

use crate::interpreter::Membrane;
use crate::overlay::{CellAction, MOUSE_BUTTON_MASK, MOUSE_CLICK_HOLD, MOUSE_DOUBLE_CLICK, Overlay};
use crate::protocol::{self, Frame, NUM_SWITCHES};

pub const MAX_KEYCODES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardReport {
    pub modifier: u8,
    pub keys: [u8; MAX_KEYCODES],
}

impl KeyboardReport {
    pub fn is_empty(&self) -> bool {
        self.modifier == 0 && self.keys.iter().all(|k| *k == 0)
    }

    /* Keycodes in use, in report order. */
    pub fn keycodes(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys.iter().copied().take_while(|k| *k != 0)
    }

    pub fn to_frame(&self) -> Frame {
        protocol::reflect_keystroke(self.modifier, &self.keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseReport {
    pub buttons: u8,
    pub dx: i8,
    pub dy: i8,
}

impl MouseReport {
    pub fn has_motion(&self) -> bool {
        self.dx != 0 || self.dy != 0
    }

    pub fn to_frame(&self) -> Frame {
        protocol::reflect_mouse(self.buttons, self.dx, self.dy)
    }
}

/* Build both reports from the membrane and switches. `None` for `overlay`
 * (or an inactive device) yields empty reports. */
pub fn build(
    membrane: &Membrane,
    switches: &[bool; NUM_SWITCHES],
    overlay: Option<&Overlay>,
) -> (KeyboardReport, MouseReport) {
    let mut acc = Accumulator::default();
    let Some(overlay) = overlay else {
        return (acc.kb, acc.mouse);
    };

    /* row-major, so earlier cells win the keycode slots */
    for (row, cells) in membrane.iter().enumerate() {
        for (col, pressed) in cells.iter().enumerate() {
            if *pressed {
                acc.add(overlay.action(row, col));
            }
        }
    }
    for (i, pressed) in switches.iter().enumerate() {
        if *pressed {
            acc.add(overlay.switch_action(i));
        }
    }

    acc.finish()
}

#[derive(Default)]
struct Accumulator {
    kb: KeyboardReport,
    mouse: MouseReport,
    nkeys: usize,
    dx: i16,
    dy: i16,
}

impl Accumulator {
    fn add(&mut self, action: CellAction) {
        match action {
            CellAction::None => {}
            CellAction::Keyboard { modifier, keycode } => {
                self.kb.modifier |= modifier;
                if keycode == 0 || self.kb.keys[..self.nkeys].contains(&keycode) {
                    return;
                }
                /* report format limit; extra keys are dropped */
                if self.nkeys < MAX_KEYCODES {
                    self.kb.keys[self.nkeys] = keycode;
                    self.nkeys += 1;
                }
            }
            CellAction::Mouse { buttons, dx, dy } => {
                /* double-click and click-hold buttons are driven by the
                 * engine, not by the cell being held */
                if buttons & (MOUSE_DOUBLE_CLICK | MOUSE_CLICK_HOLD) == 0 {
                    self.mouse.buttons |= buttons & MOUSE_BUTTON_MASK;
                }
                self.dx = self.dx.saturating_add(i16::from(dx));
                self.dy = self.dy.saturating_add(i16::from(dy));
            }
        }
    }

    fn finish(mut self) -> (KeyboardReport, MouseReport) {
        self.mouse.dx = saturate(self.dx);
        self.mouse.dy = saturate(self.dy);
        (self.kb, self.mouse)
    }
}

fn saturate(v: i16) -> i8 {
    v.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RESOLUTION_COLS, RESOLUTION_ROWS};

    const NO_SWITCHES: [bool; NUM_SWITCHES] = [false; NUM_SWITCHES];

    fn empty_membrane() -> Membrane {
        [[false; RESOLUTION_COLS]; RESOLUTION_ROWS]
    }

    /* Row 0 holds keycodes 4.., one per cell. */
    fn letters() -> Overlay {
        let mut overlay = Overlay::new("letters", None);
        for col in 0..RESOLUTION_COLS {
            overlay
                .fill(
                    0,
                    col,
                    1,
                    1,
                    CellAction::Keyboard {
                        modifier: 0,
                        keycode: 4 + col as u8,
                    },
                )
                .unwrap();
        }
        overlay
    }

    #[test]
    fn at_most_six_keycodes() {
        let overlay = letters();
        let mut membrane = empty_membrane();
        for col in 0..10 {
            membrane[0][col] = true;
        }
        let (kb, _) = build(&membrane, &NO_SWITCHES, Some(&overlay));
        assert_eq!(kb.keys, [4, 5, 6, 7, 8, 9]);
        assert_eq!(kb.keycodes().count(), MAX_KEYCODES);
    }

    #[test]
    fn duplicates_coalesce_and_modifiers_combine() {
        let mut overlay = Overlay::new("dup", None);
        let a = CellAction::Keyboard {
            modifier: 0x02,
            keycode: 4,
        };
        overlay.fill(0, 0, 2, 2, a).unwrap();
        overlay
            .fill(
                3,
                3,
                1,
                1,
                CellAction::Keyboard {
                    modifier: 0x01,
                    keycode: 0,
                },
            )
            .unwrap();

        let mut membrane = empty_membrane();
        membrane[0][0] = true;
        membrane[1][1] = true;
        membrane[3][3] = true;

        let (kb, mouse) = build(&membrane, &NO_SWITCHES, Some(&overlay));
        assert_eq!(kb.modifier, 0x03);
        assert_eq!(kb.keys, [4, 0, 0, 0, 0, 0]);
        assert_eq!(mouse, MouseReport::default());
    }

    #[test]
    fn mouse_cells_accumulate() {
        let mut overlay = Overlay::new("mouse", None);
        overlay
            .fill(
                0,
                0,
                1,
                24,
                CellAction::Mouse {
                    buttons: 0,
                    dx: 100,
                    dy: -3,
                },
            )
            .unwrap();
        overlay
            .fill(
                5,
                5,
                1,
                1,
                CellAction::Mouse {
                    buttons: 0x01 | crate::overlay::MOUSE_CLICK_HOLD,
                    dx: 0,
                    dy: 0,
                },
            )
            .unwrap();

        overlay
            .fill(
                6,
                6,
                1,
                1,
                CellAction::Mouse {
                    buttons: 0x02,
                    dx: 0,
                    dy: 0,
                },
            )
            .unwrap();

        let mut membrane = empty_membrane();
        membrane[0][0] = true;
        membrane[0][1] = true;
        membrane[5][5] = true;

        let (kb, mouse) = build(&membrane, &NO_SWITCHES, Some(&overlay));
        assert!(kb.is_empty());
        assert_eq!(
            mouse,
            MouseReport {
                buttons: 0,
                dx: 127,
                dy: -6
            }
        );

        membrane[6][6] = true;
        let (_, mouse) = build(&membrane, &NO_SWITCHES, Some(&overlay));
        assert_eq!(mouse.buttons, 0x02);
    }

    #[test]
    fn switches_follow_membrane_cells() {
        let mut overlay = letters();
        overlay
            .set_switch(
                2,
                CellAction::Keyboard {
                    modifier: 0,
                    keycode: 0x2c,
                },
            )
            .unwrap();
        overlay
            .set_switch(
                1,
                CellAction::Keyboard {
                    modifier: 0,
                    keycode: 4,
                },
            )
            .unwrap();

        let mut membrane = empty_membrane();
        membrane[0][1] = true;
        let mut switches = NO_SWITCHES;
        switches[0] = true;
        switches[1] = true;

        let (kb, _) = build(&membrane, &switches, Some(&overlay));
        assert_eq!(kb.keys, [5, 4, 0x2c, 0, 0, 0]);
    }

    #[test]
    fn full_membrane_of_motion_saturates() {
        let mut overlay = Overlay::new("fast", None);
        overlay
            .fill(
                0,
                0,
                RESOLUTION_ROWS,
                RESOLUTION_COLS,
                CellAction::Mouse {
                    buttons: 0,
                    dx: 127,
                    dy: -128,
                },
            )
            .unwrap();
        let membrane = [[true; RESOLUTION_COLS]; RESOLUTION_ROWS];
        let (_, mouse) = build(&membrane, &NO_SWITCHES, Some(&overlay));
        assert_eq!((mouse.dx, mouse.dy), (127, -128));
    }

    #[test]
    fn no_overlay_gives_empty_reports() {
        let mut membrane = empty_membrane();
        membrane[0][0] = true;
        let (kb, mouse) = build(&membrane, &NO_SWITCHES, None);
        assert!(kb.is_empty());
        assert_eq!(mouse, MouseReport::default());
    }

    #[test]
    fn frames() {
        let kb = KeyboardReport {
            modifier: 0x02,
            keys: [4, 0, 0, 0, 0, 0],
        };
        assert_eq!(kb.to_frame().0, [21, 0x02, 4, 0, 0, 0, 0, 0]);
        let mouse = MouseReport {
            buttons: 1,
            dx: -1,
            dy: 2,
        };
        assert_eq!(mouse.to_frame().0, [22, 1, 0xff, 2, 0, 0, 0, 0]);
    }
}
