use std::path::Path;

use configparser::ini::Ini;
use tracing::{debug, warn};

use crate::overlay::{CellAction, NUM_STANDARD_OVERLAYS, Overlay, OverlayTable};

/* Load every `.overlay` file in `dir` on top of the built-in table.
 *
 * File layout:
 *
 *   [Overlay]
 *   Name = Mouse Access USB Overlay
 *   Number = 4                       ; optional standard slot
 *
 *   [Cells]
 *   up    = 0 8 4 8 mouse 0x00 0 -4
 *   click = 8 8 8 8 mouse 0x01 0 0
 *   enter = 16 0 4 6 key 0x00 0x28
 *
 *   [Switches]                       ; optional
 *   1 = key 0x00 0x2c
 *
 * Each cell entry is `row col height width` followed by either
 * `key MODIFIER KEYCODE` or `mouse BUTTONS DX DY`. Labels are only names;
 * blocks are applied in label order, later blocks win where they overlap.
 * Switch entries are keyed by switch number and carry the action alone. */
pub fn load_overlay_directory(dir: &Path) -> OverlayTable {
    let mut table = OverlayTable::builtin();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) => {
            warn!("Failed to read overlay directory {:?}: {}", dir, err);
            return table;
        }
    };

    for dir_entry in entries.flatten() {
        let path = dir_entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("overlay") {
            continue;
        }

        match parse_overlay_file(&path) {
            Ok(overlay) => {
                debug!("Loaded overlay: {} (slot {:?})", overlay.name, overlay.number);
                table.insert(overlay);
            }
            Err(err) => {
                warn!("Failed to parse {:?}: {}", path, err);
            }
        }
    }

    debug!("Overlay table loaded: {} overlays", table.len());
    table
}

/* Parse a single `.overlay` INI file. */
fn parse_overlay_file(path: &Path) -> Result<Overlay, String> {
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| format!("INI parse error: {}", e))?;
    parse_overlay(&ini)
}

fn parse_overlay(ini: &Ini) -> Result<Overlay, String> {
    /* [Overlay] section */
    let name = ini
        .get("overlay", "name")
        .filter(|n| !n.trim().is_empty())
        .ok_or("Missing [Overlay] Name")?;
    let number = match ini.get("overlay", "number") {
        None => None,
        Some(n) => {
            let slot: u8 = parse_number(&n).ok_or_else(|| format!("Invalid Number '{}'", n))?;
            if usize::from(slot) >= NUM_STANDARD_OVERLAYS {
                return Err(format!("Number {} is not a standard overlay slot", slot));
            }
            Some(slot)
        }
    };

    let mut overlay = Overlay::new(name.trim(), number);

    /* [Cells] section */
    let cells = ini
        .get_map_ref()
        .get("cells")
        .ok_or("Missing [Cells] section")?;
    let mut labels: Vec<&String> = cells.keys().collect();
    labels.sort();

    for label in labels {
        let Some(Some(spec)) = cells.get(label) else {
            return Err(format!("Cell '{}' has no value", label));
        };
        let (row, col, height, width, action) =
            parse_cell(spec).map_err(|e| format!("Cell '{}': {}", label, e))?;
        overlay
            .fill(row, col, height, width, action)
            .map_err(|e| format!("Cell '{}': {}", label, e))?;
    }

    /* [Switches] section */
    if let Some(switches) = ini.get_map_ref().get("switches") {
        for (label, value) in switches {
            let number: u8 =
                parse_number(label).ok_or_else(|| format!("Invalid switch '{}'", label))?;
            let Some(value) = value else {
                return Err(format!("Switch {} has no value", number));
            };
            let fields: Vec<&str> = value.split_whitespace().collect();
            let action = parse_action(&fields).map_err(|e| format!("Switch {}: {}", number, e))?;
            overlay
                .set_switch(number, action)
                .map_err(|e| format!("Switch {}: {}", number, e))?;
        }
    }

    Ok(overlay)
}

/* Parse `"row col height width key MOD CODE"` or
 * `"row col height width mouse BUTTONS DX DY"`. */
fn parse_cell(s: &str) -> Result<(usize, usize, usize, usize, CellAction), String> {
    let fields: Vec<&str> = s.split_whitespace().collect();
    if fields.len() != 7 && fields.len() != 8 {
        return Err(format!("expected 7 or 8 fields, got {}", fields.len()));
    }

    let mut geometry = [0usize; 4];
    for (slot, field) in geometry.iter_mut().zip(&fields[..4]) {
        *slot = parse_number(field).ok_or_else(|| format!("invalid number '{}'", field))?;
    }
    let [row, col, height, width] = geometry;

    Ok((row, col, height, width, parse_action(&fields[4..])?))
}

/* Parse `key MOD CODE` or `mouse BUTTONS DX DY`. */
fn parse_action(fields: &[&str]) -> Result<CellAction, String> {
    let Some(kind) = fields.first() else {
        return Err("missing action".to_string());
    };
    let action = match (*kind, fields.len()) {
        ("key", 3) => CellAction::Keyboard {
            modifier: parse_number(fields[1])
                .ok_or_else(|| format!("invalid modifier '{}'", fields[1]))?,
            keycode: parse_number(fields[2])
                .ok_or_else(|| format!("invalid keycode '{}'", fields[2]))?,
        },
        ("mouse", 4) => CellAction::Mouse {
            buttons: parse_number(fields[1])
                .ok_or_else(|| format!("invalid buttons '{}'", fields[1]))?,
            dx: fields[2]
                .parse()
                .map_err(|_| format!("invalid dx '{}'", fields[2]))?,
            dy: fields[3]
                .parse()
                .map_err(|_| format!("invalid dy '{}'", fields[3]))?,
        },
        (kind, n) => return Err(format!("'{}' with {} fields is not a cell action", kind, n)),
    };
    Ok(action)
}

/* Decimal or `0x`-prefixed hexadecimal. */
fn parse_number<T: TryFrom<u64>>(s: &str) -> Option<T> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => s.parse().ok()?,
    };
    T::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ini(text: &str) -> Ini {
        let mut ini = Ini::new();
        ini.read(text.to_string()).unwrap();
        ini
    }

    #[test]
    fn test_parse_cell_key() {
        let (row, col, h, w, action) = parse_cell("16 0 4 6 key 0x00 0x28").unwrap();
        assert_eq!((row, col, h, w), (16, 0, 4, 6));
        assert_eq!(
            action,
            CellAction::Keyboard {
                modifier: 0,
                keycode: 0x28
            }
        );
    }

    #[test]
    fn test_parse_cell_mouse() {
        let (_, _, _, _, action) = parse_cell("0 8 4 8 mouse 0x41 -4 12").unwrap();
        assert_eq!(
            action,
            CellAction::Mouse {
                buttons: 0x41,
                dx: -4,
                dy: 12
            }
        );
    }

    #[test]
    fn test_parse_cell_invalid() {
        assert!(parse_cell("0 0 1 1 key 0x00").is_err());
        assert!(parse_cell("0 0 1 1 mouse 0 0").is_err());
        assert!(parse_cell("0 0 1 1 joystick 0 0").is_err());
        assert!(parse_cell("0 0 x 1 key 0 4").is_err());
        assert!(parse_cell("0 0 1 1 key 0 0x100").is_err());
        assert!(parse_cell("0 0 1 1 mouse 0 200 0").is_err());
    }

    #[test]
    fn test_parse_overlay() {
        let overlay = parse_overlay(&ini(
            "[Overlay]\nName = Mouse Access USB Overlay\nNumber = 4\n\
             [Cells]\nup = 0 8 4 8 mouse 0x00 0 -4\nclick = 8 8 8 8 mouse 0x01 0 0\n",
        ))
        .unwrap();
        assert_eq!(overlay.name, "Mouse Access USB Overlay");
        assert_eq!(overlay.number, Some(4));
        assert_eq!(
            overlay.action(1, 9),
            CellAction::Mouse {
                buttons: 0,
                dx: 0,
                dy: -4
            }
        );
        assert_eq!(overlay.action(23, 23), CellAction::None);
    }

    #[test]
    fn test_parse_overlay_switches() {
        let overlay = parse_overlay(&ini(
            "[Overlay]\nName = Jacks\n[Cells]\n[Switches]\n1 = key 0x00 0x2c\n2 = mouse 0x01 0 0\n",
        ))
        .unwrap();
        assert_eq!(
            overlay.switch_action(0),
            CellAction::Keyboard {
                modifier: 0,
                keycode: 0x2c
            }
        );
        assert_eq!(
            overlay.switch_action(1),
            CellAction::Mouse {
                buttons: 1,
                dx: 0,
                dy: 0
            }
        );
        assert!(parse_overlay(&ini("[Overlay]\nName = x\n[Cells]\n[Switches]\n9 = key 0 4\n")).is_err());
        assert!(parse_overlay(&ini("[Overlay]\nName = x\n[Cells]\n[Switches]\n1 = key 0\n")).is_err());
    }

    #[test]
    fn test_parse_overlay_rejects_bad_input() {
        assert!(parse_overlay(&ini("[Cells]\na = 0 0 1 1 key 0 4\n")).is_err());
        assert!(parse_overlay(&ini("[Overlay]\nName = x\nNumber = 7\n[Cells]\n")).is_err());
        assert!(parse_overlay(&ini("[Overlay]\nName = x\n")).is_err());
        assert!(parse_overlay(&ini("[Overlay]\nName = x\n[Cells]\na = 22 0 4 1 key 0 4\n")).is_err());
        assert!(
            parse_overlay(&ini(
                "[Overlay]\nName = x\n[Cells]\na = 1 0 18446744073709551615 1 key 0 4\n"
            ))
            .is_err()
        );
    }

    #[test]
    fn test_load_directory() {
        let dir = std::env::temp_dir().join(format!("ikeysd-overlays-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("custom.overlay"),
            "[Overlay]\nName = Custom\n[Cells]\na = 0 0 2 2 key 0x02 0x04\n",
        )
        .unwrap();
        std::fs::write(dir.join("broken.overlay"), "[Overlay]\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let table = load_overlay_directory(&dir);
        let custom = table.by_name("Custom").unwrap();
        assert_eq!(
            custom.action(1, 1),
            CellAction::Keyboard {
                modifier: 0x02,
                keycode: 0x04
            }
        );
        /* the built-in alphabet overlay is still there */
        assert!(table.standard(crate::overlay::OVERLAY_ALPHABET).is_some());
        assert_eq!(table.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_directory_keeps_builtins() {
        let table = load_overlay_directory(Path::new("/nonexistent/ikeysd/overlays"));
        assert_eq!(table.len(), 1);
    }
}
