/* Calibration record reader.
 *
 * The device stores its serial number and light-sensor calibration at the
 * top of EEPROM. The record is fetched one byte per request; lost requests
 * are simply re-issued after the retry interval, so arrival order and
 * duplicates do not matter. */

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::{self, Frame, NUM_SENSORS};

pub const EEPROM_BASE: u16 = 0x1f80;
pub const SERIAL_LEN: usize = 29;
pub const RECORD_LEN: usize = SERIAL_LEN + 2 * NUM_SENSORS;
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

const SERIAL_PREFIX: &[u8] = b"C-";

/* Decoded record, available once every byte checked out. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    pub serial: [u8; SERIAL_LEN],
    pub black: [u8; NUM_SENSORS],
    pub white: [u8; NUM_SENSORS],
}

impl Calibration {
    fn from_bytes(bytes: &[u8; RECORD_LEN]) -> Self {
        let mut serial = [0u8; SERIAL_LEN];
        let mut black = [0u8; NUM_SENSORS];
        let mut white = [0u8; NUM_SENSORS];
        serial.copy_from_slice(&bytes[..SERIAL_LEN]);
        black.copy_from_slice(&bytes[SERIAL_LEN..SERIAL_LEN + NUM_SENSORS]);
        white.copy_from_slice(&bytes[SERIAL_LEN + NUM_SENSORS..]);
        Self {
            serial,
            black,
            white,
        }
    }

    /* Serial number up to the first NUL, lossy for non-ASCII bytes. */
    pub fn serial_number(&self) -> String {
        let end = self.serial.iter().position(|b| *b == 0).unwrap_or(SERIAL_LEN);
        String::from_utf8_lossy(&self.serial[..end]).into_owned()
    }

    /* Early IntelliSwitch units report the IntelliKeys identity; their
     * serial is the bare prefix with the rest zeroed. */
    pub fn is_intelliswitch_v1(&self) -> bool {
        self.serial.starts_with(SERIAL_PREFIX)
            && self.serial[SERIAL_PREFIX.len()..].iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /* Byte recorded; record still incomplete or not yet valid. */
    Stored,
    /* Record is already valid, byte dropped. */
    Ignored,
    /* Address does not belong to the record. */
    OutOfRange,
    /* This byte completed a valid record. */
    Validated(Calibration),
}

#[derive(Debug, Clone)]
pub struct EepromReader {
    data: [u8; RECORD_LEN],
    byte_valid: [bool; RECORD_LEN],
    requested_at: [Option<Instant>; RECORD_LEN],
    valid: bool,
    prefix_warned: bool,
}

impl Default for EepromReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EepromReader {
    pub fn new() -> Self {
        Self {
            data: [0; RECORD_LEN],
            byte_valid: [false; RECORD_LEN],
            requested_at: [None; RECORD_LEN],
            valid: false,
            prefix_warned: false,
        }
    }

    /* Read requests for every missing byte whose last request timed out. */
    pub fn poll(&mut self, now: Instant) -> Vec<Frame> {
        if self.valid {
            return Vec::new();
        }

        let mut frames = Vec::new();
        for (i, (valid, requested)) in self
            .byte_valid
            .iter()
            .zip(self.requested_at.iter_mut())
            .enumerate()
        {
            if *valid {
                continue;
            }
            let due = match requested {
                Some(at) => now.saturating_duration_since(*at) >= RETRY_INTERVAL,
                None => true,
            };
            if due {
                frames.push(protocol::eeprom_read_byte(EEPROM_BASE + i as u16));
                *requested = Some(now);
            }
        }
        if !frames.is_empty() {
            debug!("Requesting {} calibration bytes", frames.len());
        }
        frames
    }

    /* Record one byte reported by the device. */
    pub fn store(&mut self, data: u8, address: u16) -> StoreOutcome {
        if self.valid {
            return StoreOutcome::Ignored;
        }
        let index = match address.checked_sub(EEPROM_BASE).map(usize::from) {
            Some(i) if i < RECORD_LEN => i,
            _ => {
                warn!("EEPROM byte for address 0x{address:04x} is outside the calibration record");
                return StoreOutcome::OutOfRange;
            }
        };

        self.data[index] = data;
        self.byte_valid[index] = true;

        if !self.byte_valid.iter().all(|v| *v) {
            return StoreOutcome::Stored;
        }
        if !self.data.starts_with(SERIAL_PREFIX) {
            if !self.prefix_warned {
                warn!(
                    "Calibration record complete but serial prefix is {:02x?}",
                    &self.data[..SERIAL_PREFIX.len()]
                );
                self.prefix_warned = true;
            }
            return StoreOutcome::Stored;
        }

        self.valid = true;
        let calibration = Calibration::from_bytes(&self.data);
        info!("EEPROM data valid, serial {}", calibration.serial_number());
        StoreOutcome::Validated(calibration)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn byte_is_valid(&self, index: usize) -> bool {
        self.byte_valid.get(index).copied().unwrap_or(false)
    }

    pub fn missing(&self) -> usize {
        self.byte_valid.iter().filter(|v| !**v).count()
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.valid.then(|| Calibration::from_bytes(&self.data))
    }
}
