/* Event interpreter.
 *
 * Decodes inbound event frames into mutations of the live input state
 * (membrane matrix, switch array, sensor readings, firmware version, on/off
 * toggle) and reports what changed so the engine can run follow-ups. The
 * interpreter itself never queues commands. */

use tracing::{debug, trace, warn};

use crate::protocol::{EventCode, Frame, NUM_SENSORS, NUM_SWITCHES, RESOLUTION_COLS, RESOLUTION_ROWS};

/* Sensor threshold used until the EEPROM calibration record is valid. */
pub const DEFAULT_SENSOR_MIDPOINT: u8 = 150;

pub type Membrane = [[bool; RESOLUTION_COLS]; RESOLUTION_ROWS];

/* One membrane cell or switch whose value flipped. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputChange {
    Membrane { row: usize, col: usize, pressed: bool },
    Switch { number: u8, pressed: bool },
}

/* What an event did to the input state. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    Membrane { row: usize, col: usize, pressed: bool },
    Switch { number: u8, pressed: bool },
    /* Overlay candidate computed from the current sensor readings. */
    Candidate(u8),
    Version { major: u8, minor: u8 },
    EepromByte { data: u8, address: u16 },
    Toggle(bool),
    /* Correction pass finished; live state replaced, these cells changed. */
    Corrected(Vec<InputChange>),
    /* Event consumed with no visible effect. */
    None,
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    membrane: Membrane,
    switches: [bool; NUM_SWITCHES],
    sensors: [u8; NUM_SENSORS],
    midpoints: Option<[u8; NUM_SENSORS]>,
    version: Option<(u8, u8)>,
    toggle: Option<bool>,

    correct_membrane: Membrane,
    correct_switches: [bool; NUM_SWITCHES],
    correcting: bool,

    anomalies: u64,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            membrane: [[false; RESOLUTION_COLS]; RESOLUTION_ROWS],
            switches: [false; NUM_SWITCHES],
            sensors: [0; NUM_SENSORS],
            midpoints: None,
            version: None,
            toggle: None,
            correct_membrane: [[false; RESOLUTION_COLS]; RESOLUTION_ROWS],
            correct_switches: [false; NUM_SWITCHES],
            correcting: false,
            anomalies: 0,
        }
    }

    pub fn interpret(&mut self, frame: &Frame) -> Interpretation {
        let Some(code) = frame.event_code() else {
            self.anomaly(frame, "unknown event");
            return Interpretation::None;
        };
        trace!("Event {:?}: {:02x?}", code, frame.as_bytes());

        match code {
            EventCode::MembranePress | EventCode::MembraneRelease => {
                let pressed = code == EventCode::MembranePress;
                let (col, row) = (frame.byte(1) as usize, frame.byte(2) as usize);
                let Some(cell) = self.membrane.get_mut(row).and_then(|r| r.get_mut(col)) else {
                    self.anomaly(frame, "membrane cell out of range");
                    return Interpretation::None;
                };
                *cell = pressed;
                Interpretation::Membrane { row, col, pressed }
            }

            EventCode::Switch => {
                let number = frame.byte(1);
                let pressed = frame.byte(2) != 0;
                let Some(slot) = switch_index(number).and_then(|i| self.switches.get_mut(i)) else {
                    self.anomaly(frame, "switch out of range");
                    return Interpretation::None;
                };
                *slot = pressed;
                Interpretation::Switch { number, pressed }
            }

            EventCode::SensorChange => {
                let sensor = frame.byte(1) as usize;
                let Some(slot) = self.sensors.get_mut(sensor) else {
                    self.anomaly(frame, "sensor out of range");
                    return Interpretation::None;
                };
                *slot = frame.byte(2);
                Interpretation::Candidate(self.candidate())
            }

            EventCode::Version => {
                let (major, minor) = (frame.byte(1), frame.byte(2));
                self.version = Some((major, minor));
                debug!("Firmware version {major}.{minor}");
                Interpretation::Version { major, minor }
            }

            EventCode::EepromReadByte => Interpretation::EepromByte {
                data: frame.byte(1),
                address: frame.u16_le(2),
            },

            EventCode::OnOffSwitch => {
                let on = frame.byte(1) == 1;
                if self.toggle == Some(on) {
                    return Interpretation::None;
                }
                self.toggle = Some(on);
                Interpretation::Toggle(on)
            }

            EventCode::CorrectMembrane => {
                let (col, row) = (frame.byte(1) as usize, frame.byte(2) as usize);
                match self.correct_membrane.get_mut(row).and_then(|r| r.get_mut(col)) {
                    Some(cell) => *cell = true,
                    None => self.anomaly(frame, "correction cell out of range"),
                }
                Interpretation::None
            }

            EventCode::CorrectSwitch => {
                match switch_index(frame.byte(1)).and_then(|i| self.correct_switches.get_mut(i)) {
                    Some(slot) => *slot = true,
                    None => self.anomaly(frame, "correction switch out of range"),
                }
                Interpretation::None
            }

            EventCode::CorrectDone => Interpretation::Corrected(self.apply_correction()),

            EventCode::EepromRead
            | EventCode::AutopilotState
            | EventCode::Delay
            | EventCode::AllSensors => Interpretation::None,

            EventCode::Ack
            | EventCode::DeviceReady
            | EventCode::NoMoreEvents
            | EventCode::MembraneRepeat
            | EventCode::SwitchRepeat => {
                self.anomalies += 1;
                debug!("Unexpected {:?} event (anomaly #{})", code, self.anomalies);
                Interpretation::None
            }
        }
    }

    fn anomaly(&mut self, frame: &Frame, what: &str) {
        self.anomalies += 1;
        warn!("Ignoring {what}: {:02x?} (anomaly #{})", frame.as_bytes(), self.anomalies);
    }

    /* Bitmask of sensors reading above their midpoint. */
    pub fn candidate(&self) -> u8 {
        let midpoints = self.midpoints.unwrap_or([DEFAULT_SENSOR_MIDPOINT; NUM_SENSORS]);
        self.sensors
            .iter()
            .zip(midpoints)
            .enumerate()
            .filter(|(_, (value, mid))| **value > *mid)
            .fold(0u8, |acc, (i, _)| acc | (1 << i))
    }

    /* Switch to calibrated midpoints, (black + white) / 2 per sensor. */
    pub fn set_calibration(&mut self, black: &[u8; NUM_SENSORS], white: &[u8; NUM_SENSORS]) {
        let mut mid = [0u8; NUM_SENSORS];
        for (i, m) in mid.iter_mut().enumerate() {
            *m = ((u16::from(black[i]) + u16::from(white[i])) / 2) as u8;
        }
        debug!("Sensor midpoints {:?}", mid);
        self.midpoints = Some(mid);
    }

    /* Open a correction pass ahead of a CORRECT command. Returns false while
     * an earlier pass is still waiting for its CORRECT_DONE. */
    pub fn begin_correction(&mut self) -> bool {
        if self.correcting {
            return false;
        }
        self.reset_correction();
        self.correcting = true;
        true
    }

    fn reset_correction(&mut self) {
        self.correct_membrane = [[false; RESOLUTION_COLS]; RESOLUTION_ROWS];
        self.correct_switches = [false; NUM_SWITCHES];
        self.correcting = false;
    }

    fn apply_correction(&mut self) -> Vec<InputChange> {
        let mut changes = Vec::new();
        for (row, (live, scratch)) in self
            .membrane
            .iter()
            .zip(self.correct_membrane.iter())
            .enumerate()
        {
            for (col, (was, now)) in live.iter().zip(scratch.iter()).enumerate() {
                if was != now {
                    changes.push(InputChange::Membrane {
                        row,
                        col,
                        pressed: *now,
                    });
                }
            }
        }
        for (i, (was, now)) in self.switches.iter().zip(self.correct_switches.iter()).enumerate() {
            if was != now {
                changes.push(InputChange::Switch {
                    number: i as u8 + 1,
                    pressed: *now,
                });
            }
        }

        self.membrane = self.correct_membrane;
        self.switches = self.correct_switches;
        self.reset_correction();
        if !changes.is_empty() {
            debug!("Correction pass changed {} inputs", changes.len());
        }
        changes
    }

    pub fn membrane(&self) -> &Membrane {
        &self.membrane
    }

    pub fn is_pressed(&self, row: usize, col: usize) -> bool {
        self.membrane
            .get(row)
            .and_then(|r| r.get(col))
            .copied()
            .unwrap_or(false)
    }

    pub fn switches(&self) -> &[bool; NUM_SWITCHES] {
        &self.switches
    }

    /* Switch state by 1-based number. */
    pub fn switch(&self, number: u8) -> bool {
        switch_index(number)
            .and_then(|i| self.switches.get(i))
            .copied()
            .unwrap_or(false)
    }

    pub fn sensors(&self) -> &[u8; NUM_SENSORS] {
        &self.sensors
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        self.version
    }

    pub fn is_switched_on(&self) -> bool {
        self.toggle == Some(true)
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /* Release everything, abandoning any correction pass in flight. */
    pub fn clear_inputs(&mut self) {
        self.membrane = [[false; RESOLUTION_COLS]; RESOLUTION_ROWS];
        self.switches = [false; NUM_SWITCHES];
        self.reset_correction();
    }
}

fn switch_index(number: u8) -> Option<usize> {
    (number as usize).checked_sub(1).filter(|i| *i < NUM_SWITCHES)
}
