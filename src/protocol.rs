/* IntelliKeys wire protocol definitions.
 *
 * Every command and every event is a fixed 8-byte report:
 *   Command: buf[0] = opcode, buf[1..8] = opcode-specific parameters
 *   Event:   buf[0] = event code, buf[1..8] = payload
 *
 * Command opcodes below LOCAL_COMMAND_BASE travel to the device. Opcodes at or
 * above it never leave the host; the dispatcher consumes them. */

/* USB identity */
pub const IK_VID: u16 = 0x095e;
pub const IK_PID_FWLOAD: u16 = 0x0100;
pub const IK_PID_RUNNING: u16 = 0x0101;

pub const REPORT_LEN: usize = 8;

/* Membrane resolution (rows x columns) */
pub const RESOLUTION_ROWS: usize = 24;
pub const RESOLUTION_COLS: usize = 24;

pub const NUM_SWITCHES: usize = 6;
pub const NUM_SENSORS: usize = 3;
pub const NUM_LEDS: u8 = 9;

pub const DEVICE_COMMAND_MAX: u8 = 49;
pub const EVENT_BASE: u8 = 50;
pub const LOCAL_COMMAND_BASE: u8 = 100;

/* Commands understood by the device firmware. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceCommand {
    GetVersion = 1,
    Led = 2,
    Scan = 3,
    Tone = 4,
    GetEvent = 5,
    Init = 6,
    EepromRead = 7,
    EepromWrite = 8,
    OnOffSwitch = 9,
    Correct = 10,
    EepromReadByte = 11,
    ResetDevice = 12,
    StartAuto = 13,
    StopAuto = 14,
    AllLeds = 15,
    StartOutput = 16,
    StopOutput = 17,
    AllSensors = 18,
    ReflectKeystroke = 21,
    ReflectMouseMove = 22,
    GetSerialNumber = 40,
}

impl DeviceCommand {
    pub fn from_u8(code: u8) -> Option<Self> {
        let cmd = match code {
            1 => Self::GetVersion,
            2 => Self::Led,
            3 => Self::Scan,
            4 => Self::Tone,
            5 => Self::GetEvent,
            6 => Self::Init,
            7 => Self::EepromRead,
            8 => Self::EepromWrite,
            9 => Self::OnOffSwitch,
            10 => Self::Correct,
            11 => Self::EepromReadByte,
            12 => Self::ResetDevice,
            13 => Self::StartAuto,
            14 => Self::StopAuto,
            15 => Self::AllLeds,
            16 => Self::StartOutput,
            17 => Self::StopOutput,
            18 => Self::AllSensors,
            21 => Self::ReflectKeystroke,
            22 => Self::ReflectMouseMove,
            40 => Self::GetSerialNumber,
            _ => return None,
        };
        Some(cmd)
    }
}

/* Driver-internal commands. They share the queue with device commands so
 * that ordering (and DELAY pacing) is preserved, but never reach the wire. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocalCommand {
    Delay = 101,
    MouseMove = 102,
    MouseButton = 103,
    Keyboard = 104,
    KeyDone = 105,
    KeyStart = 106,
    KeyRepeat = 107,
    CpHelp = 108,
    CpListFeatures = 109,
    CpRefresh = 110,
    CpToggle = 111,
    KeyboardUnicode = 112,
    LiftAllModifiers = 113,
    CpReportRealtime = 114,
}

impl LocalCommand {
    pub fn from_u8(code: u8) -> Option<Self> {
        let cmd = match code {
            101 => Self::Delay,
            102 => Self::MouseMove,
            103 => Self::MouseButton,
            104 => Self::Keyboard,
            105 => Self::KeyDone,
            106 => Self::KeyStart,
            107 => Self::KeyRepeat,
            108 => Self::CpHelp,
            109 => Self::CpListFeatures,
            110 => Self::CpRefresh,
            111 => Self::CpToggle,
            112 => Self::KeyboardUnicode,
            113 => Self::LiftAllModifiers,
            114 => Self::CpReportRealtime,
            _ => return None,
        };
        Some(cmd)
    }
}

/* Events sent by the device. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    Ack = 51,
    MembranePress = 52,
    MembraneRelease = 53,
    Switch = 54,
    SensorChange = 55,
    Version = 56,
    EepromRead = 57,
    OnOffSwitch = 58,
    NoMoreEvents = 59,
    MembraneRepeat = 60,
    SwitchRepeat = 61,
    CorrectMembrane = 62,
    CorrectSwitch = 63,
    CorrectDone = 64,
    EepromReadByte = 65,
    DeviceReady = 66,
    AutopilotState = 67,
    Delay = 68,
    AllSensors = 69,
}

impl EventCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        let ev = match code {
            51 => Self::Ack,
            52 => Self::MembranePress,
            53 => Self::MembraneRelease,
            54 => Self::Switch,
            55 => Self::SensorChange,
            56 => Self::Version,
            57 => Self::EepromRead,
            58 => Self::OnOffSwitch,
            59 => Self::NoMoreEvents,
            60 => Self::MembraneRepeat,
            61 => Self::SwitchRepeat,
            62 => Self::CorrectMembrane,
            63 => Self::CorrectSwitch,
            64 => Self::CorrectDone,
            65 => Self::EepromReadByte,
            66 => Self::DeviceReady,
            67 => Self::AutopilotState,
            68 => Self::Delay,
            69 => Self::AllSensors,
            _ => return None,
        };
        Some(ev)
    }
}

/* Classification of a command frame by its opcode. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Device(DeviceCommand),
    Local(LocalCommand),
}

/* Key direction carried by KEYBOARD and MOUSE_BUTTON local commands. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyDirection {
    Down = 1,
    Up = 2,
}

impl KeyDirection {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Down),
            2 => Some(Self::Up),
            _ => None,
        }
    }
}

/* A single 8-byte report. Used for both directions. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame(pub [u8; REPORT_LEN]);

impl Frame {
    /* Build a frame from an opcode and up to 7 parameter bytes. */
    pub fn new(opcode: u8, params: &[u8]) -> Self {
        let mut buf = [0u8; REPORT_LEN];
        buf[0] = opcode;
        let copy_len = params.len().min(REPORT_LEN - 1);
        buf[1..1 + copy_len].copy_from_slice(&params[..copy_len]);
        Self(buf)
    }

    pub fn device(cmd: DeviceCommand, params: &[u8]) -> Self {
        Self::new(cmd as u8, params)
    }

    pub fn local(cmd: LocalCommand, params: &[u8]) -> Self {
        Self::new(cmd as u8, params)
    }

    /* Parse a raw inbound buffer. Returns `None` unless it is exactly one report. */
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; REPORT_LEN] = buf.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    /* Parameter byte `n` (1-based, like the firmware documentation). */
    pub fn byte(&self, n: usize) -> u8 {
        self.0.get(n).copied().unwrap_or(0)
    }

    /* Little-endian u16 starting at parameter byte `n`. */
    pub fn u16_le(&self, n: usize) -> u16 {
        u16::from_le_bytes([self.byte(n), self.byte(n + 1)])
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_LEN] {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.opcode() >= LOCAL_COMMAND_BASE
    }

    /* Classify the opcode as a known device or local command. */
    pub fn command_kind(&self) -> Option<CommandKind> {
        let op = self.opcode();
        if op >= LOCAL_COMMAND_BASE {
            LocalCommand::from_u8(op).map(CommandKind::Local)
        } else if op <= DEVICE_COMMAND_MAX {
            DeviceCommand::from_u8(op).map(CommandKind::Device)
        } else {
            None
        }
    }

    pub fn event_code(&self) -> Option<EventCode> {
        EventCode::from_u8(self.opcode())
    }
}

/* ------------------------------------------------------------------ */
/* Command builders                                                    */
/* ------------------------------------------------------------------ */

pub fn delay(ms: u16) -> Frame {
    Frame::local(LocalCommand::Delay, &ms.to_le_bytes())
}

pub fn set_led(number: u8, on: bool) -> Frame {
    Frame::device(DeviceCommand::Led, &[number, u8::from(on)])
}

pub fn tone(frequency: u8, volume: u8) -> Frame {
    Frame::device(DeviceCommand::Tone, &[frequency, volume])
}

/* Ask for one byte of EEPROM at `address` (lsb, msb). */
pub fn eeprom_read_byte(address: u16) -> Frame {
    let [lsb, msb] = address.to_le_bytes();
    Frame::device(DeviceCommand::EepromReadByte, &[lsb, msb])
}

/* Local KEYBOARD command: `(code, direction, delay-after ms LE)`. */
pub fn keyboard(code: u8, direction: KeyDirection, delay_after_ms: u16) -> Frame {
    let [lo, hi] = delay_after_ms.to_le_bytes();
    Frame::local(LocalCommand::Keyboard, &[code, direction as u8, lo, hi])
}

pub fn mouse_button(buttons: u8, direction: KeyDirection) -> Frame {
    Frame::local(LocalCommand::MouseButton, &[buttons, direction as u8])
}

pub fn reflect_keystroke(modifier: u8, keycodes: &[u8; 6]) -> Frame {
    let mut params = [0u8; 7];
    params[0] = modifier;
    params[1..].copy_from_slice(keycodes);
    Frame::device(DeviceCommand::ReflectKeystroke, &params)
}

pub fn reflect_mouse(buttons: u8, dx: i8, dy: i8) -> Frame {
    Frame::device(
        DeviceCommand::ReflectMouseMove,
        &[buttons, dx.to_le_bytes()[0], dy.to_le_bytes()[0]],
    )
}
