/* Per-device protocol engine.
 *
 * `IntelliKeys` owns every piece of per-device state and wires the protocol
 * components together. It is synchronous and clock-driven: the owner feeds
 * it inbound reports through `handle_report` and calls `tick` periodically
 * with a sink for outbound frames. Observers pick up `DeviceEvent`s with
 * `drain_events`. */

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::dispatcher::{DEFAULT_BUDGET, DispatchOutcome, Dispatcher};
use crate::eeprom::{Calibration, EepromReader, StoreOutcome};
use crate::error::CommandError;
use crate::interpreter::{InputChange, Interpretation, Interpreter};
use crate::modifier::{KeyTransition, ModifierKey, ModifierState, Modifiers};
use crate::overlay::{
    self, CellAction, MOUSE_BUTTON_MASK, MOUSE_CLICK_HOLD, MOUSE_DOUBLE_CLICK, Overlay,
    OverlayTable,
};
use crate::protocol::{
    self, CommandKind, DeviceCommand, Frame, KeyDirection, LocalCommand, NUM_LEDS,
};
use crate::queue::{CommandQueue, DEFAULT_CAPACITY};
use crate::report::{self, KeyboardReport, MAX_KEYCODES, MouseReport};
use crate::settings::{IndicatorLights, Settings};
use crate::settle::{DEFAULT_SETTLE_WINDOW, OverlaySettler};
use crate::transport::ReportSink;

pub const DEFAULT_LED_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MOUSE_REPEAT: Duration = Duration::from_millis(40);
pub const DEFAULT_CORRECTION_INTERVAL: Duration = Duration::from_millis(500);

/* Pause after enabling the scanner before asking for sensor readings. */
const SCAN_START_DELAY_MS: u16 = 250;

/* Power toggle sweep */
const SWEEP_LOW: u8 = 200;
const SWEEP_HIGH: u8 = 250;
const SWEEP_DURATION_MS: u32 = 200;
const SWEEP_STEP_MS: u32 = 5;
const SWEEP_VOLUME: u8 = 2;

const KEY_CLICK_FREQUENCY: u8 = 180;
const KEY_CLICK_MS: u16 = 10;

const OVERLAY_TONE_FREQUENCY: u8 = 120;
const OVERLAY_TONE_MS: u16 = 100;
const OVERLAY_FLASH_MS: u16 = 100;

const DOUBLE_CLICK_GAP_MS: u16 = 50;

const LEFT_BUTTON: u8 = 0x01;

/* HID usages of the eight modifier keys, LeftControl through RightGUI. */
const USAGE_MODIFIER_FIRST: u8 = 0xe0;
const USAGE_MODIFIER_LAST: u8 = 0xe7;

const LED_COUNT: usize = NUM_LEDS as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub dispatch_budget: usize,
    /* `None` disables the periodic correction pass. */
    pub correction_interval: Option<Duration>,
    pub mouse_repeat: Duration,
    pub settle_window: Duration,
    pub led_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_budget: DEFAULT_BUDGET,
            correction_interval: Some(DEFAULT_CORRECTION_INTERVAL),
            mouse_repeat: DEFAULT_MOUSE_REPEAT,
            settle_window: DEFAULT_SETTLE_WINDOW,
            led_interval: DEFAULT_LED_INTERVAL,
            queue_capacity: DEFAULT_CAPACITY,
        }
    }
}

/* Things observers care about. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    MembraneChanged { row: usize, col: usize, pressed: bool },
    SwitchChanged { number: u8, pressed: bool },
    ToggleChanged(bool),
    /* Committed standard overlay, `None` when the slot is empty. */
    OverlayChanged(Option<u8>),
    FirmwareVersion { major: u8, minor: u8 },
    CalibrationValid(String),
    ControlPanelRefresh,
}

pub struct IntelliKeys {
    config: EngineConfig,
    queue: Arc<CommandQueue>,
    dispatcher: Dispatcher,
    interpreter: Interpreter,
    settler: OverlaySettler,
    eeprom: EepromReader,
    modifiers: Modifiers,
    overlays: Arc<OverlayTable>,
    settings: Settings,

    open: bool,
    calibration: Option<Calibration>,

    /* State driven by local KEYBOARD / MOUSE_BUTTON commands */
    held_modifiers: u8,
    held_keys: Vec<u8>,
    held_buttons: u8,
    releases: Vec<(Instant, u8)>,

    last_keyboard: KeyboardReport,
    last_mouse: MouseReport,
    last_mouse_sent: Option<Instant>,

    /* What the device was last told, per LED. */
    leds: [Option<bool>; LED_COUNT],
    last_led_refresh: Option<Instant>,
    next_correction: Option<Instant>,

    events: Vec<DeviceEvent>,
}

impl IntelliKeys {
    pub fn new(config: EngineConfig, overlays: Arc<OverlayTable>, settings: Settings) -> Self {
        Self {
            queue: Arc::new(CommandQueue::with_capacity(config.queue_capacity)),
            dispatcher: Dispatcher::new(),
            interpreter: Interpreter::new(),
            settler: OverlaySettler::new(config.settle_window),
            eeprom: EepromReader::new(),
            modifiers: Modifiers::default(),
            overlays,
            settings,
            open: false,
            calibration: None,
            held_modifiers: 0,
            held_keys: Vec::new(),
            held_buttons: 0,
            releases: Vec::new(),
            last_keyboard: KeyboardReport::default(),
            last_mouse: MouseReport::default(),
            last_mouse_sent: None,
            leds: [None; LED_COUNT],
            last_led_refresh: None,
            next_correction: None,
            events: Vec::new(),
            config,
        }
    }

    /* Queue the start-up sequence and mark the device open. */
    pub fn start(&mut self, now: Instant) {
        info!("Starting IntelliKeys");

        /* interrupt-driven event mode */
        self.post_internal(Frame::device(DeviceCommand::Init, &[0]));
        self.post_internal(Frame::device(DeviceCommand::Scan, &[1]));
        self.post_internal(protocol::delay(SCAN_START_DELAY_MS));
        self.post_internal(Frame::device(DeviceCommand::AllSensors, &[]));
        self.post_internal(Frame::device(DeviceCommand::GetVersion, &[]));

        self.reset_keyboard();
        self.reset_mouse();

        self.next_correction = self.config.correction_interval.map(|i| now + i);
        self.open = true;
    }

    /* Public enqueue. Rejections are logged by the queue as well. */
    pub fn post(&self, frame: Frame) -> Result<(), CommandError> {
        self.queue.enqueue(frame)
    }

    /* Shared handle for producers outside the owning task. */
    pub fn queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.queue)
    }

    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /* ------------------------------------------------------------------ */
    /* Inbound                                                             */
    /* ------------------------------------------------------------------ */

    pub fn handle_report(&mut self, frame: &Frame, now: Instant) {
        match self.interpreter.interpret(frame) {
            Interpretation::Membrane { row, col, pressed } => {
                self.events
                    .push(DeviceEvent::MembraneChanged { row, col, pressed });
                self.reassess(now);
                if pressed {
                    self.on_press(row, col, now);
                }
            }
            Interpretation::Switch { number, pressed } => {
                debug!("Switch {number} {}", if pressed { "down" } else { "up" });
                self.events
                    .push(DeviceEvent::SwitchChanged { number, pressed });
                self.reassess(now);
            }
            Interpretation::Candidate(candidate) => self.settler.observe(candidate, now),
            Interpretation::Version { major, minor } => {
                info!("IntelliKeys firmware {major}.{minor}");
                self.events
                    .push(DeviceEvent::FirmwareVersion { major, minor });
            }
            Interpretation::EepromByte { data, address } => self.store_eeprom(data, address, now),
            Interpretation::Toggle(on) => self.on_toggle(on),
            Interpretation::Corrected(changes) => {
                for change in changes {
                    self.events.push(match change {
                        InputChange::Membrane { row, col, pressed } => {
                            DeviceEvent::MembraneChanged { row, col, pressed }
                        }
                        InputChange::Switch { number, pressed } => {
                            DeviceEvent::SwitchChanged { number, pressed }
                        }
                    });
                }
                self.reassess(now);
            }
            Interpretation::None => {}
        }
    }

    fn store_eeprom(&mut self, data: u8, address: u16, now: Instant) {
        let StoreOutcome::Validated(calibration) = self.eeprom.store(data, address) else {
            return;
        };

        self.interpreter
            .set_calibration(&calibration.black, &calibration.white);
        /* re-evaluate the overlay against the calibrated thresholds */
        self.settler.observe(self.interpreter.candidate(), now);

        if calibration.is_intelliswitch_v1() {
            info!("Device identifies as an IntelliSwitch (v1)");
        }
        self.events
            .push(DeviceEvent::CalibrationValid(calibration.serial_number()));
        self.calibration = Some(calibration);
        self.post_internal(Frame::local(LocalCommand::CpRefresh, &[]));
    }

    /* Press edge on a membrane cell: latches, synthesized clicks, key click. */
    fn on_press(&mut self, row: usize, col: usize, now: Instant) {
        if !self.is_active() {
            return;
        }
        let Some(action) = self.active_overlay().map(|o| o.action(row, col)) else {
            return;
        };
        if action == CellAction::None {
            return;
        }

        if self.settings.key_sound > 0 {
            self.post_internal(protocol::tone(KEY_CLICK_FREQUENCY, self.settings.key_sound));
            self.post_internal(protocol::delay(KEY_CLICK_MS));
            self.post_internal(protocol::tone(KEY_CLICK_FREQUENCY, 0));
        }

        if let Some(bits) = action.modifier_only() {
            self.execute_modifiers(bits, now);
            return;
        }

        if let CellAction::Mouse { buttons, .. } = action {
            if buttons & MOUSE_CLICK_HOLD != 0 {
                self.modifiers.mouse_down.toggle_state(now);
                debug!("Mouse button {}", self.modifiers.mouse_down.state());
                self.reassess(now);
            } else if buttons & MOUSE_DOUBLE_CLICK != 0 {
                let buttons = match buttons & MOUSE_BUTTON_MASK {
                    0 => LEFT_BUTTON,
                    b => b,
                };
                for direction in [KeyDirection::Down, KeyDirection::Up].repeat(2) {
                    self.post_internal(protocol::mouse_button(buttons, direction));
                    self.post_internal(protocol::delay(DOUBLE_CLICK_GAP_MS));
                }
            }
        }
    }

    fn execute_modifiers(&mut self, bits: u8, now: Instant) {
        let policy = self.settings.shift_key_action;
        for key in ModifierKey::ALL {
            let side = bits & key.mask();
            if side == 0 {
                continue;
            }
            let usage = USAGE_MODIFIER_FIRST + side.trailing_zeros() as u8;
            let frame = match self.modifiers.latch_mut(key).execute(policy, now) {
                Some(KeyTransition::Down) => protocol::keyboard(usage, KeyDirection::Down, 0),
                Some(KeyTransition::Up) => protocol::keyboard(usage, KeyDirection::Up, 0),
                Some(KeyTransition::Tap(hold)) => {
                    let ms = u16::try_from(hold.as_millis()).unwrap_or(u16::MAX);
                    protocol::keyboard(usage, KeyDirection::Down, ms)
                }
                None => continue,
            };
            self.post_internal(frame);
        }
    }

    fn on_toggle(&mut self, on: bool) {
        info!("IntelliKeys switched {}", if on { "on" } else { "off" });
        self.events.push(DeviceEvent::ToggleChanged(on));

        /* nothing queued or held survives a power toggle */
        self.purge();

        if on {
            self.sweep_sound(SWEEP_LOW, SWEEP_HIGH, SWEEP_DURATION_MS);
        } else {
            self.sweep_sound(SWEEP_HIGH, SWEEP_LOW, SWEEP_DURATION_MS);
        }

        self.reset_keyboard();
        self.reset_mouse();
    }

    /* Drop queued commands, the dispatcher's delay and every held input. */
    fn purge(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.dispatcher.reset();
        self.interpreter.clear_inputs();
        self.held_modifiers = 0;
        self.held_keys.clear();
        self.held_buttons = 0;
        self.releases.clear();
        if dropped > 0 {
            debug!("Dropped {dropped} queued commands");
        }
    }

    /* Detach: forget the device. `start` brings it back. */
    pub fn stop(&mut self) {
        info!("Stopping IntelliKeys");
        self.purge();
        self.settler.reset();
        self.modifiers.lift_all();
        self.last_keyboard = KeyboardReport::default();
        self.last_mouse = MouseReport::default();
        self.last_mouse_sent = None;
        self.last_led_refresh = None;
        self.leds = [None; LED_COUNT];
        self.next_correction = None;
        self.open = false;
    }

    /* Rising or falling tone, chasing the LEDs round while it plays. */
    fn sweep_sound(&mut self, start: u8, end: u8, duration_ms: u32) {
        let loops = (duration_ms / SWEEP_STEP_MS).max(1) as i32;
        let (start, end) = (i32::from(start), i32::from(end));
        let step = (end - start) * 100 / loops;

        let mut frequency = start;
        let mut light = 0u8;
        let mut on = true;
        for i in 0..loops {
            frequency = start + i * step / 100;
            self.post_internal(protocol::tone(frequency.clamp(0, 255) as u8, SWEEP_VOLUME));

            if (i + 1) % 5 == 0 {
                light += 1;
                if light > NUM_LEDS {
                    on = !on;
                    light = 1;
                }
                self.post_internal(protocol::set_led(light, on));
            }
        }
        self.post_internal(protocol::tone(frequency.clamp(0, 255) as u8, 0));

        for n in 1..=NUM_LEDS {
            self.post_internal(protocol::set_led(n, false));
        }
        self.leds = [Some(false); LED_COUNT];
    }

    fn on_overlay_change(&mut self) {
        let current = self.settler.current_overlay();
        info!(
            "Overlay changed: {}",
            current.map(overlay::standard_name).unwrap_or("none")
        );

        self.reset_keyboard();
        self.reset_mouse();

        self.post_internal(protocol::tone(OVERLAY_TONE_FREQUENCY, SWEEP_VOLUME));
        self.post_internal(protocol::delay(OVERLAY_TONE_MS));
        self.post_internal(protocol::tone(OVERLAY_TONE_FREQUENCY, 0));

        let (flashes, ms) = if self.interpreter.is_switched_on() {
            (3, OVERLAY_FLASH_MS)
        } else {
            (1, OVERLAY_FLASH_MS / 2)
        };
        for _ in 0..flashes {
            self.post_internal(Frame::device(DeviceCommand::AllLeds, &[1]));
            self.post_internal(protocol::delay(ms));
            self.post_internal(Frame::device(DeviceCommand::AllLeds, &[0]));
            self.post_internal(protocol::delay(ms));
        }
        self.leds = [Some(false); LED_COUNT];

        self.events.push(DeviceEvent::OverlayChanged(current));
    }

    /* ------------------------------------------------------------------ */
    /* Periodic                                                            */
    /* ------------------------------------------------------------------ */

    pub fn tick(&mut self, now: Instant, sink: &mut dyn ReportSink) -> DispatchOutcome {
        if self.open {
            if self.settler.settle(now).is_some() {
                self.on_overlay_change();
            }

            if self.interpreter.is_switched_on()
                && self
                    .last_led_refresh
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.config.led_interval)
            {
                self.refresh_leds();
                self.last_led_refresh = Some(now);
            }

            for frame in self.eeprom.poll(now) {
                self.post_internal(frame);
            }

            if let (Some(interval), Some(due)) = (self.config.correction_interval, self.next_correction) {
                if now >= due {
                    self.correct();
                    self.next_correction = Some(now + interval);
                }
            }

            if self.last_mouse.has_motion()
                && self
                    .last_mouse_sent
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.config.mouse_repeat)
            {
                self.post_internal(self.last_mouse.to_frame());
                self.last_mouse_sent = Some(now);
            }

            let (due, pending): (Vec<_>, Vec<_>) =
                self.releases.drain(..).partition(|(at, _)| *at <= now);
            self.releases = pending;
            if !due.is_empty() {
                for (_, code) in due {
                    self.release_key(code, Release::Scheduled);
                }
                self.reassess(now);
            }
        }

        let mut local = Vec::new();
        let outcome = self.dispatcher.dispatch(
            now,
            &self.queue,
            sink,
            self.config.dispatch_budget,
            &mut local,
        );
        for frame in local {
            self.execute_local(&frame, now);
        }
        outcome
    }

    /* Ask the device to resend its full input state. */
    fn correct(&mut self) {
        if !self.interpreter.begin_correction() {
            debug!("Correction pass still outstanding, skipping");
            return;
        }
        trace!("Requesting correction pass");
        self.post_internal(Frame::device(DeviceCommand::Correct, &[]));
    }

    fn refresh_leds(&mut self) {
        let wanted = self.indicator_state();
        for (i, on) in wanted.into_iter().enumerate() {
            if self.leds[i] != Some(on) {
                self.leds[i] = Some(on);
                self.post_internal(protocol::set_led(i as u8 + 1, on));
            }
        }
    }

    /* Desired state of LED 1..=9. Host caps and num lock are not reported
     * back to the device, so their lights stay dark. */
    fn indicator_state(&self) -> [bool; LED_COUNT] {
        let active = |key| self.modifiers.latch(key).state().is_active();
        let shift = active(ModifierKey::Shift);
        let alt = active(ModifierKey::Alt);
        let control = active(ModifierKey::Control) || active(ModifierKey::Command);
        let mouse = self.modifiers.mouse_down.state().is_active();
        let (caps, num) = (false, false);

        match self.settings.indicator_lights {
            IndicatorLights::Six => [shift, alt, false, caps, control, false, mouse, num, false],
            IndicatorLights::Three => [shift, false, shift, caps, false, caps, mouse, false, mouse],
        }
    }

    /* ------------------------------------------------------------------ */
    /* Local commands                                                      */
    /* ------------------------------------------------------------------ */

    fn execute_local(&mut self, frame: &Frame, now: Instant) {
        let Some(CommandKind::Local(cmd)) = frame.command_kind() else {
            return;
        };

        match cmd {
            LocalCommand::Keyboard => {
                let code = frame.byte(1);
                match KeyDirection::from_u8(frame.byte(2)) {
                    Some(KeyDirection::Down) => {
                        self.hold_key(code);
                        let after = frame.u16_le(3);
                        if after > 0 {
                            self.releases
                                .push((now + Duration::from_millis(u64::from(after)), code));
                        }
                    }
                    Some(KeyDirection::Up) => self.release_key(code, Release::Explicit),
                    None => {
                        warn!("KEYBOARD command with direction {}", frame.byte(2));
                        return;
                    }
                }
                self.reassess(now);
            }
            LocalCommand::MouseButton => {
                let buttons = frame.byte(1) & MOUSE_BUTTON_MASK;
                match KeyDirection::from_u8(frame.byte(2)) {
                    Some(KeyDirection::Down) => self.held_buttons |= buttons,
                    Some(KeyDirection::Up) => self.held_buttons &= !buttons,
                    None => {
                        warn!("MOUSE_BUTTON command with direction {}", frame.byte(2));
                        return;
                    }
                }
                self.reassess(now);
            }
            LocalCommand::LiftAllModifiers => {
                self.modifiers.lift_all();
                self.held_modifiers = 0;
                self.held_keys.clear();
                self.releases.clear();
                self.reassess(now);
            }
            LocalCommand::CpRefresh => self.events.push(DeviceEvent::ControlPanelRefresh),
            other => debug!("Local command {:?} has no handler", other),
        }
    }

    fn hold_key(&mut self, code: u8) {
        if let Some(bit) = modifier_bit(code) {
            self.held_modifiers |= bit;
        } else if code != 0 && !self.held_keys.contains(&code) && self.held_keys.len() < MAX_KEYCODES
        {
            self.held_keys.push(code);
        }
    }

    fn release_key(&mut self, code: u8, release: Release) {
        let Some(bit) = modifier_bit(code) else {
            self.held_keys.retain(|k| *k != code);
            return;
        };
        match ModifierKey::ALL.into_iter().find(|k| k.mask() & bit != 0) {
            /* either side releases the key */
            Some(key) => {
                self.held_modifiers &= !key.mask();
                /* a no-latch tap ends on its own and leaves the latch set */
                if release == Release::Explicit {
                    self.modifiers
                        .latch_mut(key)
                        .set_state(ModifierState::Off);
                }
            }
            None => self.held_modifiers &= !bit,
        }
    }

    /* ------------------------------------------------------------------ */
    /* Reports                                                             */
    /* ------------------------------------------------------------------ */

    /* Rebuild both reports and post whichever changed. */
    fn reassess(&mut self, now: Instant) {
        let (mut kb, mut mouse) = if self.is_active() {
            report::build(
                self.interpreter.membrane(),
                self.interpreter.switches(),
                self.active_overlay(),
            )
        } else {
            (KeyboardReport::default(), MouseReport::default())
        };

        if self.is_active() {
            kb.modifier |= self.held_modifiers;
            for code in &self.held_keys {
                if kb.keycodes().any(|k| k == *code) {
                    continue;
                }
                if let Some(slot) = kb.keys.iter_mut().find(|k| **k == 0) {
                    *slot = *code;
                }
            }
            mouse.buttons |= self.held_buttons;
            if self.modifiers.mouse_down.state().is_active() {
                mouse.buttons |= LEFT_BUTTON;
            }
        }

        if kb != self.last_keyboard {
            trace!("Keyboard report {:?}", kb);
            self.last_keyboard = kb;
            self.post_internal(kb.to_frame());
        }
        if mouse != self.last_mouse {
            trace!("Mouse report {:?}", mouse);
            self.last_mouse = mouse;
            self.post_internal(mouse.to_frame());
            self.last_mouse_sent = Some(now);
        }
    }

    fn reset_keyboard(&mut self) {
        self.last_keyboard = KeyboardReport::default();
        self.post_internal(self.last_keyboard.to_frame());
        self.post_internal(Frame::local(LocalCommand::LiftAllModifiers, &[]));
    }

    fn reset_mouse(&mut self) {
        self.last_mouse = MouseReport::default();
        self.last_mouse_sent = None;
        self.held_buttons = 0;
        self.post_internal(self.last_mouse.to_frame());
    }

    fn post_internal(&self, frame: Frame) {
        /* overflow is already logged by the queue; the frame is lost */
        let _ = self.queue.enqueue(frame);
    }

    fn is_active(&self) -> bool {
        self.open && self.interpreter.is_switched_on()
    }

    fn active_overlay(&self) -> Option<&Overlay> {
        self.overlays.resolve(
            self.settler.current_overlay(),
            self.settings.use_this_overlay.as_deref(),
        )
    }

    /* ------------------------------------------------------------------ */
    /* Accessors                                                           */
    /* ------------------------------------------------------------------ */

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_switched_on(&self) -> bool {
        self.interpreter.is_switched_on()
    }

    pub fn current_overlay(&self) -> Option<u8> {
        self.settler.current_overlay()
    }

    /* Name of the overlay reports are built from, if any. */
    pub fn active_overlay_name(&self) -> Option<&str> {
        self.active_overlay().map(|o| o.name.as_str())
    }

    pub fn firmware_version(&self) -> Option<(u8, u8)> {
        self.interpreter.version()
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn serial_number(&self) -> Option<String> {
        self.calibration.as_ref().map(Calibration::serial_number)
    }

    pub fn is_intelliswitch(&self) -> bool {
        self.calibration
            .as_ref()
            .is_some_and(Calibration::is_intelliswitch_v1)
    }

    pub fn modifier_states(&self) -> Vec<(String, String)> {
        self.modifiers.states()
    }

    pub fn switch(&self, number: u8) -> bool {
        self.interpreter.switch(number)
    }

    pub fn anomalies(&self) -> u64 {
        self.interpreter.anomalies()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /* Apply new user settings. A different overlay override releases
     * everything so no key stays stuck across the switch. */
    pub fn set_settings(&mut self, settings: Settings) {
        if settings.indicator_lights != self.settings.indicator_lights {
            self.leds = [None; LED_COUNT];
        }
        let overlay_changed = settings.use_this_overlay != self.settings.use_this_overlay;
        self.settings = settings;

        if overlay_changed && self.open {
            debug!(
                "Overlay override now {:?}",
                self.settings.use_this_overlay.as_deref()
            );
            self.reset_keyboard();
            self.reset_mouse();
        }
    }
}

/* Where a key-up came from. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /* KEYBOARD up command */
    Explicit,
    /* hold time of a KEYBOARD down ran out */
    Scheduled,
}

fn modifier_bit(code: u8) -> Option<u8> {
    (USAGE_MODIFIER_FIRST..=USAGE_MODIFIER_LAST)
        .contains(&code)
        .then(|| 1 << (code - USAGE_MODIFIER_FIRST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::{EEPROM_BASE, RECORD_LEN, SERIAL_LEN};
    use crate::modifier::ShiftKeyAction;
    use crate::protocol::EventCode;
    use crate::transport::testing::RecordingSink;

    const STEP: Duration = Duration::from_millis(5);

    struct Rig {
        ik: IntelliKeys,
        sink: RecordingSink,
        now: Instant,
    }

    impl Rig {
        fn with(config: EngineConfig, table: OverlayTable, settings: Settings) -> Self {
            let mut ik = IntelliKeys::new(config, Arc::new(table), settings);
            let now = Instant::now();
            ik.start(now);
            Self {
                ik,
                sink: RecordingSink::ready(),
                now,
            }
        }

        fn new() -> Self {
            Self::with(quiet_config(), OverlayTable::builtin(), Settings::default())
        }

        fn advance(&mut self, ms: u64) {
            for _ in 0..ms / 5 {
                self.now += STEP;
                self.ik.tick(self.now, &mut self.sink);
            }
        }

        fn event(&mut self, code: EventCode, params: &[u8]) {
            self.ik
                .handle_report(&Frame::new(code as u8, params), self.now);
        }

        fn press(&mut self, row: u8, col: u8) {
            self.event(EventCode::MembranePress, &[col, row]);
        }

        fn release(&mut self, row: u8, col: u8) {
            self.event(EventCode::MembraneRelease, &[col, row]);
        }

        fn sent(&self, opcode: DeviceCommand) -> Vec<Frame> {
            self.sink
                .sent
                .iter()
                .filter(|f| f.opcode() == opcode as u8)
                .copied()
                .collect()
        }

        fn last_keyboard(&self) -> Option<Frame> {
            self.sent(DeviceCommand::ReflectKeystroke).last().copied()
        }

        fn clear(&mut self) {
            self.sink.sent.clear();
            self.ik.drain_events();
        }

        /* Switch on and slide in the alphabet overlay (sensors 0 and 1 lit). */
        fn switch_on_with_alphabet(&mut self) {
            self.event(EventCode::OnOffSwitch, &[1]);
            self.event(EventCode::SensorChange, &[0, 200]);
            self.event(EventCode::SensorChange, &[1, 200]);
            /* settle window plus the recognition flashes */
            self.advance(2000);
            self.clear();
        }
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            dispatch_budget: 64,
            correction_interval: None,
            ..EngineConfig::default()
        }
    }

    fn pointer_table() -> OverlayTable {
        let mut table = OverlayTable::builtin();
        let mut pointer = Overlay::new("Pointer", None);
        let cells = [
            CellAction::Mouse {
                buttons: 0,
                dx: 5,
                dy: 0,
            },
            CellAction::Mouse {
                buttons: LEFT_BUTTON | MOUSE_DOUBLE_CLICK,
                dx: 0,
                dy: 0,
            },
            CellAction::Mouse {
                buttons: LEFT_BUTTON | MOUSE_CLICK_HOLD,
                dx: 0,
                dy: 0,
            },
            CellAction::Keyboard {
                modifier: 0,
                keycode: 0x1d,
            },
        ];
        for (row, action) in cells.into_iter().enumerate() {
            pointer.fill(row, 0, 1, 1, action).unwrap();
        }
        table.insert(pointer);
        table
    }

    fn pointer_rig() -> Rig {
        let settings = Settings {
            use_this_overlay: Some("Pointer".to_string()),
            key_sound: 0,
            ..Settings::default()
        };
        let mut rig = Rig::with(quiet_config(), pointer_table(), settings);
        rig.event(EventCode::OnOffSwitch, &[1]);
        rig.advance(300);
        rig.clear();
        rig
    }

    #[test]
    fn start_sequence() {
        let mut rig = Rig::new();
        rig.advance(5);
        let opcodes: Vec<u8> = rig.sink.sent.iter().map(|f| f.opcode()).collect();
        /* DELAY holds the rest back */
        assert_eq!(opcodes, vec![DeviceCommand::Init as u8, DeviceCommand::Scan as u8]);
        assert_eq!(rig.sink.sent[0].byte(1), 0);
        assert_eq!(rig.sink.sent[1].byte(1), 1);

        rig.advance(250);
        let opcodes: Vec<u8> = rig.sink.sent.iter().map(|f| f.opcode()).take(6).collect();
        assert_eq!(
            opcodes,
            vec![
                DeviceCommand::Init as u8,
                DeviceCommand::Scan as u8,
                DeviceCommand::AllSensors as u8,
                DeviceCommand::GetVersion as u8,
                DeviceCommand::ReflectKeystroke as u8,
                DeviceCommand::ReflectMouseMove as u8,
            ]
        );
        assert!(rig.ik.is_open());
        /* calibration polling started with the first tick */
        assert_eq!(rig.sent(DeviceCommand::EepromReadByte).len(), RECORD_LEN);
    }

    #[test]
    fn post_validates_opcodes() {
        let rig = Rig::new();
        assert_eq!(
            rig.ik.post(Frame::new(19, &[])),
            Err(CommandError::InvalidDeviceCommand(19))
        );
        assert!(rig.ik.post(protocol::tone(100, 1)).is_ok());
    }

    #[test]
    fn toggle_plays_sweep_and_resets() {
        let mut rig = Rig::new();
        rig.advance(300);
        rig.clear();

        rig.event(EventCode::OnOffSwitch, &[1]);
        assert_eq!(rig.ik.drain_events(), vec![DeviceEvent::ToggleChanged(true)]);
        rig.advance(100);

        let tones = rig.sent(DeviceCommand::Tone);
        assert_eq!(tones.len(), 41);
        assert_eq!((tones[0].byte(1), tones[0].byte(2)), (200, 2));
        assert_eq!(tones[39].byte(1), 248);
        assert_eq!(tones[40].byte(2), 0);

        let leds = rig.sent(DeviceCommand::Led);
        assert_eq!(leds.len(), 8 + 9);
        assert_eq!((leds[0].byte(1), leds[0].byte(2)), (1, 1));
        assert!(leds[8..].iter().all(|f| f.byte(2) == 0));

        let kb = rig.last_keyboard().unwrap();
        assert_eq!(kb.0, [21, 0, 0, 0, 0, 0, 0, 0]);
        assert!(rig.ik.is_switched_on());
    }

    #[test]
    fn overlay_commit_side_effects() {
        let mut rig = Rig::new();
        rig.event(EventCode::OnOffSwitch, &[1]);
        rig.advance(300);
        rig.clear();

        rig.event(EventCode::SensorChange, &[0, 200]);
        rig.event(EventCode::SensorChange, &[1, 200]);
        rig.advance(900);
        assert_eq!(rig.ik.current_overlay(), None);

        rig.advance(1000);
        assert_eq!(rig.ik.current_overlay(), Some(overlay::OVERLAY_ALPHABET));
        assert!(
            rig.ik
                .drain_events()
                .contains(&DeviceEvent::OverlayChanged(Some(overlay::OVERLAY_ALPHABET)))
        );
        /* three on/off flashes while switched on */
        assert_eq!(rig.sent(DeviceCommand::AllLeds).len(), 6);
        assert_eq!(rig.ik.active_overlay_name(), Some("Alphabet USB Overlay"));
    }

    #[test]
    fn overlay_commit_while_off_flashes_once() {
        let mut rig = Rig::new();
        rig.advance(300);
        rig.clear();
        rig.event(EventCode::SensorChange, &[0, 200]);
        rig.event(EventCode::SensorChange, &[1, 200]);
        rig.advance(1500);
        assert_eq!(rig.sent(DeviceCommand::AllLeds).len(), 2);

        /* switched off: presses never reach a report */
        rig.press(8, 0);
        rig.advance(50);
        assert!(
            rig.sent(DeviceCommand::ReflectKeystroke)
                .iter()
                .all(|f| f.0[1..].iter().all(|b| *b == 0))
        );
    }

    #[test]
    fn membrane_press_reports_key() {
        let mut rig = Rig::new();
        rig.switch_on_with_alphabet();

        rig.press(8, 0);
        assert!(rig.ik.drain_events().contains(&DeviceEvent::MembraneChanged {
            row: 8,
            col: 0,
            pressed: true
        }));
        rig.advance(50);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 4, 0, 0, 0, 0, 0]);

        /* key click at the configured volume */
        let tones = rig.sent(DeviceCommand::Tone);
        assert_eq!(tones[0].byte(2), Settings::default().key_sound);
        assert_eq!(tones.last().unwrap().byte(2), 0);

        rig.release(8, 0);
        rig.advance(10);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn latching_shift_holds_until_second_press() {
        let mut rig = Rig::new();
        rig.switch_on_with_alphabet();

        rig.press(20, 0);
        rig.advance(30);
        rig.release(20, 0);
        rig.advance(150);
        assert_eq!(rig.last_keyboard().unwrap().byte(1), 0x02);
        assert!(rig.sent(DeviceCommand::Led).contains(&protocol::set_led(1, true)));

        /* shifted letter */
        rig.press(8, 0);
        rig.advance(30);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0x02, 4, 0, 0, 0, 0, 0]);
        rig.release(8, 0);

        rig.press(20, 0);
        rig.advance(30);
        rig.release(20, 0);
        rig.advance(150);
        assert_eq!(rig.last_keyboard().unwrap().byte(1), 0);
        assert_eq!(
            rig.ik.modifier_states()[0],
            ("shift".to_string(), "off".to_string())
        );
        assert_eq!(
            rig.sent(DeviceCommand::Led).last(),
            Some(&protocol::set_led(1, false))
        );
    }

    #[test]
    fn nolatch_shift_taps_and_stays_latched() {
        let settings = Settings {
            shift_key_action: ShiftKeyAction::NoLatch,
            ..Settings::default()
        };
        let mut rig = Rig::with(quiet_config(), OverlayTable::builtin(), settings);
        rig.switch_on_with_alphabet();

        rig.press(20, 0);
        rig.release(20, 0);
        rig.advance(60);

        let reports = rig.sent(DeviceCommand::ReflectKeystroke);
        assert!(reports.iter().any(|f| f.byte(1) == 0x02));
        assert_eq!(reports.last().unwrap().byte(1), 0);
        assert_eq!(
            rig.ik.modifier_states()[0],
            ("shift".to_string(), "latched".to_string())
        );

        /* the next press taps again */
        rig.sink.sent.clear();
        rig.press(20, 0);
        rig.release(20, 0);
        rig.advance(60);
        let reports = rig.sent(DeviceCommand::ReflectKeystroke);
        assert!(reports.iter().any(|f| f.byte(1) == 0x02));
        assert_eq!(reports.last().unwrap().byte(1), 0);
    }

    #[test]
    fn explicit_key_up_lifts_the_latch() {
        let mut rig = Rig::new();
        rig.switch_on_with_alphabet();

        rig.press(20, 0);
        rig.release(20, 0);
        rig.advance(30);
        assert_eq!(
            rig.ik.modifier_states()[0],
            ("shift".to_string(), "latched".to_string())
        );

        rig.ik
            .post(protocol::keyboard(USAGE_MODIFIER_FIRST + 1, KeyDirection::Up, 0))
            .unwrap();
        rig.advance(10);
        assert_eq!(
            rig.ik.modifier_states()[0],
            ("shift".to_string(), "off".to_string())
        );
        assert_eq!(rig.last_keyboard().unwrap().byte(1), 0);
    }

    #[test]
    fn switch_keys_reach_the_next_report() {
        let mut table = OverlayTable::builtin();
        let mut jacks = Overlay::new("Jacks", None);
        jacks
            .set_switch(
                1,
                CellAction::Keyboard {
                    modifier: 0,
                    keycode: 0x2c,
                },
            )
            .unwrap();
        table.insert(jacks);
        let settings = Settings {
            use_this_overlay: Some("Jacks".to_string()),
            key_sound: 0,
            ..Settings::default()
        };
        let mut rig = Rig::with(quiet_config(), table, settings);
        rig.event(EventCode::OnOffSwitch, &[1]);
        rig.advance(300);
        rig.clear();

        rig.event(EventCode::Switch, &[1, 1]);
        assert_eq!(
            rig.ik.drain_events(),
            vec![DeviceEvent::SwitchChanged {
                number: 1,
                pressed: true
            }]
        );
        rig.advance(5);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 0x2c, 0, 0, 0, 0, 0]);

        rig.event(EventCode::Switch, &[1, 0]);
        rig.advance(5);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn toggle_drops_queued_frames_and_held_inputs() {
        let mut rig = Rig::new();
        rig.switch_on_with_alphabet();

        rig.press(8, 0);
        rig.advance(50);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 4, 0, 0, 0, 0, 0]);

        /* the long delay keeps the tone waiting in the queue */
        rig.ik.post(protocol::delay(5000)).unwrap();
        rig.ik.post(protocol::tone(77, 1)).unwrap();
        rig.advance(10);
        rig.clear();

        rig.event(EventCode::OnOffSwitch, &[0]);
        rig.event(EventCode::OnOffSwitch, &[1]);
        /* the pending delay went with the queue: the sweep starts at once */
        rig.advance(5);
        assert!(!rig.sent(DeviceCommand::Tone).is_empty());

        rig.advance(1000);
        assert!(rig.sent(DeviceCommand::Tone).iter().all(|f| f.byte(1) != 77));
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 0, 0, 0, 0, 0, 0]);

        /* the key held before the toggle no longer feeds reports */
        rig.sink.sent.clear();
        rig.press(23, 23);
        rig.advance(20);
        assert!(
            rig.sent(DeviceCommand::ReflectKeystroke)
                .iter()
                .all(|f| f.0[1..].iter().all(|b| *b == 0))
        );
    }

    #[test]
    fn stop_forgets_the_device() {
        let mut rig = Rig::new();
        rig.switch_on_with_alphabet();
        assert_eq!(rig.ik.current_overlay(), Some(overlay::OVERLAY_ALPHABET));
        rig.ik.post(protocol::set_led(4, true)).unwrap();

        rig.ik.stop();
        assert!(!rig.ik.is_open());
        assert_eq!(rig.ik.current_overlay(), None);
        assert!(rig.ik.queue().is_empty());

        rig.clear();
        rig.advance(100);
        assert!(rig.sink.sent.is_empty());
    }

    #[test]
    fn correction_waits_for_outstanding_pass() {
        let config = EngineConfig {
            correction_interval: Some(Duration::from_millis(100)),
            ..quiet_config()
        };
        let mut rig = Rig::with(config, OverlayTable::builtin(), Settings::default());
        rig.advance(500);
        /* the device never answers, so only the first CORRECT goes out */
        assert_eq!(rig.sent(DeviceCommand::Correct).len(), 1);

        rig.event(EventCode::CorrectDone, &[]);
        rig.advance(100);
        assert_eq!(rig.sent(DeviceCommand::Correct).len(), 2);
    }

    #[test]
    fn three_light_layout_mirrors_shift() {
        let settings = Settings {
            indicator_lights: IndicatorLights::Three,
            ..Settings::default()
        };
        let mut rig = Rig::with(quiet_config(), OverlayTable::builtin(), settings);
        rig.switch_on_with_alphabet();

        rig.press(20, 0);
        rig.release(20, 0);
        rig.advance(200);
        let leds = rig.sent(DeviceCommand::Led);
        assert!(leds.contains(&protocol::set_led(1, true)));
        assert!(leds.contains(&protocol::set_led(3, true)));
        assert!(!leds.contains(&protocol::set_led(2, true)));
    }

    #[test]
    fn override_overlay_wins_without_bar_code() {
        let mut rig = pointer_rig();
        rig.press(3, 0);
        rig.advance(20);
        assert_eq!(rig.last_keyboard().unwrap().0, [21, 0, 0x1d, 0, 0, 0, 0, 0]);
        assert_eq!(rig.ik.active_overlay_name(), Some("Pointer"));
        /* key sound off */
        assert!(rig.sent(DeviceCommand::Tone).is_empty());
    }

    #[test]
    fn mouse_motion_repeats_while_held() {
        let mut rig = pointer_rig();
        rig.press(0, 0);
        rig.advance(200);
        let moves: Vec<Frame> = rig
            .sent(DeviceCommand::ReflectMouseMove)
            .into_iter()
            .filter(|f| f.byte(2) == 5)
            .collect();
        assert!(moves.len() >= 4, "only {} mouse reports", moves.len());

        rig.release(0, 0);
        rig.advance(10);
        rig.sink.sent.clear();
        rig.advance(200);
        assert!(rig.sent(DeviceCommand::ReflectMouseMove).is_empty());
    }

    #[test]
    fn double_click_cell() {
        let mut rig = pointer_rig();
        rig.press(1, 0);
        rig.advance(400);
        let buttons: Vec<u8> = rig
            .sent(DeviceCommand::ReflectMouseMove)
            .iter()
            .map(|f| f.byte(1))
            .collect();
        assert_eq!(buttons, vec![1, 0, 1, 0]);
    }

    #[test]
    fn click_hold_cell_toggles_button() {
        let mut rig = pointer_rig();
        rig.press(2, 0);
        rig.release(2, 0);
        rig.advance(150);
        assert_eq!(
            rig.sent(DeviceCommand::ReflectMouseMove).last().unwrap().byte(1),
            LEFT_BUTTON
        );
        /* mouse-down light in the six-light layout */
        assert!(rig.sent(DeviceCommand::Led).contains(&protocol::set_led(7, true)));

        rig.press(2, 0);
        rig.release(2, 0);
        rig.advance(20);
        assert_eq!(
            rig.sent(DeviceCommand::ReflectMouseMove).last().unwrap().byte(1),
            0
        );
    }

    #[test]
    fn calibration_record_validates() {
        let mut rig = Rig::new();
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(b"C-42");
        record[SERIAL_LEN..SERIAL_LEN + 3].copy_from_slice(&[20, 20, 20]);
        record[SERIAL_LEN + 3..].copy_from_slice(&[100, 100, 100]);

        for (i, data) in record.iter().enumerate() {
            let [lsb, msb] = (EEPROM_BASE + i as u16).to_le_bytes();
            rig.event(EventCode::EepromReadByte, &[*data, lsb, msb]);
        }
        assert_eq!(
            rig.ik.drain_events(),
            vec![DeviceEvent::CalibrationValid("C-42".to_string())]
        );
        assert_eq!(rig.ik.serial_number().as_deref(), Some("C-42"));
        assert!(!rig.ik.is_intelliswitch());

        rig.advance(300);
        assert!(rig.ik.drain_events().contains(&DeviceEvent::ControlPanelRefresh));
        rig.sink.sent.clear();
        rig.advance(600);
        assert!(rig.sent(DeviceCommand::EepromReadByte).is_empty());

        /* calibrated midpoint is 60 */
        rig.event(EventCode::SensorChange, &[0, 61]);
        rig.advance(1100);
        assert_eq!(rig.ik.current_overlay(), Some(1));
    }

    #[test]
    fn correction_pass_is_scheduled() {
        let config = EngineConfig {
            correction_interval: Some(Duration::from_millis(500)),
            ..quiet_config()
        };
        let mut rig = Rig::with(config, OverlayTable::builtin(), Settings::default());
        rig.advance(400);
        assert!(rig.sent(DeviceCommand::Correct).is_empty());
        rig.advance(200);
        assert_eq!(rig.sent(DeviceCommand::Correct).len(), 1);
        rig.ik.drain_events();

        rig.event(EventCode::CorrectMembrane, &[2, 3]);
        rig.event(EventCode::CorrectDone, &[]);
        assert_eq!(
            rig.ik.drain_events(),
            vec![DeviceEvent::MembraneChanged {
                row: 3,
                col: 2,
                pressed: true
            }]
        );
    }

    #[test]
    fn version_and_switch_events() {
        let mut rig = Rig::new();
        rig.event(EventCode::Version, &[3, 7]);
        rig.event(EventCode::Switch, &[2, 1]);
        assert_eq!(
            rig.ik.drain_events(),
            vec![
                DeviceEvent::FirmwareVersion { major: 3, minor: 7 },
                DeviceEvent::SwitchChanged {
                    number: 2,
                    pressed: true
                },
            ]
        );
        assert_eq!(rig.ik.firmware_version(), Some((3, 7)));
        assert!(rig.ik.switch(2));
    }

    #[test]
    fn modifier_usage_bits() {
        assert_eq!(modifier_bit(0xe1), Some(0x02));
        assert_eq!(modifier_bit(0xe7), Some(0x80));
        assert_eq!(modifier_bit(0x04), None);
    }
}
