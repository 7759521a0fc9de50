//! Indicator and push-button interfaces.
//!
//! The whole human-interface block is optional; a headless node simply
//! never attaches a [`ModuleUi`] and the dispatcher skips all of this.
//!
//! Indicator contract per mode: lean = green on / yellow off, flexible =
//! yellow on / green off, transitioning = yellow blinking / green off. The
//! green indicator additionally pulses once per received frame.

/// Button hold time that arms a lean/flexible transition.
pub const HOLD_FOR_TRANSITION_MS: u64 = 6_000;

/// Press-duration band that triggers renegotiation (inclusive lower bound).
pub const RENEGOTIATE_MIN_MS: u64 = 1_000;
/// Press-duration band that triggers renegotiation (exclusive upper bound).
pub const RENEGOTIATE_MAX_MS: u64 = 2_000;

/// Presses shorter than this start an enumeration (flexible mode only).
pub const ENUM_TAP_MAX_MS: u64 = 500;

/// One indicator lamp.
pub trait Indicator {
    /// Steady on.
    fn on(&mut self);
    /// Steady off.
    fn off(&mut self);
    /// Continuous blinking.
    fn blink(&mut self);
    /// One short flash on top of the current state.
    fn pulse(&mut self);
    /// Advance any blink/pulse animation.
    fn tick(&mut self, now_ms: u64);
}

/// A debounced momentary push button, edge-detected on release.
pub trait PushButton {
    /// Sample the input.
    fn tick(&mut self, now_ms: u64);
    /// Is the button currently held?
    fn is_pressed(&self) -> bool;
    /// Did the pressed state flip during the last tick?
    fn state_changed(&self) -> bool;
    /// Duration of the most recently completed state, in milliseconds.
    fn last_press_duration_ms(&self) -> u64;
    /// Duration of the current state, in milliseconds.
    fn current_state_duration_ms(&self) -> u64;
}

/// The attached human-interface block: two mode lamps and the setup button.
pub struct ModuleUi {
    pub green: Box<dyn Indicator>,
    pub yellow: Box<dyn Indicator>,
    pub button: Box<dyn PushButton>,
}

impl ModuleUi {
    pub fn new(
        green: Box<dyn Indicator>,
        yellow: Box<dyn Indicator>,
        button: Box<dyn PushButton>,
    ) -> Self {
        Self {
            green,
            yellow,
            button,
        }
    }
}
