//! Progress interpolation and the local countdown.
//!
//! Between refresh cycles the displayed time-to-next-stop counts down on the
//! local clock. A freshly located bracket always replaces the countdown
//! outright; the ticker never extrapolates past it and never goes below 0.

use crate::models::Bracket;

/// Visual budget for one bracket segment (half of the 0..100 track).
pub const PROGRESS_SCALE: u32 = 50;

/// Progress reported when both ETAs are 0.
pub const DEFAULT_PROGRESS: u8 = (PROGRESS_SCALE / 2) as u8;

/// `floor(current * PROGRESS_SCALE / (current + next))`.
pub fn visual_progress(current_eta_seconds: u32, next_eta_seconds: u32) -> u8 {
    let total = u64::from(current_eta_seconds) + u64::from(next_eta_seconds);
    if total == 0 {
        return DEFAULT_PROGRESS;
    }
    let scaled = u64::from(current_eta_seconds) * u64::from(PROGRESS_SCALE) / total;
    // current <= total, so scaled <= PROGRESS_SCALE
    scaled as u8
}

/// Saturating one-second countdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Countdown {
    remaining: u32,
}

impl Countdown {
    pub fn new(remaining: u32) -> Self {
        Self { remaining }
    }

    pub fn tick(&mut self) -> u32 {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// The displayed bracket and its countdown.
#[derive(Debug, Default)]
pub struct LocalTicker {
    bracket: Option<Bracket>,
    countdown: Countdown,
}

impl LocalTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is displayed with a freshly located bracket.
    pub fn publish(&mut self, bracket: Bracket) {
        self.countdown = Countdown::new(bracket.remaining_seconds);
        self.bracket = Some(bracket);
    }

    /// Advance one second. Returns whether the displayed value changed.
    pub fn tick(&mut self) -> bool {
        if self.bracket.is_none() || self.countdown.remaining() == 0 {
            return false;
        }
        self.countdown.tick();
        true
    }

    /// The bracket as it should be displayed right now.
    pub fn displayed(&self) -> Option<Bracket> {
        self.bracket.map(|bracket| Bracket {
            remaining_seconds: self.countdown.remaining(),
            ..bracket
        })
    }
}
