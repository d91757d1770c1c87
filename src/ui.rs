//! Front-end seam for the recovery UI.
//!
//! The engine never talks to a screen or a keypad directly; it goes through
//! this trait. Every call is fire-and-forget except `poll_key`, which is the
//! non-blocking cancel-key check interleaved with archiver output.

use crate::logging::LogThrottle;
use crossterm::event::{self, Event, KeyCode};
use std::io::IsTerminal;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiKey {
    /// The cancel key (first press) and the confirm key (second press).
    Cancel,
    Confirm,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Working,
    Idle,
    Error,
}

pub trait UiAdapter: Send + Sync {
    fn print(&self, msg: &str);
    fn show_progress(&self);
    fn set_progress(&self, fraction: f32);
    fn reset_progress(&self);
    fn set_phase(&self, phase: JobPhase);
    /// Non-blocking key check. `None` when no key is pending.
    fn poll_key(&self) -> Option<UiKey>;
    fn clear_keys(&self);
    /// Whether a human is attached; gates the cancel banner and key polling.
    fn interactive(&self) -> bool;
}

/// Console front end: messages to stdout, progress repainted in place on
/// stderr, keys polled through crossterm.
pub struct ConsoleUi {
    throttle: LogThrottle,
    interactive: bool,
}

impl ConsoleUi {
    pub fn new(progress_interval: Duration) -> Self {
        Self {
            throttle: LogThrottle::new(progress_interval),
            interactive: std::io::stdin().is_terminal(),
        }
    }
}

impl UiAdapter for ConsoleUi {
    fn print(&self, msg: &str) {
        println!("{msg}");
    }

    fn show_progress(&self) {
        self.throttle.reset();
    }

    fn set_progress(&self, fraction: f32) {
        if self.throttle.should_log() {
            eprint!("\r[{:3.0}%] ", fraction.clamp(0.0, 1.0) * 100.0);
        }
    }

    fn reset_progress(&self) {
        if self.interactive {
            eprintln!();
        }
        self.throttle.reset();
    }

    fn set_phase(&self, phase: JobPhase) {
        debug!(?phase, "phase change");
    }

    fn poll_key(&self) -> Option<UiKey> {
        if !self.interactive {
            return None;
        }
        match event::poll(Duration::ZERO) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => Some(match key.code {
                    KeyCode::Esc | KeyCode::Char('c') => UiKey::Cancel,
                    KeyCode::Enter | KeyCode::Char('y') => UiKey::Confirm,
                    _ => UiKey::Other,
                }),
                _ => None,
            },
            _ => None,
        }
    }

    fn clear_keys(&self) {
        while matches!(event::poll(Duration::ZERO), Ok(true)) {
            if event::read().is_err() {
                break;
            }
        }
    }

    fn interactive(&self) -> bool {
        self.interactive
    }
}

/// Silent front end for stream transfers (`dump`/`undump`), where stdout is
/// the payload and nothing may be printed over it.
pub struct SilentUi;

impl UiAdapter for SilentUi {
    fn print(&self, msg: &str) {
        info!("{msg}");
    }

    fn show_progress(&self) {}
    fn set_progress(&self, _fraction: f32) {}
    fn reset_progress(&self) {}
    fn set_phase(&self, _phase: JobPhase) {}

    fn poll_key(&self) -> Option<UiKey> {
        None
    }

    fn clear_keys(&self) {}

    fn interactive(&self) -> bool {
        false
    }
}
