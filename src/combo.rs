//! Button combo monitor
//!
//! Polls a button mask on a background thread and toggles emulation when
//! every button of the combo is held at once.
//!
//! ## Debounce
//! After a match the monitor sleeps for the debounce interval before
//! toggling, and does not sample during that wait. One press therefore
//! toggles exactly once; holding the combo across several debounce windows
//! toggles once per window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::state::{self, EmulationEvent, SharedEmulation};

/// Default sampling period
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default debounce wait after a combo match
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Linux key codes for the default combo (L3 + R3 + START)
pub mod keys {
    pub const BTN_START: u16 = 0x13b;
    pub const BTN_THUMBL: u16 = 0x13d;
    pub const BTN_THUMBR: u16 = 0x13e;

    pub const DEFAULT_COMBO: &[u16] = &[BTN_THUMBL, BTN_THUMBR, BTN_START];
}

/// Source of the current button mask
pub trait ButtonSource: Send + Sync {
    /// Bitmask of buttons currently held
    fn current_buttons(&self) -> u32;
}

/// Mask with one bit per combo button
pub fn combo_mask(button_count: usize) -> u32 {
    match button_count {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

/// Combo monitor settings
#[derive(Debug, Clone, Copy)]
pub struct ComboSettings {
    /// Bits that must all be held
    pub mask: u32,
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl Default for ComboSettings {
    fn default() -> Self {
        Self {
            mask: combo_mask(keys::DEFAULT_COMBO.len()),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// Samples buttons and toggles emulation on a combo match
pub struct ComboMonitor {
    state: SharedEmulation,
    source: Arc<dyn ButtonSource>,
    settings: ComboSettings,
    /// Optional channel for toggle notifications
    event_tx: Option<mpsc::Sender<EmulationEvent>>,
}

impl ComboMonitor {
    pub fn new(state: SharedEmulation, source: Arc<dyn ButtonSource>, settings: ComboSettings) -> Self {
        Self {
            state,
            source,
            settings,
            event_tx: None,
        }
    }

    /// Report toggles on `event_tx`
    pub fn with_events(mut self, event_tx: mpsc::Sender<EmulationEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Check if a sampled mask holds the whole combo
    pub fn is_combo(&self, buttons: u32) -> bool {
        self.settings.mask != 0 && buttons & self.settings.mask == self.settings.mask
    }

    /// One sampling step
    ///
    /// Returns the new enabled value when this tick toggled.
    pub fn tick(&self) -> Option<bool> {
        let buttons = self.source.current_buttons();
        if !self.is_combo(buttons) {
            return None;
        }

        thread::sleep(self.settings.debounce);

        let enabled = state::lock(&self.state).toggle();
        tracing::info!(enabled, "Combo held - portal emulation toggled");

        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(EmulationEvent::Toggled { enabled }) {
                tracing::debug!(error = %e, "Dropped toggle event");
            }
        }
        Some(enabled)
    }

    /// Run the monitor on a background thread
    pub fn spawn(self) -> std::io::Result<MonitorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("combo-monitor".to_string())
            .spawn(move || self.run(&stop_flag))?;

        Ok(MonitorHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn run(&self, stop: &AtomicBool) {
        tracing::debug!(
            mask = format!("0x{:08X}", self.settings.mask),
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "Combo monitor started"
        );

        while !stop.load(Ordering::Acquire) {
            self.tick();
            thread::sleep(self.settings.poll_interval);
        }

        tracing::debug!("Combo monitor stopped");
    }
}

/// Handle to a running combo monitor
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Check if the monitor thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the monitor and wait for the current tick to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Combo monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// evdev Button Source
// ============================================================================

/// Button source backed by an evdev device's key state
///
/// Key `i` of the configured list maps to bit `i` of the mask.
#[cfg(target_os = "linux")]
pub struct EvdevButtons {
    device: std::sync::Mutex<evdev::Device>,
    keys: Vec<u16>,
}

#[cfg(target_os = "linux")]
impl EvdevButtons {
    /// Open an evdev device and watch the given key codes
    pub fn open<P: AsRef<std::path::Path>>(path: P, keys: &[u16]) -> std::io::Result<Self> {
        let device = evdev::Device::open(path.as_ref())?;
        tracing::info!(
            path = %path.as_ref().display(),
            name = device.name().unwrap_or("Unknown"),
            "Combo input device opened"
        );
        Ok(Self {
            device: std::sync::Mutex::new(device),
            keys: keys.iter().copied().take(32).collect(),
        })
    }
}

#[cfg(target_os = "linux")]
impl ButtonSource for EvdevButtons {
    fn current_buttons(&self) -> u32 {
        let device = self.device.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let held = match device.get_key_state() {
            Ok(held) => held,
            Err(e) => {
                tracing::trace!(error = %e, "Failed to read key state");
                return 0;
            }
        };

        self.keys
            .iter()
            .enumerate()
            .filter(|(_, code)| held.contains(evdev::KeyCode(**code)))
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }
}
