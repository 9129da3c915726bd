//! Plugin lifecycle
//!
//! `start()` loads (or synthesizes) the figure dump, installs the transfer
//! hook and starts the combo monitor. `stop()` undoes the same steps in
//! reverse order and flushes the dump one last time.
//!
//! A failed hook installation leaves nothing behind: no monitor thread, no
//! loaded dump.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::combo::{ButtonSource, ComboMonitor, ComboSettings, MonitorHandle};
use crate::config::Config;
use crate::device::{DeviceIdentity, IdentityResolver};
use crate::dump::{DumpError, DumpStore, Storage};
use crate::hooks::{HookError, HookInstaller, InstalledHook};
use crate::router::Interceptor;
use crate::state::{self, new_shared_state, EmulationEvent, SharedEmulation};

/// External collaborators the plugin runs against
#[derive(Clone)]
pub struct Collaborators {
    pub installer: Arc<dyn HookInstaller>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub buttons: Arc<dyn ButtonSource>,
    pub storage: Arc<dyn Storage>,
}

/// Plugin settings
#[derive(Debug, Clone)]
pub struct PluginOptions {
    pub identity: DeviceIdentity,
    pub dump_path: PathBuf,
    pub combo: ComboSettings,
    pub start_enabled: bool,
}

impl From<&Config> for PluginOptions {
    fn from(config: &Config) -> Self {
        Self {
            identity: config.device.identity(),
            dump_path: config.dump_path.clone(),
            combo: config.combo.settings(),
            start_enabled: config.start_enabled,
        }
    }
}

/// Everything owned while the plugin is running
struct Running {
    state: SharedEmulation,
    interceptor: Arc<Interceptor>,
    hook: Box<dyn InstalledHook>,
    monitor: MonitorHandle,
}

/// Lifecycle controller for portal emulation
pub struct Plugin {
    options: PluginOptions,
    collaborators: Collaborators,
    event_tx: Option<mpsc::Sender<EmulationEvent>>,
    running: Option<Running>,
}

impl Plugin {
    pub fn new(options: PluginOptions, collaborators: Collaborators) -> Self {
        Self {
            options,
            collaborators,
            event_tx: None,
            running: None,
        }
    }

    /// Report combo toggles on `event_tx`
    pub fn with_events(mut self, event_tx: mpsc::Sender<EmulationEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Shared state of the running plugin
    pub fn state(&self) -> Option<&SharedEmulation> {
        self.running.as_ref().map(|r| &r.state)
    }

    /// Current enabled flag, `None` when stopped
    pub fn is_enabled(&self) -> Option<bool> {
        self.state().map(|s| state::lock(s).enabled)
    }

    fn store(&self) -> DumpStore {
        DumpStore::new(
            self.options.dump_path.clone(),
            Arc::clone(&self.collaborators.storage),
        )
    }

    /// Load the dump, install the hook and start the combo monitor
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let store = self.store();
        let state = new_shared_state(self.options.start_enabled);
        state::lock(&state).dump = Some(store.load_or_default());

        let interceptor = Arc::new(Interceptor::new(
            self.options.identity,
            Arc::clone(&self.collaborators.resolver),
            Arc::clone(&state),
            store,
        ));

        let hook = match self.collaborators.installer.install(interceptor.clone()) {
            Ok(hook) => hook,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install transfer hook");
                state::lock(&state).release();
                return Err(StartError::HookInstallFailed(e));
            }
        };

        let mut monitor = ComboMonitor::new(
            Arc::clone(&state),
            Arc::clone(&self.collaborators.buttons),
            self.options.combo,
        );
        if let Some(tx) = &self.event_tx {
            monitor = monitor.with_events(tx.clone());
        }

        let monitor = match monitor.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start combo monitor");
                hook.remove();
                state::lock(&state).release();
                return Err(StartError::MonitorSpawnFailed(e));
            }
        };

        tracing::info!(
            device = %self.options.identity,
            dump = %self.options.dump_path.display(),
            enabled = self.options.start_enabled,
            "Portal emulation started"
        );

        self.running = Some(Running {
            state,
            interceptor,
            hook,
            monitor,
        });
        Ok(())
    }

    /// Stop the monitor, remove the hook, flush and release the dump
    ///
    /// Does nothing if the plugin is not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            tracing::debug!("Stop requested while not running");
            return;
        };

        running.monitor.stop();
        running.hook.remove();

        match running.interceptor.flush_and_release() {
            Ok(()) => {}
            Err(DumpError::NothingToPersist) => {
                tracing::debug!("No figure dump to flush");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to flush figure dump on stop");
            }
        }

        tracing::info!("Portal emulation stopped");
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Plugin start error type
#[derive(Debug)]
pub enum StartError {
    /// `start()` called on a running plugin
    AlreadyRunning,
    /// The transfer hook could not be installed
    HookInstallFailed(HookError),
    /// The combo monitor thread could not be spawned
    MonitorSpawnFailed(std::io::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyRunning => write!(f, "Plugin already running"),
            StartError::HookInstallFailed(e) => write!(f, "Hook installation failed: {}", e),
            StartError::MonitorSpawnFailed(e) => write!(f, "Combo monitor failed to start: {}", e),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::AlreadyRunning => None,
            StartError::HookInstallFailed(e) => Some(e),
            StartError::MonitorSpawnFailed(e) => Some(e),
        }
    }
}
