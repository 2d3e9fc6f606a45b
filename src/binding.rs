use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_std::sync::Mutex;

use log::{debug, error, info, trace, warn};

use crate::{
    config::{BindingConfig, DEFAULT_REFRESH_MS},
    config_catalog::ConfigCatalog,
    device_spec::{DeviceSpec, SpecSlot},
    error::{Error, Result},
    receiver::{Receiver, ReceiverHandle, ReceiverOptions},
    scheduler::{schedule, RunMode, Schedule},
    transport::DisconnectHandle,
    update_dispatcher::{EventPublisher, Providers, UpdateDispatcher},
};

/// Name of the refresh service reported to the host.
pub const BINDING_NAME: &str = "ResolVBUS Refresh Service";

/// Lifecycle state of a `VBusBinding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// No valid configuration has been applied yet.
    Unconfigured,

    /// A configuration is being applied.
    Starting,

    /// A receiver is running or ready for periodic cycles.
    Running,

    /// The receiver is being shut down.
    Stopping,

    /// The binding was deactivated.
    Stopped,
}

#[derive(Debug)]
enum Runner {
    Continuous(ReceiverHandle),
    Periodic {
        receiver: Arc<Mutex<Receiver>>,
        disconnect: DisconnectHandle,
    },
}

impl Runner {
    async fn stop(self) {
        match self {
            Runner::Continuous(mut handle) => handle.stop().await,
            Runner::Periodic {
                receiver,
                disconnect,
            } => {
                disconnect.disconnect();
                // Wait for an in-flight cycle to notice.
                drop(receiver.lock().await);
            }
        }
    }
}

#[derive(Debug)]
struct Active {
    config: BindingConfig,
    runner: Runner,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: BindingState,
    schedule: Option<Schedule>,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Supervises the receiver of one VBus device on behalf of the host.
///
/// The host calls `activate` / `modified` with its option set, `execute` on
/// every tick of its refresh timer (at `refresh_interval`) and `deactivate`
/// on shutdown. At most one receiver is active at any time.
pub struct VBusBinding {
    resource_dir: PathBuf,
    spec: SpecSlot,
    dispatcher: Arc<UpdateDispatcher>,
    receiver_options: ReceiverOptions,
    status: StdMutex<Status>,
    last_cycle_error: StdMutex<Option<String>>,
    active: Mutex<Option<Active>>,
    cycle_in_flight: AtomicBool,
}

impl VBusBinding {
    /// Create an unconfigured binding.
    ///
    /// Device definitions are resolved from the `mapping.cfg` catalog in
    /// `resource_dir`, values are published through `publisher` for the items
    /// `providers` bind.
    pub fn new<P: AsRef<Path>>(
        resource_dir: P,
        providers: Providers,
        publisher: Arc<dyn EventPublisher>,
    ) -> VBusBinding {
        let spec = SpecSlot::new();
        let dispatcher = UpdateDispatcher::new(spec.clone(), providers, publisher);

        VBusBinding {
            resource_dir: resource_dir.as_ref().to_path_buf(),
            spec,
            dispatcher: Arc::new(dispatcher),
            receiver_options: ReceiverOptions::default(),
            status: StdMutex::new(Status {
                state: BindingState::Unconfigured,
                schedule: None,
            }),
            last_cycle_error: StdMutex::new(None),
            active: Mutex::new(None),
            cycle_in_flight: AtomicBool::new(false),
        }
    }

    /// Replace the timeouts used by receivers created from now on.
    pub fn with_receiver_options(mut self, options: ReceiverOptions) -> VBusBinding {
        self.receiver_options = options;
        self
    }

    fn status(&self) -> Status {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_status(&self, state: BindingState, schedule: Option<Schedule>) {
        let mut status = match self.status.lock() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };
        trace!("Binding state {:?} -> {:?}", status.state, state);
        *status = Status { state, schedule };
    }

    fn set_last_cycle_error(&self, message: Option<String>) {
        match self.last_cycle_error.lock() {
            Ok(mut last) => *last = message,
            Err(poisoned) => *poisoned.into_inner() = message,
        }
    }

    /// The name of the refresh service.
    pub fn name(&self) -> &'static str {
        BINDING_NAME
    }

    /// The current lifecycle state.
    pub fn state(&self) -> BindingState {
        self.status().state
    }

    /// The active run mode, if configured.
    pub fn run_mode(&self) -> Option<RunMode> {
        self.status().schedule.map(|schedule| schedule.mode)
    }

    /// Interval the host should call `execute` at.
    pub fn refresh_interval(&self) -> Duration {
        self.status()
            .schedule
            .map(|schedule| schedule.interval)
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_REFRESH_MS))
    }

    /// Why the last periodic cycle could not reach the device, if it failed.
    /// Cleared by the next successful cycle and by reconfiguration.
    pub fn last_cycle_error(&self) -> Option<String> {
        match self.last_cycle_error.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the binding is running and its last cycle reached the device.
    pub fn is_configured(&self) -> bool {
        self.state() == BindingState::Running && self.last_cycle_error().is_none()
    }

    /// The currently active device spec, if one could be loaded.
    pub fn device_spec(&self) -> Option<Arc<DeviceSpec>> {
        self.spec.load()
    }

    /// The configuration currently applied.
    pub async fn config(&self) -> Option<BindingConfig> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.config.clone())
    }

    /// Apply the host's configuration and start receiving.
    ///
    /// An invalid option set is rejected with `Error::Config` and leaves any
    /// running receiver untouched.
    pub async fn activate(&self, properties: &HashMap<String, String>) -> Result<()> {
        info!("ResolVBUS binding activated");
        let config = BindingConfig::from_properties(properties)?;
        self.apply(config).await
    }

    /// Apply a changed configuration, replacing the running receiver.
    pub async fn modified(&self, properties: &HashMap<String, String>) -> Result<()> {
        info!("ResolVBUS binding modified, updating configuration");
        let config = BindingConfig::from_properties(properties)?;
        self.apply(config).await
    }

    /// Apply an already typed configuration.
    pub async fn apply(&self, config: BindingConfig) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            self.set_status(BindingState::Stopping, None);
            previous.runner.stop().await;
        }

        self.set_status(BindingState::Starting, None);
        self.set_last_cycle_error(None);

        let spec = match config.device_id {
            Some(ref device_id) => {
                info!("Using config for device ID {}", device_id);
                match ConfigCatalog::resolve(&self.resource_dir, device_id).await {
                    Ok(spec) => Some(spec),
                    Err(err) => {
                        error!("{}", err);
                        None
                    }
                }
            }
            None => {
                warn!("No device ID configured, values will not be published");
                None
            }
        };
        self.spec.store(spec);

        let schedule = schedule(
            config.transport.kind(),
            config.update_interval,
            config.refresh,
        );

        let receiver = Receiver::new(
            config.transport.create(),
            self.dispatcher.clone(),
            self.receiver_options.clone(),
        );

        let runner = match schedule.mode {
            RunMode::Continuous => {
                debug!("Starting continuous receiver for {:?}", config.transport);
                Runner::Continuous(receiver.spawn())
            }
            RunMode::Periodic => {
                debug!("Polling every {:?} for {:?}", schedule.interval, config.transport);
                Runner::Periodic {
                    disconnect: receiver.disconnect_handle(),
                    receiver: Arc::new(Mutex::new(receiver)),
                }
            }
        };

        *active = Some(Active { config, runner });
        self.set_status(BindingState::Running, Some(schedule));

        Ok(())
    }

    /// Stop the receiver. Calling this more than once does nothing harmful.
    pub async fn deactivate(&self) {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            debug!("Stopping ResolVBUS listener...");
            self.set_status(BindingState::Stopping, None);
            previous.runner.stop().await;
        }

        self.set_status(BindingState::Stopped, None);
        info!("ResolVBUS binding deactivated");
    }

    /// Run one refresh cycle.
    ///
    /// Only does something in periodic mode; returns the number of packets
    /// received. Fails with `Error::InvalidState` if the previous cycle is
    /// still running.
    pub async fn execute(&self) -> Result<usize> {
        if self.state() != BindingState::Running {
            trace!("Binding not running, skipping refresh");
            return Ok(0);
        }

        let receiver = match *self.active.lock().await {
            Some(Active {
                runner: Runner::Periodic { ref receiver, .. },
                ..
            }) => receiver.clone(),
            _ => return Ok(0),
        };

        if self.cycle_in_flight.swap(true, Ordering::SeqCst) {
            let err = Error::InvalidState("previous refresh cycle is still running".into());
            warn!("{}", err);
            return Err(err);
        }
        let _guard = CycleGuard(&self.cycle_in_flight);

        debug!("Refreshing values");

        let mut receiver = receiver.lock().await;
        match receiver.run_once().await {
            Ok(count) => {
                self.set_last_cycle_error(None);
                Ok(count)
            }
            Err(err) => {
                if err.is_transport_error() {
                    warn!("Refresh cycle failed: {}", err);
                    self.set_last_cycle_error(Some(err.to_string()));
                } else {
                    debug!("Refresh cycle interrupted: {}", err);
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for VBusBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBusBinding")
            .field("resource_dir", &self.resource_dir)
            .field("state", &self.state())
            .field("spec", &self.spec)
            .finish()
    }
}
