//! Device store
//!
//! Owns the caller-side broker session and the current [`Registry`].
//! Refreshes re-fetch the device list with a bounded number of attempts and
//! replace the registry only when one succeeds.

use common::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::{ApiError, RefreshError};
use crate::registry::Registry;
use crate::session::ApiClient;

/// Attempts per refresh
pub const DEFAULT_REFRESH_ATTEMPTS: u32 = 5;

/// Pause between failed attempts
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(2);

/// How hard a refresh tries
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Emit [`StoreEvent::RefreshFailed`] when all attempts fail
    pub notify_errors: bool,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_REFRESH_ATTEMPTS,
            retry_delay: DEFAULT_REFRESH_DELAY,
            notify_errors: true,
        }
    }
}

/// Outcome of a refresh, for whoever displays the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Refreshed { devices: usize },
    RefreshFailed { attempts: u32, error: String },
}

/// Shared handle to the caller session and registry
pub struct DeviceStore<C: Connector> {
    api: Arc<Mutex<ApiClient<C>>>,
    registry: Arc<RwLock<Registry>>,
    policy: RefreshPolicy,
    events: async_channel::Sender<StoreEvent>,
}

impl<C: Connector> Clone for DeviceStore<C> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            events: self.events.clone(),
        }
    }
}

impl<C: Connector> DeviceStore<C> {
    pub fn new(api: ApiClient<C>, policy: RefreshPolicy) -> (Self, async_channel::Receiver<StoreEvent>) {
        let (events, rx) = async_channel::unbounded();
        let store = Self {
            api: Arc::new(Mutex::new(api)),
            registry: Arc::new(RwLock::new(Registry::default())),
            policy,
            events,
        };
        (store, rx)
    }

    /// The caller-side session; hold the lock for one request/response pair
    pub fn api(&self) -> &Arc<Mutex<ApiClient<C>>> {
        &self.api
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub async fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().await
    }

    pub async fn snapshot(&self) -> Registry {
        self.registry.read().await.clone()
    }

    /// Optimistically record a new holder after a successful request
    pub async fn set_vm(&self, label: &str, vm: &str) -> bool {
        self.registry.write().await.set_vm(label, vm)
    }

    /// Re-fetch the device list and replace the registry
    ///
    /// Tries up to `max_attempts` times, reconnecting when the session has
    /// been closed, sleeping `retry_delay` between failures. The last failure
    /// returns at once. On exhaustion the previous registry is kept.
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.fetch().await {
                Ok(registry) => {
                    let devices = registry.len();
                    *self.registry.write().await = registry;
                    info!("Device list refreshed: {} devices", devices);
                    self.emit(StoreEvent::Refreshed { devices });
                    return Ok(devices);
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        error!("Giving up on device list after {} attempts", attempt);
                        if self.policy.notify_errors {
                            self.emit(StoreEvent::RefreshFailed {
                                attempts: attempt,
                                error: e.to_string(),
                            });
                        }
                        return Err(RefreshError {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    error!(
                        "Failed to fetch device list, trying again ({}). Error: {}",
                        attempt, e
                    );
                    sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// Run [`refresh`](Self::refresh) on its own task
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(e) = store.refresh().await {
                debug!("Background refresh ended: {}", e);
            }
        })
    }

    async fn fetch(&self) -> Result<Registry, ApiError> {
        let mut api = self.api.lock().await;
        if !api.is_connected() {
            api.connect().await?;
        }
        let list = api.list_devices().await?;
        Ok(Registry::build(list.devices))
    }

    fn emit(&self, event: StoreEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Store event dropped, receiver is gone");
        }
    }
}
