//! Connectivity Monitor
//!
//! Single debounced view of device connectivity. Raw readings come from a
//! `ConnectivitySource` (an OS bridge, or an HTTP probe); a change is only
//! published once the new status has held for the stabilization window.
//! Source errors read as `unknown`, never as `offline`.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::listeners::{ListenerSet, Subscription};
use super::models::{NetworkState, NetworkStatus};

// ============================================================================
// Connectivity Sources
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("Connectivity source unavailable: {0}")]
    Unavailable(String),

    #[error("Connectivity probe failed: {0}")]
    Probe(String),
}

/// Raw connectivity signal
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    /// Point-in-time reading
    async fn snapshot(&self) -> Result<NetworkStatus, ConnectivityError>;

    /// Wait for the next raw reading. `None` once the source has shut down.
    async fn next_reading(&self) -> Option<Result<NetworkStatus, ConnectivityError>>;
}

/// Source fed by the host platform's connectivity callbacks
pub struct ChannelSource {
    initial: NetworkStatus,
    receiver: Mutex<mpsc::UnboundedReceiver<NetworkStatus>>,
}

impl ChannelSource {
    /// Returns the source and the sender the platform bridge reports into
    pub fn new(initial: NetworkStatus) -> (Self, mpsc::UnboundedSender<NetworkStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            initial,
            receiver: Mutex::new(rx),
        };
        (source, tx)
    }
}

#[async_trait]
impl ConnectivitySource for ChannelSource {
    async fn snapshot(&self) -> Result<NetworkStatus, ConnectivityError> {
        Ok(self.initial)
    }

    async fn next_reading(&self) -> Option<Result<NetworkStatus, ConnectivityError>> {
        self.receiver.lock().await.recv().await.map(Ok)
    }
}

/// Source that probes a URL with HEAD requests
///
/// Any HTTP response means the network path works; transport failures read
/// as offline.
pub struct HttpProbe {
    client: Option<reqwest::Client>,
    url: String,
    interval: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                log::error!("Failed to create probe HTTP client: {}", e);
                None
            }
        };

        Self {
            client,
            url: url.into(),
            interval,
        }
    }

    async fn probe(&self) -> Result<NetworkStatus, ConnectivityError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectivityError::Unavailable("no HTTP client".to_string()))?;

        match client.head(&self.url).send().await {
            Ok(_) => Ok(NetworkStatus::Online),
            Err(e) if e.is_builder() => Err(ConnectivityError::Probe(e.to_string())),
            Err(e) => {
                log::debug!("Probe to {} failed: {}", self.url, e);
                Ok(NetworkStatus::Offline)
            }
        }
    }
}

#[async_trait]
impl ConnectivitySource for HttpProbe {
    async fn snapshot(&self) -> Result<NetworkStatus, ConnectivityError> {
        self.probe().await
    }

    async fn next_reading(&self) -> Option<Result<NetworkStatus, ConnectivityError>> {
        tokio::time::sleep(self.interval).await;
        Some(self.probe().await)
    }
}

// ============================================================================
// Network Monitor
// ============================================================================

struct MonitorState {
    current: NetworkState,
    /// Status waiting out the stabilization window
    candidate: Option<NetworkStatus>,
    generation: u64,
}

/// Debounced connectivity monitor
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<StdMutex<MonitorState>>,
    listeners: ListenerSet<NetworkState>,
    debounce: Duration,
    pump: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl NetworkMonitor {
    /// Monitor with no reading yet (`unknown`)
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Arc::new(StdMutex::new(MonitorState {
                current: NetworkState::unknown(),
                candidate: None,
                generation: 0,
            })),
            listeners: ListenerSet::new(),
            debounce,
            pump: Arc::new(StdMutex::new(None)),
        }
    }

    /// Seed from the source's snapshot and follow its readings
    pub async fn start(source: Arc<dyn ConnectivitySource>, debounce: Duration) -> Self {
        let monitor = Self::new(debounce);

        let initial = match source.snapshot().await {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Connectivity snapshot unavailable: {}", e);
                NetworkStatus::Unknown
            }
        };
        monitor.lock_state().current = NetworkState { status: initial, changed_at: Utc::now() };
        log::info!("Network monitor started ({:?})", initial);

        let pump_monitor = monitor.clone();
        let handle = tokio::spawn(async move {
            while let Some(reading) = source.next_reading().await {
                let status = reading.unwrap_or_else(|e| {
                    log::warn!("Connectivity reading failed: {}", e);
                    NetworkStatus::Unknown
                });
                pump_monitor.report(status);
            }
            log::info!("Connectivity source closed");
        });
        *monitor.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        monitor
    }

    /// Stop following the source. The last state stays readable.
    pub fn stop(&self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Last stable state; never blocks on the source
    pub fn snapshot(&self) -> NetworkState {
        self.lock_state().current
    }

    pub fn is_online(&self) -> bool {
        self.snapshot().is_online()
    }

    /// Register for stable transitions
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Feed one raw reading
    ///
    /// Must be called within a Tokio runtime when the debounce window is
    /// non-zero.
    pub fn report(&self, status: NetworkStatus) {
        let generation = {
            let mut state = self.lock_state();

            if status == state.current.status {
                // Flapped back before the window elapsed
                if state.candidate.take().is_some() {
                    state.generation += 1;
                    log::debug!("Connectivity change to {:?} discarded (flap)", state.current.status);
                }
                return;
            }
            if state.candidate == Some(status) {
                return;
            }

            state.candidate = Some(status);
            state.generation += 1;
            state.generation
        };

        if self.debounce.is_zero() {
            self.commit(generation, status);
            return;
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(monitor.debounce).await;
            monitor.commit(generation, status);
        });
    }

    fn commit(&self, generation: u64, status: NetworkStatus) {
        let next = {
            let mut state = self.lock_state();
            if state.generation != generation || state.candidate != Some(status) {
                return;
            }
            state.candidate = None;
            state.current = NetworkState { status, changed_at: Utc::now() };
            state.current
        };

        log::info!("Network status changed to {:?}", next.status);
        self.listeners.emit(&next);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================
