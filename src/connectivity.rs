//! Network reachability monitoring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Whether the host can currently reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// A route to the network exists.
    Satisfied,
    /// No usable route.
    Unsatisfied,
}

impl ConnectivityStatus {
    /// Returns true for [`ConnectivityStatus::Satisfied`].
    #[must_use]
    pub const fn is_satisfied(self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// A single reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Checks reachability once.
    async fn probe(&self) -> ConnectivityStatus;
}

/// Probes by opening TCP connections.
///
/// The network counts as reachable if any target accepts a connection
/// before the timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    targets: Vec<String>,
    timeout: Duration,
}

impl TcpProbe {
    /// Creates a probe over `host:port` targets.
    #[must_use]
    pub const fn new(targets: Vec<String>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> ConnectivityStatus {
        for target in &self.targets {
            let attempt = tokio::net::TcpStream::connect(target.as_str());
            if matches!(tokio::time::timeout(self.timeout, attempt).await, Ok(Ok(_))) {
                return ConnectivityStatus::Satisfied;
            }
        }
        ConnectivityStatus::Unsatisfied
    }
}

/// Holds the current connectivity status and fans out changes.
///
/// Subscribers are only woken when the status actually changes.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    status: watch::Sender<ConnectivityStatus>,
    shutdown: CancellationToken,
}

impl ConnectivityMonitor {
    /// Creates a monitor whose status is only changed through [`set_status`](Self::set_status).
    #[must_use]
    pub fn new(initial: ConnectivityStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            status,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a monitor fed by `probe` every `interval`.
    ///
    /// The first probe runs before this returns, so the initial status is
    /// real. Polling stops when the monitor is dropped.
    pub async fn spawn<P: ConnectivityProbe>(probe: P, interval: Duration) -> Arc<Self> {
        let initial = probe.probe().await;
        log::info!("Initial connectivity: {initial:?}");
        let monitor = Arc::new(Self::new(initial));

        let sender = monitor.status.clone();
        let shutdown = monitor.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = probe.probe().await;
                        publish(&sender, status);
                    }
                }
            }
        });

        monitor
    }

    /// Returns the most recently observed status.
    #[must_use]
    pub fn current_status(&self) -> ConnectivityStatus {
        *self.status.borrow()
    }

    /// Records a status. Returns true if it differs from the previous one.
    pub fn set_status(&self, status: ConnectivityStatus) -> bool {
        publish(&self.status, status)
    }

    /// Returns a receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    /// Runs `handler` on a background task for every status transition.
    pub fn on_status_change<H>(&self, handler: H) -> JoinHandle<()>
    where
        H: Fn(ConnectivityStatus) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *rx.borrow_and_update();
                        handler(status);
                    }
                }
            }
        })
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn publish(sender: &watch::Sender<ConnectivityStatus>, status: ConnectivityStatus) -> bool {
    let changed = sender.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
    if changed {
        log::info!("Connectivity changed: {status:?}");
    }
    changed
}
