//! Download coordinator.
//!
//! A single task owns every item and every active transfer registration.
//! Callers talk to it through a [`CoordinatorHandle`]; engine events and
//! connectivity changes are consumed by the same task, so all state
//! changes are applied one at a time and published as whole snapshots.

pub mod ledger;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;

use crate::config::AppConfig;
use crate::connectivity::ConnectivityStatus;
use crate::error::{Error, Result};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::model::{ErrorKind, Item, ItemId, ItemState, Notice, Snapshot};
use crate::store::LocalStore;
use crate::transfer::{
    Attachment, EventReceiver, SessionId, TransferEngine, TransferEvent, TransferHandle,
};
use crate::url::parse_source;

use ledger::Ledger;

/// Notice sent when a request is refused for lack of network.
pub const NO_CONNECTION: &str = "No Internet Connection";
/// Notice sent when losing the network cancelled running transfers.
pub const CONNECTION_LOST: &str = "Internet connection lost. Downloads cancelled.";
/// Notice sent after a local video was removed.
pub const DELETED: &str = "Video Deleted Successfully.";

const COMMAND_BUFFER: usize = 64;
const NOTICE_BUFFER: usize = 64;

/// Calls the wrapped acknowledgment when dropped.
///
/// Whatever path a reattach command takes, including never reaching the
/// coordinator, the host hears back exactly once.
struct Acknowledgment(Option<Box<dyn FnOnce() + Send>>);

impl Acknowledgment {
    fn new(done: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(done)))
    }
}

impl Drop for Acknowledgment {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            done();
        }
    }
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acknowledgment")
    }
}

#[derive(Debug)]
enum Command {
    Configure {
        sources: Vec<String>,
        reply: oneshot::Sender<Snapshot>,
    },
    Request {
        id: ItemId,
        reply: oneshot::Sender<Result<ItemState>>,
    },
    Delete {
        id: ItemId,
        reply: oneshot::Sender<Result<ItemState>>,
    },
    Playback {
        id: ItemId,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    Reattach {
        session: SessionId,
        done: Acknowledgment,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle/event pairs seen before the first item list was registered.
#[derive(Debug, Default)]
struct Parked {
    in_flight: Vec<TransferHandle>,
    events: Vec<TransferEvent>,
}

/// The task that owns item state.
pub struct Coordinator<E: TransferEngine, F: FileSystem = TokioFileSystem> {
    engine: Arc<E>,
    store: LocalStore<F>,
    ledger: Ledger,
    events: Option<EventReceiver>,
    connectivity: watch::Receiver<ConnectivityStatus>,
    connectivity_open: bool,
    parked: Parked,
    outbox: Vec<Notice>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Snapshot>,
    notices: broadcast::Sender<Notice>,
}

impl<E: TransferEngine, F: FileSystem + 'static> Coordinator<E, F> {
    /// Attaches to the configured session and starts the coordinator task.
    ///
    /// Transfers the engine reports as running or finished at this point
    /// are matched to items by source once [`CoordinatorHandle::configure`]
    /// registers them.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot attach to the session.
    pub async fn spawn(
        config: &AppConfig,
        engine: Arc<E>,
        store: LocalStore<F>,
        connectivity: watch::Receiver<ConnectivityStatus>,
    ) -> Result<CoordinatorHandle> {
        let session = SessionId::new(config.session.clone());
        let Attachment {
            events,
            in_flight,
            pending,
        } = engine.attach(&session).await?;
        log::info!(
            "Coordinator attached to session {session} ({} running, {} buffered)",
            in_flight.len(),
            pending.len()
        );

        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (snapshots, snapshot_rx) = watch::channel(Snapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let coordinator = Self {
            engine,
            store,
            ledger: Ledger::new(),
            events: Some(events),
            connectivity,
            connectivity_open: true,
            parked: Parked {
                in_flight,
                events: pending,
            },
            outbox: Vec::new(),
            commands,
            snapshots,
            notices: notices.clone(),
        };
        tokio::spawn(coordinator.run());

        Ok(CoordinatorHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            notices,
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = next_event(&mut self.events), if self.events.is_some() => {
                    let Some(event) = event else {
                        log::warn!("Transfer engine closed the event channel");
                        self.events = None;
                        continue;
                    };
                    let mut changed = self.dispatch(event).await;
                    while let Some(event) = self.try_next_event() {
                        changed |= self.dispatch(event).await;
                    }
                    if changed {
                        self.publish();
                    }
                }
                changed = self.connectivity.changed(), if self.connectivity_open => {
                    if changed.is_err() {
                        log::debug!("Connectivity monitor gone");
                        self.connectivity_open = false;
                        continue;
                    }
                    let status = *self.connectivity.borrow_and_update();
                    if !status.is_satisfied() {
                        self.on_connectivity_lost();
                    }
                }
            }
        }
        log::info!("Coordinator stopped");
    }

    fn try_next_event(&mut self) -> Option<TransferEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// Applies a live engine event, or parks it while no items are registered
    /// so it is replayed against the first item list.
    async fn dispatch(&mut self, event: TransferEvent) -> bool {
        if self.ledger.generation() == 0 {
            log::debug!("Parking event for {} until items are registered", event.handle());
            self.parked.events.push(event);
            return false;
        }
        self.on_event(event).await
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure { sources, reply } => {
                let snapshot = self.configure(sources).await;
                let _ = reply.send(snapshot);
            }
            Command::Request { id, reply } => {
                let result = self.request(&id).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Delete { id, reply } => {
                let result = self.delete(&id).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Playback { id, reply } => {
                let _ = reply.send(self.playback_path(&id).await);
            }
            Command::Reattach {
                session,
                done,
                reply,
            } => {
                let result = self.reattach(&session).await;
                self.publish();
                drop(done);
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    fn publish(&mut self) {
        let snapshot = self.ledger.snapshot();
        log::debug!(
            "Publishing revision {} ({} items, {} active)",
            snapshot.revision,
            snapshot.items.len(),
            snapshot.active_transfers
        );
        self.snapshots.send_replace(snapshot);

        for notice in self.outbox.drain(..) {
            // Nobody listening is fine.
            let _ = self.notices.send(notice);
        }
    }

    /// Queues a notice. It goes out right after the next published snapshot,
    /// so listeners never see a notice ahead of the state it describes.
    fn notify(&mut self, notice: Notice) {
        self.outbox.push(notice);
    }

    fn artifact_path(&self, item: &Item) -> PathBuf {
        self.store.deterministic_path(&item.title)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn configure(&mut self, sources: Vec<String>) -> Snapshot {
        let mut items = Vec::with_capacity(sources.len());
        for (index, raw) in sources.iter().enumerate() {
            let source = match parse_source(raw) {
                Ok(source) => source,
                Err(e) => {
                    log::warn!("Skipping registration entry {index}: {e}");
                    self.notify(Notice::error(None, e.kind(), e.to_string()));
                    continue;
                }
            };
            let mut item = Item::new(index, source);
            if self.store.exists(&self.artifact_path(&item)).await {
                item.mark_completed();
            }
            items.push(item);
        }

        let previous = self.ledger.replace(items);
        let mut in_flight: Vec<TransferHandle> =
            previous.into_iter().map(|(handle, _)| handle).collect();
        in_flight.append(&mut self.parked.in_flight);
        let pending = std::mem::take(&mut self.parked.events);
        self.adopt(in_flight, pending).await;

        log::info!(
            "Registered {} of {} sources (generation {})",
            self.ledger.len(),
            sources.len(),
            self.ledger.generation()
        );
        self.publish();
        self.snapshots.borrow().clone()
    }

    async fn request(&mut self, id: &ItemId) -> Result<ItemState> {
        let item = self
            .ledger
            .item(id)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;
        if matches!(item.state, ItemState::InProgress | ItemState::Completed) {
            log::debug!("Ignoring request for item {id} in state {:?}", item.state);
            return Ok(item.state);
        }
        let source = item.source.clone();

        if !self.connectivity.borrow().is_satisfied() {
            log::warn!("Request for item {id} refused: offline");
            self.ledger.fail(id);
            self.notify(Notice::error(
                Some(id.clone()),
                ErrorKind::Connectivity,
                NO_CONNECTION,
            ));
            return Ok(ItemState::Failed);
        }

        match self.engine.start(&source).await {
            Ok(handle) => {
                log::info!("Item {id} downloading via {handle}");
                self.ledger.begin(id, handle);
                Ok(ItemState::InProgress)
            }
            Err(e) => {
                log::error!("Could not start transfer for item {id}: {e}");
                self.ledger.fail(id);
                self.notify(Notice::error(Some(id.clone()), e.kind(), e.to_string()));
                Ok(ItemState::Failed)
            }
        }
    }

    async fn delete(&mut self, id: &ItemId) -> Result<ItemState> {
        let item = self
            .ledger
            .item(id)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;
        if item.state == ItemState::InProgress {
            log::debug!("Ignoring delete for item {id} while it downloads");
            return Ok(item.state);
        }
        let path = self.artifact_path(item);

        match self.store.remove(&path).await {
            Ok(()) => {
                log::info!("Deleted {}", path.display());
                self.ledger.reset(id);
                self.notify(Notice::info(Some(id.clone()), DELETED));
                Ok(ItemState::Idle)
            }
            Err(e) => {
                log::error!("Could not delete video for item {id}: {e}");
                self.notify(Notice::error(Some(id.clone()), e.kind(), e.to_string()));
                Err(e)
            }
        }
    }

    async fn playback_path(&self, id: &ItemId) -> Result<PathBuf> {
        let item = self
            .ledger
            .item(id)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))?;
        let path = self.artifact_path(item);
        if self.store.exists(&path).await {
            Ok(path)
        } else {
            Err(Error::NotFound(format!("no local video for item {id}")))
        }
    }

    async fn reattach(&mut self, session: &SessionId) -> Result<()> {
        let Attachment {
            events,
            in_flight,
            pending,
        } = self.engine.attach(session).await?;
        log::info!(
            "Reattached to session {session} ({} running, {} buffered)",
            in_flight.len(),
            pending.len()
        );

        // Whatever was already queued on the old channel comes first.
        if let Some(mut old) = self.events.replace(events) {
            while let Ok(event) = old.try_recv() {
                self.dispatch(event).await;
            }
        }

        if self.ledger.generation() == 0 {
            self.parked.in_flight.extend(in_flight);
            self.parked.events.extend(pending);
        } else {
            self.adopt(in_flight, pending).await;
        }
        Ok(())
    }

    /// Binds transfers the ledger does not know to matching items, then
    /// replays buffered events through the normal transitions.
    async fn adopt(&mut self, in_flight: Vec<TransferHandle>, pending: Vec<TransferEvent>) {
        for handle in in_flight {
            if self.ledger.owner(&handle).is_some() {
                continue;
            }
            // Finished meanwhile; bound below when its result is replayed.
            if pending
                .iter()
                .any(|event| event.is_terminal() && event.handle() == &handle)
            {
                continue;
            }
            match self.ledger.adoptable(handle.source()) {
                Some(id) => {
                    log::info!("Item {id} resumes running transfer {handle}");
                    self.ledger.begin(&id, handle);
                }
                None => {
                    log::warn!("No item for running transfer {handle}, cancelling");
                    self.engine.cancel(&handle);
                }
            }
        }

        for event in pending {
            if self.ledger.owner(event.handle()).is_none()
                && let Some(id) = self.ledger.adoptable(event.handle().source())
            {
                log::info!("Item {id} collects buffered result of {}", event.handle());
                self.ledger.begin(&id, event.handle().clone());
            }
            self.on_event(event).await;
        }
    }

    // =========================================================================
    // Engine and connectivity events
    // =========================================================================

    /// Applies one engine event. Returns true if any item changed.
    async fn on_event(&mut self, event: TransferEvent) -> bool {
        match event {
            TransferEvent::Progress {
                handle,
                written,
                total,
            } => {
                let applied = self.ledger.progress(&handle, written, total);
                if !applied {
                    log::debug!("Ignoring progress for stale transfer {handle}");
                }
                applied
            }
            TransferEvent::Success { handle, artifact } => self.on_success(&handle, &artifact).await,
            TransferEvent::Failure { handle, error } => {
                let Some(id) = self.ledger.finish(&handle) else {
                    log::debug!("Ignoring failure of stale transfer {handle}: {error}");
                    return false;
                };
                log::warn!("Item {id} failed: {error}");
                self.ledger.fail(&id);
                self.notify(Notice::error(
                    Some(id),
                    ErrorKind::Transfer,
                    format!("Internet issue: {error}"),
                ));
                true
            }
        }
    }

    async fn on_success(&mut self, handle: &TransferHandle, artifact: &Path) -> bool {
        let Some(id) = self.ledger.finish(handle) else {
            log::debug!("Discarding artifact of stale transfer {handle}");
            if let Err(e) = self.store.discard(artifact).await {
                log::warn!("Could not discard stale artifact: {e}");
            }
            return false;
        };
        let Some(path) = self.ledger.item(&id).map(|item| self.artifact_path(item)) else {
            return false;
        };

        let committed = match self.store.commit(artifact, &path).await {
            Ok(()) if self.store.exists(&path).await => Ok(()),
            Ok(()) => Err(Error::storage(
                &path,
                io::Error::new(io::ErrorKind::NotFound, "artifact missing after commit"),
            )),
            Err(e) => Err(e),
        };

        match committed {
            Ok(()) => {
                log::info!("Item {id} saved to {}", path.display());
                self.ledger.complete(&id);
            }
            Err(e) => {
                log::error!("Could not store video for item {id}: {e}");
                self.ledger.fail(&id);
                self.notify(Notice::error(Some(id), e.kind(), e.to_string()));
            }
        }
        true
    }

    fn on_connectivity_lost(&mut self) {
        let cancelled = self.ledger.drain_active();
        if cancelled.is_empty() {
            log::info!("Connectivity lost with no running transfers");
            return;
        }
        for (handle, id) in &cancelled {
            self.engine.cancel(handle);
            self.ledger.fail(id);
        }
        log::warn!(
            "Connectivity lost, cancelled {} transfer(s)",
            cancelled.len()
        );
        self.notify(Notice::error(None, ErrorKind::Connectivity, CONNECTION_LOST));
        self.publish();
    }
}

async fn next_event(events: &mut Option<EventReceiver>) -> Option<TransferEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable front end of a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
    notices: broadcast::Sender<Notice>,
}

fn gone<T>(_: T) -> Error {
    Error::Channel("coordinator is not running".to_string())
}

impl CoordinatorHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(gone)?;
        rx.await.map_err(gone)
    }

    /// Replaces the item list with one item per valid source, in order.
    ///
    /// Identities are the positions in `sources`. Entries that do not parse
    /// are skipped with a validation notice. Returns the published snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the coordinator has stopped.
    pub async fn configure<I, S>(&self, sources: I) -> Result<Snapshot>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.call(|reply| Command::Configure { sources, reply }).await
    }

    /// Starts downloading an item and returns its resulting state.
    ///
    /// Items already downloading or downloaded are left alone. Offline
    /// requests fail the item immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown items.
    pub async fn request(&self, id: &ItemId) -> Result<ItemState> {
        let id = id.clone();
        self.call(|reply| Command::Request { id, reply }).await?
    }

    /// Deletes an item's local video and returns the item's resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if there is no video to delete or removal
    /// fails; the item is left as it was.
    pub async fn delete(&self, id: &ItemId) -> Result<ItemState> {
        let id = id.clone();
        self.call(|reply| Command::Delete { id, reply }).await?
    }

    /// Resolves the local video of an item for playback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the item or its video does not exist.
    pub async fn playback_path(&self, id: &ItemId) -> Result<PathBuf> {
        let id = id.clone();
        self.call(|reply| Command::Playback { id, reply }).await?
    }

    /// Rebinds the engine to `session` and reconciles everything it buffered.
    ///
    /// `done` runs exactly once after reconciliation, including when it fails
    /// or the coordinator has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot attach or the coordinator has
    /// stopped.
    pub async fn reattach(
        &self,
        session: SessionId,
        done: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let done = Acknowledgment::new(done);
        self.call(|reply| Command::Reattach {
            session,
            done,
            reply,
        })
        .await?
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver woken on every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Published snapshots as a stream, starting with the current one.
    #[must_use]
    pub fn snapshots(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Receiver for notices published from now on.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Stops the coordinator. Running transfers are left to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the coordinator already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands.send(Command::Shutdown).await.map_err(gone)
    }
}
