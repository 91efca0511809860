//! Scripted transfer engine for driving the coordinator in tests.

use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transfer::{
    Attachment, EventSender, SessionId, TransferEngine, TransferEvent, TransferHandle,
};

#[derive(Default)]
struct Script {
    route: Option<EventSender>,
    attached: Vec<SessionId>,
    started: Vec<TransferHandle>,
    cancelled: Vec<TransferHandle>,
    running: Vec<TransferHandle>,
    buffered: Vec<TransferEvent>,
    refuse_next_start: bool,
    refuse_next_attach: bool,
}

/// Engine whose transfers only move when the test says so.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn attached(&self) -> Vec<SessionId> {
        self.script().attached.clone()
    }

    pub fn started(&self) -> Vec<TransferHandle> {
        self.script().started.clone()
    }

    pub fn last_started(&self) -> TransferHandle {
        self.script().started.last().cloned().expect("a started transfer")
    }

    pub fn cancelled(&self) -> Vec<TransferHandle> {
        self.script().cancelled.clone()
    }

    pub fn refuse_next_start(&self) {
        self.script().refuse_next_start = true;
    }

    pub fn refuse_next_attach(&self) {
        self.script().refuse_next_attach = true;
    }

    /// Pretends a transfer is already running in the engine.
    pub fn adopt_running(&self, handle: TransferHandle) {
        self.script().running.push(handle);
    }

    /// Drops the event route as if the process had gone away.
    pub fn detach(&self) {
        self.script().route = None;
    }

    /// Queues a terminal event for the next attach.
    pub fn buffer(&self, event: TransferEvent) {
        let mut script = self.script();
        script.running.retain(|h| h != event.handle());
        script.buffered.push(event);
    }

    /// Sends an event to the attached coordinator.
    pub fn emit(&self, event: TransferEvent) {
        let mut script = self.script();
        if event.is_terminal() {
            script.running.retain(|h| h != event.handle());
        }
        script
            .route
            .as_ref()
            .expect("engine attached")
            .send(event)
            .expect("coordinator listening");
    }

    pub fn progress(&self, handle: &TransferHandle, written: u64, total: Option<u64>) {
        self.emit(TransferEvent::Progress {
            handle: handle.clone(),
            written,
            total,
        });
    }

    pub fn succeed(&self, handle: &TransferHandle, artifact: &Path) {
        self.emit(TransferEvent::Success {
            handle: handle.clone(),
            artifact: artifact.to_path_buf(),
        });
    }

    pub fn fail(&self, handle: &TransferHandle, error: &str) {
        self.emit(TransferEvent::Failure {
            handle: handle.clone(),
            error: error.to_string(),
        });
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn attach(&self, session: &SessionId) -> Result<Attachment> {
        let mut script = self.script();
        if mem::take(&mut script.refuse_next_attach) {
            return Err(Error::Transfer(format!("no such session {session}")));
        }
        let (tx, events) = mpsc::unbounded_channel();
        script.route = Some(tx);
        script.attached.push(session.clone());
        Ok(Attachment {
            events,
            in_flight: script.running.clone(),
            pending: mem::take(&mut script.buffered),
        })
    }

    async fn start(&self, source: &Url) -> Result<TransferHandle> {
        let mut script = self.script();
        if mem::take(&mut script.refuse_next_start) {
            return Err(Error::Transfer("engine refused".to_string()));
        }
        let handle = TransferHandle::new(source.clone());
        script.started.push(handle.clone());
        script.running.push(handle.clone());
        Ok(handle)
    }

    fn cancel(&self, handle: &TransferHandle) {
        let mut script = self.script();
        script.cancelled.push(handle.clone());
        if let Some(pos) = script.running.iter().position(|h| h == handle) {
            script.running.remove(pos);
            if let Some(route) = &script.route {
                let _ = route.send(TransferEvent::Failure {
                    handle: handle.clone(),
                    error: Error::Cancelled.to_string(),
                });
            }
        }
    }
}
