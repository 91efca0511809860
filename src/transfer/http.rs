//! HTTP transfer engine built on `reqwest`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::journal::{SessionJournal, TransferOutcome};
use super::{Attachment, EventSender, SessionId, TransferEngine, TransferEvent, TransferHandle};
use crate::config::{AppConfig, TransferConfig};
use crate::error::{Error, Result};
use crate::format::format_bytes;

/// Failure text for transfers whose process went away mid-flight.
pub const INTERRUPTED: &str = "transfer interrupted before it finished";

/// Builds a configured HTTP client for video transfers.
fn build_http_client(config: &TransferConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// State shared between the engine and its transfer tasks.
#[derive(Default)]
struct Shared {
    journal: Option<SessionJournal>,
    route: Option<EventSender>,
    live: HashMap<String, CancellationToken>,
}

/// Downloads over HTTP(S), one tokio task per transfer.
///
/// Bytes are streamed into `<staging_dir>/<id>.part`. Each transfer is
/// journaled under `state_dir` so that outcomes reached while no
/// coordinator is attached are handed out on the next attach.
pub struct HttpTransferEngine {
    client: reqwest::Client,
    staging_dir: PathBuf,
    state_dir: PathBuf,
    cleanup_on_error: bool,
    shared: Arc<Mutex<Shared>>,
}

impl HttpTransferEngine {
    /// Creates an engine from the application configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = build_http_client(&config.transfer)?;
        Ok(Self::with_client(
            client,
            &config.paths.staging_dir,
            &config.paths.state_dir,
            config.transfer.cleanup_on_error,
        ))
    }

    /// Creates an engine around an existing client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        staging_dir: &Path,
        state_dir: &Path,
        cleanup_on_error: bool,
    ) -> Self {
        Self {
            client,
            staging_dir: staging_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            cleanup_on_error,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Number of transfers currently running in this process.
    #[must_use]
    pub fn active_transfers(&self) -> usize {
        lock(&self.shared).live.len()
    }

    fn staging_path(&self, handle: &TransferHandle) -> PathBuf {
        self.staging_dir.join(format!("{}.part", handle.id()))
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn attach(&self, session: &SessionId) -> Result<Attachment> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut shared = lock(&self.shared);
        let mut journal = SessionJournal::open(&self.state_dir, session)?;

        // Running entries with no task in this process died with a previous one.
        let orphaned: Vec<String> = journal
            .running()
            .filter(|entry| !shared.live.contains_key(&entry.id))
            .map(|entry| entry.id.clone())
            .collect();
        for id in &orphaned {
            log::warn!("Transfer {id} did not survive the previous process");
            journal.record_outcome(
                id,
                TransferOutcome::Failed {
                    error: INTERRUPTED.to_string(),
                },
            );
            let _ = std::fs::remove_file(self.staging_dir.join(format!("{id}.part")));
        }

        let pending: Vec<TransferEvent> = journal
            .take_terminal()
            .into_iter()
            .filter_map(|entry| {
                let id = entry.id.clone();
                let event = entry.into_event();
                if event.is_none() {
                    log::warn!("Dropping journal entry {id} with an unreadable source");
                }
                event
            })
            .collect();
        let in_flight: Vec<TransferHandle> =
            journal.running().filter_map(|entry| entry.handle()).collect();
        journal.save()?;

        log::info!(
            "Attached to session {session}: {} running, {} buffered",
            in_flight.len(),
            pending.len()
        );
        shared.journal = Some(journal);
        shared.route = Some(tx);

        Ok(Attachment {
            events,
            in_flight,
            pending,
        })
    }

    async fn start(&self, source: &Url) -> Result<TransferHandle> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let handle = TransferHandle::new(source.clone());
        let token = CancellationToken::new();
        let session = {
            let mut shared = lock(&self.shared);
            let Some(journal) = shared.journal.as_mut() else {
                return Err(Error::Transfer(
                    "engine is not attached to a session".to_string(),
                ));
            };
            journal.record_started(&handle);
            journal.save()?;
            let session = journal.session_id();
            shared
                .live
                .insert(handle.id().to_string(), token.clone());
            session
        };

        let task = TransferTask {
            client: self.client.clone(),
            part: self.staging_path(&handle),
            handle: handle.clone(),
            token,
            session,
            state_dir: self.state_dir.clone(),
            cleanup_on_error: self.cleanup_on_error,
            shared: Arc::clone(&self.shared),
        };
        tokio::spawn(task.run());

        log::info!("Transfer started: {handle}");
        Ok(handle)
    }

    fn cancel(&self, handle: &TransferHandle) {
        if let Some(token) = lock(&self.shared).live.get(handle.id()) {
            log::info!("Cancelling transfer {handle}");
            token.cancel();
        }
    }
}

/// One running transfer.
struct TransferTask {
    client: reqwest::Client,
    handle: TransferHandle,
    part: PathBuf,
    token: CancellationToken,
    session: SessionId,
    state_dir: PathBuf,
    cleanup_on_error: bool,
    shared: Arc<Mutex<Shared>>,
}

impl TransferTask {
    async fn run(self) {
        let result = tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Error::Cancelled),
            res = self.fetch() => res,
        };

        let event = match result {
            Ok(written) => {
                log::info!(
                    "Transfer finished: {} ({})",
                    self.handle,
                    format_bytes(written)
                );
                TransferEvent::Success {
                    handle: self.handle.clone(),
                    artifact: self.part.clone(),
                }
            }
            Err(e) => {
                if self.cleanup_on_error {
                    let _ = tokio::fs::remove_file(&self.part).await;
                }
                log::warn!("Transfer failed: {}: {e}", self.handle);
                TransferEvent::Failure {
                    handle: self.handle.clone(),
                    error: e.to_string(),
                }
            }
        };
        self.finish(event);
    }

    /// Streams the response body into the staging file.
    async fn fetch(&self) -> Result<u64> {
        let mut response = self
            .client
            .get(self.handle.source().clone())
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(&self.part).await?;
        let mut written = 0u64;
        self.emit(TransferEvent::Progress {
            handle: self.handle.clone(),
            written,
            total,
        });

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.emit(TransferEvent::Progress {
                handle: self.handle.clone(),
                written,
                total,
            });
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total
            && written < total
        {
            return Err(Error::Transfer(format!(
                "connection closed after {written} of {total} bytes"
            )));
        }
        Ok(written)
    }

    /// Forwards a progress report if anyone is listening.
    fn emit(&self, event: TransferEvent) {
        if let Some(route) = lock(&self.shared).route.as_ref() {
            let _ = route.send(event);
        }
    }

    /// Delivers the terminal event, or journals it for the next attach.
    ///
    /// A cancel that lands before the live entry is dropped always wins,
    /// even over a body that has fully arrived.
    fn finish(&self, event: TransferEvent) {
        let mut shared = lock(&self.shared);
        shared.live.remove(self.handle.id());

        let event = match event {
            TransferEvent::Success { handle, artifact } if self.token.is_cancelled() => {
                log::warn!("Transfer {handle} was cancelled as it finished");
                if let Err(e) = std::fs::remove_file(&artifact) {
                    log::warn!("Could not remove {}: {e}", artifact.display());
                }
                TransferEvent::Failure {
                    handle,
                    error: Error::Cancelled.to_string(),
                }
            }
            event => event,
        };

        let delivered = shared
            .route
            .as_ref()
            .is_some_and(|route| route.send(event.clone()).is_ok());

        let id = self.handle.id();
        let update = |journal: &mut SessionJournal| {
            if delivered {
                journal.remove(id);
            } else {
                let outcome = match event {
                    TransferEvent::Success { artifact, .. } => {
                        TransferOutcome::Finished { artifact }
                    }
                    TransferEvent::Failure { error, .. } => TransferOutcome::Failed { error },
                    TransferEvent::Progress { .. } => TransferOutcome::Running,
                };
                log::info!("No coordinator attached, buffering outcome of {id}");
                journal.record_outcome(id, outcome);
            }
            journal.save()
        };

        let saved = match shared.journal.as_mut() {
            Some(journal) if journal.session_id() == self.session => update(journal),
            _ => SessionJournal::open(&self.state_dir, &self.session)
                .and_then(|mut journal| update(&mut journal)),
        };
        if let Err(e) = saved {
            log::error!("Failed to update journal for session {}: {e}", self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const BODY: &[u8] = b"0123456789";

    fn engine(dir: &TempDir) -> HttpTransferEngine {
        HttpTransferEngine::with_client(
            reqwest::Client::new(),
            &dir.path().join("staging"),
            &dir.path().join("sessions"),
            true,
        )
    }

    fn ok_response() -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            BODY.len()
        )
        .into_bytes();
        response.extend_from_slice(BODY);
        response
    }

    /// Serves one connection with a canned response, then holds it open for `linger`.
    async fn serve_once(response: Vec<u8>, linger: Duration) -> (Url, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response).await.unwrap();
            tokio::time::sleep(linger).await;
            let _ = socket.shutdown().await;
        });
        (
            Url::parse(&format!("http://{addr}/video.mp4")).unwrap(),
            task,
        )
    }

    async fn next_terminal(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event channel open");
                if event.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("terminal event in time")
    }

    #[tokio::test]
    async fn start_requires_attach() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let url = Url::parse("http://127.0.0.1:9/a.mp4").unwrap();
        assert!(matches!(
            engine.start(&url).await,
            Err(Error::Transfer(_))
        ));
    }

    #[tokio::test]
    async fn download_reports_progress_then_success() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut attachment = engine.attach(&"s".into()).await.unwrap();
        let (url, server) = serve_once(ok_response(), Duration::ZERO).await;

        let handle = engine.start(&url).await.unwrap();
        assert_eq!(handle.source(), &url);

        let mut last_written = 0;
        let artifact = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match attachment.events.recv().await.unwrap() {
                    TransferEvent::Progress { written, total, .. } => {
                        assert!(written >= last_written);
                        assert_eq!(total, Some(BODY.len() as u64));
                        last_written = written;
                    }
                    TransferEvent::Success { artifact, handle: h } => {
                        assert_eq!(h, handle);
                        break artifact;
                    }
                    TransferEvent::Failure { error, .. } => panic!("unexpected failure: {error}"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(last_written, BODY.len() as u64);
        assert_eq!(std::fs::read(&artifact).unwrap(), BODY);
        assert_eq!(engine.active_transfers(), 0);
        server.await.unwrap();

        // Delivered outcomes are not kept for a later attach.
        let again = engine.attach(&"s".into()).await.unwrap();
        assert!(again.pending.is_empty());
    }

    #[tokio::test]
    async fn http_error_status_is_failure() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut attachment = engine.attach(&"s".into()).await.unwrap();
        let response =
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let (url, _server) = serve_once(response, Duration::ZERO).await;

        let handle = engine.start(&url).await.unwrap();
        let event = next_terminal(&mut attachment.events).await;

        let TransferEvent::Failure { handle: h, error } = event else {
            panic!("expected failure, got {event:?}");
        };
        assert_eq!(h, handle);
        assert!(error.contains("404"));
        assert!(!engine.staging_path(&handle).exists());
    }

    #[tokio::test]
    async fn cancel_yields_failure() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut attachment = engine.attach(&"s".into()).await.unwrap();
        let stalled =
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial".to_vec();
        let (url, _server) = serve_once(stalled, Duration::from_secs(30)).await;

        let handle = engine.start(&url).await.unwrap();
        // Wait until the body has started flowing.
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = attachment.events.recv().await {
                if matches!(event, TransferEvent::Progress { written, .. } if written > 0) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        engine.cancel(&handle);
        let event = next_terminal(&mut attachment.events).await;
        assert!(matches!(event, TransferEvent::Failure { .. }));
        assert_eq!(engine.active_transfers(), 0);
    }

    #[tokio::test]
    async fn cancel_right_after_start_wins_over_complete_body() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut attachment = engine.attach(&"s".into()).await.unwrap();
        let (url, _server) = serve_once(ok_response(), Duration::ZERO).await;

        let handle = engine.start(&url).await.unwrap();
        engine.cancel(&handle);

        let event = next_terminal(&mut attachment.events).await;
        assert_eq!(
            event,
            TransferEvent::Failure {
                handle: handle.clone(),
                error: Error::Cancelled.to_string(),
            }
        );
        assert!(!engine.staging_path(&handle).exists());
    }

    #[tokio::test]
    async fn cancel_after_body_completes_turns_success_into_failure() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut attachment = engine.attach(&"s".into()).await.unwrap();
        let url = Url::parse("http://127.0.0.1:9/a.mp4").unwrap();
        let handle = TransferHandle::new(url);
        let token = CancellationToken::new();
        lock(&engine.shared)
            .live
            .insert(handle.id().to_string(), token.clone());

        // The body is on disk and the task is about to report it.
        let part = engine.staging_path(&handle);
        std::fs::create_dir_all(part.parent().unwrap()).unwrap();
        std::fs::write(&part, BODY).unwrap();
        let task = TransferTask {
            client: engine.client.clone(),
            handle: handle.clone(),
            part: part.clone(),
            token,
            session: SessionId::new("s"),
            state_dir: dir.path().join("sessions"),
            cleanup_on_error: true,
            shared: Arc::clone(&engine.shared),
        };
        engine.cancel(&handle);
        task.finish(TransferEvent::Success {
            handle: handle.clone(),
            artifact: part.clone(),
        });

        let event = next_terminal(&mut attachment.events).await;
        assert!(matches!(event, TransferEvent::Failure { handle: h, .. } if h == handle));
        assert!(!part.exists());
        assert_eq!(engine.active_transfers(), 0);
    }

    #[tokio::test]
    async fn outcome_buffered_while_detached_is_delivered_once() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let session = SessionId::new("bg");
        let attachment = engine.attach(&session).await.unwrap();
        drop(attachment);

        let (url, server) = serve_once(ok_response(), Duration::ZERO).await;
        let handle = engine.start(&url).await.unwrap();
        server.await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.active_transfers() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let first = engine.attach(&session).await.unwrap();
        assert_eq!(first.pending.len(), 1);
        let TransferEvent::Success { handle: h, artifact } = &first.pending[0] else {
            panic!("expected buffered success");
        };
        assert_eq!(h, &handle);
        assert_eq!(std::fs::read(artifact).unwrap(), BODY);

        let second = engine.attach(&session).await.unwrap();
        assert!(second.pending.is_empty());
    }

    #[tokio::test]
    async fn running_transfer_survives_reattach() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let session = SessionId::new("bg");
        let first = engine.attach(&session).await.unwrap();
        let stalled =
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial".to_vec();
        let (url, _server) = serve_once(stalled, Duration::from_secs(30)).await;
        let handle = engine.start(&url).await.unwrap();

        let mut second = engine.attach(&session).await.unwrap();
        drop(first);
        assert_eq!(second.in_flight, vec![handle.clone()]);
        assert!(second.pending.is_empty());

        engine.cancel(&handle);
        let event = next_terminal(&mut second.events).await;
        assert_eq!(event.handle(), &handle);
    }

    #[tokio::test]
    async fn transfer_from_dead_process_is_reported_interrupted() {
        let dir = TempDir::new().unwrap();
        let session = SessionId::new("bg");
        let handle = TransferHandle::new(Url::parse("https://host/a.mp4").unwrap());
        let mut journal = SessionJournal::new(&dir.path().join("sessions"), &session);
        journal.record_started(&handle);
        journal.save().unwrap();

        let engine = engine(&dir);
        let attachment = engine.attach(&session).await.unwrap();

        assert!(attachment.in_flight.is_empty());
        assert_eq!(
            attachment.pending,
            vec![TransferEvent::Failure {
                handle,
                error: INTERRUPTED.to_string(),
            }]
        );
        let reloaded = SessionJournal::open(&dir.path().join("sessions"), &session).unwrap();
        assert!(reloaded.transfers.is_empty());
    }
}
