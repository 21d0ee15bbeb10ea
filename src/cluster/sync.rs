//! Replication Sync Pool
//!
//! One background worker per known peer. A trigger makes the worker push the
//! auth, config and log stores to the peer concurrently, each as a chunked
//! `POST /cluster/sync/{kind}` whose body is the storage dump since the last
//! watermark and whose trailer carries the new watermark. The watermark only
//! moves after the peer answered 200.

use crate::cluster::directory::PeerDirectory;
use crate::cluster::transport::{endpoint_url, host_header, PeerConnector, COOKIE_HEADER, NODE_ID_HEADER, SINCE_TRAILER};
use crate::cluster::types::{ClusterError, NodeId, NodeSyncState, StorageKind};
use crate::cluster::watermark::WatermarkStore;
use crate::domain::ports::StreamableStorage;
use crate::infrastructure::ShutdownController;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const DUMP_PIPE_SIZE: usize = 64 * 1024;
const DUMP_CHUNK_SIZE: usize = 16 * 1024;

type FrameResult = Result<Frame<Bytes>, std::io::Error>;
type SyncBody = StreamBody<BoxStream<'static, FrameResult>>;

/// The three replicated stores.
#[derive(Clone)]
pub struct StorageSet {
    pub auth: Arc<dyn StreamableStorage>,
    pub config: Arc<dyn StreamableStorage>,
    pub log: Arc<dyn StreamableStorage>,
}

impl StorageSet {
    pub fn new(
        auth: Arc<dyn StreamableStorage>,
        config: Arc<dyn StreamableStorage>,
        log: Arc<dyn StreamableStorage>,
    ) -> Self {
        Self { auth, config, log }
    }

    pub fn get(&self, kind: StorageKind) -> &Arc<dyn StreamableStorage> {
        match kind {
            StorageKind::Auth => &self.auth,
            StorageKind::Config => &self.config,
            StorageKind::Log => &self.log,
        }
    }
}

/// Route of the sync receiver for one store.
pub fn sync_path(kind: StorageKind) -> String {
    format!("/cluster/sync/{}", kind)
}

/// Build the outbound sync request for one store.
pub fn build_sync_request<B>(
    endpoint: &Url,
    kind: StorageKind,
    local_id: &NodeId,
    cookie: Option<&str>,
    body: B,
) -> anyhow::Result<hyper::Request<B>> {
    let url = endpoint_url(endpoint, &sync_path(kind));
    let mut builder = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(url.path())
        .header(hyper::header::HOST, host_header(endpoint))
        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
        .header(hyper::header::TRAILER, SINCE_TRAILER)
        .header(NODE_ID_HEADER, local_id.as_str());
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE_HEADER, cookie);
    }
    Ok(builder.body(body)?)
}

/// Trailer map announcing the watermark reached by a dump.
pub fn since_trailer(watermark: u64) -> anyhow::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    trailers.insert(
        HeaderName::from_bytes(SINCE_TRAILER.as_bytes())?,
        HeaderValue::from(watermark),
    );
    Ok(trailers)
}

// ==================== Worker State ====================

/// Lifecycle of one peer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Idle until the next trigger
    Waiting,
    /// Replicating, with the triggering state
    Syncing(NodeSyncState),
    /// Worker has been removed
    Stopped,
}

/// Inputs to the worker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Triggered(NodeSyncState),
    RoundFinished,
    Stop,
}

/// Worker state transition function.
pub fn next_state(state: WorkerState, event: WorkerEvent) -> WorkerState {
    match (state, event) {
        (WorkerState::Stopped, _) => WorkerState::Stopped,
        (_, WorkerEvent::Stop) => WorkerState::Stopped,
        (WorkerState::Waiting, WorkerEvent::Triggered(state)) => WorkerState::Syncing(state),
        (WorkerState::Syncing(_), WorkerEvent::RoundFinished) => WorkerState::Waiting,
        (state, _) => state,
    }
}

// ==================== Transfer ====================

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State shared by all workers of a pool.
struct SyncContext {
    local_id: NodeId,
    cookie: Option<String>,
    directory: Arc<PeerDirectory>,
    connector: PeerConnector,
    storages: StorageSet,
    watermarks: Arc<WatermarkStore>,
    dial_timeout: Duration,
    tasks: ShutdownController,
}

async fn forward_frames(mut reader: DuplexStream, frame_tx: mpsc::Sender<FrameResult>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; DUMP_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]));
        if frame_tx.send(Ok(frame)).await.is_err() {
            anyhow::bail!("request body closed");
        }
    }
}

/// Stream `storage.dump(since)` into body frames, ending with the trailer.
async fn pump_dump(
    storage: Arc<dyn StreamableStorage>,
    since: u64,
    frame_tx: mpsc::Sender<FrameResult>,
) -> anyhow::Result<u64> {
    let (mut writer, reader) = tokio::io::duplex(DUMP_PIPE_SIZE);

    let produce = async move {
        let result = storage.dump(&mut writer, since).await;
        let _ = writer.shutdown().await;
        result
    };

    // the reader moves into the forwarder so a closed body unblocks the dump
    let forward = forward_frames(reader, frame_tx.clone());

    let (dumped, forwarded) = tokio::join!(produce, forward);

    match (dumped, forwarded) {
        (Ok(watermark), Ok(())) => {
            let trailers = since_trailer(watermark)?;
            frame_tx
                .send(Ok(Frame::trailers(trailers)))
                .await
                .map_err(|_| anyhow::anyhow!("request body closed"))?;
            Ok(watermark)
        }
        (Err(e), _) => {
            let _ = frame_tx
                .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                .await;
            Err(e)
        }
        (Ok(_), Err(e)) => Err(e),
    }
}

impl SyncContext {
    /// Push one store to a peer and return the watermark the peer accepted.
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn transfer(&self, endpoint: &Url, kind: StorageKind, since: u64) -> anyhow::Result<u64> {
        let stream = match tokio::time::timeout(self.dial_timeout, self.connector.connect(endpoint)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(ClusterError::Timeout.into()),
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, SyncBody>(TokioIo::new(stream)).await?;
        let _conn = AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("sync connection closed: {}", e);
            }
        }));

        let (frame_tx, frame_rx) = mpsc::channel::<FrameResult>(16);
        let frames = futures::stream::unfold(frame_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        let request = build_sync_request(
            endpoint,
            kind,
            &self.local_id,
            self.cookie.as_deref(),
            StreamBody::new(frames),
        )?;

        let pump = pump_dump(self.storages.get(kind).clone(), since, frame_tx);
        let send = async {
            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, anyhow::Error>((status, body))
        };
        tokio::pin!(pump);
        tokio::pin!(send);

        let mut dumped = None;
        let (status, body) = loop {
            tokio::select! {
                result = &mut pump, if dumped.is_none() => dumped = Some(result),
                sent = &mut send => break sent?,
            }
        };

        if status != StatusCode::OK {
            return Err(ClusterError::UnexpectedStatus {
                url: endpoint_url(endpoint, &sync_path(kind)).to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            }
            .into());
        }

        match dumped {
            Some(result) => result,
            None => pump.await,
        }
    }

    /// One store: transfer, then commit the watermark on success.
    async fn attempt(
        &self,
        peer: &NodeId,
        kind: StorageKind,
        since: u64,
        cancel: &ShutdownController,
    ) -> anyhow::Result<u64> {
        let endpoint = self
            .directory
            .get(peer)
            .ok_or_else(|| ClusterError::PeerUnknown(peer.clone()))?;

        let watermark = tokio::select! {
            _ = cancel.cancelled() => return Err(ClusterError::Cancelled.into()),
            result = self.transfer(&endpoint, kind, since) => result?,
        };

        self.watermarks.advance(peer, kind, watermark)
    }

    /// Replicate all three stores to a peer.
    async fn sync_round(&self, peer: &NodeId, trigger: NodeSyncState, cancel: &ShutdownController) {
        let _guard = self.tasks.task_guard();

        let stored = match self.watermarks.get_all(peer) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("failed to read watermarks for {}: {:#}", peer, e);
                return;
            }
        };
        let since = stored.max(&trigger);

        let (auth, config, log) = tokio::join!(
            self.attempt(peer, StorageKind::Auth, since.auth, cancel),
            self.attempt(peer, StorageKind::Config, since.config, cancel),
            self.attempt(peer, StorageKind::Log, since.log, cancel),
        );

        for (kind, result) in [
            (StorageKind::Auth, auth),
            (StorageKind::Config, config),
            (StorageKind::Log, log),
        ] {
            match result {
                Ok(watermark) => {
                    tracing::debug!("synced {} to {} up to {}", kind, peer, watermark);
                }
                Err(e) => match e.downcast_ref::<ClusterError>() {
                    Some(ClusterError::Cancelled) => {
                        tracing::debug!("sync of {} to {} cancelled", kind, peer);
                    }
                    _ => tracing::warn!("sync of {} to {} failed: {:#}", kind, peer, e),
                },
            }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn run_worker(
    ctx: Arc<SyncContext>,
    peer: NodeId,
    mut inbox: watch::Receiver<Option<NodeSyncState>>,
    cancel: ShutdownController,
) {
    let mut state = WorkerState::Waiting;
    tracing::debug!("sync worker for {} started", peer);

    loop {
        let event = match state {
            WorkerState::Waiting => tokio::select! {
                _ = cancel.cancelled() => WorkerEvent::Stop,
                changed = inbox.changed() => match changed {
                    Ok(()) => match *inbox.borrow_and_update() {
                        Some(trigger) => WorkerEvent::Triggered(trigger),
                        None => continue,
                    },
                    Err(_) => WorkerEvent::Stop,
                },
            },
            WorkerState::Syncing(trigger) => {
                ctx.sync_round(&peer, trigger, &cancel).await;
                WorkerEvent::RoundFinished
            }
            WorkerState::Stopped => break,
        };
        state = next_state(state, event);
    }

    tracing::debug!("sync worker for {} stopped", peer);
}

// ==================== Pool ====================

struct WorkerHandle {
    inbox: watch::Sender<Option<NodeSyncState>>,
    cancel: ShutdownController,
}

/// Per-peer replication workers.
pub struct SyncPool {
    ctx: Arc<SyncContext>,
    workers: Mutex<HashMap<NodeId, WorkerHandle>>,
}

impl SyncPool {
    pub fn new(
        local_id: NodeId,
        cookie: Option<String>,
        directory: Arc<PeerDirectory>,
        connector: PeerConnector,
        storages: StorageSet,
        watermarks: Arc<WatermarkStore>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(SyncContext {
                local_id,
                cookie,
                directory,
                connector,
                storages,
                watermarks,
                dial_timeout,
                tasks: ShutdownController::new(),
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a worker for `peer` unless one is running. Returns true if started.
    pub fn ensure_worker(&self, peer: &NodeId) -> bool {
        let mut workers = self.workers.lock();
        self.start_locked(&mut workers, peer)
    }

    /// Stop and forget the worker of `peer`. Returns true if one existed.
    pub fn remove_worker(&self, peer: &NodeId) -> bool {
        let mut workers = self.workers.lock();
        Self::stop_locked(&mut workers, peer)
    }

    /// Record `peer` in the directory and start its worker as one step.
    ///
    /// Returns the endpoint previously known for `peer`.
    pub fn register_peer(&self, peer: &NodeId, endpoint: Url) -> Option<Url> {
        let mut workers = self.workers.lock();
        let previous = self.ctx.directory.upsert(peer.clone(), endpoint);
        self.start_locked(&mut workers, peer);
        previous
    }

    /// Drop `peer` from the directory and stop its worker as one step.
    pub fn forget_peer(&self, peer: &NodeId) -> bool {
        let mut workers = self.workers.lock();
        self.ctx.directory.remove(peer);
        Self::stop_locked(&mut workers, peer)
    }

    fn start_locked(&self, workers: &mut HashMap<NodeId, WorkerHandle>, peer: &NodeId) -> bool {
        if workers.contains_key(peer) {
            return false;
        }

        let (inbox, inbox_rx) = watch::channel(None);
        let cancel = ShutdownController::new();
        tokio::spawn(run_worker(self.ctx.clone(), peer.clone(), inbox_rx, cancel.clone()));
        workers.insert(peer.clone(), WorkerHandle { inbox, cancel });

        tracing::info!("sync worker registered for {}", peer);
        true
    }

    fn stop_locked(workers: &mut HashMap<NodeId, WorkerHandle>, peer: &NodeId) -> bool {
        match workers.remove(peer) {
            Some(handle) => {
                handle.cancel.shutdown();
                tracing::info!("sync worker removed for {}", peer);
                true
            }
            None => false,
        }
    }

    /// Stop every worker.
    pub fn remove_all(&self) {
        let drained: Vec<(NodeId, WorkerHandle)> = self.workers.lock().drain().collect();
        for (peer, handle) in drained {
            handle.cancel.shutdown();
            tracing::debug!("sync worker removed for {}", peer);
        }
    }

    /// Wait for in-flight rounds to finish after workers were stopped.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.ctx.tasks.wait_for_drain(timeout).await
    }

    /// Ask the worker of `peer` to sync. Pending triggers coalesce, last wins.
    ///
    /// Returns false when no worker exists for `peer`.
    pub fn trigger(&self, peer: &NodeId, state: NodeSyncState) -> bool {
        match self.workers.lock().get(peer) {
            Some(handle) => {
                handle.inbox.send_replace(Some(state));
                true
            }
            None => false,
        }
    }

    pub fn has_worker(&self, peer: &NodeId) -> bool {
        self.workers.lock().contains_key(peer)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.ctx.tasks.active_tasks()
    }
}
