//! Isolated inference worker.
//!
//! Both embedding engines live on one dedicated OS thread. Callers talk to it
//! through a cloneable [`WorkerHandle`]: every request gets a fresh id, the
//! reply travels back over a separate channel and a router thread hands it to
//! whichever caller is waiting on that id. Tensors and embeddings are moved
//! across, never shared.

use animatch_core::embedder::{EmbeddingEngine, EngineError, EngineKind, ModelLoader};
use animatch_core::Embedding;
use ndarray::Array4;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0}")]
    Engine(#[from] EngineError),
    #[error("worker crashed handling request {id}: {message}")]
    Crashed { id: u64, message: String },
    #[error("inference worker exited")]
    ChannelClosed,
    #[error("unexpected worker reply to {0}")]
    UnexpectedResponse(&'static str),
    #[error("spawning worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages handled by the worker thread.
#[derive(Debug)]
pub enum WorkerRequest {
    /// Load the CLIP model; `None` uses the configured path.
    InitGeneral { model_path: Option<String> },
    RunGeneral { tensor: Array4<f32> },
    InitFace { model_path: Option<String> },
    RunFace { tensor: Array4<f32> },
    /// Drop both sessions. Safe to repeat.
    ReleaseAll,
}

impl WorkerRequest {
    fn name(&self) -> &'static str {
        match self {
            WorkerRequest::InitGeneral { .. } => "init_general",
            WorkerRequest::RunGeneral { .. } => "run_general",
            WorkerRequest::InitFace { .. } => "init_face",
            WorkerRequest::RunFace { .. } => "run_face",
            WorkerRequest::ReleaseAll => "release_all",
        }
    }
}

#[derive(Debug)]
pub enum WorkerResponse {
    Ready { engine: EngineKind, model_path: String },
    Embedding(Embedding),
    Released,
}

/// Model artifacts the worker loads when a request names none.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub general_model: String,
    /// Tried in order when `general_model` fails to load.
    pub general_fallbacks: Vec<String>,
    pub face_model: String,
}

struct Envelope {
    id: u64,
    request: WorkerRequest,
}

enum Control {
    Request(Envelope),
    Shutdown,
}

struct Reply {
    id: u64,
    result: Result<WorkerResponse, WorkerError>,
}

type ReplySender = oneshot::Sender<Result<WorkerResponse, WorkerError>>;
type Pending = Arc<Mutex<HashMap<u64, ReplySender>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, ReplySender>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clone-safe handle to the inference worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Control>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
}

impl WorkerHandle {
    /// Send one request and wait for its correlated reply.
    pub async fn request(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        tracing::trace!(id, request = request.name(), "worker request");
        if self
            .tx
            .send(Control::Request(Envelope { id, request }))
            .await
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(WorkerError::ChannelClosed);
        }

        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    /// Load an engine's model. Returns the artifact actually loaded.
    pub async fn init(&self, kind: EngineKind, model_path: Option<String>) -> Result<String, WorkerError> {
        let request = match kind {
            EngineKind::General => WorkerRequest::InitGeneral { model_path },
            EngineKind::Face => WorkerRequest::InitFace { model_path },
        };
        match self.request(request).await? {
            WorkerResponse::Ready { model_path, .. } => Ok(model_path),
            _ => Err(WorkerError::UnexpectedResponse("init")),
        }
    }

    /// Run one forward pass; the tensor is moved to the worker.
    pub async fn embed(&self, kind: EngineKind, tensor: Array4<f32>) -> Result<Embedding, WorkerError> {
        let request = match kind {
            EngineKind::General => WorkerRequest::RunGeneral { tensor },
            EngineKind::Face => WorkerRequest::RunFace { tensor },
        };
        match self.request(request).await? {
            WorkerResponse::Embedding(embedding) => Ok(embedding),
            _ => Err(WorkerError::UnexpectedResponse("embed")),
        }
    }

    pub async fn release_all(&self) -> Result<(), WorkerError> {
        match self.request(WorkerRequest::ReleaseAll).await? {
            WorkerResponse::Released => Ok(()),
            _ => Err(WorkerError::UnexpectedResponse("release_all")),
        }
    }

    /// Ask the worker to release its engines and exit. Requests already
    /// queued and every later request fail with `ChannelClosed`.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown).await;
    }
}

/// Spawn the inference worker and its reply router.
///
/// No model is loaded here; engines start uninitialized and are loaded by
/// the first `Init*` request.
pub fn spawn_worker(
    loader: Arc<dyn ModelLoader>,
    settings: WorkerSettings,
) -> Result<WorkerHandle, WorkerError> {
    let general = settings.general_fallbacks.iter().fold(
        EmbeddingEngine::new(EngineKind::General, Arc::clone(&loader)),
        |engine, path| engine.with_fallback(path.clone()),
    );
    let face = EmbeddingEngine::new(EngineKind::Face, loader);
    let engines = Engines { general, face, settings };

    let (tx, rx) = mpsc::channel::<Control>(REQUEST_QUEUE_DEPTH);
    let (reply_tx, reply_rx) = std_mpsc::channel::<Reply>();
    let pending: Pending = Arc::default();

    std::thread::Builder::new()
        .name("animatch-inference".into())
        .spawn(move || run_worker(rx, reply_tx, engines))?;

    let router_pending = Arc::clone(&pending);
    std::thread::Builder::new()
        .name("animatch-router".into())
        .spawn(move || route_replies(reply_rx, router_pending))?;

    Ok(WorkerHandle {
        tx,
        pending,
        next_id: Arc::new(AtomicU64::new(1)),
    })
}

struct Engines {
    general: EmbeddingEngine,
    face: EmbeddingEngine,
    settings: WorkerSettings,
}

impl Engines {
    fn handle(&mut self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        match request {
            WorkerRequest::InitGeneral { model_path } => {
                let path = model_path.unwrap_or_else(|| self.settings.general_model.clone());
                Self::init(&mut self.general, &path)
            }
            WorkerRequest::InitFace { model_path } => {
                let path = model_path.unwrap_or_else(|| self.settings.face_model.clone());
                Self::init(&mut self.face, &path)
            }
            WorkerRequest::RunGeneral { tensor } => {
                Ok(WorkerResponse::Embedding(self.general.embed(&tensor)?))
            }
            WorkerRequest::RunFace { tensor } => Ok(WorkerResponse::Embedding(self.face.embed(&tensor)?)),
            WorkerRequest::ReleaseAll => {
                self.release_all();
                Ok(WorkerResponse::Released)
            }
        }
    }

    fn init(engine: &mut EmbeddingEngine, path: &str) -> Result<WorkerResponse, WorkerError> {
        engine.init(path)?;
        Ok(WorkerResponse::Ready {
            engine: engine.kind(),
            model_path: engine.loaded_from().unwrap_or(path).to_string(),
        })
    }

    fn release_all(&mut self) {
        self.general.release();
        self.face.release();
    }
}

fn run_worker(mut rx: mpsc::Receiver<Control>, replies: std_mpsc::Sender<Reply>, mut engines: Engines) {
    tracing::info!("inference worker started");

    while let Some(control) = rx.blocking_recv() {
        let Control::Request(Envelope { id, request }) = control else {
            tracing::info!("inference worker shutdown requested");
            break;
        };

        let name = request.name();
        let result = panic::catch_unwind(AssertUnwindSafe(|| engines.handle(request)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(id, request = name, %message, "request panicked; releasing engines");
                engines.release_all();
                Err(WorkerError::Crashed { id, message })
            });

        if let Err(e) = &result {
            tracing::debug!(id, request = name, error = %e, "worker request failed");
        }
        if replies.send(Reply { id, result }).is_err() {
            break;
        }
    }

    engines.release_all();
    rx.close();
    while let Some(control) = rx.blocking_recv() {
        if let Control::Request(Envelope { id, .. }) = control {
            let _ = replies.send(Reply { id, result: Err(WorkerError::ChannelClosed) });
        }
    }
    tracing::info!("inference worker exiting");
}

fn route_replies(replies: std_mpsc::Receiver<Reply>, pending: Pending) {
    for Reply { id, result } in replies {
        let waiter = lock(&pending).remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have stopped waiting.
                let _ = tx.send(result);
            }
            None => tracing::warn!(id, "reply for unknown request id"),
        }
    }

    let orphans: Vec<(u64, ReplySender)> = lock(&pending).drain().collect();
    for (id, tx) in orphans {
        tracing::debug!(id, "failing request: worker gone");
        let _ = tx.send(Err(WorkerError::ChannelClosed));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
