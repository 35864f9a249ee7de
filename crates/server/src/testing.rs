#![cfg(test)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use parley_core::{ServerEvent, UserId};
use parley_media::{ObjectStore, TransformOptions, UploadError};
use tokio::sync::{mpsc, watch};

use crate::{
    attachments::PipelineSettings,
    messaging::{start_engine, EngineComponents, EngineSettings, MessagingEngine},
    profiles::InMemoryProfiles,
    registry::ConnectionHandle,
    store::InMemoryMessageStore,
};

/// PNG signature followed by the start of an IHDR chunk.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// Object store whose outcomes are queued up front. Once the script runs out
/// every upload succeeds.
pub struct ScriptedObjectStore {
    script: Mutex<VecDeque<Result<String, UploadError>>>,
    calls: AtomicUsize,
    delay: Duration,
    folders: Mutex<Vec<String>>,
}

impl ScriptedObjectStore {
    fn with(script: VecDeque<Result<String, UploadError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            delay,
            folders: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with(VecDeque::new(), Duration::ZERO)
    }

    pub fn failing(times: usize) -> Arc<Self> {
        let script = (0..times)
            .map(|_| Err(UploadError::Unavailable("object store down".into())))
            .collect();
        Self::with(script, Duration::ZERO)
    }

    pub fn succeeding_after(delay: Duration) -> Arc<Self> {
        Self::with(VecDeque::new(), delay)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn folders(&self) -> Vec<String> {
        self.folders.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for ScriptedObjectStore {
    async fn upload(
        &self,
        _bytes: &[u8],
        folder: &str,
        _transform: &TransformOptions,
    ) -> Result<String, UploadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.folders.lock().unwrap().push(folder.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("https://cdn.test/{folder}/{call}.png")))
    }
}

pub fn fast_pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        max_bytes: 1024 * 1024,
        avatar_max_bytes: 512 * 1024,
        upload_timeout: Duration::from_millis(200),
        max_attempts: 3,
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        // The startup sweep must not race tests that strand jobs on purpose.
        pending_grace: Duration::from_secs(86_400),
        sweep_interval: Duration::from_secs(3_600),
        workers: 2,
        queue_capacity: 16,
    }
}

pub fn fast_engine_settings() -> EngineSettings {
    EngineSettings {
        default_page_limit: 50,
        max_page_limit: 200,
        max_text_chars: 1_000,
        fanout_to_sender: true,
        connection_queue_capacity: 64,
        max_websocket_connections: 16,
        presence_debounce: Duration::from_millis(10),
        pipeline: fast_pipeline_settings(),
    }
}

/// Wait for the next event called `name`, skipping anything else.
pub async fn next_event(rx: &mut mpsc::Receiver<Arc<ServerEvent>>, name: &str) -> Arc<ServerEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
            .unwrap_or_else(|| panic!("connection closed while waiting for {name}"));
        if event.name() == name {
            return event;
        }
    }
}

pub async fn assert_no_event(rx: &mut mpsc::Receiver<Arc<ServerEvent>>, name: &str, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        assert_ne!(event.name(), name, "unexpected {name}: {event:?}");
    }
}

/// Engine over in-memory collaborators. Background tasks stop when the
/// harness is dropped.
pub struct EngineHarness {
    pub engine: Arc<MessagingEngine>,
    pub store: Arc<InMemoryMessageStore>,
    pub profiles: Arc<InMemoryProfiles>,
    pub object_store: Arc<ScriptedObjectStore>,
    _shutdown: watch::Sender<bool>,
}

impl EngineHarness {
    pub fn start(object_store: Arc<ScriptedObjectStore>) -> Self {
        Self::with_settings(object_store, fast_engine_settings())
    }

    pub fn with_settings(object_store: Arc<ScriptedObjectStore>, settings: EngineSettings) -> Self {
        let store = Arc::new(InMemoryMessageStore::new());
        let profiles = Arc::new(InMemoryProfiles::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (engine, _tasks) = start_engine(
            EngineComponents {
                store: store.clone(),
                profiles: profiles.clone(),
                object_store: object_store.clone(),
                #[cfg(feature = "metrics")]
                metrics: None,
            },
            settings,
            shutdown_rx,
        );
        Self {
            engine,
            store,
            profiles,
            object_store,
            _shutdown: shutdown_tx,
        }
    }

    /// Register a live connection for `user_id` and return its event queue.
    pub async fn connect(&self, user_id: UserId) -> mpsc::Receiver<Arc<ServerEvent>> {
        let (handle, rx) = ConnectionHandle::new(user_id, 64);
        self.engine.registry().register(handle).await;
        rx
    }
}
