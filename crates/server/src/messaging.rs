use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_core::{
    cursor::clamp_limit,
    messaging::normalize_text,
    AuthorSnapshot, Cursor, CursorError, HistoryPage, ImageState, Message, ServerEvent,
    UploadTarget, UserId, ValidationError,
};
use parley_media::{sniff_image_format, ObjectStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    attachments::{AttachmentPipeline, EnqueueError, PipelineDeps, PipelineSettings},
    config::ServerConfig,
    delivery::DeliveryRouter,
    identity::AuthenticatedUser,
    presence::PresencePublisher,
    profiles::ProfileDirectory,
    registry::{ConnectionHandle, ConnectionRegistry},
    store::{MessageStore, StoreError},
    AppState,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),
    #[error("message not found")]
    NotFound,
    #[error("an avatar upload is already in progress")]
    UploadInProgress,
    #[error("attachment pipeline unavailable: {0}")]
    PipelineUnavailable(EnqueueError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MessagingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(err) => MessagingError::Validation(err),
            StoreError::NotFound(_) => MessagingError::NotFound,
            other => MessagingError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    pub max_text_chars: usize,
    pub fanout_to_sender: bool,
    pub connection_queue_capacity: usize,
    pub max_websocket_connections: usize,
    pub presence_debounce: Duration,
    pub pipeline: PipelineSettings,
}

impl EngineSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        let messaging = &config.messaging;
        Self {
            default_page_limit: messaging.default_page_limit,
            max_page_limit: messaging.max_page_limit,
            max_text_chars: messaging.max_text_chars,
            fanout_to_sender: messaging.fanout_to_sender,
            connection_queue_capacity: messaging.connection_queue_capacity,
            max_websocket_connections: messaging.max_websocket_connections,
            presence_debounce: config.presence.debounce(),
            pipeline: PipelineSettings::from(&config.attachments),
        }
    }
}

pub struct EngineComponents {
    pub store: Arc<dyn MessageStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub object_store: Arc<dyn ObjectStore>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<MetricsContext>>,
}

/// Orchestrates sends and reads: validates, persists, queues uploads and
/// notifies live connections.
pub struct MessagingEngine {
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileDirectory>,
    registry: ConnectionRegistry,
    router: DeliveryRouter,
    pipeline: AttachmentPipeline,
    settings: EngineSettings,
    semaphore: Arc<Semaphore>,
}

/// Wire the registry, router, presence publisher and attachment pipeline
/// together. The returned tasks stop when `shutdown` flips.
pub fn start_engine(
    components: EngineComponents,
    settings: EngineSettings,
    shutdown: watch::Receiver<bool>,
) -> (Arc<MessagingEngine>, Vec<JoinHandle<()>>) {
    let registry = ConnectionRegistry::new();
    let router = DeliveryRouter::new(registry.clone());

    let (pipeline, mut tasks) = AttachmentPipeline::start(
        PipelineDeps {
            store: components.store.clone(),
            profiles: components.profiles.clone(),
            object_store: components.object_store,
            router: router.clone(),
            #[cfg(feature = "metrics")]
            metrics: components.metrics,
        },
        settings.pipeline.clone(),
        shutdown.clone(),
    );

    tasks.push(
        PresencePublisher::new(registry.clone(), router.clone(), settings.presence_debounce)
            .spawn(shutdown),
    );

    let engine = Arc::new(MessagingEngine {
        store: components.store,
        profiles: components.profiles,
        registry,
        router,
        pipeline,
        semaphore: Arc::new(Semaphore::new(settings.max_websocket_connections)),
        settings,
    });
    (engine, tasks)
}

impl MessagingEngine {
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[cfg(feature = "metrics")]
    pub fn pipeline(&self) -> &AttachmentPipeline {
        &self.pipeline
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<&str>,
        attachment: Option<Vec<u8>>,
    ) -> Result<Message, MessagingError> {
        if sender_id == receiver_id {
            return Err(ValidationError::SelfAddressed.into());
        }
        let text = normalize_text(text, self.settings.max_text_chars)?;
        let attachment = attachment.filter(|bytes| !bytes.is_empty());
        if let Some(bytes) = &attachment {
            self.check_image(bytes, self.settings.pipeline.max_bytes)?;
        }
        if text.is_none() && attachment.is_none() {
            return Err(ValidationError::Empty.into());
        }

        let image = if attachment.is_some() {
            ImageState::Pending
        } else {
            ImageState::None
        };
        let message = self
            .store
            .append(sender_id, receiver_id, text, image)
            .await?;

        // Announce before queueing so `new-message` always precedes the
        // matching `message-updated` on every connection.
        self.announce(&message).await;

        let message = match attachment {
            Some(bytes) => self.queue_attachment(message, bytes).await,
            None => message,
        };

        tracing::info!(
            message_id = %message.id,
            %sender_id,
            %receiver_id,
            image = message.image.as_status(),
            "message sent"
        );
        Ok(message)
    }

    async fn queue_attachment(&self, message: Message, bytes: Vec<u8>) -> Message {
        let target = UploadTarget::ChatAttachment {
            message_id: message.id,
        };
        let err = match self.pipeline.enqueue(target, bytes).await {
            Ok(job_id) => {
                tracing::debug!(message_id = %message.id, %job_id, "attachment queued");
                return message;
            }
            Err(err) => err,
        };

        tracing::warn!(message_id = %message.id, error = %err, "attachment could not be queued");
        match self.pipeline.fail_immediately(message.id).await {
            Ok(failed) => {
                self.notify_parties(&failed, ServerEvent::MessageUpdated {
                    message: failed.clone(),
                })
                .await;
                failed
            }
            Err(err) => {
                tracing::error!(message_id = %message.id, ?err, "failed to resolve unqueued attachment");
                message
            }
        }
    }

    async fn announce(&self, message: &Message) {
        let author = self.author_snapshot(message.sender_id).await;
        let event = Arc::new(ServerEvent::NewMessage {
            message: message.clone(),
            author,
        });
        let reached = self
            .router
            .notify_shared(message.receiver_id, event.clone())
            .await;
        if reached == 0 {
            tracing::debug!(message_id = %message.id, "receiver offline; delivery deferred to history");
        }
        if self.settings.fanout_to_sender {
            self.router.notify_shared(message.sender_id, event).await;
        }
    }

    async fn notify_parties(&self, message: &Message, event: ServerEvent) {
        let event = Arc::new(event);
        self.router
            .notify_shared(message.receiver_id, event.clone())
            .await;
        self.router.notify_shared(message.sender_id, event).await;
    }

    async fn author_snapshot(&self, user_id: UserId) -> Option<AuthorSnapshot> {
        match self.profiles.author_snapshot(user_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(%user_id, ?err, "failed to load author snapshot");
                None
            }
        }
    }

    fn check_image(&self, bytes: &[u8], max: usize) -> Result<(), ValidationError> {
        if bytes.len() > max {
            return Err(ValidationError::AttachmentTooLarge {
                size: bytes.len(),
                max,
            });
        }
        if sniff_image_format(bytes).is_none() {
            return Err(ValidationError::UnsupportedAttachment);
        }
        Ok(())
    }

    pub async fn history(
        &self,
        user_id: UserId,
        peer_id: UserId,
        cursor: Option<Cursor>,
        limit: Option<usize>,
    ) -> Result<HistoryPage, MessagingError> {
        let limit = clamp_limit(
            limit,
            self.settings.default_page_limit,
            self.settings.max_page_limit,
        );
        Ok(self
            .store
            .page(user_id, peer_id, cursor.as_ref(), limit)
            .await?)
    }

    /// History as seen when opening a conversation: the first page also marks
    /// everything the peer sent to the caller as seen.
    pub async fn open_conversation(
        &self,
        user_id: UserId,
        peer_id: UserId,
        cursor: Option<Cursor>,
        limit: Option<usize>,
    ) -> Result<HistoryPage, MessagingError> {
        if cursor.is_none() {
            let marked = self.store.mark_all_seen_from(peer_id, user_id).await?;
            if marked > 0 {
                tracing::debug!(%user_id, %peer_id, marked, "marked conversation seen");
            }
        }
        self.history(user_id, peer_id, cursor, limit).await
    }

    /// Only the receiver may mark a message seen; anyone else gets
    /// `NotFound`.
    pub async fn mark_seen(&self, user_id: UserId, message_id: Uuid) -> Result<Message, MessagingError> {
        match self.store.get(message_id).await? {
            Some(message) if message.receiver_id == user_id => {
                Ok(self.store.mark_seen(message_id).await?)
            }
            _ => Err(MessagingError::NotFound),
        }
    }

    pub async fn unseen_counts(&self, user_id: UserId) -> Result<HashMap<UserId, u64>, MessagingError> {
        Ok(self.store.unseen_counts(user_id).await?)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.registry.online_users().await
    }

    pub async fn update_avatar(&self, user_id: UserId, bytes: Vec<u8>) -> Result<Uuid, MessagingError> {
        if bytes.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        self.check_image(&bytes, self.settings.pipeline.avatar_max_bytes)?;

        match self
            .pipeline
            .enqueue(UploadTarget::ProfilePicture { user_id }, bytes)
            .await
        {
            Ok(job_id) => Ok(job_id),
            Err(EnqueueError::Duplicate(_)) => Err(MessagingError::UploadInProgress),
            Err(err) => Err(MessagingError::PipelineUnavailable(err)),
        }
    }

    pub fn open_websocket(self: Arc<Self>, user_id: UserId, ws: WebSocketUpgrade) -> Response {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => ws.on_upgrade(move |socket| self.run_socket(user_id, socket, permit)),
            Err(_) => {
                tracing::warn!(%user_id, "websocket connection limit reached");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody::new("connection_limit", None)),
                )
                    .into_response()
            }
        }
    }

    async fn run_socket(self: Arc<Self>, user_id: UserId, mut socket: WebSocket, _permit: OwnedSemaphorePermit) {
        let (handle, mut events) =
            ConnectionHandle::new(user_id, self.settings.connection_queue_capacity);
        let connection_id = handle.id();
        self.registry.register(handle).await;
        tracing::info!(%user_id, %connection_id, "websocket connected");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let frame = match event.to_frame() {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(?err, event = event.name(), "failed to encode event");
                            continue;
                        }
                    };
                    match timeout(SEND_TIMEOUT, socket.send(WsMessage::Text(frame.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::debug!(%connection_id, ?err, "websocket send failed");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(%connection_id, "websocket send timeout");
                            break;
                        }
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        self.registry.unregister(connection_id).await;
        tracing::info!(%user_id, %connection_id, "websocket disconnected");
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: &'static str, details: Option<String>) -> Self {
        Self { error, details }
    }
}

fn error_response(err: MessagingError) -> Response {
    let (status, code) = match &err {
        MessagingError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        MessagingError::InvalidCursor(_) => (StatusCode::BAD_REQUEST, "invalid_cursor"),
        MessagingError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        MessagingError::UploadInProgress => (StatusCode::CONFLICT, "upload_in_progress"),
        MessagingError::PipelineUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
        MessagingError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
    };

    let details = if status.is_server_error() {
        tracing::error!(?err, "messaging request failed");
        None
    } else {
        Some(err.to_string())
    };
    (status, Json(ErrorBody::new(code, details))).into_response()
}

/// Accepts raw base64 or a `data:image/...;base64,` URL.
fn decode_image(raw: &str) -> Result<Vec<u8>, ValidationError> {
    let raw = raw.trim();
    let encoded = match raw.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or(ValidationError::InvalidEncoding)?,
        None => raw,
    };
    STANDARD
        .decode(encoded)
        .map_err(|_| ValidationError::InvalidEncoding)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct UnseenResponse {
    pub unseen: HashMap<UserId, u64>,
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct AvatarRequest {
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct AvatarAccepted {
    pub job_id: Uuid,
}

pub async fn send_message(
    State(state): State<AppState>,
    AuthenticatedUser(sender_id): AuthenticatedUser,
    Path(receiver_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    if !state.send_limiter().check(sender_id).await {
        tracing::warn!(%sender_id, "send rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorBody::new(
                "rate_limited",
                Some("too many messages, please slow down".into()),
            )),
        )
            .into_response();
    }

    let attachment = match body.image.as_deref().map(decode_image).transpose() {
        Ok(attachment) => attachment,
        Err(err) => return error_response(err.into()),
    };

    match state
        .engine()
        .send_message(sender_id, receiver_id, body.text.as_deref(), attachment)
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(SendMessageResponse { message })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn history(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let cursor = match query.cursor.as_deref().map(Cursor::decode).transpose() {
        Ok(cursor) => cursor,
        Err(err) => return error_response(err.into()),
    };
    let engine = state.engine();
    let limit = clamp_limit(
        query.limit,
        engine.settings.default_page_limit,
        engine.settings.max_page_limit,
    );

    match engine
        .open_conversation(user_id, peer_id, cursor, Some(limit))
        .await
    {
        Ok(page) => Json(HistoryResponse {
            messages: page.messages,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
            limit,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn mark_seen(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(message_id): Path<Uuid>,
) -> Response {
    match state.engine().mark_seen(user_id, message_id).await {
        Ok(_) => Json(AckResponse { ok: true }).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn unseen_counts(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Response {
    match state.engine().unseen_counts(user_id).await {
        Ok(unseen) => Json(UnseenResponse { unseen }).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn online_users(
    State(state): State<AppState>,
    AuthenticatedUser(_): AuthenticatedUser,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        user_ids: state.engine().online_users().await,
    })
}

pub async fn update_avatar(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<AvatarRequest>,
) -> Response {
    let bytes = match decode_image(&body.image) {
        Ok(bytes) => bytes,
        Err(err) => return error_response(err.into()),
    };

    match state.engine().update_avatar(user_id, bytes).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(AvatarAccepted { job_id })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn socket(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Response {
    state.engine().open_websocket(user_id, ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        assert_no_event, fast_engine_settings, next_event, EngineHarness, ScriptedObjectStore,
        PNG_BYTES,
    };
    use parley_core::messaging::FAILURE_NOTE;

    fn new_message(event: &ServerEvent) -> &Message {
        match event {
            ServerEvent::NewMessage { message, .. } => message,
            other => panic!("expected new-message, got {other:?}"),
        }
    }

    fn updated_message(event: &ServerEvent) -> &Message {
        match event {
            ServerEvent::MessageUpdated { message } => message,
            other => panic!("expected message-updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_send_is_rejected_and_nothing_persisted() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let err = h
            .engine
            .send_message(Uuid::new_v4(), Uuid::new_v4(), Some("   "), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Validation(ValidationError::Empty)));

        let err = h
            .engine
            .send_message(Uuid::new_v4(), Uuid::new_v4(), None, Some(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Validation(ValidationError::Empty)));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn invalid_attachments_are_rejected_synchronously() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = h
            .engine
            .send_message(a, b, Some("doc"), Some(b"%PDF-1.7".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Validation(ValidationError::UnsupportedAttachment)
        ));

        let mut huge = PNG_BYTES.to_vec();
        huge.resize(h.engine.settings.pipeline.max_bytes + 1, 0);
        let err = h.engine.send_message(a, b, None, Some(huge)).await.unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Validation(ValidationError::AttachmentTooLarge { .. })
        ));

        let long = "x".repeat(1001);
        let err = h.engine.send_message(a, b, Some(&long), None).await.unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Validation(ValidationError::TextTooLong { .. })
        ));
        assert_eq!(h.store.len().await, 0);
        assert_eq!(h.object_store.calls(), 0);
    }

    #[tokio::test]
    async fn offline_receiver_catches_up_through_history() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let sent = h
            .engine
            .send_message(alice, bob, Some("are you there?"), None)
            .await
            .unwrap();
        assert!(!sent.seen);
        assert_eq!(sent.image, ImageState::None);

        let counts = h.engine.unseen_counts(bob).await.unwrap();
        assert_eq!(counts.get(&alice), Some(&1));

        let mut bob_rx = h.connect(bob).await;
        let page = h.engine.open_conversation(bob, alice, None, None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, sent.id);
        assert!(page.messages[0].seen);
        assert!(h.engine.unseen_counts(bob).await.unwrap().is_empty());
        assert_no_event(&mut bob_rx, "new-message", Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn online_receiver_sees_placeholder_then_resolution() {
        let object_store = ScriptedObjectStore::succeeding();
        let h = EngineHarness::start(object_store.clone());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut bob_rx = h.connect(bob).await;
        let mut alice_other_device = h.connect(alice).await;

        let sent = h
            .engine
            .send_message(alice, bob, Some("photo"), Some(PNG_BYTES.to_vec()))
            .await
            .unwrap();
        assert_eq!(sent.image, ImageState::Pending);

        for rx in [&mut bob_rx, &mut alice_other_device] {
            let placeholder = next_event(rx, "new-message").await;
            assert_eq!(new_message(&placeholder).id, sent.id);
            assert!(new_message(&placeholder).image.is_pending());

            let resolved = next_event(rx, "message-updated").await;
            let resolved = updated_message(&resolved);
            assert_eq!(resolved.id, sent.id);
            assert!(resolved.image.url().is_some());
            assert_eq!(resolved.text.as_deref(), Some("photo"));
        }
        assert_eq!(object_store.calls(), 1);
    }

    #[tokio::test]
    async fn sender_fanout_can_be_disabled() {
        let mut settings = fast_engine_settings();
        settings.fanout_to_sender = false;
        let h = EngineHarness::with_settings(ScriptedObjectStore::succeeding(), settings);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice_rx = h.connect(alice).await;
        let mut bob_rx = h.connect(bob).await;

        h.engine
            .send_message(alice, bob, Some("hi"), None)
            .await
            .unwrap();
        next_event(&mut bob_rx, "new-message").await;
        assert_no_event(&mut alice_rx, "new-message", Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn repeated_upload_failures_mark_message_failed() {
        let object_store = ScriptedObjectStore::failing(3);
        let h = EngineHarness::start(object_store.clone());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut bob_rx = h.connect(bob).await;

        let sent = h
            .engine
            .send_message(alice, bob, None, Some(PNG_BYTES.to_vec()))
            .await
            .unwrap();
        next_event(&mut bob_rx, "new-message").await;
        let resolved = next_event(&mut bob_rx, "message-updated").await;
        let resolved = updated_message(&resolved);
        assert_eq!(resolved.image, ImageState::Failed);
        assert_eq!(resolved.text.as_deref(), Some(FAILURE_NOTE));
        assert_eq!(object_store.calls(), 3);

        let stored = h.store.get(sent.id).await.unwrap().unwrap();
        assert_eq!(stored.image, ImageState::Failed);
    }

    #[tokio::test]
    async fn full_queue_resolves_attachment_immediately() {
        let mut settings = fast_engine_settings();
        settings.pipeline.workers = 1;
        settings.pipeline.queue_capacity = 1;
        let h = EngineHarness::with_settings(
            ScriptedObjectStore::succeeding_after(Duration::from_millis(500)),
            settings,
        );
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(
                h.engine
                    .send_message(alice, bob, Some("pic"), Some(PNG_BYTES.to_vec()))
                    .await
                    .unwrap(),
            );
        }
        let failed: Vec<_> = results
            .iter()
            .filter(|m| m.image == ImageState::Failed)
            .collect();
        assert!(!failed.is_empty(), "one job must overflow the queue");
        for message in failed {
            assert_eq!(message.text.as_deref(), Some("pic\n[image upload failed]"));
        }
    }

    #[tokio::test]
    async fn only_receiver_can_mark_seen() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let sent = h
            .engine
            .send_message(alice, bob, Some("hello"), None)
            .await
            .unwrap();

        assert!(matches!(
            h.engine.mark_seen(alice, sent.id).await,
            Err(MessagingError::NotFound)
        ));
        assert!(matches!(
            h.engine.mark_seen(bob, Uuid::new_v4()).await,
            Err(MessagingError::NotFound)
        ));

        let first = h.engine.mark_seen(bob, sent.id).await.unwrap();
        let second = h.engine.mark_seen(bob, sent.id).await.unwrap();
        assert!(first.seen && second.seen);
    }

    #[tokio::test]
    async fn history_limit_is_clamped_and_pages_descend() {
        let mut settings = fast_engine_settings();
        settings.max_page_limit = 3;
        let h = EngineHarness::with_settings(ScriptedObjectStore::succeeding(), settings);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..5 {
            h.engine
                .send_message(alice, bob, Some(&format!("m{i}")), None)
                .await
                .unwrap();
        }

        let page = h.engine.history(bob, alice, None, Some(500)).await.unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(page.has_more);
        assert!(page
            .messages
            .windows(2)
            .all(|pair| pair[0].sort_key() > pair[1].sort_key()));

        let rest = h
            .engine
            .history(bob, alice, page.next_cursor, Some(500))
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn avatar_upload_is_accepted_and_resolved() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let user = Uuid::new_v4();
        let mut rx = h.connect(user).await;

        h.engine
            .update_avatar(user, PNG_BYTES.to_vec())
            .await
            .unwrap();
        let event = next_event(&mut rx, "profile-updated").await;
        assert!(matches!(
            event.as_ref(),
            ServerEvent::ProfileUpdated { avatar: ImageState::Uploaded { .. }, .. }
        ));

        let mut huge = PNG_BYTES.to_vec();
        huge.resize(h.engine.settings.pipeline.avatar_max_bytes + 1, 0);
        assert!(matches!(
            h.engine.update_avatar(user, huge).await,
            Err(MessagingError::Validation(ValidationError::AttachmentTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn new_message_carries_author_snapshot() {
        let h = EngineHarness::start(ScriptedObjectStore::succeeding());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        h.profiles
            .upsert(AuthorSnapshot {
                id: alice,
                display_name: Some("Alice".into()),
                avatar_url: None,
            })
            .await;
        let mut bob_rx = h.connect(bob).await;

        h.engine
            .send_message(alice, bob, Some("hey"), None)
            .await
            .unwrap();
        let event = next_event(&mut bob_rx, "new-message").await;
        let ServerEvent::NewMessage { author, .. } = event.as_ref() else {
            panic!("expected new-message");
        };
        assert_eq!(
            author.as_ref().and_then(|a| a.display_name.as_deref()),
            Some("Alice")
        );
    }

    #[test]
    fn images_decode_from_base64_and_data_urls() {
        let encoded = STANDARD.encode(PNG_BYTES);
        assert_eq!(decode_image(&encoded).unwrap(), PNG_BYTES);
        assert_eq!(
            decode_image(&format!("data:image/png;base64,{encoded}")).unwrap(),
            PNG_BYTES
        );
        assert_eq!(
            decode_image("not base64!").unwrap_err(),
            ValidationError::InvalidEncoding
        );
    }
}
