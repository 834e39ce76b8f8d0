use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use serde_json::json;
use shared::{
    domain::{
        AddChannelStatus, Channel, ChannelId, InlineButton, InlineKeyboard, PendingMedia, PostId,
        ScheduledPost,
    },
    protocol::{
        ActionReport, AddChannelRequest, BridgeRequest, InboundMessage, InitialData,
        OutboundEnvelope, PostSubmission, UploadedMedia,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod error;
pub mod loading;
pub mod media;
pub mod transport;
pub mod validation;

pub use bridge::{Bridge, BridgePeer, ChannelBridge, WsBridge};
pub use config::{ConvergencePolicy, DeletePolicy, StoreConfig};
pub use error::{StoreError, StoreResult, TransportError, ValidationError};
pub use media::{MediaFile, ObjectUrlRegistry, PreviewBackend};
pub use transport::{HttpChannel, MessageChannel};

use correlator::{Correlation, ResponseCorrelator};
use loading::{LoadingGuard, LoadingToken};
use media::MediaResourceManager;
use transport::{CallBody, HttpReply};

const DELETE_PROMPT: &str = "Are you sure you want to delete this post?";
const POST_SCHEDULED: &str = "Your post has been scheduled successfully!";
const UNEXPECTED_ERROR: &str = "An unexpected error occurred.";
const CHANNEL_ADDED: &str = "Channel added successfully!";
const BOT_REPORTED_ERROR: &str = "The bot reported an error.";
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchData,
    AddChannel,
    SchedulePost,
    DeletePost,
    UploadMedia,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchData => "fetch_data",
            Self::AddChannel => "add_channel",
            Self::SchedulePost => "schedule_post",
            Self::DeletePost => "delete_post",
            Self::UploadMedia => "upload_media",
        }
    }

    /// Operations whose success changes channels or posts on the remote side.
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::AddChannel | Self::SchedulePost | Self::DeletePost)
    }

    /// Maps a bridge request name, as bots echo it in action reports.
    pub fn from_request_name(name: &str) -> Option<Self> {
        match name {
            "get_initial_data" => Some(Self::FetchData),
            "add_channel" => Some(Self::AddChannel),
            "new_post" => Some(Self::SchedulePost),
            "delete_post" => Some(Self::DeletePost),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing dialogs supplied by the host UI.
#[async_trait]
pub trait HostPrompts: Send + Sync {
    /// Resolves once the operator answers. It may resolve late, or never.
    async fn confirm(&self, message: &str) -> bool;
    fn alert(&self, message: &str);
}

/// Confirms everything and logs alerts. For headless hosts.
pub struct AutoConfirm;

#[async_trait]
impl HostPrompts for AutoConfirm {
    async fn confirm(&self, _message: &str) -> bool {
        true
    }

    fn alert(&self, message: &str) {
        info!(message, "alert");
    }
}

/// A post as the operator composed it.
#[derive(Debug, Clone)]
pub struct PostDraft {
    pub channel_id: ChannelId,
    pub text: String,
    pub schedule_time: DateTime<Utc>,
    pub inline_buttons: Vec<InlineButton>,
}

/// Everything the UI renders from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreState {
    pub channels: Vec<Channel>,
    pub scheduled_posts: Vec<ScheduledPost>,
    pub is_loading: bool,
    pub add_channel_status: AddChannelStatus,
    pub pending_media: Option<PendingMedia>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    StateChanged(StoreState),
    /// An operation got no answer in time and stopped counting as busy. Its
    /// outcome is unknown.
    LoadingTimedOut {
        operation: Operation,
    },
    ActionFailed {
        operation: Option<Operation>,
        message: String,
    },
}

struct StoreInner {
    state: StoreState,
    loading: LoadingGuard,
    correlator: ResponseCorrelator,
    media: MediaResourceManager,
    background: Vec<JoinHandle<()>>,
}

/// Single-writer state container. All mutation goes through its actions and
/// the inbound merge handlers; subscribers get a [`StoreEvent`] per change.
pub struct DashboardStore {
    channel: MessageChannel,
    prompts: Arc<dyn HostPrompts>,
    config: StoreConfig,
    inner: Mutex<StoreInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl DashboardStore {
    pub fn new(channel: MessageChannel) -> Arc<Self> {
        Self::new_with_dependencies(
            channel,
            Arc::new(AutoConfirm),
            Arc::new(ObjectUrlRegistry::new()),
            StoreConfig::default(),
        )
    }

    pub fn new_with_dependencies(
        channel: MessageChannel,
        prompts: Arc<dyn HostPrompts>,
        previews: Arc<dyn PreviewBackend>,
        config: StoreConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            channel,
            prompts,
            inner: Mutex::new(StoreInner {
                state: StoreState::default(),
                loading: LoadingGuard::new(config.loading_timeout),
                correlator: ResponseCorrelator::new(),
                media: MediaResourceManager::new(previews),
                background: Vec::new(),
            }),
            config,
            listener: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> StoreState {
        self.inner.lock().await.state.clone()
    }

    pub async fn in_flight(&self) -> Vec<Operation> {
        self.inner.lock().await.loading.in_flight()
    }

    /// Attaches the inbound listener and loads the initial data.
    pub async fn start(self: &Arc<Self>) {
        self.attach().await;
        self.fetch_data().await;
    }

    /// Starts merging inbound bridge traffic. Returns `false` on transports
    /// without a broadcast side.
    pub async fn attach(self: &Arc<Self>) -> bool {
        let MessageChannel::Bridge(bridge) = &self.channel else {
            return false;
        };
        let mut inbound = bridge.subscribe();
        let store = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(raw) => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.handle_inbound(&raw).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "store: inbound listener lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("store: inbound listener finished");
        });

        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }
        info!("store: inbound listener attached");
        true
    }

    /// Stops merging inbound traffic. In-flight sends and calls continue.
    pub async fn detach(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
            info!("store: inbound listener detached");
        }
    }

    /// Detaches, cancels timers and scheduled refetches, and releases the
    /// preview.
    pub async fn shutdown(&self) {
        self.detach().await;
        let mut inner = self.inner.lock().await;
        inner.loading.cancel_all();
        let abandoned = inner.correlator.outstanding();
        inner.correlator.clear();
        for task in inner.background.drain(..) {
            task.abort();
        }
        inner.media.clear();
        self.refresh(&mut inner);
        info!(abandoned, "store: shut down");
    }

    /// Resolves with the first state that is not loading.
    pub async fn wait_until_idle(&self) -> StoreState {
        let mut events = self.subscribe();
        let state = self.snapshot().await;
        if !state.is_loading {
            return state;
        }
        loop {
            match events.recv().await {
                Ok(StoreEvent::StateChanged(state)) if !state.is_loading => return state,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.snapshot().await,
            }
        }
    }

    /// Replaces channels, posts and (when reported) pending media wholesale.
    pub async fn fetch_data(self: &Arc<Self>) {
        match &self.channel {
            MessageChannel::Bridge(bridge) => {
                if let Err(err) = self
                    .send_bridge(bridge.as_ref(), Operation::FetchData, BridgeRequest::GetInitialData)
                    .await
                {
                    self.fail(Operation::FetchData, &err).await;
                }
            }
            MessageChannel::Http(http) => {
                let token = self.begin(Operation::FetchData).await;
                let result = http
                    .call(Method::GET, "initial-data", CallBody::Empty)
                    .await
                    .and_then(HttpReply::into_success)
                    .and_then(|body| {
                        body.data_as::<InitialData>()
                            .map_err(|source| TransportError::Body {
                                endpoint: "initial-data".to_string(),
                                source,
                            })
                    });
                self.complete_with(token, |store, inner| match result {
                    Ok(data) => store.merge_initial_data(inner, data),
                    Err(err) => store.record_failure(inner, Some(Operation::FetchData), &err),
                })
                .await;
            }
        }
    }

    pub async fn add_channel(self: &Arc<Self>, name: &str) -> StoreResult<()> {
        let username = validation::channel_username(name)?;
        {
            let mut inner = self.inner.lock().await;
            inner.state.add_channel_status = AddChannelStatus::default();
        }

        match &self.channel {
            MessageChannel::Bridge(bridge) => {
                let request = BridgeRequest::AddChannel { username };
                match self
                    .send_bridge(bridge.as_ref(), Operation::AddChannel, request)
                    .await
                {
                    Ok(()) => {
                        let mut inner = self.inner.lock().await;
                        self.converge_after_send(&mut inner, Operation::AddChannel);
                    }
                    Err(err) => self.fail(Operation::AddChannel, &err).await,
                }
            }
            MessageChannel::Http(http) => {
                let token = self.begin(Operation::AddChannel).await;
                let body = AddChannelRequest {
                    username: username.clone(),
                };
                let result = http
                    .call(Method::POST, "channels", CallBody::Json(json!(body)))
                    .await;
                self.complete_with(token, |store, inner| match result {
                    Ok(reply) => {
                        let success = reply.is_success();
                        let message = reply.body.user_message().unwrap_or_else(|| {
                            if success {
                                format!("Channel {username} added successfully!")
                            } else {
                                reply.body.failure(reply.status).message
                            }
                        });
                        store.apply_add_channel_status(
                            inner,
                            AddChannelStatus { success, message },
                        );
                        if success {
                            store.schedule_convergence(inner, Operation::AddChannel);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "store: add_channel transport failure");
                        store.apply_add_channel_status(
                            inner,
                            AddChannelStatus {
                                success: false,
                                message: UNEXPECTED_ERROR.to_string(),
                            },
                        );
                    }
                })
                .await;
            }
        }
        Ok(())
    }

    /// Schedules `draft` with the pending media attached, then clears the media.
    pub async fn schedule_post(self: &Arc<Self>, draft: PostDraft) -> StoreResult<()> {
        let pending = self.inner.lock().await.media.pending();
        validation::post_draft(&draft, pending.is_some())?;

        let (file_id, file_type) = match pending {
            Some(media) => (Some(media.file_id), Some(media.media_type)),
            None => (None, None),
        };
        let submission = PostSubmission {
            channel_id: draft.channel_id,
            text: draft.text,
            schedule_time: draft.schedule_time,
            file_id,
            file_type,
            inline_buttons: InlineKeyboard::single_row(draft.inline_buttons),
        };

        match &self.channel {
            MessageChannel::Bridge(bridge) => {
                let submitted_media = submission.file_id.clone();
                let request = BridgeRequest::NewPost(submission);
                match self
                    .send_bridge(bridge.as_ref(), Operation::SchedulePost, request)
                    .await
                {
                    Ok(()) => {
                        {
                            let mut inner = self.inner.lock().await;
                            Self::release_submitted_media(&mut inner, &submitted_media);
                            self.converge_after_send(&mut inner, Operation::SchedulePost);
                            self.refresh(&mut inner);
                        }
                        self.prompts.alert(POST_SCHEDULED);
                    }
                    Err(err) => self.fail(Operation::SchedulePost, &err).await,
                }
            }
            MessageChannel::Http(http) => {
                let token = self.begin(Operation::SchedulePost).await;
                let result = http
                    .call(Method::POST, "posts", CallBody::Json(json!(submission)))
                    .await
                    .and_then(HttpReply::into_success);
                self.complete_with(token, |store, inner| match result {
                    Ok(_) => {
                        info!(channel_id = %submission.channel_id, "store: post scheduled");
                        Self::release_submitted_media(inner, &submission.file_id);
                        store.schedule_convergence(inner, Operation::SchedulePost);
                    }
                    Err(err) => store.record_failure(inner, Some(Operation::SchedulePost), &err),
                })
                .await;
            }
        }
        Ok(())
    }

    /// Asks the operator to confirm, then deletes. Returns immediately; the
    /// returned task finishes once the confirmation resolves and the delete
    /// request has been issued.
    pub fn delete_post(self: &Arc<Self>, post_id: PostId) -> JoinHandle<()> {
        let prompts = Arc::clone(&self.prompts);
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            if !prompts.confirm(DELETE_PROMPT).await {
                info!(%post_id, "store: delete cancelled by operator");
                return;
            }
            let Some(store) = store.upgrade() else {
                return;
            };
            store.delete_confirmed(post_id).await;
        })
    }

    async fn delete_confirmed(self: &Arc<Self>, post_id: PostId) {
        if self.config.delete_policy == DeletePolicy::Optimistic {
            let mut inner = self.inner.lock().await;
            let before = inner.state.scheduled_posts.len();
            inner.state.scheduled_posts.retain(|post| post.id != post_id);
            if inner.state.scheduled_posts.len() != before {
                debug!(%post_id, "store: removed post ahead of acknowledgment");
                self.refresh(&mut inner);
            }
        }

        match &self.channel {
            MessageChannel::Bridge(bridge) => {
                let request = BridgeRequest::DeletePost { post_id };
                match self
                    .send_bridge(bridge.as_ref(), Operation::DeletePost, request)
                    .await
                {
                    Ok(()) => {
                        let mut inner = self.inner.lock().await;
                        self.converge_after_send(&mut inner, Operation::DeletePost);
                    }
                    Err(err) => self.fail(Operation::DeletePost, &err).await,
                }
            }
            MessageChannel::Http(http) => {
                let token = self.begin(Operation::DeletePost).await;
                let result = http
                    .call(Method::DELETE, &format!("posts/{post_id}"), CallBody::Empty)
                    .await
                    .and_then(HttpReply::into_success);
                self.complete_with(token, |store, inner| match result {
                    Ok(_) => {
                        info!(%post_id, "store: post deleted");
                        store.schedule_convergence(inner, Operation::DeletePost);
                    }
                    Err(err) => store.record_failure(inner, Some(Operation::DeletePost), &err),
                })
                .await;
            }
        }
    }

    /// Uploads `file` and keeps a local preview of it as the pending media.
    pub async fn upload_media(self: &Arc<Self>, file: MediaFile) -> StoreResult<()> {
        let MessageChannel::Http(http) = &self.channel else {
            return Err(StoreError::Unsupported {
                operation: Operation::UploadMedia,
                transport: self.channel.transport_name(),
            });
        };

        let token = self.begin(Operation::UploadMedia).await;
        let result = http
            .call(Method::POST, "media/upload", CallBody::Multipart(file.clone()))
            .await
            .and_then(HttpReply::into_success)
            .and_then(|body| {
                UploadedMedia::from_response(&body).map_err(|source| TransportError::Body {
                    endpoint: "media/upload".to_string(),
                    source,
                })
            });

        let mut preview_error = None;
        self.complete_with(token, |store, inner| match result {
            Ok(uploaded) => {
                match inner
                    .media
                    .install_upload(&file, uploaded.file_id, uploaded.media_type)
                {
                    Ok(pending) => info!(file_id = %pending.file_id, "store: media uploaded"),
                    Err(err) => {
                        warn!(error = %err, "store: preview could not be created");
                        preview_error = Some(err);
                    }
                }
            }
            Err(err) => store.record_failure(inner, Some(Operation::UploadMedia), &err),
        })
        .await;

        match preview_error {
            Some(err) => Err(StoreError::Preview(err)),
            None => Ok(()),
        }
    }

    /// Releases the preview and forgets the pending media. Returns whether
    /// anything was pending.
    pub async fn clear_pending_media(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let cleared = inner.media.clear();
        if cleared {
            self.refresh(&mut inner);
        }
        cleared
    }

    /// Merge entry point for one raw inbound message. Messages that are not
    /// response envelopes change nothing.
    pub async fn handle_inbound(self: &Arc<Self>, raw: &str) {
        let mut inner = self.inner.lock().await;
        let Some(routed) = inner.correlator.accept(raw) else {
            return;
        };

        let operation = match routed.correlation {
            Correlation::Matched(pending) => {
                inner.loading.complete(pending.token);
                Some(pending.operation)
            }
            Correlation::Unsolicited => None,
        };
        debug!(
            response = routed.message.kind(),
            operation = operation.map(Operation::as_str),
            "store: merging inbound response"
        );

        match routed.message {
            InboundMessage::InitialData(data) => self.merge_initial_data(&mut inner, data),
            InboundMessage::AddChannel(status) => {
                let success = status.success;
                self.apply_add_channel_status(&mut inner, status);
                if success {
                    self.converge_on_ack(&mut inner, Operation::AddChannel);
                }
            }
            InboundMessage::ActionSuccess(report) => {
                self.merge_action_success(&mut inner, operation, report)
            }
            InboundMessage::ActionError(report) => {
                self.merge_action_error(&mut inner, operation, report)
            }
        }
        self.refresh(&mut inner);
    }

    fn merge_initial_data(&self, inner: &mut StoreInner, data: InitialData) {
        let InitialData {
            channels,
            posts,
            media,
        } = data;

        let titles: HashMap<ChannelId, &str> = channels
            .iter()
            .map(|channel| (channel.id, channel.title.as_str()))
            .collect();
        let mut seen = HashSet::new();
        let scheduled_posts: Vec<ScheduledPost> = posts
            .into_iter()
            .filter(|record| {
                let fresh = seen.insert(record.id);
                if !fresh {
                    warn!(post_id = %record.id, "store: dropping duplicate post");
                }
                fresh
            })
            .map(|record| {
                let channel_name = titles
                    .get(&record.channel_id)
                    .map(|title| title.to_string())
                    .unwrap_or_else(|| self.config.unknown_channel_label.clone());
                ScheduledPost::from_record(record, channel_name)
            })
            .collect();

        info!(
            channels = channels.len(),
            posts = scheduled_posts.len(),
            "store: initial data merged"
        );
        inner.state.channels = channels;
        inner.state.scheduled_posts = scheduled_posts;
        if let Some(media) = media {
            inner.media.replace_from_server(Some(media));
        }
    }

    fn apply_add_channel_status(&self, inner: &mut StoreInner, status: AddChannelStatus) {
        if status.success {
            info!(message = %status.message, "store: channel added");
        } else {
            self.notify_failure(inner, Some(Operation::AddChannel), status.message.clone());
        }
        inner.state.add_channel_status = status;
    }

    /// Acknowledgements of reads, or of nothing we can name, change nothing.
    fn merge_action_success(
        self: &Arc<Self>,
        inner: &mut StoreInner,
        operation: Option<Operation>,
        report: ActionReport,
    ) {
        let operation =
            operation.or_else(|| report.action.as_deref().and_then(Operation::from_request_name));
        let Some(operation) = operation.filter(|operation| operation.is_mutation()) else {
            debug!(action = ?report.action, "store: ignoring acknowledgement of a non-mutation");
            return;
        };
        if operation == Operation::AddChannel {
            self.apply_add_channel_status(
                inner,
                AddChannelStatus {
                    success: true,
                    message: report.message.unwrap_or_else(|| CHANNEL_ADDED.to_string()),
                },
            );
        }
        self.converge_on_ack(inner, operation);
    }

    fn merge_action_error(
        &self,
        inner: &mut StoreInner,
        operation: Option<Operation>,
        report: ActionReport,
    ) {
        let operation =
            operation.or_else(|| report.action.as_deref().and_then(Operation::from_request_name));
        let message = report
            .message
            .unwrap_or_else(|| BOT_REPORTED_ERROR.to_string());
        if operation == Some(Operation::AddChannel) {
            inner.state.add_channel_status = AddChannelStatus {
                success: false,
                message: message.clone(),
            };
        }
        self.notify_failure(inner, operation, message);
    }

    fn record_failure(
        &self,
        inner: &mut StoreInner,
        operation: Option<Operation>,
        err: &TransportError,
    ) {
        warn!(operation = operation.map(Operation::as_str), error = %err, "store: action failed");
        self.notify_failure(inner, operation, err.user_message());
    }

    fn notify_failure(&self, inner: &mut StoreInner, operation: Option<Operation>, message: String) {
        inner.state.last_error = Some(message.clone());
        if self.config.alert_on_failure {
            self.prompts.alert(&message);
        }
        let _ = self
            .events
            .send(StoreEvent::ActionFailed { operation, message });
    }

    async fn fail(&self, operation: Operation, err: &TransportError) {
        let mut inner = self.inner.lock().await;
        if operation == Operation::AddChannel {
            inner.state.add_channel_status = AddChannelStatus {
                success: false,
                message: UNEXPECTED_ERROR.to_string(),
            };
        }
        self.record_failure(&mut inner, Some(operation), err);
        self.refresh(&mut inner);
    }

    /// Recomputes derived fields and notifies subscribers.
    fn refresh(&self, inner: &mut StoreInner) {
        inner.state.is_loading = inner.loading.is_loading();
        inner.state.pending_media = inner.media.pending();
        let _ = self
            .events
            .send(StoreEvent::StateChanged(inner.state.clone()));
    }

    fn arm_loading(self: &Arc<Self>, inner: &mut StoreInner, operation: Operation) -> LoadingToken {
        let store = Arc::downgrade(self);
        inner.loading.arm(operation, move |token, window| {
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(store) = store.upgrade() {
                    store.expire_loading(token).await;
                }
            })
        })
    }

    async fn expire_loading(&self, token: LoadingToken) {
        let mut inner = self.inner.lock().await;
        let Some(operation) = inner.loading.expire(token) else {
            return;
        };
        inner.correlator.forget_token(token);
        warn!(
            %operation,
            timeout_ms = inner.loading.window().as_millis() as u64,
            "store: no response within the loading window; clearing busy state"
        );
        self.refresh(&mut inner);
        let _ = self.events.send(StoreEvent::LoadingTimedOut { operation });
    }

    async fn begin(self: &Arc<Self>, operation: Operation) -> LoadingToken {
        let mut inner = self.inner.lock().await;
        let token = self.arm_loading(&mut inner, operation);
        self.refresh(&mut inner);
        token
    }

    async fn complete_with<F>(self: &Arc<Self>, token: LoadingToken, merge: F)
    where
        F: FnOnce(&Arc<Self>, &mut StoreInner),
    {
        let mut inner = self.inner.lock().await;
        inner.loading.complete(token);
        merge(self, &mut inner);
        self.refresh(&mut inner);
    }

    /// Registers the request before sending so a fast response still finds it.
    async fn send_bridge(
        self: &Arc<Self>,
        bridge: &dyn Bridge,
        operation: Operation,
        request: BridgeRequest,
    ) -> Result<(), TransportError> {
        let envelope = OutboundEnvelope::new(request);
        let request_id = envelope.request_id;
        let payload = serde_json::to_string(&envelope)
            .map_err(|err| TransportError::Bridge(err.to_string()))?;
        {
            let mut inner = self.inner.lock().await;
            let token = self.arm_loading(&mut inner, operation);
            inner.correlator.register(request_id, operation, token);
            self.refresh(&mut inner);
        }

        match bridge.send_data(payload).await {
            Ok(()) => {
                info!(
                    %request_id,
                    request = envelope.request.name(),
                    "store: bridge request sent"
                );
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                if let Some(pending) = inner.correlator.forget(request_id) {
                    inner.loading.complete(pending.token);
                }
                Err(err)
            }
        }
    }

    /// Media picked up after the post was submitted stays pending.
    fn release_submitted_media(inner: &mut StoreInner, submitted: &Option<String>) {
        let Some(file_id) = submitted else {
            return;
        };
        if !inner.media.clear_if(file_id) {
            debug!(%file_id, "store: pending media changed while posting; keeping it");
        }
    }

    fn converge_on_ack(self: &Arc<Self>, inner: &mut StoreInner, operation: Operation) {
        if self.config.convergence == ConvergencePolicy::OnAcknowledgement {
            self.schedule_convergence(inner, operation);
        }
    }

    /// Bridge mutations that bots do not acknowledge converge on a timer.
    fn converge_after_send(self: &Arc<Self>, inner: &mut StoreInner, operation: Operation) {
        if let ConvergencePolicy::DelayedRefetch(_) = self.config.convergence {
            self.schedule_convergence(inner, operation);
        }
    }

    fn schedule_convergence(self: &Arc<Self>, inner: &mut StoreInner, after: Operation) {
        let delay = match self.config.convergence {
            ConvergencePolicy::DelayedRefetch(delay) => delay,
            ConvergencePolicy::OnAcknowledgement => Duration::ZERO,
        };
        let store: Weak<Self> = Arc::downgrade(self);
        inner.background.retain(|task| !task.is_finished());
        inner.background.push(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(store) = store.upgrade() {
                debug!(%after, delay_ms = delay.as_millis() as u64, "store: convergence refetch");
                store.fetch_data().await;
            }
        }));
    }
}

impl Drop for DashboardStore {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        for task in self.inner.get_mut().background.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
