use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{ConversationCache, InboxSnapshotStore, SharedCache};
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, FeedFilter};
use crate::merge::{MergeEngine, SubscriptionHandle};
use crate::models::{
    ConversationKind, Message, MessageContent, NewThread, Participant, ParticipantRole, Thread, ThreadViewModel,
    ThreadWithParticipants,
};
use crate::read_state::ReadStateTracker;
use crate::repository::ConversationStore;
use crate::resolver::{InboxRequest, ThreadResolver};
use crate::send::SendPipeline;
use crate::validation::InputValidator;

/// Signed-in user the service acts for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub tenant_id: String,
    pub role: ParticipantRole,
}

impl Session {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            role,
        }
    }
}

/// Inbox handed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxView {
    pub threads: Vec<ThreadViewModel>,
    /// True when served from the last snapshot because the store was unreachable
    pub stale: bool,
}

/// Result of opening a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedThread {
    pub thread: Thread,
    pub messages: Vec<Message>,
    /// Whether the view should treat the thread as read on open
    pub mark_read_on_open: bool,
    pub unread_before_open: u32,
    pub unread_count: u32,
}

/// Per-session messaging surface used by every role's UI
pub struct MessagingService {
    store: Arc<dyn ConversationStore>,
    session: Session,
    cache: SharedCache,
    engine: Arc<MergeEngine>,
    resolver: ThreadResolver,
    tracker: ReadStateTracker,
    pipeline: SendPipeline,
    snapshots: Option<InboxSnapshotStore>,
    config: AppConfig,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        feed: Arc<dyn ChangeFeed>,
        session: Session,
        config: AppConfig,
    ) -> Result<Self> {
        InputValidator::validate_id("user_id", &session.user_id)?;
        InputValidator::validate_id("tenant_id", &session.tenant_id)?;

        let cache = ConversationCache::shared(session.user_id.clone());
        let tracker = ReadStateTracker::new(Arc::clone(&store))
            .with_batch_mark_read(config.sync.use_batch_mark_read)
            .with_retry(config.sync.read_retry_attempts, config.sync.reconnect_initial_backoff_ms);
        let resolver = ThreadResolver::new(Arc::clone(&store), tracker.clone())
            .with_placeholder_name(config.inbox.placeholder_name.clone())
            .with_retry(config.sync.read_retry_attempts, config.sync.reconnect_initial_backoff_ms);
        let pipeline = SendPipeline::new(Arc::clone(&store), config.validation.clone()).with_cache(Arc::clone(&cache));
        let engine = Arc::new(MergeEngine::new(
            Arc::clone(&store),
            feed,
            Arc::clone(&cache),
            config.sync.clone(),
        ));
        let snapshots = config
            .inbox
            .snapshot_path
            .as_deref()
            .map(InboxSnapshotStore::open)
            .transpose()?;

        Ok(Self {
            store,
            session,
            cache,
            engine,
            resolver,
            tracker,
            pipeline,
            snapshots,
            config,
        })
    }

    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Cache shared with this session's subscriptions
    pub const fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Role-scoped inbox for the session user.
    ///
    /// A successful fetch refreshes the snapshot. When the store stays unreachable,
    /// the last snapshot is served with `stale = true` if one exists.
    pub async fn get_inbox(&self) -> Result<InboxView> {
        let request = InboxRequest {
            viewer_id: self.session.user_id.clone(),
            tenant_id: self.session.tenant_id.clone(),
            role: self.session.role,
            include_archived: self.config.inbox.include_archived,
        };
        let role = self.session.role.as_str();

        match self.resolver.resolve(&request).await {
            Ok(threads) => {
                if let Some(snapshots) = &self.snapshots {
                    if let Err(err) = snapshots.save(&self.session.user_id, role, &threads) {
                        warn!(error = %err, "Failed to save inbox snapshot");
                    }
                }
                self.cache.lock().take_stale_threads();
                Ok(InboxView { threads, stale: false })
            },
            Err(err) if err.is_retryable() && self.config.inbox.serve_stale_snapshot => {
                let snapshot = match &self.snapshots {
                    Some(snapshots) => snapshots.load(&self.session.user_id, role)?,
                    None => None,
                };
                match snapshot {
                    Some((saved_at, threads)) => {
                        warn!(error = %err, saved_at = %saved_at, "Serving stale inbox snapshot");
                        Ok(InboxView { threads, stale: true })
                    },
                    None => Err(err),
                }
            },
            Err(err) => Err(err),
        }
    }

    /// Load a thread into the session cache and, when configured, mark it read
    pub async fn open_thread(&self, thread_id: &str) -> Result<OpenedThread> {
        let thread = self.member_thread(thread_id).await?;
        // Open first so events committed while the fetch runs are merged, not lost
        let was_open = {
            let mut cache = self.cache.lock();
            let was_open = cache.get(thread_id).is_some();
            cache.open(thread_id);
            was_open
        };
        let messages = match self.store.list_messages(thread_id, None).await {
            Ok(messages) => messages,
            Err(err) => {
                if !was_open {
                    self.cache.lock().close(thread_id);
                }
                return Err(err);
            },
        };

        let unread_before_open = {
            let mut cache = self.cache.lock();
            let open = cache.open(thread_id);
            open.refresh(messages, thread.participants.clone());
            open.unread_count()
        };

        let mark_read_on_open = self.config.sync.mark_read_on_open;
        if mark_read_on_open {
            let participant = self.tracker.mark_read(thread_id, &self.session.user_id).await?;
            self.apply_own_participant(participant);
        }

        let cache = self.cache.lock();
        let open = cache
            .get(thread_id)
            .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id} was closed")))?;
        info!(thread_id, unread_before_open, "Opened thread");
        Ok(OpenedThread {
            thread: thread.thread,
            messages: open.messages().to_vec(),
            mark_read_on_open,
            unread_before_open,
            unread_count: open.unread_count(),
        })
    }

    /// Drop a thread's cached state
    pub fn close_thread(&self, thread_id: &str) {
        self.cache.lock().close(thread_id);
    }

    /// Cached messages of an open thread
    pub fn cached_messages(&self, thread_id: &str) -> Option<Vec<Message>> {
        self.cache.lock().get(thread_id).map(|open| open.messages().to_vec())
    }

    /// Cached unread count of an open thread
    pub fn cached_unread(&self, thread_id: &str) -> Option<u32> {
        self.cache.lock().get(thread_id).map(crate::cache::ThreadCache::unread_count)
    }

    pub async fn send_message(&self, thread_id: &str, content: &MessageContent) -> Result<Message> {
        self.pipeline.send(thread_id, &self.session.user_id, content).await
    }

    /// Advance the session user's read marker for a thread
    pub async fn mark_read(&self, thread_id: &str) -> Result<Participant> {
        let participant = self.tracker.mark_read(thread_id, &self.session.user_id).await?;
        self.apply_own_participant(participant.clone());
        Ok(participant)
    }

    /// Unread messages in one thread, straight from the store
    pub async fn unread_count(&self, thread_id: &str) -> Result<u32> {
        self.tracker.unread_count(thread_id, &self.session.user_id).await
    }

    /// Aggregate unread badge, derived from the per-thread counts
    pub async fn get_unread_badge_count(&self) -> Result<u32> {
        self.tracker
            .unread_badge(&self.session.user_id, &self.session.tenant_id)
            .await
    }

    /// Keep one open thread in sync with the change feed
    pub fn watch_thread(&self, thread_id: &str) -> SubscriptionHandle {
        self.engine.spawn_subscription(FeedFilter::thread(thread_id))
    }

    /// Follow every thread the session user participates in
    pub fn watch_session(&self) -> SubscriptionHandle {
        self.engine.spawn_subscription(FeedFilter::user(self.session.user_id.clone()))
    }

    /// Threads with activity since the last inbox fetch
    pub fn stale_threads(&self) -> Vec<String> {
        let cache = self.cache.lock();
        let mut ids: Vec<String> = cache
            .thread_ids()
            .into_iter()
            .filter(|id| cache.is_stale(id))
            .collect();
        drop(cache);
        ids.extend(self.cache.lock().take_stale_threads());
        ids.sort();
        ids.dedup();
        ids
    }

    /// Start a conversation; the session user is always a participant
    pub async fn start_conversation(
        &self,
        kind: ConversationKind,
        participants: Vec<(String, ParticipantRole)>,
        subject: Option<String>,
        subject_entity_id: Option<String>,
    ) -> Result<ThreadWithParticipants> {
        for (user_id, _) in &participants {
            InputValidator::validate_id("participant", user_id)?;
        }
        let mut members = vec![(self.session.user_id.clone(), self.session.role)];
        members.extend(participants.into_iter().filter(|(user_id, _)| *user_id != self.session.user_id));
        if members.len() < 2 {
            return Err(SyncError::Validation("a conversation needs someone to talk to".into()));
        }

        let thread = self
            .store
            .start_conversation(&NewThread {
                tenant_id: self.session.tenant_id.clone(),
                kind,
                created_by: self.session.user_id.clone(),
                subject: subject.map(|s| InputValidator::sanitize_text(&s)).filter(|s| !s.is_empty()),
                subject_entity_id,
                participants: members,
            })
            .await?;
        info!(thread_id = %thread.thread.id, kind = %kind, "Started conversation");
        Ok(thread)
    }

    /// Latest non-archived two-party thread of `kind` with `counterpart_id`, started
    /// when none exists
    pub async fn find_or_start_direct(
        &self,
        kind: ConversationKind,
        counterpart_id: &str,
        counterpart_role: ParticipantRole,
    ) -> Result<ThreadWithParticipants> {
        InputValidator::validate_id("counterpart", counterpart_id)?;
        let me = self.session.user_id.as_str();
        let existing = self
            .store
            .list_threads_for_user(me, &self.session.tenant_id)
            .await?
            .into_iter()
            .filter(|t| t.thread.kind == kind && !t.thread.archived)
            .filter(|t| {
                t.participants.len() == 2 && t.participant(me).is_some() && t.participant(counterpart_id).is_some()
            })
            .max_by(|a, b| {
                (a.thread.last_activity_at, &a.thread.id).cmp(&(b.thread.last_activity_at, &b.thread.id))
            });

        match existing {
            Some(thread) => Ok(thread),
            None => {
                self.start_conversation(kind, vec![(counterpart_id.to_string(), counterpart_role)], None, None)
                    .await
            },
        }
    }

    /// Edit one of the session user's messages
    pub async fn edit_message(&self, message_id: &str, content: MessageContent) -> Result<Message> {
        self.own_message(message_id).await?;
        let content = InputValidator::sanitize_content(content);
        InputValidator::validate_content(&content, &self.config.validation)?;

        let message = self.store.edit_message(message_id, &content).await?;
        self.replace_cached(message.clone());
        Ok(message)
    }

    /// Soft-delete one of the session user's messages
    pub async fn delete_message(&self, message_id: &str) -> Result<Message> {
        self.own_message(message_id).await?;
        let message = self.store.delete_message(message_id).await?;
        self.replace_cached(message.clone());
        Ok(message)
    }

    pub async fn set_muted(&self, thread_id: &str, muted: bool) -> Result<Participant> {
        let participant = self.store.set_muted(thread_id, &self.session.user_id, muted).await?;
        self.apply_own_participant(participant.clone());
        Ok(participant)
    }

    pub async fn set_archived(&self, thread_id: &str, archived: bool) -> Result<Thread> {
        self.member_thread(thread_id).await?;
        self.store.set_archived(thread_id, archived).await
    }

    /// Thread the session user belongs to. Threads of other tenants or without the
    /// user are reported as missing.
    async fn member_thread(&self, thread_id: &str) -> Result<ThreadWithParticipants> {
        InputValidator::validate_id("thread_id", thread_id)?;
        self.store
            .get_thread(thread_id)
            .await?
            .filter(|t| t.thread.tenant_id == self.session.tenant_id)
            .filter(|t| t.participant(&self.session.user_id).is_some())
            .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id}")))
    }

    async fn own_message(&self, message_id: &str) -> Result<Message> {
        InputValidator::validate_id("message_id", message_id)?;
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        if message.sender_id != self.session.user_id {
            return Err(SyncError::Validation("only the sender can change a message".into()));
        }
        if message.is_deleted() {
            return Err(SyncError::Validation("message was deleted".into()));
        }
        Ok(message)
    }

    fn apply_own_participant(&self, participant: Participant) {
        let mut cache = self.cache.lock();
        if let Some(open) = cache.get_mut(&participant.thread_id) {
            open.apply_participant(participant);
            open.recompute();
        }
    }

    fn replace_cached(&self, message: Message) {
        let mut cache = self.cache.lock();
        if let Some(open) = cache.get_mut(&message.thread_id) {
            open.replace_message(message);
            open.recompute();
        }
    }
}
