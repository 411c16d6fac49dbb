use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeEvent, ChangeFeedHub, EventType, FeedRow};
use crate::metrics::{MetricsTimer, SyncMetrics};
use crate::models::{
    now_millis, Message, MessageContent, NewThread, Participant, Profile, Thread, ThreadWithParticipants,
};

/// Query and mutation surface of the relational store.
///
/// Every mutation is monotonic: read markers and last-activity timestamps only move
/// forward, so concurrent writers converge without coordination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Threads of a tenant the user participates in, each with its participant rows
    async fn list_threads_for_user(&self, user_id: &str, tenant_id: &str) -> Result<Vec<ThreadWithParticipants>>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadWithParticipants>>;

    /// Messages ordered by (created-at, id), optionally only those after `since_id`
    async fn list_messages(&self, thread_id: &str, since_id: Option<String>) -> Result<Vec<Message>>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;

    /// Newest non-deleted message per thread in one round trip
    async fn latest_messages(&self, thread_ids: &[String]) -> Result<HashMap<String, Message>>;

    /// Newest non-deleted message of a single thread
    async fn latest_message(&self, thread_id: &str) -> Result<Option<Message>>;

    /// Persist a message and advance the thread's last activity in one transaction
    async fn insert_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        content: &MessageContent,
        created_at: DateTime<Utc>,
    ) -> Result<Message>;

    async fn update_thread_last_activity(&self, thread_id: &str, at: DateTime<Utc>) -> Result<Thread>;

    async fn update_participant_last_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant>;

    /// Server-side "mark thread as read". Stores without it return [`SyncError::Unsupported`].
    async fn mark_thread_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant>;

    /// Non-deleted messages not sent by `excluding_sender`, created strictly after `created_after`
    async fn count_messages(
        &self,
        thread_id: &str,
        excluding_sender: &str,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<u64>;

    /// Best-effort profile lookup; unknown ids are absent from the result
    async fn resolve_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>>;

    async fn start_conversation(&self, new_thread: &NewThread) -> Result<ThreadWithParticipants>;

    async fn edit_message(&self, message_id: &str, content: &MessageContent) -> Result<Message>;

    async fn delete_message(&self, message_id: &str) -> Result<Message>;

    async fn set_muted(&self, thread_id: &str, user_id: &str, muted: bool) -> Result<Participant>;

    async fn set_archived(&self, thread_id: &str, archived: bool) -> Result<Thread>;
}

/// SQLite-backed store that publishes every committed mutation to a change feed
#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Database,
    feed: Option<Arc<ChangeFeedHub>>,
    metrics: SyncMetrics,
    batch_mark_read: bool,
}

impl SqliteConversationStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            feed: None,
            metrics: SyncMetrics::default(),
            batch_mark_read: true,
        }
    }

    /// Publish committed changes to `feed`
    #[must_use]
    pub fn with_feed(mut self, feed: Arc<ChangeFeedHub>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Enable or disable the single-statement mark-read
    #[must_use]
    pub const fn with_batch_mark_read(mut self, enabled: bool) -> Self {
        self.batch_mark_read = enabled;
        self
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Run a blocking database call off the async runtime, timing it
    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let timer = MetricsTimer::new(self.metrics.clone(), operation);
        let result = tokio::task::spawn_blocking(move || call(&db)).await?;
        let elapsed = timer.finish(result.is_ok());
        match &result {
            Ok(_) => debug!(operation, duration_ms = elapsed.as_millis(), "Store operation completed"),
            Err(err) => warn!(operation, error = %err, "Store operation failed"),
        }
        result
    }

    fn publish(&self, event_type: EventType, row: FeedRow, thread: &ThreadWithParticipants) {
        if let Some(feed) = &self.feed {
            let audience = thread.participants.iter().map(|p| p.user_id.clone()).collect();
            feed.publish(ChangeEvent::new(event_type, row, thread.thread.tenant_id.clone(), audience));
        }
    }
}

/// Fetch the thread owning a row so its event can be scoped
fn owning_thread(db: &Database, thread_id: &str) -> Result<ThreadWithParticipants> {
    db.get_thread(thread_id)?
        .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id}")))
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn list_threads_for_user(&self, user_id: &str, tenant_id: &str) -> Result<Vec<ThreadWithParticipants>> {
        let (user_id, tenant_id) = (user_id.to_string(), tenant_id.to_string());
        self.run("list_threads_for_user", move |db| db.list_threads_for_user(&user_id, &tenant_id))
            .await
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadWithParticipants>> {
        let thread_id = thread_id.to_string();
        self.run("get_thread", move |db| db.get_thread(&thread_id)).await
    }

    async fn list_messages(&self, thread_id: &str, since_id: Option<String>) -> Result<Vec<Message>> {
        let thread_id = thread_id.to_string();
        self.run("list_messages", move |db| {
            let mut messages = db.list_messages(&thread_id, since_id.as_deref())?;
            if let Some(thread) = db.get_thread(&thread_id)? {
                for message in &mut messages {
                    for participant in &thread.participants {
                        message.note_reader(participant);
                    }
                }
            }
            Ok(messages)
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let message_id = message_id.to_string();
        self.run("get_message", move |db| db.get_message(&message_id)).await
    }

    async fn latest_messages(&self, thread_ids: &[String]) -> Result<HashMap<String, Message>> {
        let thread_ids = thread_ids.to_vec();
        self.run("latest_messages", move |db| db.latest_messages(&thread_ids)).await
    }

    async fn latest_message(&self, thread_id: &str) -> Result<Option<Message>> {
        let thread_id = thread_id.to_string();
        self.run("latest_message", move |db| {
            Ok(db.latest_messages(std::slice::from_ref(&thread_id))?.remove(&thread_id))
        })
        .await
    }

    async fn insert_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        content: &MessageContent,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let (thread_id, sender_id, content) = (thread_id.to_string(), sender_id.to_string(), content.clone());
        let (message, thread) = self
            .run("insert_message", move |db| {
                let message = db.insert_message(&thread_id, &sender_id, &content, created_at)?;
                let thread = owning_thread(db, &thread_id)?;
                Ok((message, thread))
            })
            .await?;

        self.publish(EventType::Insert, FeedRow::Message(message.clone()), &thread);
        self.publish(EventType::Update, FeedRow::Thread(thread.thread.clone()), &thread);
        Ok(message)
    }

    async fn update_thread_last_activity(&self, thread_id: &str, at: DateTime<Utc>) -> Result<Thread> {
        let thread_id = thread_id.to_string();
        let thread = self
            .run("update_thread_last_activity", move |db| {
                db.update_thread_last_activity(&thread_id, at)?;
                owning_thread(db, &thread_id)
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Thread(thread.thread.clone()), &thread);
        Ok(thread.thread)
    }

    async fn update_participant_last_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant> {
        let (thread_id, user_id) = (thread_id.to_string(), user_id.to_string());
        let (participant, thread) = self
            .run("update_participant_last_read", move |db| {
                let participant = db.update_participant_last_read(&thread_id, &user_id, at)?;
                Ok((participant, owning_thread(db, &thread_id)?))
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Participant(participant.clone()), &thread);
        Ok(participant)
    }

    async fn mark_thread_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant> {
        if !self.batch_mark_read {
            return Err(SyncError::Unsupported("mark_thread_read".into()));
        }

        let (thread_id, user_id) = (thread_id.to_string(), user_id.to_string());
        let (participant, thread) = self
            .run("mark_thread_read", move |db| {
                let participant = db.mark_thread_read(&thread_id, &user_id, at)?;
                Ok((participant, owning_thread(db, &thread_id)?))
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Participant(participant.clone()), &thread);
        Ok(participant)
    }

    async fn count_messages(
        &self,
        thread_id: &str,
        excluding_sender: &str,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let (thread_id, excluding_sender) = (thread_id.to_string(), excluding_sender.to_string());
        self.run("count_messages", move |db| db.count_messages(&thread_id, &excluding_sender, created_after))
            .await
    }

    async fn resolve_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>> {
        let user_ids = user_ids.to_vec();
        self.run("resolve_profiles", move |db| db.resolve_profiles(&user_ids)).await
    }

    async fn start_conversation(&self, new_thread: &NewThread) -> Result<ThreadWithParticipants> {
        let new_thread = new_thread.clone();
        let thread = self
            .run("start_conversation", move |db| db.create_thread(&new_thread, now_millis()))
            .await?;

        self.publish(EventType::Insert, FeedRow::Thread(thread.thread.clone()), &thread);
        Ok(thread)
    }

    async fn edit_message(&self, message_id: &str, content: &MessageContent) -> Result<Message> {
        let (message_id, content) = (message_id.to_string(), content.clone());
        let (message, thread) = self
            .run("edit_message", move |db| {
                let message = db.edit_message(&message_id, &content, now_millis())?;
                let thread = owning_thread(db, &message.thread_id)?;
                Ok((message, thread))
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Message(message.clone()), &thread);
        Ok(message)
    }

    async fn delete_message(&self, message_id: &str) -> Result<Message> {
        let message_id = message_id.to_string();
        let (message, thread) = self
            .run("delete_message", move |db| {
                let message = db.delete_message(&message_id, now_millis())?;
                let thread = owning_thread(db, &message.thread_id)?;
                Ok((message, thread))
            })
            .await?;

        self.publish(EventType::Delete, FeedRow::Message(message.clone()), &thread);
        Ok(message)
    }

    async fn set_muted(&self, thread_id: &str, user_id: &str, muted: bool) -> Result<Participant> {
        let (thread_id, user_id) = (thread_id.to_string(), user_id.to_string());
        let (participant, thread) = self
            .run("set_muted", move |db| {
                let participant = db.set_muted(&thread_id, &user_id, muted)?;
                Ok((participant, owning_thread(db, &thread_id)?))
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Participant(participant.clone()), &thread);
        Ok(participant)
    }

    async fn set_archived(&self, thread_id: &str, archived: bool) -> Result<Thread> {
        let thread_id = thread_id.to_string();
        let thread = self
            .run("set_archived", move |db| {
                db.set_archived(&thread_id, archived, now_millis())?;
                owning_thread(db, &thread_id)
            })
            .await?;

        self.publish(EventType::Update, FeedRow::Thread(thread.thread.clone()), &thread);
        Ok(thread.thread)
    }
}
