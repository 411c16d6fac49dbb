//! Unread counts and read markers.
//!
//! One definition of "unread" is used everywhere, for the cached per-thread count,
//! the store-side count and the aggregate badge: messages from someone else, created
//! strictly after the viewer's read marker, and not soft-deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::{now_millis, Message, Participant, ThreadWithParticipants};
use crate::repository::ConversationStore;
use crate::utils::retry_transient;

/// Count unread messages in an in-memory message list
#[must_use]
pub fn count_unread(messages: &[Message], user_id: &str, last_read_at: Option<DateTime<Utc>>) -> u32 {
    let unread = messages
        .iter()
        .filter(|m| m.sender_id != user_id && !m.is_deleted())
        .filter(|m| last_read_at.map_or(true, |read| m.created_at > read))
        .count();
    u32::try_from(unread).unwrap_or(u32::MAX)
}

/// Computes unread counts against the store and advances read markers
#[derive(Clone)]
pub struct ReadStateTracker {
    store: Arc<dyn ConversationStore>,
    metrics: SyncMetrics,
    use_batch_mark_read: bool,
    retry_attempts: u32,
    retry_backoff_ms: u64,
}

impl ReadStateTracker {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            metrics: SyncMetrics::default(),
            use_batch_mark_read: true,
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }

    #[must_use]
    pub const fn with_batch_mark_read(mut self, enabled: bool) -> Self {
        self.use_batch_mark_read = enabled;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Unread messages of `user_id` in one thread
    pub async fn unread_count(&self, thread_id: &str, user_id: &str) -> Result<u32> {
        let thread = retry_transient("get_thread", self.retry_attempts, self.retry_backoff_ms, || {
            self.store.get_thread(thread_id)
        })
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id}")))?;

        self.unread_for(&thread, user_id).await
    }

    /// Unread count using participant rows already fetched with the thread
    pub async fn unread_for(&self, thread: &ThreadWithParticipants, user_id: &str) -> Result<u32> {
        let participant = thread.participant(user_id).ok_or_else(|| {
            SyncError::NotFound(format!("participant {user_id} in thread {}", thread.thread.id))
        })?;

        let count = retry_transient("count_messages", self.retry_attempts, self.retry_backoff_ms, || {
            self.store.count_messages(&thread.thread.id, user_id, participant.last_read_at)
        })
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Unread counts for several threads, fetched concurrently and returned in input order
    pub async fn unread_counts(&self, threads: &[ThreadWithParticipants], user_id: &str) -> Vec<Result<u32>> {
        join_all(threads.iter().map(|thread| self.unread_for(thread, user_id))).await
    }

    /// Aggregate badge: the sum of per-thread unread counts over every thread of
    /// the user in the tenant. Archiving hides a thread from the inbox but does not
    /// change its count, so the badge always equals the sum of [`Self::unread_count`].
    pub async fn unread_badge(&self, user_id: &str, tenant_id: &str) -> Result<u32> {
        let threads = retry_transient("list_threads_for_user", self.retry_attempts, self.retry_backoff_ms, || {
            self.store.list_threads_for_user(user_id, tenant_id)
        })
        .await?;

        let mut total: u32 = 0;
        for count in self.unread_counts(&threads, user_id).await {
            total = total.saturating_add(count?);
        }
        debug!(user_id, tenant_id, threads = threads.len(), total, "Computed unread badge");
        Ok(total)
    }

    /// Mark everything in the thread as read now
    pub async fn mark_read(&self, thread_id: &str, user_id: &str) -> Result<Participant> {
        self.mark_read_at(thread_id, user_id, now_millis()).await
    }

    /// Advance the read marker to `max(current, at)`.
    ///
    /// Uses the store's single-statement mark-read when enabled and falls back to the
    /// per-participant update when the store does not offer it. Repeating the call is
    /// harmless.
    pub async fn mark_read_at(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant> {
        if self.use_batch_mark_read {
            match self.store.mark_thread_read(thread_id, user_id, at).await {
                Err(SyncError::Unsupported(operation)) => {
                    warn!(thread_id, operation = %operation, "Batch mark-read unavailable, using direct update");
                    self.metrics.record_mark_read_fallback();
                },
                result => return self.log_marked(result, thread_id, user_id),
            }
        }

        let result = self.store.update_participant_last_read(thread_id, user_id, at).await;
        self.log_marked(result, thread_id, user_id)
    }

    fn log_marked(&self, result: Result<Participant>, thread_id: &str, user_id: &str) -> Result<Participant> {
        match &result {
            Ok(participant) => info!(
                thread_id,
                user_id,
                last_read_at = ?participant.last_read_at,
                "Marked thread as read"
            ),
            Err(_) => self.metrics.record_error("read_state", "mark_read"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{from_millis, ConversationKind, MessageContent, ParticipantRole, Thread};
    use crate::repository::MockConversationStore;
    use mockall::predicate::eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn message(id: &str, sender: &str, at: i64, deleted: bool) -> Message {
        Message {
            id: id.into(),
            thread_id: "t1".into(),
            sender_id: sender.into(),
            content: MessageContent::Text(format!("message {id}")),
            created_at: from_millis(at),
            edited_at: None,
            deleted_at: deleted.then(|| from_millis(at + 1)),
            read_by: BTreeSet::new(),
        }
    }

    fn participant(user: &str, last_read: Option<i64>) -> Participant {
        Participant {
            thread_id: "t1".into(),
            user_id: user.into(),
            role: ParticipantRole::Parent,
            joined_at: from_millis(0),
            muted: false,
            last_read_at: last_read.map(from_millis),
        }
    }

    fn thread_with(participants: Vec<Participant>) -> ThreadWithParticipants {
        ThreadWithParticipants {
            thread: Thread {
                id: "t1".into(),
                tenant_id: "school-1".into(),
                kind: ConversationKind::ParentTeacher,
                subject_entity_id: None,
                subject: None,
                created_by: "parent-1".into(),
                last_activity_at: from_millis(0),
                archived: false,
                created_at: from_millis(0),
                updated_at: from_millis(0),
            },
            participants,
        }
    }

    #[test]
    fn own_deleted_and_already_read_messages_do_not_count() {
        let messages = vec![
            message("a", "teacher-1", 100, false),
            message("b", "parent-1", 200, false),
            message("c", "teacher-1", 300, true),
            message("d", "teacher-1", 400, false),
        ];
        assert_eq!(count_unread(&messages, "parent-1", None), 2);
        assert_eq!(count_unread(&messages, "parent-1", Some(from_millis(100))), 1);
        assert_eq!(count_unread(&messages, "parent-1", Some(from_millis(400))), 0);
    }

    #[tokio::test]
    async fn falls_back_to_direct_update_when_batch_is_unsupported() {
        let mut store = MockConversationStore::new();
        store
            .expect_mark_thread_read()
            .times(1)
            .returning(|_, _, _| Err(SyncError::Unsupported("mark_thread_read".into())));
        store
            .expect_update_participant_last_read()
            .times(1)
            .returning(|_, user, at| Ok(participant(user, Some(at.timestamp_millis()))));

        let tracker = ReadStateTracker::new(Arc::new(store));
        let updated = tracker.mark_read_at("t1", "parent-1", from_millis(500)).await.unwrap();
        assert_eq!(updated.last_read_at, Some(from_millis(500)));
    }

    #[tokio::test]
    async fn batch_failures_other_than_unsupported_propagate() {
        let mut store = MockConversationStore::new();
        store
            .expect_mark_thread_read()
            .returning(|_, _, _| Err(SyncError::Transient("offline".into())));
        store.expect_update_participant_last_read().never();

        let tracker = ReadStateTracker::new(Arc::new(store));
        assert!(tracker.mark_read_at("t1", "parent-1", from_millis(1)).await.is_err());
    }

    #[tokio::test]
    async fn unread_count_uses_the_viewer_read_marker() {
        let mut store = MockConversationStore::new();
        store
            .expect_count_messages()
            .with(eq("t1"), eq("parent-1"), eq(Some(from_millis(250))))
            .returning(|_, _, _| Ok(4));

        let tracker = ReadStateTracker::new(Arc::new(store));
        let thread = thread_with(vec![participant("parent-1", Some(250)), participant("teacher-1", None)]);
        assert_eq!(tracker.unread_for(&thread, "parent-1").await.unwrap(), 4);
        assert!(matches!(
            tracker.unread_for(&thread, "stranger").await,
            Err(SyncError::NotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn advancing_the_marker_never_increases_unread(
            times in proptest::collection::vec(0_i64..10_000, 0..40),
            first in 0_i64..10_000,
            second in 0_i64..10_000,
        ) {
            let messages: Vec<Message> = times
                .iter()
                .enumerate()
                .map(|(i, at)| message(&i.to_string(), if i % 3 == 0 { "parent-1" } else { "teacher-1" }, *at, false))
                .collect();

            let mut reader = participant("parent-1", Some(first));
            let before = count_unread(&messages, "parent-1", reader.last_read_at);
            reader.advance_read(from_millis(second));
            let after = count_unread(&messages, "parent-1", reader.last_read_at);

            prop_assert!(after <= before);
            prop_assert!(reader.last_read_at >= Some(from_millis(first)));
        }
    }
}
