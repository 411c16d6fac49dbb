use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::cache::SharedCache;
use crate::config::ValidationConfig;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::{now_millis, Message, MessageContent};
use crate::repository::ConversationStore;
use crate::validation::InputValidator;

/// Validates and persists outbound messages
pub struct SendPipeline {
    store: Arc<dyn ConversationStore>,
    cache: Option<SharedCache>,
    limits: ValidationConfig,
    metrics: SyncMetrics,
}

impl SendPipeline {
    pub fn new(store: Arc<dyn ConversationStore>, limits: ValidationConfig) -> Self {
        Self {
            store,
            cache: None,
            limits,
            metrics: SyncMetrics::default(),
        }
    }

    /// Optimistically add sent messages to this cache
    #[must_use]
    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Send `content` to a thread as `sender_id`.
    ///
    /// Validation and membership problems are reported before anything is written;
    /// the caller still holds `content` in that case. Store failures come back as
    /// [`SyncError::SendFailed`] carrying the content exactly as typed, before
    /// sanitizing, so the caller can retry without losing it.
    pub async fn send(&self, thread_id: &str, sender_id: &str, content: &MessageContent) -> Result<Message> {
        let started = Instant::now();
        InputValidator::validate_id("thread_id", thread_id)?;
        InputValidator::validate_id("sender_id", sender_id)?;
        let sanitized = InputValidator::sanitize_content(content.clone());
        InputValidator::validate_content(&sanitized, &self.limits)?;

        let thread = match self.store.get_thread(thread_id).await {
            Ok(Some(thread)) => thread,
            Ok(None) => return Err(SyncError::NotFound(format!("thread {thread_id}"))),
            Err(err) => return Err(self.failed(content.clone(), err, started)),
        };
        if thread.participant(sender_id).is_none() {
            return Err(SyncError::Validation(format!(
                "{sender_id} is not a participant of thread {thread_id}"
            )));
        }

        let message = match self.store.insert_message(thread_id, sender_id, &sanitized, now_millis()).await {
            Ok(message) => message,
            Err(err) => return Err(self.failed(content.clone(), err, started)),
        };

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            if let Some(open) = cache.get_mut(thread_id) {
                open.insert_message(message.clone());
                open.recompute();
            }
        }

        self.metrics.record_send(started.elapsed(), true);
        info!(
            thread_id,
            sender_id,
            message_id = %message.id,
            kind = message.kind().as_str(),
            "Message sent"
        );
        Ok(message)
    }

    fn failed(&self, content: MessageContent, source: SyncError, started: Instant) -> SyncError {
        self.metrics.record_send(started.elapsed(), false);
        warn!(error = %source, retryable = source.is_retryable(), "Send failed");
        SyncError::SendFailed {
            content,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConversationCache;
    use crate::models::{
        from_millis, ContentKind, ConversationKind, MediaReference, Participant, ParticipantRole, Thread,
        ThreadWithParticipants,
    };
    use crate::repository::MockConversationStore;
    use std::collections::BTreeSet;

    fn thread() -> ThreadWithParticipants {
        ThreadWithParticipants {
            thread: Thread {
                id: "t1".into(),
                tenant_id: "school-1".into(),
                kind: ConversationKind::ParentPrincipal,
                subject_entity_id: None,
                subject: None,
                created_by: "parent-1".into(),
                last_activity_at: from_millis(0),
                archived: false,
                created_at: from_millis(0),
                updated_at: from_millis(0),
            },
            participants: vec![Participant {
                thread_id: "t1".into(),
                user_id: "parent-1".into(),
                role: ParticipantRole::Parent,
                joined_at: from_millis(0),
                muted: false,
                last_read_at: None,
            }],
        }
    }

    #[tokio::test]
    async fn store_failure_keeps_the_original_content() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().returning(|_| Ok(Some(thread())));
        store
            .expect_insert_message()
            .returning(|_, _, _, _| Err(SyncError::Transient("connection reset".into())));

        let pipeline = SendPipeline::new(Arc::new(store), ValidationConfig::default());
        let content = MessageContent::Text("Can we meet Friday?".into());
        let err = pipeline.send("t1", "parent-1", &content).await.unwrap_err();

        assert_eq!(err.unsent_content(), Some(&content));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_send_returns_the_content_as_typed() {
        let mut store = MockConversationStore::new();
        store
            .expect_get_thread()
            .returning(|_| Err(SyncError::Transient("connection reset".into())));
        store.expect_insert_message().never();

        let pipeline = SendPipeline::new(Arc::new(store), ValidationConfig::default());
        let typed = MessageContent::Text("  see you at 3  ".into());
        let err = pipeline.send("t1", "parent-1", &typed).await.unwrap_err();

        assert_eq!(err.unsent_content(), Some(&typed));
    }

    #[tokio::test]
    async fn invalid_media_is_rejected_before_the_store_is_touched() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().never();
        store.expect_insert_message().never();

        let pipeline = SendPipeline::new(Arc::new(store), ValidationConfig::default());
        let media = MessageContent::Media(MediaReference {
            kind: ContentKind::Voice,
            url: "ftp://files.example.com/note.m4a".into(),
            mime_type: "audio/mp4".into(),
            size_bytes: None,
            duration_ms: Some(4_000),
        });

        let err = pipeline.send("t1", "parent-1", &media).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = pipeline
            .send("t1", "parent-1", &MessageContent::Text("   ".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn non_participants_cannot_send() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().returning(|_| Ok(Some(thread())));
        store.expect_insert_message().never();

        let pipeline = SendPipeline::new(Arc::new(store), ValidationConfig::default());
        let err = pipeline
            .send("t1", "stranger", &MessageContent::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn sent_message_lands_in_the_open_thread_cache() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().returning(|_| Ok(Some(thread())));
        store.expect_insert_message().returning(|thread_id, sender, content, at| {
            Ok(Message {
                id: "m1".into(),
                thread_id: thread_id.into(),
                sender_id: sender.into(),
                content: content.clone(),
                created_at: at,
                edited_at: None,
                deleted_at: None,
                read_by: BTreeSet::new(),
            })
        });

        let cache = ConversationCache::shared("parent-1");
        cache.lock().open("t1").recompute();
        let pipeline = SendPipeline::new(Arc::new(store), ValidationConfig::default()).with_cache(cache.clone());

        pipeline
            .send("t1", "parent-1", &MessageContent::Text("  Thanks!  ".into()))
            .await
            .unwrap();

        let cache = cache.lock();
        let open = cache.get("t1").unwrap();
        assert!(open.contains("m1"));
        assert_eq!(open.messages()[0].content, MessageContent::Text("Thanks!".into()));
        assert_eq!(open.unread_count(), 0);
    }
}
