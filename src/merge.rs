//! Realtime merge: folds change-feed events into a view's cache.
//!
//! Events are applied by message id, never by arrival order, so replays after a
//! reconnect and duplicate deliveries leave the cache unchanged. Each subscription
//! runs as a task owned by a [`SubscriptionHandle`]; dropping the handle ends it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ParticipantChange, SharedCache};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::feed::{ChangeEvent, ChangeFeed, EventType, FeedFilter, FeedItem, FeedRow, FeedScope};
use crate::metrics::SyncMetrics;
use crate::repository::ConversationStore;
use crate::utils::jittered_backoff;

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same message id already cached
    Duplicate,
    /// Edit or delete marker applied to a cached message
    Replaced,
    OwnReadAdvanced,
    ReceiptsUpdated(usize),
    /// Thread is not open; remembered for the next inbox refresh
    MarkedStale,
    Unchanged,
}

impl MergeOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Duplicate => "duplicate",
            Self::Replaced => "replaced",
            Self::OwnReadAdvanced => "own_read_advanced",
            Self::ReceiptsUpdated(_) => "receipts_updated",
            Self::MarkedStale => "marked_stale",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    /// Connection dropped; waiting to subscribe again
    Reconnecting,
    Unsubscribed,
    /// Gave up after the configured number of failed connects. The cache is no
    /// longer kept current and the owner should refetch or watch again.
    Failed,
}

/// Applies feed events and catch-up fetches to a shared cache
pub struct MergeEngine {
    store: Arc<dyn ConversationStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: SharedCache,
    metrics: SyncMetrics,
    config: SyncConfig,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ConversationStore>, feed: Arc<dyn ChangeFeed>, cache: SharedCache, config: SyncConfig) -> Self {
        Self {
            store,
            feed,
            cache,
            metrics: SyncMetrics::default(),
            config,
        }
    }

    pub const fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Fold one event into the cache
    pub fn apply(&self, event: &ChangeEvent) -> MergeOutcome {
        let thread_id = event.thread_id();
        let mut cache = self.cache.lock();
        let viewer_is_affected = match &event.row {
            FeedRow::Participant(participant) => participant.user_id == cache.viewer_id(),
            _ => true,
        };

        let outcome = match cache.get_mut(thread_id) {
            Some(thread) => match (&event.row, event.event_type) {
                (FeedRow::Message(message), EventType::Insert) => {
                    if thread.insert_message(message.clone()) {
                        thread.recompute();
                        self.metrics.record_unread_recompute();
                        MergeOutcome::Inserted
                    } else {
                        self.metrics.record_duplicate_event();
                        MergeOutcome::Duplicate
                    }
                },
                (FeedRow::Message(message), _) => {
                    if thread.replace_message(message.clone()) {
                        thread.recompute();
                        self.metrics.record_unread_recompute();
                        MergeOutcome::Replaced
                    } else {
                        MergeOutcome::Unchanged
                    }
                },
                (FeedRow::Participant(participant), _) => match thread.apply_participant(participant.clone()) {
                    ParticipantChange::OwnReadAdvanced => {
                        thread.recompute();
                        self.metrics.record_unread_recompute();
                        MergeOutcome::OwnReadAdvanced
                    },
                    ParticipantChange::ReceiptsUpdated(count) => MergeOutcome::ReceiptsUpdated(count),
                    ParticipantChange::Unchanged => MergeOutcome::Unchanged,
                },
                // Thread metadata does not affect an open message list
                (FeedRow::Thread(_), _) => MergeOutcome::Unchanged,
            },
            None if viewer_is_affected => {
                cache.mark_stale(thread_id);
                MergeOutcome::MarkedStale
            },
            None => MergeOutcome::Unchanged,
        };
        drop(cache);

        self.metrics.record_event_applied(event.table.as_str(), outcome.as_str());
        debug!(
            thread_id,
            table = event.table.as_str(),
            outcome = outcome.as_str(),
            "Applied change event"
        );
        outcome
    }

    /// Refetch an open thread and merge it through the same idempotent path.
    /// Returns how many messages were new.
    ///
    /// The full list is fetched rather than rows after a cursor: the newest cached
    /// message may be the viewer's own optimistic send, or may sort after a commit
    /// that landed with an earlier timestamp.
    pub async fn catch_up(&self, thread_id: &str) -> Result<usize> {
        if self.cache.lock().get(thread_id).is_none() {
            return Ok(0);
        }

        let participants = self
            .store
            .get_thread(thread_id)
            .await?
            .map(|thread| thread.participants)
            .unwrap_or_default();
        let fetched = self.store.list_messages(thread_id, None).await?;
        let fetched_count = fetched.len();

        let mut cache = self.cache.lock();
        let Some(cached) = cache.get_mut(thread_id) else {
            return Ok(0);
        };
        let inserted = cached.refresh(fetched, participants);
        drop(cache);

        self.metrics.record_catch_up(fetched_count);
        debug!(thread_id, fetched = fetched_count, inserted, "Caught up thread");
        Ok(inserted)
    }

    /// Catch up every open thread covered by `filter`. Returns false when cancelled.
    async fn catch_up_scope(&self, filter: &FeedFilter, token: &CancellationToken) -> bool {
        let thread_ids = match &filter.scope {
            FeedScope::Thread(thread_id) => vec![thread_id.clone()],
            FeedScope::Tenant(_) | FeedScope::User(_) => self.cache.lock().thread_ids(),
        };

        for thread_id in thread_ids {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return false,
                result = self.catch_up(&thread_id) => result,
            };
            if let Err(err) = result {
                warn!(thread_id = %thread_id, error = %err, "Catch-up failed, thread left stale");
                self.cache.lock().mark_stale(&thread_id);
            }
        }
        true
    }

    /// Start a subscription task bound to the returned handle
    pub fn spawn_subscription(self: &Arc<Self>, filter: FeedFilter) -> SubscriptionHandle {
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
        let task = tokio::spawn(run_subscription(Arc::clone(self), filter, token.clone(), state_tx));
        SubscriptionHandle {
            token,
            state: state_rx,
            task: Some(task),
        }
    }
}

async fn run_subscription(
    engine: Arc<MergeEngine>,
    filter: FeedFilter,
    token: CancellationToken,
    state: watch::Sender<SubscriptionState>,
) {
    let mut failures: u32 = 0;
    let mut connected_once = false;
    let mut final_state = SubscriptionState::Unsubscribed;

    'connect: loop {
        state.send_replace(if connected_once {
            SubscriptionState::Reconnecting
        } else {
            SubscriptionState::Connecting
        });

        let subscribed = tokio::select! {
            biased;
            () = token.cancelled() => break 'connect,
            result = engine.feed.subscribe(filter.clone()) => result,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(err) => {
                failures = failures.saturating_add(1);
                let limit = engine.config.max_reconnect_attempts;
                if limit > 0 && failures >= limit {
                    warn!(scope = ?filter.scope, failures, error = %err, "Giving up on subscription");
                    engine.metrics.record_error("feed", "subscribe");
                    final_state = SubscriptionState::Failed;
                    break 'connect;
                }
                let delay = jittered_backoff(
                    failures - 1,
                    engine.config.reconnect_initial_backoff_ms,
                    engine.config.reconnect_max_backoff_ms,
                );
                warn!(
                    scope = ?filter.scope,
                    failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Subscribe failed, backing off"
                );
                tokio::select! {
                    biased;
                    () = token.cancelled() => break 'connect,
                    () = tokio::time::sleep(delay) => continue 'connect,
                }
            },
        };
        failures = 0;
        let stream_id = stream.id();

        // Reconcile after every subscribe, the first included: anything committed
        // before the stream existed only reaches the cache through a fetch.
        if connected_once {
            engine.metrics.record_reconnect();
        }
        if !engine.catch_up_scope(&filter, &token).await {
            engine.feed.unsubscribe(stream_id).await;
            break 'connect;
        }
        connected_once = true;
        state.send_replace(SubscriptionState::Subscribed);
        info!(subscription_id = stream_id, scope = ?filter.scope, "Subscription active");

        loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => {
                    engine.feed.unsubscribe(stream_id).await;
                    break 'connect;
                },
                item = stream.next() => item,
            };

            match item {
                FeedItem::Event(event) => {
                    if token.is_cancelled() {
                        break 'connect;
                    }
                    engine.apply(&event);
                },
                FeedItem::Lagged(skipped) => {
                    warn!(subscription_id = stream_id, skipped, "Subscription lagged, catching up");
                    if !engine.catch_up_scope(&filter, &token).await {
                        break 'connect;
                    }
                },
                FeedItem::Closed => {
                    info!(subscription_id = stream_id, "Subscription closed, reconnecting");
                    continue 'connect;
                },
            }
        }
    }

    state.send_replace(final_state);
    debug!(scope = ?filter.scope, state = ?final_state, "Subscription ended");
}

/// Owner of a running subscription; dropping it unsubscribes
pub struct SubscriptionHandle {
    token: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver for observing state transitions
    #[must_use]
    pub fn state_watcher(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Wait until the subscription reaches `target`; false if the task ended first
    pub async fn wait_for(&mut self, target: SubscriptionState) -> bool {
        let reached = self
            .state
            .wait_for(|state| {
                *state == target || matches!(state, SubscriptionState::Unsubscribed | SubscriptionState::Failed)
            })
            .await;
        matches!(reached, Ok(state) if *state == target)
    }

    /// Cancel the subscription and wait for its task to stop. No cache mutation
    /// happens after this returns.
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Subscription task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        // The task observes the token before touching the cache again
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConversationCache;
    use crate::feed::ChangeFeedHub;
    use crate::models::{from_millis, Message, MessageContent, Participant, ParticipantRole};
    use crate::repository::MockConversationStore;
    use std::collections::BTreeSet;

    fn message(id: &str, sender: &str, at: i64) -> Message {
        Message {
            id: id.into(),
            thread_id: "t1".into(),
            sender_id: sender.into(),
            content: MessageContent::Text(format!("body {id}")),
            created_at: from_millis(at),
            edited_at: None,
            deleted_at: None,
            read_by: BTreeSet::new(),
        }
    }

    fn inserted(message: Message) -> ChangeEvent {
        ChangeEvent::new(
            EventType::Insert,
            FeedRow::Message(message),
            "school-1",
            vec!["parent-1".into(), "teacher-1".into()],
        )
    }

    fn read_marker(user: &str, at: i64) -> ChangeEvent {
        ChangeEvent::new(
            EventType::Update,
            FeedRow::Participant(Participant {
                thread_id: "t1".into(),
                user_id: user.into(),
                role: ParticipantRole::Parent,
                joined_at: from_millis(0),
                muted: false,
                last_read_at: Some(from_millis(at)),
            }),
            "school-1",
            vec!["parent-1".into(), "teacher-1".into()],
        )
    }

    fn engine_with_open_thread() -> MergeEngine {
        let cache = ConversationCache::shared("parent-1");
        cache.lock().open("t1").recompute();
        MergeEngine::new(
            Arc::new(MockConversationStore::new()),
            Arc::new(ChangeFeedHub::new(8)),
            cache,
            SyncConfig::default(),
        )
    }

    #[test]
    fn replayed_events_are_dropped_by_id() {
        let engine = engine_with_open_thread();
        let event = inserted(message("m1", "teacher-1", 100));

        assert_eq!(engine.apply(&event), MergeOutcome::Inserted);
        assert_eq!(engine.apply(&event), MergeOutcome::Duplicate);

        let cache = engine.cache().lock();
        let thread = cache.get("t1").unwrap();
        assert_eq!(thread.messages().len(), 1);
        assert_eq!(thread.unread_count(), 1);
        assert!(!thread.is_stale());
    }

    #[test]
    fn own_read_marker_recomputes_unread() {
        let engine = engine_with_open_thread();
        engine.apply(&inserted(message("m1", "teacher-1", 100)));
        engine.apply(&inserted(message("m2", "teacher-1", 200)));

        assert_eq!(engine.apply(&read_marker("parent-1", 150)), MergeOutcome::OwnReadAdvanced);
        assert_eq!(engine.cache().lock().get("t1").unwrap().unread_count(), 1);

        // Older marker delivered late changes nothing
        assert_eq!(engine.apply(&read_marker("parent-1", 120)), MergeOutcome::Unchanged);
        assert_eq!(engine.cache().lock().get("t1").unwrap().unread_count(), 1);
    }

    #[test]
    fn events_for_unopened_threads_mark_them_stale() {
        let engine = engine_with_open_thread();
        let mut other = message("x1", "teacher-1", 100);
        other.thread_id = "t2".into();

        assert_eq!(engine.apply(&inserted(other)), MergeOutcome::MarkedStale);
        assert_eq!(engine.cache().lock().take_stale_threads(), vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn catch_up_recovers_messages_older_than_an_own_optimistic_send() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().returning(|_| Ok(None));
        store
            .expect_list_messages()
            .withf(|_, since| since.is_none())
            .returning(|_, _| {
                Ok(vec![
                    message("m1", "teacher-1", 100),
                    message("m2", "teacher-1", 200),
                    message("own", "parent-1", 300),
                ])
            });

        let cache = ConversationCache::shared("parent-1");
        {
            let mut guard = cache.lock();
            let open = guard.open("t1");
            open.refresh(vec![message("m1", "teacher-1", 100)], Vec::new());
            // Sent while the feed was down, after m2 committed elsewhere
            open.insert_message(message("own", "parent-1", 300));
            open.recompute();
        }
        let engine = MergeEngine::new(Arc::new(store), Arc::new(ChangeFeedHub::new(8)), cache, SyncConfig::default());

        assert_eq!(engine.catch_up("t1").await.unwrap(), 1);
        let cache = engine.cache().lock();
        let thread = cache.get("t1").unwrap();
        let ids: Vec<&str> = thread.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "own"]);
        assert_eq!(thread.unread_count(), 2);
    }

    #[tokio::test]
    async fn catch_up_skips_threads_that_are_not_open() {
        let engine = MergeEngine::new(
            Arc::new(MockConversationStore::new()),
            Arc::new(ChangeFeedHub::new(8)),
            ConversationCache::shared("parent-1"),
            SyncConfig::default(),
        );
        assert_eq!(engine.catch_up("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_subscribe_reconciles_before_reporting_subscribed() {
        let mut store = MockConversationStore::new();
        store.expect_get_thread().returning(|_| Ok(None));
        store
            .expect_list_messages()
            .returning(|_, _| Ok(vec![message("gap", "teacher-1", 100)]));

        let cache = ConversationCache::shared("parent-1");
        cache.lock().open("t1").recompute();
        let engine = Arc::new(MergeEngine::new(
            Arc::new(store),
            Arc::new(ChangeFeedHub::new(8)),
            cache,
            SyncConfig::default(),
        ));

        let mut handle = engine.spawn_subscription(FeedFilter::thread("t1"));
        assert!(handle.wait_for(SubscriptionState::Subscribed).await);
        let guard = engine.cache().lock();
        assert!(guard.get("t1").unwrap().contains("gap"));
        assert_eq!(guard.get("t1").unwrap().unread_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_connect_attempts_surface_as_failed() {
        let hub = Arc::new(ChangeFeedHub::new(8));
        hub.set_available(false);
        let config = SyncConfig {
            reconnect_initial_backoff_ms: 1,
            reconnect_max_backoff_ms: 2,
            max_reconnect_attempts: 3,
            ..SyncConfig::default()
        };
        let engine = Arc::new(MergeEngine::new(
            Arc::new(MockConversationStore::new()),
            hub as Arc<dyn ChangeFeed>,
            ConversationCache::shared("parent-1"),
            config,
        ));

        let mut handle = engine.spawn_subscription(FeedFilter::thread("t1"));
        assert!(!handle.wait_for(SubscriptionState::Subscribed).await);
        assert_eq!(handle.state(), SubscriptionState::Failed);
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_feed_subscription() {
        let hub = Arc::new(ChangeFeedHub::new(8));
        let cache = ConversationCache::shared("parent-1");
        let engine = Arc::new(MergeEngine::new(
            Arc::new(MockConversationStore::new()),
            Arc::clone(&hub) as Arc<dyn ChangeFeed>,
            cache,
            SyncConfig::default(),
        ));

        let mut handle = engine.spawn_subscription(FeedFilter::thread("t1"));
        assert!(handle.wait_for(SubscriptionState::Subscribed).await);
        assert_eq!(hub.active_subscriptions(), 1);

        let mut watcher = handle.state_watcher();
        drop(handle);
        assert!(watcher
            .wait_for(|state| *state == SubscriptionState::Unsubscribed)
            .await
            .is_ok());
        assert_eq!(hub.active_subscriptions(), 0);
    }
}
