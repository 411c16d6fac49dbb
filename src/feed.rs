//! Change feed: typed row events and the in-process hub that fans them out.
//!
//! Subscribers receive `{event_type, table, row}` events filtered by table and by a
//! scope key (tenant, thread or user). A subscription is released either explicitly
//! through [`ChangeFeed::unsubscribe`] or by dropping its [`EventStream`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::models::{Message, Participant, Thread};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// Table a change belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTable {
    Messages,
    Participants,
    Threads,
}

impl FeedTable {
    /// Label used for logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Participants => "participants",
            Self::Threads => "threads",
        }
    }
}

/// Row payload carried by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "lowercase")]
pub enum FeedRow {
    Message(Message),
    Participant(Participant),
    Thread(Thread),
}

/// A committed change pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub table: FeedTable,
    pub row: FeedRow,
    /// Tenant owning the thread
    pub tenant_id: String,
    /// Participants of the thread at commit time; used for user-scoped filters
    pub audience: Vec<String>,
}

impl ChangeEvent {
    /// Build an event for a row of `thread`-scoped data
    #[must_use]
    pub fn new(event_type: EventType, row: FeedRow, tenant_id: impl Into<String>, audience: Vec<String>) -> Self {
        let table = match row {
            FeedRow::Message(_) => FeedTable::Messages,
            FeedRow::Participant(_) => FeedTable::Participants,
            FeedRow::Thread(_) => FeedTable::Threads,
        };
        Self {
            event_type,
            table,
            row,
            tenant_id: tenant_id.into(),
            audience,
        }
    }

    /// Thread the changed row belongs to
    #[must_use]
    pub fn thread_id(&self) -> &str {
        match &self.row {
            FeedRow::Message(message) => &message.thread_id,
            FeedRow::Participant(participant) => &participant.thread_id,
            FeedRow::Thread(thread) => &thread.id,
        }
    }
}

/// Scope key of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedScope {
    Tenant(String),
    Thread(String),
    User(String),
}

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    /// Tables of interest; empty means every table
    pub tables: Vec<FeedTable>,
    pub scope: FeedScope,
}

impl FeedFilter {
    #[must_use]
    pub const fn new(scope: FeedScope) -> Self {
        Self { tables: Vec::new(), scope }
    }

    /// Events for one thread's messages and participants
    #[must_use]
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self::new(FeedScope::Thread(thread_id.into()))
            .with_table(FeedTable::Messages)
            .with_table(FeedTable::Participants)
    }

    /// Events for every thread the user participates in
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(FeedScope::User(user_id.into()))
    }

    #[must_use]
    pub fn with_table(mut self, table: FeedTable) -> Self {
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
        self
    }

    /// True when `event` falls inside this filter
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.tables.is_empty() && !self.tables.contains(&event.table) {
            return false;
        }
        match &self.scope {
            FeedScope::Tenant(tenant_id) => &event.tenant_id == tenant_id,
            FeedScope::Thread(thread_id) => event.thread_id() == thread_id,
            FeedScope::User(user_id) => event.audience.iter().any(|member| member == user_id),
        }
    }
}

/// Next item read from an [`EventStream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Event(ChangeEvent),
    /// The receiver fell behind and this many events were skipped
    Lagged(u64),
    /// The connection dropped or the subscription was released
    Closed,
}

/// Subscription surface of a change feed
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a filtered event stream
    async fn subscribe(&self, filter: FeedFilter) -> Result<EventStream>;

    /// Release a subscription; a no-op for unknown ids
    async fn unsubscribe(&self, subscription_id: u64);
}

type ActiveSet = Arc<Mutex<HashSet<u64>>>;

/// Live, filtered stream of change events
pub struct EventStream {
    id: u64,
    filter: FeedFilter,
    receiver: broadcast::Receiver<ChangeEvent>,
    active: ActiveSet,
    metrics: SyncMetrics,
}

impl EventStream {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.lock().contains(&self.id)
    }

    /// Wait for the next matching event
    pub async fn next(&mut self) -> FeedItem {
        loop {
            if !self.is_active() {
                return FeedItem::Closed;
            }
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return FeedItem::Event(event),
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => return FeedItem::Lagged(skipped),
                Err(RecvError::Closed) => return FeedItem::Closed,
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let remaining = {
            let mut active = self.active.lock();
            active.remove(&self.id);
            active.len()
        };
        self.metrics.set_active_subscriptions(remaining);
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// In-process change feed backed by a broadcast channel
pub struct ChangeFeedHub {
    sender: RwLock<broadcast::Sender<ChangeEvent>>,
    capacity: usize,
    available: RwLock<bool>,
    active: ActiveSet,
    next_id: AtomicU64,
    metrics: SyncMetrics,
}

impl ChangeFeedHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(sender),
            capacity,
            available: RwLock::new(true),
            active: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicU64::new(1),
            metrics: SyncMetrics::default(),
        }
    }

    /// Push a committed change to every live receiver; returns how many received it
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let sender = self.sender.read().clone();
        let thread_id = event.thread_id().to_string();
        let table = event.table;
        let delivered = sender.send(event).unwrap_or(0);
        debug!(thread_id = %thread_id, table = table.as_str(), delivered, "Published change event");
        delivered
    }

    /// Drop every open connection. Streams observe [`FeedItem::Closed`] and must
    /// subscribe again; events published meanwhile are only visible through catch-up.
    pub fn disconnect(&self) {
        let (sender, _receiver) = broadcast::channel(self.capacity);
        *self.sender.write() = sender;
        info!("Change feed connections dropped");
    }

    /// Toggle whether new subscriptions are accepted
    pub fn set_available(&self, available: bool) {
        *self.available.write() = available;
    }

    /// Number of subscriptions not yet released
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for ChangeFeedHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeFeed for ChangeFeedHub {
    async fn subscribe(&self, filter: FeedFilter) -> Result<EventStream> {
        if !*self.available.read() {
            return Err(SyncError::Transient("change feed unavailable".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.sender.read().subscribe();
        let count = {
            let mut active = self.active.lock();
            active.insert(id);
            active.len()
        };
        self.metrics.set_active_subscriptions(count);
        debug!(subscription_id = id, scope = ?filter.scope, "Subscribed to change feed");

        Ok(EventStream {
            id,
            filter,
            receiver,
            active: Arc::clone(&self.active),
            metrics: self.metrics.clone(),
        })
    }

    async fn unsubscribe(&self, subscription_id: u64) {
        let count = {
            let mut active = self.active.lock();
            active.remove(&subscription_id);
            active.len()
        };
        self.metrics.set_active_subscriptions(count);
        debug!(subscription_id, "Unsubscribed from change feed");
    }
}
