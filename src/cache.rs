use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::models::{now_millis, Message, MessagePreview, Participant, PreviewState, ThreadViewModel};
use crate::read_state::count_unread;

/// What applying a participant row changed in a thread cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantChange {
    /// The viewer's own read marker moved forward
    OwnReadAdvanced,
    /// Another participant's marker now covers this many more of the viewer's messages
    ReceiptsUpdated(usize),
    Unchanged,
}

/// Client-held state of one open thread.
///
/// Messages are kept sorted by (created-at, id) regardless of arrival order, and a
/// message id is stored at most once. Derived values (unread count, preview) are
/// only trusted while the cache is not stale.
#[derive(Debug, Clone)]
pub struct ThreadCache {
    thread_id: String,
    viewer_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
    participants: HashMap<String, Participant>,
    viewer_last_read_at: Option<DateTime<Utc>>,
    stale: bool,
    unread: u32,
    preview: PreviewState,
}

impl ThreadCache {
    pub fn new(thread_id: impl Into<String>, viewer_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            viewer_id: viewer_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
            participants: HashMap::new(),
            viewer_last_read_at: None,
            stale: true,
            unread: 0,
            preview: PreviewState::Empty,
        }
    }

    /// Fold a fresh fetch into the cache and recompute.
    ///
    /// Nothing already cached is dropped: events delivered while the fetch was in
    /// flight survive, and fetched rows go through the same by-id path as feed
    /// events so edit and delete markers are picked up too. Returns how many
    /// messages were new.
    pub fn refresh(&mut self, messages: Vec<Message>, participants: Vec<Participant>) -> usize {
        for participant in participants {
            self.apply_participant(participant);
        }
        let mut inserted = 0;
        for message in messages {
            if self.ids.contains(&message.id) {
                self.replace_message(message);
            } else if self.insert_message(message) {
                inserted += 1;
            }
        }
        self.recompute();
        inserted
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Messages in (created-at, id) order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub const fn unread_count(&self) -> u32 {
        self.unread
    }

    pub const fn preview(&self) -> &PreviewState {
        &self.preview
    }

    /// Readers of a cached message
    pub fn seen_by(&self, message_id: &str) -> Option<&BTreeSet<String>> {
        self.messages.iter().find(|m| m.id == message_id).map(|m| &m.read_by)
    }

    /// Insert a message unless one with the same id is already cached.
    ///
    /// Returns false for duplicates. A new message marks the cache stale until the
    /// next [`ThreadCache::recompute`].
    pub fn insert_message(&mut self, mut message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        for participant in self.participants.values() {
            message.note_reader(participant);
        }

        let position = self
            .messages
            .partition_point(|existing| existing.sort_key() < message.sort_key());
        self.ids.insert(message.id.clone());
        self.messages.insert(position, message);
        self.stale = true;
        true
    }

    /// Insert every message not yet cached; returns how many were new
    pub fn merge_messages(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages.into_iter().filter(|m| self.insert_message(m.clone())).count()
    }

    /// Apply an edit or delete marker to a cached message, inserting it when absent.
    ///
    /// Markers never regress: a delete already applied stays applied, and the newer
    /// edit wins. Returns true when anything changed.
    pub fn replace_message(&mut self, message: Message) -> bool {
        let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) else {
            return self.insert_message(message);
        };

        let mut changed = false;
        if message.edited_at > existing.edited_at {
            existing.content = message.content;
            existing.edited_at = message.edited_at;
            changed = true;
        }
        if existing.deleted_at.is_none() && message.deleted_at.is_some() {
            existing.deleted_at = message.deleted_at;
            changed = true;
        }
        let before = existing.read_by.len();
        existing.read_by.extend(message.read_by);
        changed |= existing.read_by.len() != before;

        if changed {
            self.stale = true;
        }
        changed
    }

    /// Fold a participant row into the cache.
    ///
    /// The viewer's own row advances the cached read marker (never backward). Another
    /// participant's row updates the "seen" receipts on the viewer's messages.
    pub fn apply_participant(&mut self, participant: Participant) -> ParticipantChange {
        if participant.user_id == self.viewer_id {
            let advanced = match participant.last_read_at {
                Some(at) if self.viewer_last_read_at.map_or(true, |current| at > current) => {
                    self.viewer_last_read_at = Some(at);
                    true
                },
                _ => false,
            };
            self.store_participant(participant);
            if advanced {
                self.stale = true;
                return ParticipantChange::OwnReadAdvanced;
            }
            return ParticipantChange::Unchanged;
        }

        let merged = self.store_participant(participant);
        let mut updated = 0;
        for message in &mut self.messages {
            if message.sender_id == self.viewer_id && message.note_reader(&merged) {
                updated += 1;
            }
        }
        if updated == 0 {
            ParticipantChange::Unchanged
        } else {
            ParticipantChange::ReceiptsUpdated(updated)
        }
    }

    /// Keep the newest read marker seen for a participant and return the merged row
    fn store_participant(&mut self, participant: Participant) -> Participant {
        let entry = self
            .participants
            .entry(participant.user_id.clone())
            .or_insert_with(|| participant.clone());
        let previous_read = entry.last_read_at;
        *entry = participant;
        if previous_read > entry.last_read_at {
            entry.last_read_at = previous_read;
        }
        entry.clone()
    }

    /// Targeted recompute of the unread count and preview from cached data
    pub fn recompute(&mut self) {
        self.unread = count_unread(&self.messages, &self.viewer_id, self.viewer_last_read_at);
        self.preview = self
            .messages
            .iter()
            .rev()
            .find(|m| !m.is_deleted())
            .map_or(PreviewState::Empty, |m| PreviewState::Available(MessagePreview::from(m)));
        self.stale = false;
    }
}

/// Explicit per-view cache of open threads.
///
/// Threads that receive events while not open are remembered as stale so an inbox
/// view knows which entries to refresh.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    viewer_id: String,
    threads: HashMap<String, ThreadCache>,
    stale_threads: HashSet<String>,
}

/// Cache shared between a view and its subscriptions
pub type SharedCache = Arc<Mutex<ConversationCache>>;

impl ConversationCache {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            threads: HashMap::new(),
            stale_threads: HashSet::new(),
        }
    }

    /// Wrap a new cache for sharing with subscriptions
    pub fn shared(viewer_id: impl Into<String>) -> SharedCache {
        Arc::new(Mutex::new(Self::new(viewer_id)))
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn get(&self, thread_id: &str) -> Option<&ThreadCache> {
        self.threads.get(thread_id)
    }

    pub fn get_mut(&mut self, thread_id: &str) -> Option<&mut ThreadCache> {
        self.threads.get_mut(thread_id)
    }

    /// Cache for a thread, created empty when it is not open yet.
    ///
    /// From here on feed events for the thread land in its cache instead of the
    /// stale set, so callers open before fetching and then [`ThreadCache::refresh`].
    pub fn open(&mut self, thread_id: &str) -> &mut ThreadCache {
        self.stale_threads.remove(thread_id);
        let viewer_id = self.viewer_id.clone();
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadCache::new(thread_id, viewer_id))
    }

    /// Discard a thread's cached state
    pub fn close(&mut self, thread_id: &str) -> Option<ThreadCache> {
        self.threads.remove(thread_id)
    }

    /// Ids of the open threads
    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.threads.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Flag a thread as needing a refresh, whether or not it is open
    pub fn mark_stale(&mut self, thread_id: &str) {
        match self.threads.get_mut(thread_id) {
            Some(thread) => thread.mark_stale(),
            None => {
                self.stale_threads.insert(thread_id.to_string());
            },
        }
    }

    pub fn is_stale(&self, thread_id: &str) -> bool {
        self.threads
            .get(thread_id)
            .map_or_else(|| self.stale_threads.contains(thread_id), ThreadCache::is_stale)
    }

    /// Drain the set of non-open threads that saw activity
    pub fn take_stale_threads(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.stale_threads.drain().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InboxSnapshot {
    saved_at: DateTime<Utc>,
    threads: Vec<ThreadViewModel>,
}

/// Last good inbox per (user, role), kept in an embedded sled tree
pub struct InboxSnapshotStore {
    db: sled::Db,
}

impl InboxSnapshotStore {
    /// Open (or create) the snapshot tree at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| crate::error::SyncError::Cache(format!("Failed to create snapshot directory: {e}")))?;
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn make_key(user_id: &str, role: &str) -> Vec<u8> {
        format!("{user_id}:{role}").into_bytes()
    }

    /// Persist an inbox as the latest good snapshot
    pub fn save(&self, user_id: &str, role: &str, threads: &[ThreadViewModel]) -> Result<()> {
        let snapshot = InboxSnapshot {
            saved_at: now_millis(),
            threads: threads.to_vec(),
        };
        let data = bincode::serialize(&snapshot)?;
        self.db.insert(Self::make_key(user_id, role), data)?;
        self.db.flush()?;
        debug!(user_id, role, threads = threads.len(), "Saved inbox snapshot");
        Ok(())
    }

    /// Latest snapshot and when it was taken
    pub fn load(&self, user_id: &str, role: &str) -> Result<Option<(DateTime<Utc>, Vec<ThreadViewModel>)>> {
        match self.db.get(Self::make_key(user_id, role))? {
            Some(data) => {
                let snapshot: InboxSnapshot = bincode::deserialize(&data)?;
                Ok(Some((snapshot.saved_at, snapshot.threads)))
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{from_millis, ConversationKind, MessageContent, ParticipantRole};
    use proptest::prelude::*;

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

    fn participant(user: &str, last_read: Option<i64>) -> Participant {
        Participant {
            thread_id: "t1".into(),
            user_id: user.into(),
            role: ParticipantRole::Teacher,
            joined_at: from_millis(0),
            muted: false,
            last_read_at: last_read.map(from_millis),
        }
    }

    #[test]
    fn out_of_order_arrival_is_sorted_by_created_at() {
        let mut cache = ThreadCache::new("t1", "parent-1");
        cache.insert_message(message("m3", "teacher-1", 300));
        cache.insert_message(message("m1", "teacher-1", 100));
        cache.insert_message(message("m2", "teacher-1", 200));

        let ids: Vec<&str> = cache.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn delete_marker_drops_message_from_unread_and_preview() {
        let mut cache = ThreadCache::new("t1", "parent-1");
        cache.refresh(
            vec![message("m1", "teacher-1", 100), message("m2", "teacher-1", 200)],
            vec![participant("parent-1", None)],
        );
        assert_eq!(cache.unread_count(), 2);

        let mut deleted = message("m2", "teacher-1", 200);
        deleted.deleted_at = Some(from_millis(250));
        assert!(cache.replace_message(deleted.clone()));
        assert!(!cache.replace_message(deleted));
        cache.recompute();

        assert_eq!(cache.unread_count(), 1);
        match cache.preview() {
            PreviewState::Available(preview) => assert_eq!(preview.message_id, "m1"),
            other => panic!("unexpected preview: {other:?}"),
        }
    }

    #[test]
    fn refresh_keeps_messages_delivered_during_the_fetch() {
        let mut cache = ThreadCache::new("t1", "parent-1");
        // Arrived over the feed after the fetch query ran
        cache.insert_message(message("m3", "teacher-1", 300));

        let mut edited = message("m1", "teacher-1", 100);
        edited.edited_at = Some(from_millis(150));
        edited.content = MessageContent::Text("fixed".into());
        cache.refresh(
            vec![message("m1", "teacher-1", 100), message("m2", "parent-1", 200)],
            vec![participant("parent-1", Some(100))],
        );
        assert_eq!(cache.refresh(vec![edited, message("m3", "teacher-1", 300)], Vec::new()), 0);

        let ids: Vec<&str> = cache.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(cache.messages()[0].content, MessageContent::Text("fixed".into()));
        assert_eq!(cache.unread_count(), 1);
        assert!(!cache.is_stale());
    }

    #[test]
    fn other_participant_read_updates_receipts_on_own_messages() {
        let mut cache = ThreadCache::new("t1", "parent-1");
        cache.refresh(
            vec![message("m1", "parent-1", 100), message("m2", "parent-1", 300), message("m3", "teacher-1", 200)],
            vec![participant("parent-1", None), participant("teacher-1", None)],
        );

        let change = cache.apply_participant(participant("teacher-1", Some(250)));
        assert_eq!(change, ParticipantChange::ReceiptsUpdated(1));
        assert!(cache.seen_by("m1").unwrap().contains("teacher-1"));
        assert!(cache.seen_by("m2").unwrap().is_empty());

        // A stale row must not roll the receipts back
        assert_eq!(cache.apply_participant(participant("teacher-1", Some(50))), ParticipantChange::Unchanged);
        assert!(cache.seen_by("m1").unwrap().contains("teacher-1"));
    }

    #[test]
    fn unopened_threads_are_tracked_as_stale() {
        let mut cache = ConversationCache::new("parent-1");
        cache.mark_stale("t9");
        assert!(cache.is_stale("t9"));
        assert_eq!(cache.take_stale_threads(), vec!["t9".to_string()]);
        assert!(!cache.is_stale("t9"));
    }

    #[test]
    fn snapshot_round_trips_view_models() {
        let dir = tempfile::tempdir().unwrap();
        let store = InboxSnapshotStore::open(dir.path().join("snapshots")).unwrap();
        let view = ThreadViewModel {
            thread_id: "t1".into(),
            kind: ConversationKind::ParentTeacher,
            subject: Some("Reading log".into()),
            contact_key: "teacher-1".into(),
            counterpart: None,
            last_activity_at: from_millis(1_000),
            preview: PreviewState::Unavailable,
            unread_count: 2,
            unread_degraded: false,
            muted: false,
            archived: false,
        };

        store.save("parent-1", "parent", std::slice::from_ref(&view)).unwrap();
        let (_, threads) = store.load("parent-1", "parent").unwrap().unwrap();
        assert_eq!(threads, vec![view]);
        assert!(store.load("parent-1", "teacher").unwrap().is_none());
    }

    proptest! {
        #[test]
        fn merge_is_idempotent_and_order_independent(
            times in proptest::collection::vec(0_i64..1_000, 1..30),
            seed in any::<u64>(),
        ) {
            let messages: Vec<Message> = times
                .iter()
                .enumerate()
                .map(|(i, at)| message(&format!("m{i:03}"), "teacher-1", *at))
                .collect();

            let mut shuffled = messages.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = usize::try_from(seed.wrapping_mul(i as u64 + 1) % len as u64).unwrap();
                shuffled.swap(i, j);
            }

            let mut in_order = ThreadCache::new("t1", "parent-1");
            in_order.merge_messages(messages.clone());

            let mut arrived = ThreadCache::new("t1", "parent-1");
            arrived.merge_messages(shuffled.clone());
            prop_assert_eq!(arrived.merge_messages(shuffled), 0);

            prop_assert_eq!(in_order.messages(), arrived.messages());
            prop_assert!(arrived.messages().windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
        }
    }
}
