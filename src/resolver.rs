//! Inbox resolution: which threads a viewer sees and how each one is decorated.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{
    ContactProfile, ConversationKind, MessagePreview, ParticipantRole, PreviewState, Profile, ThreadViewModel,
    ThreadWithParticipants,
};
use crate::read_state::ReadStateTracker;
use crate::repository::ConversationStore;
use crate::utils::retry_transient;

/// Who is asking for an inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRequest {
    pub viewer_id: String,
    pub tenant_id: String,
    pub role: ParticipantRole,
    pub include_archived: bool,
}

/// Logical contact key of a thread for `viewer_id`.
///
/// Two-party conversations collapse on the other participant's id. Group threads and
/// threads without a counterpart keep their own id so they are never merged.
#[must_use]
pub fn contact_key(thread: &ThreadWithParticipants, viewer_id: &str) -> String {
    let others = thread.others(viewer_id);
    match others.as_slice() {
        [counterpart] if thread.thread.kind != ConversationKind::General => counterpart.user_id.clone(),
        _ => thread.thread.id.clone(),
    }
}

/// Keep one thread per contact key: the greatest (last-activity, thread id).
///
/// The result is ordered newest activity first.
#[must_use]
pub fn collapse_by_contact(threads: Vec<ThreadWithParticipants>, viewer_id: &str) -> Vec<(String, ThreadWithParticipants)> {
    let mut kept: HashMap<String, ThreadWithParticipants> = HashMap::new();
    for thread in threads {
        let key = contact_key(&thread, viewer_id);
        let newer = kept
            .get(&key)
            .map_or(true, |current| activity_key(current) < activity_key(&thread));
        if newer {
            kept.insert(key, thread);
        }
    }

    let mut collapsed: Vec<(String, ThreadWithParticipants)> = kept.into_iter().collect();
    collapsed.sort_by(|(_, a), (_, b)| activity_key(b).cmp(&activity_key(a)));
    collapsed
}

fn activity_key(thread: &ThreadWithParticipants) -> (chrono::DateTime<chrono::Utc>, &str) {
    (thread.thread.last_activity_at, thread.thread.id.as_str())
}

/// Builds role-scoped inboxes from the store
pub struct ThreadResolver {
    store: Arc<dyn ConversationStore>,
    tracker: ReadStateTracker,
    placeholder_name: String,
    retry_attempts: u32,
    retry_backoff_ms: u64,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn ConversationStore>, tracker: ReadStateTracker) -> Self {
        Self {
            store,
            tracker,
            placeholder_name: "Unknown user".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }

    #[must_use]
    pub fn with_placeholder_name(mut self, name: impl Into<String>) -> Self {
        self.placeholder_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Resolve the viewer's inbox.
    ///
    /// Only the base thread fetch can fail the call (after retries). Missing profiles
    /// render with a placeholder, a thread whose preview cannot be loaded shows
    /// `PreviewState::Unavailable`, and a failed unread count is flagged with
    /// `unread_degraded` while the rest of the entry stays intact.
    pub async fn resolve(&self, request: &InboxRequest) -> Result<Vec<ThreadViewModel>> {
        let viewer = request.viewer_id.as_str();
        let threads = retry_transient("list_threads_for_user", self.retry_attempts, self.retry_backoff_ms, || {
            self.store.list_threads_for_user(viewer, &request.tenant_id)
        })
        .await?;
        let fetched = threads.len();

        // Role-scoped inbox: the viewer's own row decides which inbox a thread is in
        let visible: Vec<ThreadWithParticipants> = threads
            .into_iter()
            .filter(|t| t.participant(viewer).is_some_and(|p| p.role == request.role))
            .filter(|t| request.include_archived || !t.thread.archived)
            .collect();

        let collapsed = collapse_by_contact(visible, viewer);
        let (keys, threads): (Vec<String>, Vec<ThreadWithParticipants>) = collapsed.into_iter().unzip();

        let profiles = self.profiles_for(&threads, viewer).await;
        let previews = self.previews_for(&threads).await;
        let unread = self.tracker.unread_counts(&threads, viewer).await;

        let mut views = Vec::with_capacity(threads.len());
        for (((key, thread), preview), unread) in keys.into_iter().zip(&threads).zip(previews).zip(unread) {
            let (unread_count, unread_degraded) = match unread {
                Ok(count) => (count, false),
                Err(err) => {
                    warn!(thread_id = %thread.thread.id, error = %err, "Unread count unavailable");
                    (0, true)
                },
            };
            let counterpart = thread.others(viewer).first().map(|other| match profiles.get(&other.user_id) {
                Some(profile) => ContactProfile {
                    user_id: other.user_id.clone(),
                    display_name: profile.display_name.clone(),
                    avatar_url: profile.avatar_url.clone(),
                    role: other.role,
                    resolved: true,
                },
                None => ContactProfile {
                    user_id: other.user_id.clone(),
                    display_name: self.placeholder_name.clone(),
                    avatar_url: None,
                    role: other.role,
                    resolved: false,
                },
            });

            views.push(ThreadViewModel {
                thread_id: thread.thread.id.clone(),
                kind: thread.thread.kind,
                subject: thread.thread.subject.clone(),
                contact_key: key,
                counterpart,
                last_activity_at: thread.thread.last_activity_at,
                preview,
                unread_count,
                unread_degraded,
                muted: thread.participant(viewer).is_some_and(|p| p.muted),
                archived: thread.thread.archived,
            });
        }

        debug!(
            viewer_id = viewer,
            role = %request.role,
            fetched,
            shown = views.len(),
            "Resolved inbox"
        );
        Ok(views)
    }

    /// One batched profile lookup for every counterpart; failure degrades to placeholders
    async fn profiles_for(&self, threads: &[ThreadWithParticipants], viewer: &str) -> HashMap<String, Profile> {
        let mut ids: Vec<String> = threads
            .iter()
            .filter_map(|t| t.others(viewer).first().map(|p| p.user_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return HashMap::new();
        }

        match self.store.resolve_profiles(&ids).await {
            Ok(profiles) => profiles.into_iter().map(|p| (p.user_id.clone(), p)).collect(),
            Err(err) => {
                warn!(error = %err, "Profile lookup failed, using placeholders");
                HashMap::new()
            },
        }
    }

    /// Batched last-message lookup, falling back to one lookup per thread
    async fn previews_for(&self, threads: &[ThreadWithParticipants]) -> Vec<PreviewState> {
        let ids: Vec<String> = threads.iter().map(|t| t.thread.id.clone()).collect();
        if ids.is_empty() {
            return Vec::new();
        }

        match self.store.latest_messages(&ids).await {
            Ok(mut latest) => ids
                .iter()
                .map(|id| {
                    latest
                        .remove(id)
                        .map_or(PreviewState::Empty, |m| PreviewState::Available(MessagePreview::from(&m)))
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "Batched preview lookup failed, loading per thread");
                join_all(ids.iter().map(|id| async move {
                    match self.store.latest_message(id).await {
                        Ok(Some(message)) => PreviewState::Available(MessagePreview::from(&message)),
                        Ok(None) => PreviewState::Empty,
                        Err(err) => {
                            warn!(thread_id = %id, error = %err, "Preview unavailable");
                            PreviewState::Unavailable
                        },
                    }
                }))
                .await
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::models::{from_millis, Message, MessageContent, Participant, Thread};
    use crate::repository::MockConversationStore;
    use std::collections::BTreeSet;

    fn thread(id: &str, kind: ConversationKind, activity: i64, members: &[(&str, ParticipantRole)]) -> ThreadWithParticipants {
        ThreadWithParticipants {
            thread: Thread {
                id: id.into(),
                tenant_id: "school-1".into(),
                kind,
                subject_entity_id: None,
                subject: None,
                created_by: members[0].0.into(),
                last_activity_at: from_millis(activity),
                archived: false,
                created_at: from_millis(0),
                updated_at: from_millis(activity),
            },
            participants: members
                .iter()
                .map(|(user, role)| Participant {
                    thread_id: id.into(),
                    user_id: (*user).into(),
                    role: *role,
                    joined_at: from_millis(0),
                    muted: false,
                    last_read_at: None,
                })
                .collect(),
        }
    }

    fn parent_teacher(id: &str, teacher: &str, activity: i64) -> ThreadWithParticipants {
        thread(
            id,
            ConversationKind::ParentTeacher,
            activity,
            &[("parent-1", ParticipantRole::Parent), (teacher, ParticipantRole::Teacher)],
        )
    }

    fn latest(thread_id: &str) -> Message {
        Message {
            id: format!("{thread_id}-last"),
            thread_id: thread_id.into(),
            sender_id: "teacher-1".into(),
            content: MessageContent::Text("See you tomorrow".into()),
            created_at: from_millis(10),
            edited_at: None,
            deleted_at: None,
            read_by: BTreeSet::new(),
        }
    }

    fn request() -> InboxRequest {
        InboxRequest {
            viewer_id: "parent-1".into(),
            tenant_id: "school-1".into(),
            role: ParticipantRole::Parent,
            include_archived: false,
        }
    }

    #[test]
    fn two_threads_with_one_teacher_collapse_to_the_newer() {
        let collapsed = collapse_by_contact(
            vec![parent_teacher("old", "teacher-1", 100), parent_teacher("new", "teacher-1", 200)],
            "parent-1",
        );
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].0, "teacher-1");
        assert_eq!(collapsed[0].1.thread.id, "new");
    }

    #[test]
    fn activity_ties_keep_the_greater_thread_id() {
        let collapsed = collapse_by_contact(
            vec![parent_teacher("b", "teacher-1", 100), parent_teacher("a", "teacher-1", 100)],
            "parent-1",
        );
        assert_eq!(collapsed[0].1.thread.id, "b");
    }

    #[test]
    fn group_and_solo_threads_are_never_collapsed() {
        let solo = thread("solo", ConversationKind::ParentTeacher, 50, &[("parent-1", ParticipantRole::Parent)]);
        let group_a = thread(
            "group-a",
            ConversationKind::General,
            60,
            &[("parent-1", ParticipantRole::Parent), ("teacher-1", ParticipantRole::Teacher)],
        );
        let group_b = thread(
            "group-b",
            ConversationKind::General,
            70,
            &[("parent-1", ParticipantRole::Parent), ("teacher-1", ParticipantRole::Teacher)],
        );
        let collapsed = collapse_by_contact(vec![solo, group_a, group_b], "parent-1");
        let ids: Vec<&str> = collapsed.iter().map(|(_, t)| t.thread.id.as_str()).collect();
        assert_eq!(ids, vec!["group-b", "group-a", "solo"]);
    }

    #[tokio::test]
    async fn missing_profile_and_failed_preview_degrade_per_thread() {
        let mut store = MockConversationStore::new();
        store.expect_list_threads_for_user().returning(|_, _| {
            Ok(vec![parent_teacher("t1", "teacher-1", 200), parent_teacher("t2", "teacher-2", 100)])
        });
        store.expect_resolve_profiles().returning(|_| {
            Ok(vec![Profile {
                user_id: "teacher-1".into(),
                display_name: "Ms. Rivera".into(),
                avatar_url: None,
            }])
        });
        store
            .expect_latest_messages()
            .returning(|_| Err(SyncError::Transient("timeout".into())));
        store.expect_latest_message().returning(|id| {
            if id == "t1" {
                Ok(Some(latest("t1")))
            } else {
                Err(SyncError::Transient("timeout".into()))
            }
        });
        store.expect_count_messages().returning(|_, _, _| Ok(1));

        let store: Arc<dyn ConversationStore> = Arc::new(store);
        let resolver = ThreadResolver::new(Arc::clone(&store), ReadStateTracker::new(store)).with_retry(1, 1);
        let inbox = resolver.resolve(&request()).await.unwrap();

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].thread_id, "t1");
        assert!(matches!(inbox[0].preview, PreviewState::Available(_)));
        assert_eq!(inbox[0].counterpart.as_ref().unwrap().display_name, "Ms. Rivera");

        assert_eq!(inbox[1].preview, PreviewState::Unavailable);
        let placeholder = inbox[1].counterpart.as_ref().unwrap();
        assert!(!placeholder.resolved);
        assert_eq!(placeholder.display_name, "Unknown user");
        assert!(inbox.iter().all(|view| view.unread_count == 1 && !view.unread_degraded));
    }

    #[tokio::test]
    async fn failed_unread_count_keeps_the_loaded_preview() {
        let mut store = MockConversationStore::new();
        store.expect_list_threads_for_user().returning(|_, _| {
            Ok(vec![parent_teacher("t1", "teacher-1", 200), parent_teacher("t2", "teacher-2", 100)])
        });
        store.expect_resolve_profiles().returning(|_| Ok(Vec::new()));
        store
            .expect_latest_messages()
            .returning(|_| Err(SyncError::Transient("timeout".into())));
        store.expect_latest_message().returning(|id| Ok(Some(latest(id))));
        store.expect_count_messages().returning(|thread_id, _, _| {
            if thread_id == "t1" {
                Err(SyncError::Transient("timeout".into()))
            } else {
                Ok(2)
            }
        });

        let store: Arc<dyn ConversationStore> = Arc::new(store);
        let tracker = ReadStateTracker::new(Arc::clone(&store)).with_retry(1, 1);
        let resolver = ThreadResolver::new(store, tracker).with_retry(1, 1);
        let inbox = resolver.resolve(&request()).await.unwrap();

        assert_eq!(inbox[0].thread_id, "t1");
        assert!(matches!(inbox[0].preview, PreviewState::Available(_)));
        assert!(inbox[0].unread_degraded);
        assert_eq!(inbox[0].unread_count, 0);

        assert!(matches!(inbox[1].preview, PreviewState::Available(_)));
        assert!(!inbox[1].unread_degraded);
        assert_eq!(inbox[1].unread_count, 2);
    }

    #[tokio::test]
    async fn base_fetch_failure_is_retryable() {
        let mut store = MockConversationStore::new();
        store
            .expect_list_threads_for_user()
            .times(2)
            .returning(|_, _| Err(SyncError::Transient("offline".into())));

        let store: Arc<dyn ConversationStore> = Arc::new(store);
        let resolver = ThreadResolver::new(Arc::clone(&store), ReadStateTracker::new(store)).with_retry(2, 1);
        let err = resolver.resolve(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn threads_joined_under_another_role_are_excluded() {
        let mut store = MockConversationStore::new();
        store.expect_list_threads_for_user().returning(|_, _| {
            Ok(vec![thread(
                "admin-thread",
                ConversationKind::General,
                10,
                &[("parent-1", ParticipantRole::Admin), ("teacher-1", ParticipantRole::Teacher)],
            )])
        });

        let store: Arc<dyn ConversationStore> = Arc::new(store);
        let resolver = ThreadResolver::new(Arc::clone(&store), ReadStateTracker::new(store));
        assert!(resolver.resolve(&request()).await.unwrap().is_empty());
    }
}
