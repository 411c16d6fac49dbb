//! Data models for threads, participants and messages
//!
//! This module contains the domain types shared by the store, the change feed,
//! the caches and the UI-facing view models.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Kind of conversation a thread represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationKind {
    /// Parent talking to a teacher
    ParentTeacher,
    /// Parent talking to a principal
    ParentPrincipal,
    /// Broadcast or group conversation
    General,
}

impl ConversationKind {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ParentTeacher => "parent-teacher",
            Self::ParentPrincipal => "parent-principal",
            Self::General => "general",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parent-teacher" => Ok(Self::ParentTeacher),
            "parent-principal" => Ok(Self::ParentPrincipal),
            "general" => Ok(Self::General),
            other => Err(SyncError::Validation(format!("unknown conversation kind: {other}"))),
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a participant holds inside a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Parent or guardian
    Parent,
    /// Teacher
    Teacher,
    /// Principal
    Principal,
    /// School administrator
    Admin,
}

impl ParticipantRole {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Teacher => "teacher",
            Self::Principal => "principal",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for ParticipantRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "parent" => Ok(Self::Parent),
            "teacher" => Ok(Self::Teacher),
            "principal" => Ok(Self::Principal),
            "admin" => Ok(Self::Admin),
            other => Err(SyncError::Validation(format!("unknown participant role: {other}"))),
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text
    Text,
    /// Voice note
    Voice,
    /// Image
    Image,
    /// Generated by the system (joins, notices)
    System,
}

impl ContentKind {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::System => "system",
        }
    }

    /// True for kinds whose content is a media reference
    #[must_use]
    pub const fn is_media(&self) -> bool {
        matches!(self, Self::Voice | Self::Image)
    }
}

impl FromStr for ContentKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "voice" => Ok(Self::Voice),
            "image" => Ok(Self::Image),
            "system" => Ok(Self::System),
            other => Err(SyncError::Validation(format!("unknown content kind: {other}"))),
        }
    }
}

/// Reference to an uploaded media object.
///
/// Serialized as `{kind, url, mimeType, sizeBytes?, durationMs?}` so any client can
/// render it or fall back to a generic attachment link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReference {
    /// Voice or image
    pub kind: ContentKind,
    /// Location of the uploaded object
    pub url: String,
    /// MIME type of the object
    pub mime_type: String,
    /// Size of the object in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Duration for voice notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageContent {
    /// Text typed by a user
    Text(String),
    /// Uploaded voice note or image
    Media(MediaReference),
    /// Notice generated by the system
    System(String),
}

impl MessageContent {
    /// Content kind stored next to the body
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        match self {
            Self::Text(_) => ContentKind::Text,
            Self::Media(media) => media.kind,
            Self::System(_) => ContentKind::System,
        }
    }

    /// Encode the body for the `content` column: raw text, or the media JSON
    pub fn to_storage(&self) -> Result<String> {
        match self {
            Self::Text(text) | Self::System(text) => Ok(text.clone()),
            Self::Media(media) => Ok(serde_json::to_string(media)?),
        }
    }

    /// Decode a stored body using its content kind
    pub fn from_storage(kind: ContentKind, raw: &str) -> Result<Self> {
        match kind {
            ContentKind::Text => Ok(Self::Text(raw.to_string())),
            ContentKind::System => Ok(Self::System(raw.to_string())),
            ContentKind::Voice | ContentKind::Image => Ok(Self::Media(serde_json::from_str(raw)?)),
        }
    }

    /// Short human-readable summary for inbox previews
    #[must_use]
    pub fn preview_text(&self) -> String {
        match self {
            Self::Text(text) | Self::System(text) => text.chars().take(120).collect(),
            Self::Media(media) => match media.kind {
                ContentKind::Voice => "Voice message".to_string(),
                ContentKind::Image => "Photo".to_string(),
                _ => "Attachment".to_string(),
            },
        }
    }
}

/// Conversation container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread identifier
    pub id: String,
    /// Owning tenant (school)
    pub tenant_id: String,
    /// Conversation kind
    pub kind: ConversationKind,
    /// Entity the conversation is about, e.g. a student
    pub subject_entity_id: Option<String>,
    /// Free-text subject
    pub subject: Option<String>,
    /// User that started the conversation
    pub created_by: String,
    /// Newest activity; never moves backward
    pub last_activity_at: DateTime<Utc>,
    /// Hidden from inboxes when set
    pub archived: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last metadata update
    pub updated_at: DateTime<Utc>,
}

/// Membership of a user in a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Thread the membership belongs to
    pub thread_id: String,
    /// Member user
    pub user_id: String,
    /// Role of the member in this thread
    pub role: ParticipantRole,
    /// When the member joined
    pub joined_at: DateTime<Utc>,
    /// Notifications silenced
    pub muted: bool,
    /// Read marker; `None` means nothing has been read yet
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Advance the read marker, never moving it backward.
    ///
    /// Returns true when the marker changed.
    pub fn advance_read(&mut self, at: DateTime<Utc>) -> bool {
        match self.last_read_at {
            Some(current) if current >= at => false,
            _ => {
                self.last_read_at = Some(at);
                true
            },
        }
    }
}

/// A single message in a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier
    pub id: String,
    /// Owning thread
    pub thread_id: String,
    /// Author
    pub sender_id: String,
    /// Body
    pub content: MessageContent,
    /// Creation timestamp; primary ordering key
    pub created_at: DateTime<Utc>,
    /// Set when the body was edited
    pub edited_at: Option<DateTime<Utc>>,
    /// Set when the message was soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,
    /// Participants whose read marker covers this message
    #[serde(default)]
    pub read_by: BTreeSet<String>,
}

impl Message {
    /// Ordering key: created-at, then id for equal timestamps
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    /// True when the message has been soft-deleted
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Content kind of the body
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        self.content.kind()
    }

    /// Record `participant` as a reader when their read marker covers this message.
    ///
    /// Senders never appear in their own receipts. Returns true when the reader set grew.
    pub fn note_reader(&mut self, participant: &Participant) -> bool {
        if participant.user_id == self.sender_id {
            return false;
        }
        match participant.last_read_at {
            Some(at) if at >= self.created_at => self.read_by.insert(participant.user_id.clone()),
            _ => false,
        }
    }
}

/// A thread together with all of its participant rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadWithParticipants {
    /// Thread row
    pub thread: Thread,
    /// Participant rows, one per user
    pub participants: Vec<Participant>,
}

impl ThreadWithParticipants {
    /// Participant row for a user
    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Participants other than the viewer, ordered by user id
    #[must_use]
    pub fn others(&self, viewer_id: &str) -> Vec<&Participant> {
        let mut others: Vec<&Participant> =
            self.participants.iter().filter(|p| p.user_id != viewer_id).collect();
        others.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        others
    }
}

/// Display profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// User identifier
    pub user_id: String,
    /// Name to show
    pub display_name: String,
    /// Avatar location
    pub avatar_url: Option<String>,
}

/// Counterpart shown for a thread in the inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactProfile {
    /// Counterpart user identifier
    pub user_id: String,
    /// Name to show; a placeholder when the profile did not resolve
    pub display_name: String,
    /// Avatar location
    pub avatar_url: Option<String>,
    /// Counterpart role in the thread
    pub role: ParticipantRole,
    /// False when the profile is missing (e.g. deleted account)
    pub resolved: bool,
}

/// Last-message summary for the inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    /// Message identifier
    pub message_id: String,
    /// Author
    pub sender_id: String,
    /// Short summary of the body
    pub text: String,
    /// Content kind
    pub kind: ContentKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePreview {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.content.preview_text(),
            kind: message.kind(),
            created_at: message.created_at,
        }
    }
}

/// State of the last-message preview of an inbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreviewState {
    /// Newest non-deleted message
    Available(MessagePreview),
    /// Thread has no visible messages
    Empty,
    /// Enrichment failed for this thread
    Unavailable,
}

/// Inbox entry handed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadViewModel {
    /// Thread identifier
    pub thread_id: String,
    /// Conversation kind
    pub kind: ConversationKind,
    /// Free-text subject
    pub subject: Option<String>,
    /// Logical contact key the entry was collapsed on
    pub contact_key: String,
    /// Counterpart, if the thread has one
    pub counterpart: Option<ContactProfile>,
    /// Newest activity
    pub last_activity_at: DateTime<Utc>,
    /// Last-message preview
    pub preview: PreviewState,
    /// Unread messages for the viewer
    pub unread_count: u32,
    /// The count could not be loaded and `unread_count` is a placeholder 0
    pub unread_degraded: bool,
    /// Viewer muted the thread
    pub muted: bool,
    /// Thread is archived
    pub archived: bool,
}

/// Data for starting a new conversation
#[derive(Debug, Clone)]
pub struct NewThread {
    /// Owning tenant
    pub tenant_id: String,
    /// Conversation kind
    pub kind: ConversationKind,
    /// Creator user id; also added as participant when listed
    pub created_by: String,
    /// Free-text subject
    pub subject: Option<String>,
    /// Entity the conversation is about
    pub subject_entity_id: Option<String>,
    /// Members and their roles; duplicates keep the first role
    pub participants: Vec<(String, ParticipantRole)>,
}

/// Current time truncated to the millisecond precision the store keeps
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Convert stored milliseconds back to a timestamp
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
