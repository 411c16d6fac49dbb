//! Database schema definitions
//!
//! This module provides constants for table and column names used with rusqlite.
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch so that
//! monotonic updates can be expressed with `MAX(..)` in SQL.

/// Profiles table schema
pub mod profiles {
    /// Table name
    pub const TABLE: &str = "profiles";
    /// Primary key column
    pub const USER_ID: &str = "user_id";
    /// Owning tenant column
    pub const TENANT_ID: &str = "tenant_id";
    /// Display name column
    pub const DISPLAY_NAME: &str = "display_name";
    /// Avatar URL column
    pub const AVATAR_URL: &str = "avatar_url";
}

/// Threads table schema
pub mod threads {
    /// Table name
    pub const TABLE: &str = "threads";
    /// Primary key column
    pub const ID: &str = "id";
    /// Owning tenant column
    pub const TENANT_ID: &str = "tenant_id";
    /// Conversation kind column
    pub const KIND: &str = "kind";
    /// Subject entity reference column
    pub const SUBJECT_ENTITY_ID: &str = "subject_entity_id";
    /// Free-text subject column
    pub const SUBJECT: &str = "subject";
    /// Creator column
    pub const CREATED_BY: &str = "created_by";
    /// Last activity timestamp column
    pub const LAST_ACTIVITY_AT: &str = "last_activity_at";
    /// Archived flag column
    pub const ARCHIVED: &str = "archived";
    /// Creation timestamp column
    pub const CREATED_AT: &str = "created_at";
    /// Update timestamp column
    pub const UPDATED_AT: &str = "updated_at";
}

/// Participants table schema
pub mod participants {
    /// Table name
    pub const TABLE: &str = "participants";
    /// Foreign key to threads table
    pub const THREAD_ID: &str = "thread_id";
    /// Member user column
    pub const USER_ID: &str = "user_id";
    /// Role column
    pub const ROLE: &str = "role";
    /// Join timestamp column
    pub const JOINED_AT: &str = "joined_at";
    /// Muted flag column
    pub const MUTED: &str = "muted";
    /// Read marker column
    pub const LAST_READ_AT: &str = "last_read_at";
}

/// Messages table schema
pub mod messages {
    /// Table name
    pub const TABLE: &str = "messages";
    /// Primary key column
    pub const ID: &str = "id";
    /// Foreign key to threads table
    pub const THREAD_ID: &str = "thread_id";
    /// Author column
    pub const SENDER_ID: &str = "sender_id";
    /// Encoded body column
    pub const CONTENT: &str = "content";
    /// Content kind column
    pub const CONTENT_KIND: &str = "content_kind";
    /// Creation timestamp column
    pub const CREATED_AT: &str = "created_at";
    /// Edit marker column
    pub const EDITED_AT: &str = "edited_at";
    /// Soft delete marker column
    pub const DELETED_AT: &str = "deleted_at";
}
