use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    from_millis, ContentKind, Message, MessageContent, NewThread, Participant, Profile, Thread, ThreadWithParticipants,
};
use crate::schema::{messages, participants, profiles, threads};

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Database manager for handling connections and operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) the database at `path` with default pool settings
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, &DatabaseConfig::default())
    }

    /// Open (or create) the database with explicit pool settings
    pub fn with_config(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| SyncError::Other(format!("Failed to create database directory: {e}")))?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)?;

        // Run migrations
        let conn = pool.get()?;
        Self::run_migrations(&conn)?;

        info!(path = %path.display(), "Conversation database ready");
        Ok(Self { pool })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(include_str!("../migrations/2025-03-15-000000_create_conversations/up.sql"))?;
        conn.execute_batch(include_str!("../migrations/2025-03-19-000000_add_read_state_indexes/up.sql"))?;
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Insert or refresh a display profile
    pub fn upsert_profile(&self, tenant_id: &str, profile: &Profile) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "INSERT INTO {t} ({uid}, {tid}, {name}, {avatar}) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT({uid}) DO UPDATE SET {name} = excluded.{name}, {avatar} = excluded.{avatar}",
                t = profiles::TABLE,
                uid = profiles::USER_ID,
                tid = profiles::TENANT_ID,
                name = profiles::DISPLAY_NAME,
                avatar = profiles::AVATAR_URL,
            ),
            params![profile.user_id, tenant_id, profile.display_name, profile.avatar_url],
        )?;
        Ok(())
    }

    /// Resolve display profiles; unknown ids are simply absent from the result
    pub fn resolve_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            profiles::TABLE,
            profiles::USER_ID,
            placeholders(user_ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), |row| {
            Ok(Profile {
                user_id: row.get(profiles::USER_ID)?,
                display_name: row.get(profiles::DISPLAY_NAME)?,
                avatar_url: row.get(profiles::AVATAR_URL)?,
            })
        })?;

        let mut results = Vec::new();
        for profile in rows {
            results.push(profile?);
        }
        Ok(results)
    }

    /// Create a thread and its participant rows in one transaction.
    ///
    /// Duplicate user ids in `new_thread.participants` keep their first role so the
    /// (thread, user) pair stays unique.
    pub fn create_thread(&self, new_thread: &NewThread, at: DateTime<Utc>) -> Result<ThreadWithParticipants> {
        if new_thread.participants.is_empty() {
            return Err(SyncError::Validation("a conversation needs at least one participant".into()));
        }

        let id = Uuid::new_v4().to_string();
        let ms = at.timestamp_millis();
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?7, ?7)",
                threads::TABLE,
                threads::ID,
                threads::TENANT_ID,
                threads::KIND,
                threads::SUBJECT_ENTITY_ID,
                threads::SUBJECT,
                threads::CREATED_BY,
                threads::LAST_ACTIVITY_AT,
                threads::ARCHIVED,
                threads::CREATED_AT,
                threads::UPDATED_AT
            ),
            params![
                id,
                new_thread.tenant_id,
                new_thread.kind.as_str(),
                new_thread.subject_entity_id,
                new_thread.subject,
                new_thread.created_by,
                ms
            ],
        )?;

        for (user_id, role) in &new_thread.participants {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} ({}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, 0)",
                    participants::TABLE,
                    participants::THREAD_ID,
                    participants::USER_ID,
                    participants::ROLE,
                    participants::JOINED_AT,
                    participants::MUTED
                ),
                params![id, user_id, role.as_str(), ms],
            )?;
        }
        tx.commit()?;

        debug!(thread_id = %id, kind = %new_thread.kind, "Created thread");
        self.get_thread(&id)?
            .ok_or_else(|| SyncError::Other("Failed to retrieve newly created thread".into()))
    }

    /// Threads of `tenant_id` that `user_id` participates in, with all participant rows
    pub fn list_threads_for_user(&self, user_id: &str, tenant_id: &str) -> Result<Vec<ThreadWithParticipants>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT t.* FROM {t} t INNER JOIN {p} p ON p.{pt} = t.{tid}
             WHERE p.{pu} = ?1 AND t.{tenant} = ?2
             ORDER BY t.{activity} DESC, t.{tid} ASC",
            t = threads::TABLE,
            p = participants::TABLE,
            pt = participants::THREAD_ID,
            tid = threads::ID,
            pu = participants::USER_ID,
            tenant = threads::TENANT_ID,
            activity = threads::LAST_ACTIVITY_AT,
        ))?;
        let rows = stmt.query_map(params![user_id, tenant_id], Self::map_thread)?;

        let mut thread_rows = Vec::new();
        for thread in rows {
            thread_rows.push(thread?);
        }

        let ids: Vec<String> = thread_rows.iter().map(|t| t.id.clone()).collect();
        let mut by_thread = Self::participants_for(&conn, &ids)?;

        Ok(thread_rows
            .into_iter()
            .map(|thread| {
                let participants = by_thread.remove(&thread.id).unwrap_or_default();
                ThreadWithParticipants { thread, participants }
            })
            .collect())
    }

    /// A single thread with its participants
    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadWithParticipants>> {
        let conn = self.get_connection()?;
        let thread = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", threads::TABLE, threads::ID),
                params![thread_id],
                Self::map_thread,
            )
            .optional()?;

        let Some(thread) = thread else {
            return Ok(None);
        };
        let mut by_thread = Self::participants_for(&conn, std::slice::from_ref(&thread.id))?;
        let participants = by_thread.remove(&thread.id).unwrap_or_default();
        Ok(Some(ThreadWithParticipants { thread, participants }))
    }

    /// Participant rows for a set of threads, keyed by thread id
    fn participants_for(conn: &Connection, thread_ids: &[String]) -> Result<HashMap<String, Vec<Participant>>> {
        let mut by_thread: HashMap<String, Vec<Participant>> = HashMap::new();
        if thread_ids.is_empty() {
            return Ok(by_thread);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} IN ({}) ORDER BY {}, {}",
            participants::TABLE,
            participants::THREAD_ID,
            placeholders(thread_ids.len()),
            participants::THREAD_ID,
            participants::USER_ID
        ))?;
        let rows = stmt.query_map(params_from_iter(thread_ids.iter()), Self::map_participant)?;
        for participant in rows {
            let participant = participant?;
            by_thread.entry(participant.thread_id.clone()).or_default().push(participant);
        }
        Ok(by_thread)
    }

    /// A single participant row
    pub fn get_participant(&self, thread_id: &str, user_id: &str) -> Result<Option<Participant>> {
        let conn = self.get_connection()?;
        let participant = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} WHERE {} = ?1 AND {} = ?2",
                    participants::TABLE,
                    participants::THREAD_ID,
                    participants::USER_ID
                ),
                params![thread_id, user_id],
                Self::map_participant,
            )
            .optional()?;
        Ok(participant)
    }

    /// Messages of a thread ordered by (created_at, id).
    ///
    /// With `since_id`, only messages ordered after that message are returned. An
    /// unknown `since_id` returns the full list; callers merge idempotently.
    pub fn list_messages(&self, thread_id: &str, since_id: Option<&str>) -> Result<Vec<Message>> {
        let conn = self.get_connection()?;

        let cursor: Option<i64> = match since_id {
            Some(id) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
                        messages::CREATED_AT,
                        messages::TABLE,
                        messages::ID,
                        messages::THREAD_ID
                    ),
                    params![id, thread_id],
                    |row| row.get(0),
                )
                .optional()?,
            None => None,
        };

        let mut results = Vec::new();
        if let (Some(created_at), Some(since_id)) = (cursor, since_id) {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM {t} WHERE {tid} = ?1 AND ({ca} > ?2 OR ({ca} = ?2 AND {id} > ?3)) ORDER BY {ca} ASC, {id} ASC",
                t = messages::TABLE,
                tid = messages::THREAD_ID,
                ca = messages::CREATED_AT,
                id = messages::ID,
            ))?;
            let rows = stmt.query_map(params![thread_id, created_at, since_id], Self::map_message)?;
            for message in rows {
                results.push(message?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM {t} WHERE {tid} = ?1 ORDER BY {ca} ASC, {id} ASC",
                t = messages::TABLE,
                tid = messages::THREAD_ID,
                ca = messages::CREATED_AT,
                id = messages::ID,
            ))?;
            let rows = stmt.query_map(params![thread_id], Self::map_message)?;
            for message in rows {
                results.push(message?);
            }
        }

        Ok(results)
    }

    /// Newest non-deleted message per thread, in one query
    pub fn latest_messages(&self, thread_ids: &[String]) -> Result<HashMap<String, Message>> {
        let mut latest = HashMap::new();
        if thread_ids.is_empty() {
            return Ok(latest);
        }

        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM (
                SELECT m.*, ROW_NUMBER() OVER (PARTITION BY m.{tid} ORDER BY m.{ca} DESC, m.{id} DESC) AS rn
                FROM {t} m WHERE m.{deleted} IS NULL AND m.{tid} IN ({ph})
             ) WHERE rn = 1",
            t = messages::TABLE,
            tid = messages::THREAD_ID,
            ca = messages::CREATED_AT,
            id = messages::ID,
            deleted = messages::DELETED_AT,
            ph = placeholders(thread_ids.len()),
        ))?;
        let rows = stmt.query_map(params_from_iter(thread_ids.iter()), Self::map_message)?;
        for message in rows {
            let message = message?;
            latest.insert(message.thread_id.clone(), message);
        }
        Ok(latest)
    }

    /// Get a message by ID
    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.get_connection()?;
        let message = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", messages::TABLE, messages::ID),
                params![message_id],
                Self::map_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Persist a message and advance its thread's last activity atomically.
    ///
    /// Either both the message row and the thread touch are committed, or neither.
    pub fn insert_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        content: &MessageContent,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let encoded = content.to_storage()?;
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)", threads::TABLE, threads::ID),
            params![thread_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(SyncError::NotFound(format!("thread {thread_id}")));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.clone(),
            created_at,
            edited_at: None,
            deleted_at: None,
            read_by: std::collections::BTreeSet::new(),
        };

        tx.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                messages::TABLE,
                messages::ID,
                messages::THREAD_ID,
                messages::SENDER_ID,
                messages::CONTENT,
                messages::CONTENT_KIND,
                messages::CREATED_AT
            ),
            params![
                message.id,
                message.thread_id,
                message.sender_id,
                encoded,
                content.kind().as_str(),
                created_at.timestamp_millis()
            ],
        )?;
        Self::touch_thread(&tx, thread_id, created_at)?;
        tx.commit()?;

        Ok(message)
    }

    /// Advance a thread's last activity; never moves it backward
    pub fn update_thread_last_activity(&self, thread_id: &str, at: DateTime<Utc>) -> Result<Thread> {
        let conn = self.get_connection()?;
        if Self::touch_thread(&conn, thread_id, at)? == 0 {
            return Err(SyncError::NotFound(format!("thread {thread_id}")));
        }
        Self::thread_row(&conn, thread_id)
    }

    fn touch_thread(conn: &Connection, thread_id: &str, at: DateTime<Utc>) -> Result<usize> {
        let updated = conn.execute(
            &format!(
                "UPDATE {t} SET {la} = MAX({la}, ?1), {ua} = MAX({ua}, ?1) WHERE {id} = ?2",
                t = threads::TABLE,
                la = threads::LAST_ACTIVITY_AT,
                ua = threads::UPDATED_AT,
                id = threads::ID,
            ),
            params![at.timestamp_millis(), thread_id],
        )?;
        Ok(updated)
    }

    fn thread_row(conn: &Connection, thread_id: &str) -> Result<Thread> {
        conn.query_row(
            &format!("SELECT * FROM {} WHERE {} = ?", threads::TABLE, threads::ID),
            params![thread_id],
            Self::map_thread,
        )
        .optional()?
        .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id}")))
    }

    /// Advance a participant's read marker to `max(current, at)`
    pub fn update_participant_last_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {t} SET {lr} = MAX(COALESCE({lr}, ?1), ?1) WHERE {tid} = ?2 AND {uid} = ?3",
                t = participants::TABLE,
                lr = participants::LAST_READ_AT,
                tid = participants::THREAD_ID,
                uid = participants::USER_ID,
            ),
            params![at.timestamp_millis(), thread_id, user_id],
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("participant {user_id} in thread {thread_id}")));
        }
        self.get_participant(thread_id, user_id)?
            .ok_or_else(|| SyncError::NotFound(format!("participant {user_id} in thread {thread_id}")))
    }

    /// Single-statement "mark thread as read": updates and returns the row in one round trip
    pub fn mark_thread_read(&self, thread_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<Participant> {
        let conn = self.get_connection()?;
        conn.query_row(
            &format!(
                "UPDATE {t} SET {lr} = MAX(COALESCE({lr}, ?1), ?1) WHERE {tid} = ?2 AND {uid} = ?3 RETURNING *",
                t = participants::TABLE,
                lr = participants::LAST_READ_AT,
                tid = participants::THREAD_ID,
                uid = participants::USER_ID,
            ),
            params![at.timestamp_millis(), thread_id, user_id],
            Self::map_participant,
        )
        .optional()?
        .ok_or_else(|| SyncError::NotFound(format!("participant {user_id} in thread {thread_id}")))
    }

    /// Count non-deleted messages not sent by `excluding_sender`, created strictly after `created_after`
    pub fn count_messages(
        &self,
        thread_id: &str,
        excluding_sender: &str,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let conn = self.get_connection()?;
        let after = created_after.map_or(i64::MIN, |at| at.timestamp_millis());
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1 AND {} != ?2 AND {} IS NULL AND {} > ?3",
                messages::TABLE,
                messages::THREAD_ID,
                messages::SENDER_ID,
                messages::DELETED_AT,
                messages::CREATED_AT
            ),
            params![thread_id, excluding_sender, after],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Replace the body of a message and set its edit marker
    pub fn edit_message(&self, message_id: &str, content: &MessageContent, at: DateTime<Utc>) -> Result<Message> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1, {} = ?2, {} = ?3 WHERE {} = ?4 AND {} IS NULL",
                messages::TABLE,
                messages::CONTENT,
                messages::CONTENT_KIND,
                messages::EDITED_AT,
                messages::ID,
                messages::DELETED_AT
            ),
            params![content.to_storage()?, content.kind().as_str(), at.timestamp_millis(), message_id],
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("message {message_id}")));
        }
        self.get_message(message_id)?
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))
    }

    /// Soft-delete a message; the first delete marker wins
    pub fn delete_message(&self, message_id: &str, at: DateTime<Utc>) -> Result<Message> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {t} SET {d} = COALESCE({d}, ?1) WHERE {id} = ?2",
                t = messages::TABLE,
                d = messages::DELETED_AT,
                id = messages::ID,
            ),
            params![at.timestamp_millis(), message_id],
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("message {message_id}")));
        }
        self.get_message(message_id)?
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))
    }

    /// Mute or unmute a thread for one participant
    pub fn set_muted(&self, thread_id: &str, user_id: &str, muted: bool) -> Result<Participant> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2 AND {} = ?3",
                participants::TABLE,
                participants::MUTED,
                participants::THREAD_ID,
                participants::USER_ID
            ),
            params![muted, thread_id, user_id],
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("participant {user_id} in thread {thread_id}")));
        }
        self.get_participant(thread_id, user_id)?
            .ok_or_else(|| SyncError::NotFound(format!("participant {user_id} in thread {thread_id}")))
    }

    /// Archive or restore a thread
    pub fn set_archived(&self, thread_id: &str, archived: bool, at: DateTime<Utc>) -> Result<Thread> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {t} SET {a} = ?1, {ua} = MAX({ua}, ?2) WHERE {id} = ?3",
                t = threads::TABLE,
                a = threads::ARCHIVED,
                ua = threads::UPDATED_AT,
                id = threads::ID,
            ),
            params![archived, at.timestamp_millis(), thread_id],
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("thread {thread_id}")));
        }
        Self::thread_row(&conn, thread_id)
    }

    /// Map a database row to a Thread
    fn map_thread(row: &Row) -> rusqlite::Result<Thread> {
        Ok(Thread {
            id: row.get(threads::ID)?,
            tenant_id: row.get(threads::TENANT_ID)?,
            kind: parse_column(row, threads::KIND)?,
            subject_entity_id: row.get(threads::SUBJECT_ENTITY_ID)?,
            subject: row.get(threads::SUBJECT)?,
            created_by: row.get(threads::CREATED_BY)?,
            last_activity_at: from_millis(row.get(threads::LAST_ACTIVITY_AT)?),
            archived: row.get(threads::ARCHIVED)?,
            created_at: from_millis(row.get(threads::CREATED_AT)?),
            updated_at: from_millis(row.get(threads::UPDATED_AT)?),
        })
    }

    /// Map a database row to a Participant
    fn map_participant(row: &Row) -> rusqlite::Result<Participant> {
        Ok(Participant {
            thread_id: row.get(participants::THREAD_ID)?,
            user_id: row.get(participants::USER_ID)?,
            role: parse_column(row, participants::ROLE)?,
            joined_at: from_millis(row.get(participants::JOINED_AT)?),
            muted: row.get(participants::MUTED)?,
            last_read_at: row.get::<_, Option<i64>>(participants::LAST_READ_AT)?.map(from_millis),
        })
    }

    /// Map a database row to a Message
    fn map_message(row: &Row) -> rusqlite::Result<Message> {
        let kind: ContentKind = parse_column(row, messages::CONTENT_KIND)?;
        let raw: String = row.get(messages::CONTENT)?;
        let content = MessageContent::from_storage(kind, &raw).map_err(conversion_error)?;

        Ok(Message {
            id: row.get(messages::ID)?,
            thread_id: row.get(messages::THREAD_ID)?,
            sender_id: row.get(messages::SENDER_ID)?,
            content,
            created_at: from_millis(row.get(messages::CREATED_AT)?),
            edited_at: row.get::<_, Option<i64>>(messages::EDITED_AT)?.map(from_millis),
            deleted_at: row.get::<_, Option<i64>>(messages::DELETED_AT)?.map(from_millis),
            read_by: std::collections::BTreeSet::new(),
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn parse_column<T: FromStr<Err = SyncError>>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(conversion_error)
}

fn conversion_error(err: SyncError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}
