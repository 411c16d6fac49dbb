//! Conversation Sync - Inbox, Read State and Realtime Merge
//!
//! A Rust library that keeps per-user conversation state consistent between a
//! relational store of threads, participants and messages and a pushed change feed.
//!
//! # Features
//!
//! - Role-scoped inboxes collapsed by logical contact
//! - Unread counts and monotonic read markers with read receipts
//! - Idempotent, order-independent merging of realtime events
//! - Validated send pipeline that keeps failed content for retry
//! - Offline inbox snapshots and catch-up after reconnects

/// Message caches and inbox snapshots
pub mod cache;
/// Configuration management
pub mod config;
/// Database operations and connection pooling
pub mod db;
/// Error types
pub mod error;
/// Change feed events, filters and the in-process hub
pub mod feed;
/// Logging setup and utilities
pub mod logging;
/// Realtime merge engine and subscriptions
pub mod merge;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Unread counts and read markers
pub mod read_state;
/// Store trait and the SQLite implementation
pub mod repository;
/// Inbox resolution
pub mod resolver;
/// Database schema definitions
pub mod schema;
/// Outbound message pipeline
pub mod send;
/// Messaging surface for UI sessions
pub mod service;
/// Retry and backoff helpers
pub mod utils;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use cache::{ConversationCache, InboxSnapshotStore, SharedCache, ThreadCache};
pub use db::Database;
pub use error::{Result, SyncError};
pub use feed::{ChangeEvent, ChangeFeed, ChangeFeedHub, EventStream, FeedFilter};
pub use merge::{MergeEngine, MergeOutcome, SubscriptionHandle, SubscriptionState};
pub use models::{Message, MessageContent, Participant, Thread, ThreadViewModel};
pub use read_state::ReadStateTracker;
pub use repository::{ConversationStore, SqliteConversationStore};
pub use resolver::ThreadResolver;
pub use send::SendPipeline;
pub use service::{MessagingService, Session};
