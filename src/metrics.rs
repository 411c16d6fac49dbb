use anyhow::Result;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names emitted by the synchronization engine
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    // Store metrics
    pub store_operations_total: &'static str,
    pub store_operation_duration: &'static str,

    // Realtime metrics
    pub events_applied_total: &'static str,
    pub duplicate_events_total: &'static str,
    pub reconnects_total: &'static str,
    pub active_subscriptions: &'static str,
    pub catch_up_messages_total: &'static str,

    // Read state metrics
    pub unread_recomputes_total: &'static str,
    pub mark_read_fallbacks_total: &'static str,

    // Send metrics
    pub messages_sent_total: &'static str,
    pub send_failures_total: &'static str,
    pub send_duration: &'static str,

    // Error metrics
    pub errors_total: &'static str,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            store_operations_total: "convo_sync_store_operations_total",
            store_operation_duration: "convo_sync_store_operation_duration_seconds",

            events_applied_total: "convo_sync_events_applied_total",
            duplicate_events_total: "convo_sync_duplicate_events_total",
            reconnects_total: "convo_sync_reconnects_total",
            active_subscriptions: "convo_sync_active_subscriptions",
            catch_up_messages_total: "convo_sync_catch_up_messages_total",

            unread_recomputes_total: "convo_sync_unread_recomputes_total",
            mark_read_fallbacks_total: "convo_sync_mark_read_fallbacks_total",

            messages_sent_total: "convo_sync_messages_sent_total",
            send_failures_total: "convo_sync_send_failures_total",
            send_duration: "convo_sync_send_duration_seconds",

            errors_total: "convo_sync_errors_total",
        }
    }
}

impl SyncMetrics {
    /// Install a no-op recorder so metric calls are cheap when nothing exports them
    pub fn init() -> Result<()> {
        metrics::set_global_recorder(metrics::NoopRecorder)
            .map_err(|e| anyhow::anyhow!("Failed to initialize metrics recorder: {}", e))?;

        Ok(())
    }

    /// Record store operation metrics
    pub fn record_store_operation(&self, operation: &'static str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "error" };

        counter!(self.store_operations_total, "operation" => operation, "status" => status).increment(1);
        histogram!(self.store_operation_duration, "operation" => operation).record(duration.as_secs_f64());

        if !success {
            counter!(self.errors_total, "type" => "store", "operation" => operation).increment(1);
        }
    }

    /// Record one change-feed event folded into the cache
    pub fn record_event_applied(&self, table: &'static str, outcome: &'static str) {
        counter!(self.events_applied_total, "table" => table, "outcome" => outcome).increment(1);
    }

    /// Record a duplicate delivery dropped by the id check
    pub fn record_duplicate_event(&self) {
        counter!(self.duplicate_events_total).increment(1);
    }

    /// Record a re-established subscription
    pub fn record_reconnect(&self) {
        counter!(self.reconnects_total).increment(1);
    }

    /// Update the number of live subscriptions
    pub fn set_active_subscriptions(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!(self.active_subscriptions).set(count as f64);
    }

    /// Record messages fetched while catching up after a reconnect
    pub fn record_catch_up(&self, fetched: usize) {
        counter!(self.catch_up_messages_total).increment(fetched as u64);
    }

    /// Record a targeted unread recompute
    pub fn record_unread_recompute(&self) {
        counter!(self.unread_recomputes_total).increment(1);
    }

    /// Record a mark-read that fell back to the per-participant update
    pub fn record_mark_read_fallback(&self) {
        counter!(self.mark_read_fallbacks_total).increment(1);
    }

    /// Record an outbound message
    pub fn record_send(&self, duration: Duration, success: bool) {
        histogram!(self.send_duration).record(duration.as_secs_f64());
        if success {
            counter!(self.messages_sent_total).increment(1);
        } else {
            counter!(self.send_failures_total).increment(1);
            counter!(self.errors_total, "type" => "send", "operation" => "send").increment(1);
        }
    }

    /// Record error metrics
    pub fn record_error(&self, error_type: &'static str, operation: &'static str) {
        counter!(self.errors_total, "type" => error_type, "operation" => operation).increment(1);
    }
}

/// Performance timing wrapper for store metrics
pub struct MetricsTimer {
    metrics: SyncMetrics,
    operation: &'static str,
    start: std::time::Instant,
}

impl MetricsTimer {
    pub fn new(metrics: SyncMetrics, operation: &'static str) -> Self {
        Self {
            metrics,
            operation,
            start: std::time::Instant::now(),
        }
    }

    pub fn finish(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        self.metrics.record_store_operation(self.operation, duration, success);
        duration
    }
}
