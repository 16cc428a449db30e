//! Progress bus: fire-and-forget fan-out of job events.
//!
//! Built on a `tokio::sync::broadcast` channel. Publishing never waits; a
//! subscriber that falls behind loses its oldest events and sees
//! `RecvError::Lagged`. Events are snapshots, so dropping some is harmless.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::{JobRecord, JobStatus, TaskStatus};

/// Default number of buffered messages per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Which transition or snapshot an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A batch was committed.
    Batch,
    /// A table changed status.
    Task,
    /// The job changed status.
    Job,
}

/// Status carried by an event: a task status for table events, a job
/// status for job events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventStatus {
    Task(TaskStatus),
    Job(JobStatus),
}

/// Point-in-time snapshot of a job or one of its tables.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub kind: EventKind,
    /// `None` for job-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub rows_migrated: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<i64>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    pub status: EventStatus,
}

impl ProgressEvent {
    /// Snapshot of one table.
    pub fn table(
        job_id: &str,
        kind: EventKind,
        table: &str,
        rows_migrated: i64,
        total_rows: Option<i64>,
        elapsed: Duration,
        status: TaskStatus,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            table: Some(table.to_string()),
            rows_migrated,
            total_rows,
            elapsed_ms: elapsed.as_millis() as u64,
            eta_ms: eta_ms(rows_migrated, total_rows, elapsed),
            status: EventStatus::Task(status),
        }
    }

    /// Snapshot of the whole job.
    pub fn job(
        job_id: &str,
        rows_migrated: i64,
        total_rows: Option<i64>,
        elapsed: Duration,
        status: JobStatus,
    ) -> Self {
        let eta = if status == JobStatus::Running {
            eta_ms(rows_migrated, total_rows, elapsed)
        } else {
            None
        };
        Self {
            job_id: job_id.to_string(),
            kind: EventKind::Job,
            table: None,
            rows_migrated,
            total_rows,
            elapsed_ms: elapsed.as_millis() as u64,
            eta_ms: eta,
            status: EventStatus::Job(status),
        }
    }
}

/// Remaining time at the observed throughput.
///
/// `None` until at least one row has moved or when the total is unknown.
pub fn eta_ms(rows_migrated: i64, total_rows: Option<i64>, elapsed: Duration) -> Option<u64> {
    let total = total_rows?;
    if rows_migrated <= 0 {
        return None;
    }
    let remaining = (total - rows_migrated).max(0) as f64;
    let per_row_ms = elapsed.as_secs_f64() * 1000.0 / rows_migrated as f64;
    Some((remaining * per_row_ms).round() as u64)
}

/// Message published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Progress(ProgressEvent),
    Finished(Box<JobRecord>),
}

/// Broadcast hub for progress events and terminal job records.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub fn publish(&self, message: BusMessage) {
        let _ = self.tx.send(message);
    }

    pub fn progress(&self, event: ProgressEvent) {
        self.publish(BusMessage::Progress(event));
    }

    pub fn finished(&self, record: JobRecord) {
        self.publish(BusMessage::Finished(Box::new(record)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn batch(rows: i64) -> ProgressEvent {
        ProgressEvent::table(
            "job",
            EventKind::Batch,
            "orders",
            rows,
            Some(100),
            Duration::from_millis(rows as u64 * 10),
            TaskStatus::Copying,
        )
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_ms(0, Some(100), Duration::from_secs(1)), None);
        assert_eq!(eta_ms(10, None, Duration::from_secs(1)), None);
        assert_eq!(eta_ms(25, Some(100), Duration::from_secs(1)), Some(3000));
        assert_eq!(eta_ms(100, Some(100), Duration::from_secs(1)), Some(0));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ProgressBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.progress(batch(10));
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = ProgressBus::new(16);
        let mut rx = bus.subscribe();
        for rows in [10, 20, 30] {
            bus.progress(batch(rows));
        }
        for expected in [10, 20, 30] {
            match rx.recv().await.unwrap() {
                BusMessage::Progress(e) => assert_eq!(e.rows_migrated, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let bus = ProgressBus::new(2);
        let mut rx = bus.subscribe();
        for rows in 1..=5 {
            bus.progress(batch(rows));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        match rx.recv().await.unwrap() {
            BusMessage::Progress(e) => assert_eq!(e.rows_migrated, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(BusMessage::Progress(batch(50))).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["kind"], "batch");
        assert_eq!(json["status"], "copying");
        assert_eq!(json["eta_ms"], 500);

        let job = ProgressEvent::job("job", 0, None, Duration::ZERO, JobStatus::Completed);
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("table").is_none());
        assert_eq!(json["status"], "completed");
    }
}
