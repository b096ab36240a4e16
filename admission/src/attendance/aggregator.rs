//! Asynchronous wrapper around [`AttendanceProjection`].

use super::{AttendanceProjection, AttendanceSnapshot, ScanAttempt, TimeRange};
use crate::metrics;
use admission_core::environment::Clock;
use admission_core::store::{StoreError, TicketStore};
use admission_core::types::EventId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// The aggregator worker has stopped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("attendance aggregator is not running")]
pub struct AggregatorClosed;

/// Aggregator tuning.
#[derive(Clone, Copy, Debug)]
pub struct AggregatorConfig {
    /// Timeline bucket width
    pub bucket: chrono::Duration,
    /// How often a changed projection is republished
    pub refresh_interval: Duration,
    /// Ingestion channel capacity
    pub channel_capacity: usize,
    /// Recent check-ins kept per event
    pub recent_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bucket: chrono::Duration::minutes(5),
            refresh_interval: Duration::from_secs(1),
            channel_capacity: 10_000,
            recent_limit: 10,
        }
    }
}

/// Immutable published state of the projection.
#[derive(Clone, Debug)]
pub struct AttendanceBoard {
    projection: AttendanceProjection,
    refreshed_at: DateTime<Utc>,
}

impl AttendanceBoard {
    /// Read model as of [`refreshed_at`](Self::refreshed_at)
    #[must_use]
    pub const fn projection(&self) -> &AttendanceProjection {
        &self.projection
    }

    /// Publication time
    #[must_use]
    pub const fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    /// Snapshot for one event from this board against `registered` tickets
    #[must_use]
    pub fn snapshot(&self, event_id: EventId, range: TimeRange, registered: u64) -> AttendanceSnapshot {
        self.projection.snapshot(event_id, range, registered, self.refreshed_at)
    }
}

enum Command {
    Apply {
        scan: ScanAttempt,
        ingested_at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the attendance worker.
///
/// Cheap to clone. Writers call [`record`](Self::record), which never blocks;
/// readers take the latest published [`AttendanceBoard`]. Staleness is bounded
/// by the refresh interval. Registration counts come from the ticket store on
/// every [`snapshot`](Self::snapshot).
#[derive(Clone)]
pub struct AttendanceAggregator {
    commands: mpsc::Sender<Command>,
    board: watch::Receiver<Arc<AttendanceBoard>>,
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AttendanceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttendanceAggregator")
            .field("refreshed_at", &self.board.borrow().refreshed_at)
            .field("pending_capacity", &self.commands.capacity())
            .finish_non_exhaustive()
    }
}

impl AttendanceAggregator {
    /// Start the worker task on the current Tokio runtime.
    ///
    /// The worker exits once every handle has been dropped, after publishing
    /// a final board.
    #[must_use]
    pub fn spawn(
        config: AggregatorConfig,
        store: Arc<dyn TicketStore>,
        clock: Arc<dyn Clock>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, inbox) = mpsc::channel(config.channel_capacity.max(1));
        let projection = AttendanceProjection::new(config.bucket, config.recent_limit);
        let (publisher, board) = watch::channel(Arc::new(AttendanceBoard {
            projection: projection.clone(),
            refreshed_at: clock.now(),
        }));

        let worker = tokio::spawn(run_worker(
            projection,
            inbox,
            publisher,
            config.refresh_interval,
            Arc::clone(&clock),
        ));

        (
            Self {
                commands,
                board,
                store,
                clock,
            },
            worker,
        )
    }

    /// Queue a scan stamped with the current ingestion time.
    ///
    /// Never waits: if the channel is full the scan is dropped with a warning
    /// and counted in `admission_attendance_events_dropped_total`.
    pub fn record(&self, scan: ScanAttempt) {
        let command = Command::Apply {
            scan,
            ingested_at: self.clock.now(),
        };
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Attendance channel full, dropping event");
                metrics::record_attendance_event_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Attendance aggregator stopped, dropping event");
                metrics::record_attendance_event_dropped();
            }
        }
    }

    /// Apply everything queued so far and republish immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorClosed`] if the worker has stopped.
    pub async fn flush(&self) -> Result<(), AggregatorClosed> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .await
            .map_err(|_| AggregatorClosed)?;
        done.await.map_err(|_| AggregatorClosed)
    }

    /// Latest published board.
    #[must_use]
    pub fn board(&self) -> Arc<AttendanceBoard> {
        Arc::clone(&self.board.borrow())
    }

    /// Snapshot for `event_id` from the latest published board, with the
    /// registration count read from the ticket store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn snapshot(&self, event_id: EventId, range: TimeRange) -> Result<AttendanceSnapshot, StoreError> {
        let board = self.board();
        let registered = self.store.state_counts(event_id).await?.registered();
        Ok(board.snapshot(event_id, range, registered))
    }
}

async fn run_worker(
    mut projection: AttendanceProjection,
    mut inbox: mpsc::Receiver<Command>,
    publisher: watch::Sender<Arc<AttendanceBoard>>,
    refresh_interval: Duration,
    clock: Arc<dyn Clock>,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dirty = false;

    let publish = |projection: &AttendanceProjection| {
        publisher.send_replace(Arc::new(AttendanceBoard {
            projection: projection.clone(),
            refreshed_at: clock.now(),
        }));
    };

    tracing::debug!(refresh_ms = refresh_interval.as_millis(), "Attendance aggregator started");
    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Apply { scan, ingested_at }) => {
                    projection.apply(&scan, ingested_at);
                    dirty = true;
                }
                Some(Command::Flush(ack)) => {
                    publish(&projection);
                    dirty = false;
                    let _ = ack.send(());
                }
                None => break,
            },
            _ = ticker.tick() => {
                if dirty {
                    publish(&projection);
                    dirty = false;
                }
            }
        }
    }

    publish(&projection);
    tracing::debug!("Attendance aggregator stopped");
}
