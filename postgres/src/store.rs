//! `PostgreSQL`-backed [`TicketStore`].

use admission_core::store::{
    Precondition, StateCounts, StoreError, StoreFuture, TicketChange, TicketStore, WriteOutcome,
};
use admission_core::types::{
    Cancellation, DeviceId, EventId, ScanLocation, ScanMetadata, SigningNonce, Ticket, TicketId,
    TicketState, UserId, ValidityWindow,
};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;
use uuid::Uuid;

const TICKET_COLUMNS: &str = "id, event_id, user_id, state, issued_at, valid_from, valid_until, \
     scanned_at, scan_recorded_at, scan_location, scan_device_id, regeneration_count, \
     signing_nonce, cancelled_at, cancellation_reason";

const ONE_ACTIVE_PER_PAIR: &str = "tickets_one_active_per_pair";
const UNIQUE_VIOLATION: &str = "23505";

/// Ticket store over a `PostgreSQL` connection pool.
///
/// Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: PgPool,
}

impl PostgresTicketStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Create the `tickets` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    async fn active_holder(&self, event_id: EventId, user_id: UserId) -> Result<Option<TicketId>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM tickets WHERE event_id = $1 AND user_id = $2 AND state = 'active'",
        )
        .bind(event_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(|(id,)| TicketId::from_uuid(id)))
    }

    async fn list_where(&self, clause: &str, key: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE {clause}");
        let rows = sqlx::query(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn conditional_update(
        &self,
        id: TicketId,
        precondition: Precondition,
        change: &TicketChange,
    ) -> Result<Option<Ticket>, StoreError> {
        let guard = "WHERE id = $1 AND state = $2 AND ($3::BIGINT IS NULL OR signing_nonce = $3)";
        let nonce = precondition.nonce.map(nonce_to_db);
        let query = match change {
            TicketChange::MarkUsed(_) => format!(
                "UPDATE tickets SET state = 'used', scanned_at = $4, scan_recorded_at = $5, \
                 scan_location = $6, scan_device_id = $7 {guard} RETURNING {TICKET_COLUMNS}"
            ),
            TicketChange::RotateNonce(_) => format!(
                "UPDATE tickets SET state = 'active', signing_nonce = $4, \
                 regeneration_count = regeneration_count + 1, scanned_at = NULL, \
                 scan_recorded_at = NULL, scan_location = NULL, scan_device_id = NULL \
                 {guard} RETURNING {TICKET_COLUMNS}"
            ),
            TicketChange::Cancel { .. } => format!(
                "UPDATE tickets SET state = 'cancelled', cancelled_at = $4, cancellation_reason = $5 \
                 {guard} RETURNING {TICKET_COLUMNS}"
            ),
        };

        let base = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(precondition.state.as_str())
            .bind(nonce);
        let bound = match change {
            TicketChange::MarkUsed(scan) => base
                .bind(scan.scanned_at)
                .bind(scan.recorded_at)
                .bind(Option::<String>::from(scan.location.clone()))
                .bind(scan.device_id.as_str().to_string()),
            TicketChange::RotateNonce(next) => base.bind(nonce_to_db(*next)),
            TicketChange::Cancel { at, reason } => base.bind(*at).bind(reason.clone()),
        };

        let row = bound.fetch_optional(&self.pool).await.map_err(unavailable)?;
        row.as_ref().map(row_to_ticket).transpose()
    }
}

impl TicketStore for PostgresTicketStore {
    fn insert(&self, ticket: Ticket) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let scan = ticket.scan.as_ref();
            let cancellation = ticket.cancellation.as_ref();
            let result = sqlx::query(
                r"
                INSERT INTO tickets (
                    id, event_id, user_id, state, issued_at, valid_from, valid_until,
                    scanned_at, scan_recorded_at, scan_location, scan_device_id,
                    regeneration_count, signing_nonce, cancelled_at, cancellation_reason
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(ticket.id.as_uuid())
            .bind(ticket.event_id.as_uuid())
            .bind(ticket.user_id.as_uuid())
            .bind(ticket.state.as_str())
            .bind(ticket.issued_at)
            .bind(ticket.window.valid_from())
            .bind(ticket.window.valid_until())
            .bind(scan.map(|s| s.scanned_at))
            .bind(scan.map(|s| s.recorded_at))
            .bind(scan.and_then(|s| Option::<String>::from(s.location.clone())))
            .bind(scan.map(|s| s.device_id.as_str().to_string()))
            .bind(i32::try_from(ticket.regeneration_count).unwrap_or(i32::MAX))
            .bind(nonce_to_db(ticket.signing_nonce))
            .bind(cancellation.map(|c| c.at))
            .bind(cancellation.and_then(|c| c.reason.clone()))
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(ticket),
                Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                    if db.constraint() == Some(ONE_ACTIVE_PER_PAIR) {
                        let existing = self
                            .active_holder(ticket.event_id, ticket.user_id)
                            .await?
                            .ok_or_else(|| {
                                StoreError::Unavailable("active ticket vanished during insert".to_string())
                            })?;
                        Err(StoreError::ActiveTicketExists { existing })
                    } else {
                        Err(StoreError::DuplicateTicket(ticket.id))
                    }
                }
                Err(e) => Err(unavailable(e)),
            }
        })
    }

    fn get(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(self.fetch(id))
    }

    fn list_by_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(self.list_where("event_id = $1 ORDER BY issued_at, id", *event_id.as_uuid()))
    }

    fn list_by_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(self.list_where("user_id = $1 ORDER BY issued_at DESC, id", *user_id.as_uuid()))
    }

    fn state_counts(&self, event_id: EventId) -> StoreFuture<'_, StateCounts> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT state, COUNT(*) FROM tickets WHERE event_id = $1 GROUP BY state")
                    .bind(event_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(unavailable)?;

            let mut counts = StateCounts::default();
            for (state, count) in rows {
                let count = u64::try_from(count).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                match TicketState::parse(&state).map_err(|e| StoreError::Corrupt(e.to_string()))? {
                    TicketState::Active => counts.active = count,
                    TicketState::Used => counts.used = count,
                    TicketState::Cancelled => counts.cancelled = count,
                }
            }
            Ok(counts)
        })
    }

    fn transition(
        &self,
        id: TicketId,
        precondition: Precondition,
        change: TicketChange,
    ) -> StoreFuture<'_, WriteOutcome> {
        Box::pin(async move {
            change.check_from(precondition.state)?;

            if let Some(updated) = self.conditional_update(id, precondition, &change).await? {
                tracing::debug!(ticket_id = %id, state = %updated.state, "Ticket transition applied");
                return Ok(WriteOutcome::Applied(updated));
            }

            // The guarded UPDATE matched nothing: report what is there now.
            Ok(match self.fetch(id).await? {
                Some(current) => WriteOutcome::Conflict(current),
                None => WriteOutcome::NotFound,
            })
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
            Ok(())
        })
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    tracing::error!(error = %e, "Ticket store query failed");
    StoreError::Unavailable(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

/// Nonces are stored bit-for-bit in a signed `BIGINT`.
const fn nonce_to_db(nonce: SigningNonce) -> i64 {
    i64::from_ne_bytes(nonce.raw().to_ne_bytes())
}

const fn nonce_from_db(raw: i64) -> SigningNonce {
    SigningNonce::from_raw(u64::from_ne_bytes(raw.to_ne_bytes()))
}

fn row_to_ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    let state: String = row.try_get("state").map_err(corrupt)?;
    let valid_from: DateTime<Utc> = row.try_get("valid_from").map_err(corrupt)?;
    let valid_until: DateTime<Utc> = row.try_get("valid_until").map_err(corrupt)?;
    let regeneration_count: i32 = row.try_get("regeneration_count").map_err(corrupt)?;

    let scanned_at: Option<DateTime<Utc>> = row.try_get("scanned_at").map_err(corrupt)?;
    let recorded_at: Option<DateTime<Utc>> = row.try_get("scan_recorded_at").map_err(corrupt)?;
    let location: Option<String> = row.try_get("scan_location").map_err(corrupt)?;
    let device_id: Option<String> = row.try_get("scan_device_id").map_err(corrupt)?;
    let scan = match (scanned_at, recorded_at, device_id) {
        (Some(scanned_at), Some(recorded_at), Some(device_id)) => Some(ScanMetadata {
            scanned_at,
            recorded_at,
            location: ScanLocation::from(location),
            device_id: DeviceId::new(device_id),
        }),
        _ => None,
    };

    let cancelled_at: Option<DateTime<Utc>> = row.try_get("cancelled_at").map_err(corrupt)?;
    let cancellation_reason: Option<String> = row.try_get("cancellation_reason").map_err(corrupt)?;

    Ok(Ticket {
        id: TicketId::from_uuid(row.try_get("id").map_err(corrupt)?),
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(corrupt)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(corrupt)?),
        state: TicketState::parse(&state).map_err(corrupt)?,
        issued_at: row.try_get("issued_at").map_err(corrupt)?,
        window: ValidityWindow::new(valid_from, valid_until).map_err(corrupt)?,
        scan,
        regeneration_count: u32::try_from(regeneration_count).map_err(corrupt)?,
        signing_nonce: nonce_from_db(row.try_get("signing_nonce").map_err(corrupt)?),
        cancellation: cancelled_at.map(|at| Cancellation {
            at,
            reason: cancellation_reason,
        }),
    })
}
