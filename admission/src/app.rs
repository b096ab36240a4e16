//! Application coordinator: wires the store, codec, services and router.

use crate::attendance::{AggregatorConfig, AttendanceAggregator};
use crate::config::{AttendanceConfig, Config, ConfigError, StoreBackend};
use crate::issuance::IssuanceService;
use crate::server::{AppState, build_router};
use crate::validation::ValidationEngine;
use admission_core::codec::TokenCodec;
use admission_core::environment::{Clock, SystemClock};
use admission_core::memory::InMemoryTicketStore;
use admission_core::store::{StoreError, TicketStore};
use admission_core::types::AdmissionPolicy;
use admission_postgres::PostgresTicketStore;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors initializing the application.
#[derive(Error, Debug)]
pub enum AppInitError {
    /// Configuration was invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The ticket store could not be opened
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<AttendanceConfig> for AggregatorConfig {
    fn from(config: AttendanceConfig) -> Self {
        Self {
            bucket: chrono::Duration::seconds(config.bucket_secs.max(1)),
            refresh_interval: Duration::from_millis(config.refresh_ms.max(1)),
            channel_capacity: config.channel_capacity,
            recent_limit: config.recent_scans,
        }
    }
}

/// The running admission service.
pub struct AdmissionApp {
    state: AppState,
    codec: Arc<TokenCodec>,
    attendance_worker: JoinHandle<()>,
}

impl AdmissionApp {
    /// Build the application from configuration, connecting to `PostgreSQL`
    /// and running migrations when that backend is selected.
    ///
    /// # Errors
    ///
    /// Returns [`AppInitError`] if the keyring is invalid or the store cannot
    /// be opened.
    pub async fn new(config: &Config) -> Result<Self, AppInitError> {
        tracing::info!("Initializing admission service...");

        let keyring = config.signing.keyring()?;
        let codec = Arc::new(TokenCodec::new(keyring));
        tracing::info!(key_id = %codec.signing_key_id(), "✓ Signing keyring loaded");

        let store: Arc<dyn TicketStore> = match config.store.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory ticket store; tickets are lost on restart");
                Arc::new(InMemoryTicketStore::new())
            }
            StoreBackend::Postgres => {
                tracing::info!("Connecting to PostgreSQL...");
                let postgres = PostgresTicketStore::connect(
                    &config.store.database_url,
                    config.store.max_connections,
                    Duration::from_secs(config.store.connect_timeout),
                )
                .await?;
                tracing::info!("Running database migrations...");
                postgres.migrate().await?;
                Arc::new(postgres)
            }
        };
        tracing::info!(backend = ?config.store.backend, "✓ Ticket store initialized");

        Ok(Self::with_components(
            store,
            codec,
            Arc::new(SystemClock),
            config.policy.policy(),
            config.attendance.into(),
        ))
    }

    /// Assemble the application from ready-made parts.
    ///
    /// Spawns the attendance worker, so it must be called inside a Tokio runtime.
    #[must_use]
    pub fn with_components(
        store: Arc<dyn TicketStore>,
        codec: Arc<TokenCodec>,
        clock: Arc<dyn Clock>,
        policy: AdmissionPolicy,
        attendance: AggregatorConfig,
    ) -> Self {
        let (aggregator, attendance_worker) =
            AttendanceAggregator::spawn(attendance, Arc::clone(&store), Arc::clone(&clock));

        let issuance = Arc::new(IssuanceService::new(
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&clock),
            policy,
        ));
        let validation = Arc::new(
            ValidationEngine::new(Arc::clone(&store), Arc::clone(&codec), Arc::clone(&clock))
                .with_attendance(aggregator.clone()),
        );
        tracing::info!("✓ Issuance, validation and attendance services started");

        Self {
            state: AppState::new(store, issuance, validation, aggregator, clock),
            codec,
            attendance_worker,
        }
    }

    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Router serving the HTTP API
    #[must_use]
    pub fn router(&self) -> Router {
        build_router(self.state())
    }

    /// Issuance service
    #[must_use]
    pub fn issuance(&self) -> Arc<IssuanceService> {
        Arc::clone(&self.state.issuance)
    }

    /// Validation engine
    #[must_use]
    pub fn validation(&self) -> Arc<ValidationEngine> {
        Arc::clone(&self.state.validation)
    }

    /// Attendance aggregator
    #[must_use]
    pub fn attendance(&self) -> AttendanceAggregator {
        self.state.attendance.clone()
    }

    /// Token codec, for key rotation
    #[must_use]
    pub fn codec(&self) -> Arc<TokenCodec> {
        Arc::clone(&self.codec)
    }

    /// Stop the attendance worker after it publishes a final board.
    ///
    /// Routers built from this app must be dropped first, or the worker
    /// keeps running until `timeout` elapses.
    pub async fn shutdown(self, timeout: Duration) {
        let Self {
            state,
            codec: _,
            attendance_worker,
        } = self;
        drop(state);

        match tokio::time::timeout(timeout, attendance_worker).await {
            Ok(Ok(())) => tracing::info!("✓ Attendance aggregator stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Attendance aggregator task failed"),
            Err(_) => tracing::warn!(timeout_secs = timeout.as_secs(), "Attendance aggregator did not stop in time"),
        }
    }
}
