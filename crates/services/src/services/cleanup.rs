//! Periodic removal of expired sessions and verification tokens.

use std::time::Duration;

use chrono::Utc;
use db::{
    DBService,
    models::{session::Session, verification::Verification},
};
use thiserror::Error;
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, error, info};

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions: u64,
    pub verifications: u64,
}

/// Background service that prunes expired auth rows
pub struct SessionCleanupService {
    db: DBService,
    poll_interval: Duration,
}

impl SessionCleanupService {
    pub fn new(db: DBService, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }

    pub fn spawn(db: DBService) -> JoinHandle<()> {
        let service = Self::new(db, CLEANUP_INTERVAL);
        tokio::spawn(async move {
            service.start().await;
        })
    }

    async fn start(&self) {
        info!(interval = ?self.poll_interval, "Starting session cleanup service");
        let mut interval = interval(self.poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Session cleanup failed");
            }
        }
    }

    pub async fn run_once(&self) -> Result<CleanupReport, CleanupError> {
        let now = Utc::now();
        let report = CleanupReport {
            sessions: Session::delete_expired(&self.db.pool, now).await?,
            verifications: Verification::delete_expired(&self.db.pool, now).await?,
        };
        if report == CleanupReport::default() {
            debug!("Session cleanup: nothing expired");
        } else {
            info!(
                sessions = report.sessions,
                verifications = report.verifications,
                "Session cleanup removed expired rows"
            );
        }
        Ok(report)
    }
}
