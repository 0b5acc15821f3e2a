// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Minute-aligned scheduler driving the lifecycle.
//!
//! The clock ticks every second but only acts when the tick's Unix timestamp
//! is a whole minute. Each pass ends overdue reservations, then starts due
//! ones, then hands the active set to the health worker without waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gamelease_types::ReservationState;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::filesync::FileTransport;
use crate::lifecycle::ReservationLifecycle;
use crate::rcon::RemoteCommandChannel;
use crate::shell::RemoteShell;
use crate::store::{ReservationStore, StoreError};

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckJob {
    pub reservation_ids: Vec<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub ended: usize,
    pub started: usize,
    pub health_checks: usize,
}

pub fn is_minute_boundary(now: DateTime<Utc>) -> bool {
    now.timestamp().rem_euclid(60) == 0
}

pub struct ReservationClock<St, R, F, S> {
    lifecycle: Arc<ReservationLifecycle<St, R, F, S>>,
    health: mpsc::Sender<HealthCheckJob>,
    last_minute: Option<i64>,
}

impl<St, R, F, S> ReservationClock<St, R, F, S>
where
    St: ReservationStore,
    R: RemoteCommandChannel,
    F: FileTransport,
    S: RemoteShell,
{
    pub fn new(
        lifecycle: Arc<ReservationLifecycle<St, R, F, S>>,
        health: mpsc::Sender<HealthCheckJob>,
    ) -> Self {
        Self {
            lifecycle,
            health,
            last_minute: None,
        }
    }

    /// Tick until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("reservation clock running");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("reservation clock stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// Handle one tick. Returns the pass summary when a pass ran.
    ///
    /// A minute is only processed once even if the boundary is observed by
    /// more than one tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<PassSummary> {
        if !is_minute_boundary(now) {
            return None;
        }
        let minute = now.timestamp().div_euclid(60);
        if self.last_minute == Some(minute) {
            debug!(%now, "minute already processed");
            return None;
        }
        self.last_minute = Some(minute);

        let lifecycle = self.lifecycle.clone();
        let health = self.health.clone();
        let pass = tokio::spawn(async move { minute_pass(&lifecycle, &health, now).await });

        match pass.await {
            Ok(Ok(summary)) => {
                info!(
                    %now,
                    ended = summary.ended,
                    started = summary.started,
                    health_checks = summary.health_checks,
                    "clock pass complete"
                );
                Some(summary)
            }
            Ok(Err(e)) => {
                error!(%now, error = %e, "clock pass failed, will retry next minute");
                None
            }
            Err(e) => {
                error!(%now, error = %e, "clock pass panicked");
                None
            }
        }
    }
}

#[tracing::instrument(skip_all, fields(now = %now))]
async fn minute_pass<St, R, F, S>(
    lifecycle: &ReservationLifecycle<St, R, F, S>,
    health: &mpsc::Sender<HealthCheckJob>,
    now: DateTime<Utc>,
) -> Result<PassSummary, StoreError>
where
    St: ReservationStore,
    R: RemoteCommandChannel,
    F: FileTransport,
    S: RemoteShell,
{
    let mut summary = PassSummary::default();

    for reservation in lifecycle.store().overdue_reservations(now).await? {
        match lifecycle.end_reservation(reservation.id, now).await {
            Ok(_) => summary.ended += 1,
            Err(e) => error!(reservation_id = %reservation.id, error = %e, "failed to end reservation"),
        }
    }

    for reservation in lifecycle.store().due_reservations(now).await? {
        match lifecycle.start_reservation(reservation.id, now).await {
            Ok(ReservationState::Active) => summary.started += 1,
            Ok(_) => {}
            Err(e) => error!(reservation_id = %reservation.id, error = %e, "failed to start reservation"),
        }
    }

    let active: Vec<Uuid> = lifecycle
        .store()
        .active_reservations(now)
        .await?
        .into_iter()
        .map(|r| r.id)
        .collect();
    if !active.is_empty() {
        let count = active.len();
        match health.try_send(HealthCheckJob {
            reservation_ids: active,
            at: now,
        }) {
            Ok(()) => summary.health_checks = count,
            Err(TrySendError::Full(_)) => warn!(count, "health worker busy, skipping this minute"),
            Err(TrySendError::Closed(_)) => warn!(count, "health worker gone"),
        }
    }

    Ok(summary)
}

/// Drain health-check jobs until every sender is dropped.
pub fn spawn_health_worker<St, R, F, S>(
    lifecycle: Arc<ReservationLifecycle<St, R, F, S>>,
    mut jobs: mpsc::Receiver<HealthCheckJob>,
) -> JoinHandle<()>
where
    St: ReservationStore,
    R: RemoteCommandChannel,
    F: FileTransport,
    S: RemoteShell,
{
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            debug!(count = job.reservation_ids.len(), at = %job.at, "running health checks");
            lifecycle
                .check_active_reservations(&job.reservation_ids, job.at)
                .await;
        }
        info!("health worker stopped");
    })
}
