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

//! Reservation state machine.
//!
//! Every transition takes the tick's timestamp instead of reading the clock,
//! and every transition is safe to run twice: repeating one on a reservation
//! that already moved on is a no-op at the data layer.
//!
//! Remote failures never escape `start_reservation` or `end_reservation`. A
//! failed start leaves the reservation pending for the next due check; a
//! failed teardown is logged and the reservation is ended regardless.
//!
//! Transitions on one reservation run one at a time. Each waits for the
//! reservation's lock, then re-reads it and decides from what it finds.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use gamelease_types::{NewReservation, Reservation, ReservationState, Server, ValidationError};
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, DaemonToml};
use crate::filesync::{FileSyncChannel, FileSyncError, FileTransport};
use crate::mitigation::{MitigationError, MitigationSettings, NetworkMitigationController};
use crate::rcon::{RemoteCommandChannel, parse_status};
use crate::restart::{RestartOutcome, RestartStrategy};
use crate::shell::RemoteShell;
use crate::store::{ReservationStore, StoreError};

pub const RESERVATION_CONFIG: &str = "cfg/reservation.cfg";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("reservation {0} not found")]
    NotFound(Uuid),

    #[error("server {0} not found")]
    ServerNotFound(Uuid),

    #[error("player {0} not found")]
    PlayerNotFound(Uuid),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Mitigation(MitigationError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Overlap => Self::Validation(ValidationError::Overlap),
            other => Self::Store(other),
        }
    }
}

/// A remote step that failed while provisioning.
#[derive(Debug, Error)]
enum ProvisionError {
    #[error("config upload failed: {0}")]
    Upload(#[from] FileSyncError),

    #[error("restart failed: {0}")]
    Restart(String),

    #[error("mitigations failed: {0}")]
    Mitigation(#[from] MitigationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Not active at the check's timestamp.
    Skipped,
    /// The server could not be queried.
    Unknown,
    Players(u32),
    /// Empty; carries the consecutive empty checks so far.
    Idle(i32),
    AutoEnded,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub idle_threshold: i32,
    pub extension: Duration,
    pub extend_window: Duration,
    pub download_dir: PathBuf,
}

impl From<&DaemonToml> for LifecycleSettings {
    fn from(config: &DaemonToml) -> Self {
        Self {
            idle_threshold: config.lifecycle.idle_threshold_minutes,
            extension: Duration::minutes(config.lifecycle.extension_minutes),
            extend_window: Duration::minutes(config.lifecycle.extend_window_minutes),
            download_dir: config.ftp.download_dir.clone(),
        }
    }
}

/// Exclusive hold on one reservation's transitions.
struct Transition<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    states: &'a DashMap<Uuid, ReservationState>,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Transition<'_> {
    /// Publish the intermediate state to `current_state` until the hold ends.
    fn enter(&self, state: ReservationState) {
        self.states.insert(self.id, state);
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.states.remove(&self.id);
        drop(self.guard.take());
        // Waiters hold a clone of the Arc, so the entry stays while anyone queues on it.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn render_config(reservation: &Reservation, server: &Server) -> String {
    format!(
        "hostname \"{name}\"\n\
         sv_password \"{password}\"\n\
         rcon_password \"{rcon}\"\n\
         tv_enable 1\n\
         tv_password \"{tv}\"\n\
         tv_relaypassword \"{tv}\"\n",
        name = server.name.replace('"', "'"),
        password = reservation.password,
        rcon = reservation.rcon,
        tv = reservation.tv_password,
    )
}

pub struct ReservationLifecycle<St, R, F, S> {
    store: Arc<St>,
    rcon: Arc<R>,
    restart: RestartStrategy<R, S>,
    files: FileSyncChannel<F>,
    mitigation: NetworkMitigationController<S>,
    settings: LifecycleSettings,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    states: DashMap<Uuid, ReservationState>,
}

impl<St, R, F, S> ReservationLifecycle<St, R, F, S>
where
    St: ReservationStore,
    R: RemoteCommandChannel,
    F: FileTransport,
    S: RemoteShell,
{
    pub fn new(
        store: Arc<St>,
        rcon: Arc<R>,
        transport: Arc<F>,
        shell: Arc<S>,
        config: &DaemonToml,
    ) -> Result<Self, ConfigError> {
        let restart = RestartStrategy::new(
            rcon.clone(),
            shell.clone(),
            config.rcon.status_marker.clone(),
            config.rcon.kick_message.clone(),
        );
        let files = FileSyncChannel::new(
            transport,
            config.ftp.batch_size,
            std::time::Duration::from_secs(config.ftp.batch_timeout_secs),
            config.ftp.max_concurrent_batches,
        );
        let mitigation =
            NetworkMitigationController::new(shell, MitigationSettings::try_from(&config.mitigation)?);

        Ok(Self {
            store,
            rcon,
            restart,
            files,
            mitigation,
            settings: LifecycleSettings::from(config),
            locks: DashMap::new(),
            states: DashMap::new(),
        })
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Wait for every other transition on `id` to finish.
    async fn lock(&self, id: Uuid) -> Transition<'_> {
        let lock = self.locks.entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        Transition {
            locks: &self.locks,
            states: &self.states,
            id,
            guard: Some(guard),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Reservation, LifecycleError> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    async fn server(&self, id: Uuid) -> Result<Server, LifecycleError> {
        self.store
            .get_server(id)
            .await?
            .ok_or(LifecycleError::ServerNotFound(id))
    }

    /// Status history is informational; failing to write it never blocks a transition.
    async fn status(&self, id: Uuid, status: &str) {
        if let Err(e) = self.store.add_status(id, status).await {
            warn!(reservation_id = %id, error = %e, "failed to record status");
        }
    }

    /// State including transitions currently running in this process.
    pub async fn current_state(&self, id: Uuid) -> Result<ReservationState, LifecycleError> {
        if let Some(state) = self.states.get(&id) {
            return Ok(*state);
        }
        Ok(self.load(id).await?.state())
    }

    #[tracing::instrument(skip_all, fields(server_id = %new.server_id))]
    pub async fn create_reservation(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LifecycleError> {
        new.validate()?;
        self.server(new.server_id).await?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            server_id: new.server_id,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            provisioned: false,
            ended: false,
            start_instantly: new.start_instantly,
            end_instantly: false,
            auto_end: new.auto_end,
            inactive_minute_counter: 0,
            last_number_of_players: 0,
            first_map: new.first_map,
            password: generate_secret(8),
            rcon: generate_secret(16),
            tv_password: generate_secret(8),
            locked_password: None,
        };

        self.store.insert_reservation(&reservation).await?;
        info!(reservation_id = %reservation.id, "reservation created");
        self.status(reservation.id, "Reservation created").await;

        if reservation.start_instantly {
            self.start_reservation(reservation.id, now).await?;
            return self.load(reservation.id).await;
        }
        Ok(reservation)
    }

    /// Hard-delete a reservation that never started.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_reservation(&self, id: Uuid) -> Result<(), LifecycleError> {
        let _transition = self.lock(id).await;
        let state = self.load(id).await?.state();
        if state != ReservationState::Pending {
            return Err(ValidationError::InvalidState {
                action: "cancel",
                state,
            }
            .into());
        }
        self.store.delete_reservation(id).await?;
        info!(reservation_id = %id, "reservation cancelled");
        Ok(())
    }

    async fn provision(&self, reservation: &Reservation, server: &Server) -> Result<(), ProvisionError> {
        self.files
            .upload(
                server,
                &server.game_path(RESERVATION_CONFIG),
                render_config(reservation, server).into_bytes(),
            )
            .await?;

        match self
            .restart
            .restart(server, &server.rcon_password, &reservation.first_map)
            .await
        {
            RestartOutcome::Fast(status) => {
                if let Some(addr) = status.public_addr
                    && server.last_known_addr.as_deref() != Some(addr.as_str())
                {
                    info!(server = %server.name, addr = %addr, "server address changed");
                    if let Err(e) = self.store.update_server_address(server.id, &addr).await {
                        warn!(server = %server.name, error = %e, "failed to record server address");
                    }
                }
            }
            RestartOutcome::Slow => {}
            RestartOutcome::Failed(reason) => return Err(ProvisionError::Restart(reason)),
        }

        if server.mitigations_enabled {
            self.mitigation.apply(server, reservation.id).await?;
        }
        Ok(())
    }

    /// Configure and start the remote server. Returns the state afterwards;
    /// `Pending` means the attempt failed and the next due check retries it.
    #[tracing::instrument(skip(self, now))]
    pub async fn start_reservation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReservationState, LifecycleError> {
        let transition = self.lock(id).await;
        let reservation = self.load(id).await?;
        let state = reservation.state();
        if !state.can_transition_to(ReservationState::Starting) {
            debug!(%state, "reservation not pending, nothing to start");
            return Ok(state);
        }
        transition.enter(ReservationState::Starting);

        let server = self.server(reservation.server_id).await?;
        info!(server = %server.name, starts_at = %reservation.starts_at, %now, "starting reservation");
        self.status(id, "Starting").await;

        match self.provision(&reservation, &server).await {
            Ok(()) => {
                self.store.mark_provisioned(id).await?;
                self.status(id, "Server started").await;
                info!(server = %server.name, "reservation started");
                Ok(ReservationState::Active)
            }
            Err(e) => {
                warn!(server = %server.name, error = %e, "start failed, will retry on next due check");
                self.status(id, &format!("Start failed: {e}")).await;
                Ok(ReservationState::Pending)
            }
        }
    }

    async fn teardown(&self, reservation: &Reservation, server: &Server) {
        let local_dir = self.settings.download_dir.join(reservation.id.to_string());
        match self.files.fetch_artifacts(server, &local_dir).await {
            Ok(report) if report.is_clean() => {
                debug!(files = report.completed.len(), "artifacts fetched");
            }
            Ok(report) => warn!(
                failed = report.failed.len(),
                abandoned = report.abandoned.len(),
                "some artifacts were not fetched"
            ),
            Err(e) => warn!(error = %e, "failed to fetch artifacts"),
        }

        if let Err(e) = self
            .files
            .delete(server, &server.game_path(RESERVATION_CONFIG))
            .await
        {
            warn!(error = %e, "failed to remove reservation config");
        }

        if server.mitigations_enabled
            && let Err(e) = self
                .mitigation
                .disable_mitigations(server, reservation.id, true)
                .await
        {
            warn!(error = %e, "failed to remove mitigations");
        }

        if let RestartOutcome::Failed(reason) = self
            .restart
            .restart(server, &reservation.rcon, &reservation.first_map)
            .await
        {
            warn!(reason = %reason, "failed to reset server after reservation");
        }
    }

    /// Tear the reservation down and mark it ended. Teardown failures are
    /// logged; the reservation is ended regardless.
    #[tracing::instrument(skip(self))]
    pub async fn end_reservation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReservationState, LifecycleError> {
        let transition = self.lock(id).await;
        self.end_locked(&transition, now).await
    }

    async fn end_locked(
        &self,
        transition: &Transition<'_>,
        now: DateTime<Utc>,
    ) -> Result<ReservationState, LifecycleError> {
        let id = transition.id;
        let reservation = self.load(id).await?;
        let state = reservation.state();
        if state.is_terminal() {
            debug!("already ended");
            return Ok(state);
        }
        transition.enter(ReservationState::Ending);

        if state == ReservationState::Active {
            info!("ending reservation");
            self.status(id, "Ending").await;
            match self.store.get_server(reservation.server_id).await {
                Ok(Some(server)) => self.teardown(&reservation, &server).await,
                Ok(None) => error!(server_id = %reservation.server_id, "server missing, skipping teardown"),
                Err(e) => error!(error = %e, "failed to load server, skipping teardown"),
            }
        } else {
            debug!(%state, "never provisioned, nothing to tear down");
        }

        self.store.mark_ended(id, now).await?;
        self.status(id, "Ended").await;
        info!("reservation ended");
        Ok(ReservationState::Ended)
    }

    /// User-requested end, bypassing the clock.
    #[tracing::instrument(skip(self))]
    pub async fn end_reservation_instantly(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReservationState, LifecycleError> {
        let transition = self.lock(id).await;
        let reservation = self.load(id).await?;
        if reservation.state().is_terminal() {
            return Ok(ReservationState::Ended);
        }
        self.store.mark_end_instantly(id, now).await?;
        self.end_locked(&transition, now).await
    }

    /// Push `ends_at` out by the configured extension. Only active
    /// reservations in their final window can be extended.
    #[tracing::instrument(skip(self))]
    pub async fn extend_reservation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let _transition = self.lock(id).await;
        let reservation = self.load(id).await?;
        if !reservation.is_active_at(now) {
            debug!(state = %reservation.state(), "not active, cannot extend");
            return Ok(false);
        }
        if reservation.remaining(now) > self.settings.extend_window {
            return Err(ValidationError::TooEarlyToExtend {
                window_minutes: self.settings.extend_window.num_minutes(),
            }
            .into());
        }

        let new_end = reservation.ends_at + self.settings.extension;
        if self
            .store
            .has_overlap(reservation.server_id, reservation.ends_at, new_end, Some(id))
            .await?
        {
            return Err(ValidationError::Overlap.into());
        }

        self.store.update_ends_at(id, new_end).await?;
        self.status(id, &format!("Extended until {}", new_end.format("%H:%M"))).await;
        info!(ends_at = %new_end, "reservation extended");
        Ok(true)
    }

    /// Query the live player count and apply the idle policy.
    #[tracing::instrument(skip(self))]
    pub async fn check_active_reservation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<HealthOutcome, LifecycleError> {
        let transition = self.lock(id).await;
        let reservation = self.load(id).await?;
        if !reservation.is_active_at(now) {
            return Ok(HealthOutcome::Skipped);
        }
        let server = self.server(reservation.server_id).await?;

        let players = match self
            .rcon
            .execute(&server.rcon_addr(), &reservation.rcon, "status")
            .await
        {
            Ok(response) => parse_status(&response).players,
            Err(e) => {
                warn!(server = %server.name, error = %e, "health check could not reach server");
                None
            }
        };
        let Some(players) = players else {
            return Ok(HealthOutcome::Unknown);
        };

        if players > 0 {
            self.store
                .record_health(id, i32::try_from(players).unwrap_or(i32::MAX), 0)
                .await?;
            return Ok(HealthOutcome::Players(players));
        }

        let idle = reservation.inactive_minute_counter + 1;
        self.store.record_health(id, 0, idle).await?;

        if reservation.auto_end && idle >= self.settings.idle_threshold {
            info!(idle_minutes = idle, "server idle, ending reservation");
            self.status(id, &format!("Auto-ended after {idle} idle minutes"))
                .await;
            self.end_locked(&transition, now).await?;
            return Ok(HealthOutcome::AutoEnded);
        }
        Ok(HealthOutcome::Idle(idle))
    }

    /// Health-check a batch; one failing reservation does not stop the rest.
    pub async fn check_active_reservations(&self, ids: &[Uuid], now: DateTime<Utc>) {
        for &id in ids {
            if let Err(e) = self.check_active_reservation(id, now).await {
                error!(reservation_id = %id, error = %e, "health check failed");
            }
        }
    }

    /// Let a player's address through the reservation's mitigation chain.
    #[tracing::instrument(skip(self))]
    pub async fn allow_player(&self, player_id: Uuid) -> Result<bool, LifecycleError> {
        let player = self
            .store
            .get_player(player_id)
            .await?
            .ok_or(LifecycleError::PlayerNotFound(player_id))?;
        let reservation = self.load(player.reservation_id).await?;
        if reservation.state() != ReservationState::Active {
            return Ok(false);
        }
        let server = self.server(reservation.server_id).await?;
        if !server.mitigations_enabled {
            return Ok(false);
        }
        self.mitigation
            .allow_reservation_player(&*self.store, &server, &player)
            .await
            .map_err(LifecycleError::Mitigation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_alphanumeric() {
        let secret = generate_secret(16);
        assert_eq!(secret.len(), 16);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret(16));
    }

    #[test]
    fn config_contains_reservation_secrets() {
        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            starts_at: Utc::now(),
            ends_at: Utc::now() + Duration::hours(2),
            provisioned: false,
            ended: false,
            start_instantly: false,
            end_instantly: false,
            auto_end: true,
            inactive_minute_counter: 0,
            last_number_of_players: 0,
            first_map: "koth_product_final".into(),
            password: "joinme".into(),
            rcon: "r3con".into(),
            tv_password: "watch".into(),
            locked_password: None,
        };
        let server = Server {
            id: reservation.server_id,
            name: "Frankfurt \"#2\"".into(),
            ip: "10.0.0.2".into(),
            port: 27015,
            rcon_password: "default".into(),
            ftp_port: 21,
            ftp_user: "tf".into(),
            ftp_password: "tf".into(),
            game_dir: "tf".into(),
            ssh_user: "ops".into(),
            ssh_port: 22,
            service_unit: "tf2@2".into(),
            sdr: false,
            mitigations_enabled: false,
            last_known_addr: None,
        };

        let cfg = render_config(&reservation, &server);
        assert!(cfg.contains("sv_password \"joinme\""));
        assert!(cfg.contains("rcon_password \"r3con\""));
        assert!(cfg.contains("tv_password \"watch\""));
        assert!(cfg.contains("hostname \"Frankfurt '#2'\""));
    }
}
