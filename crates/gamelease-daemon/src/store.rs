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

//! Persistence seam for reservations, servers and players.
//!
//! Every query re-derives its result from stored rows, so a pass that fails
//! halfway can simply be re-run on the next clock tick.

use std::future::Future;

use chrono::{DateTime, Utc};
use gamelease_types::{Reservation, ReservationPlayer, Server};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("reservation overlaps another reservation on the same server")]
    Overlap,

    #[error("record not found")]
    NotFound,
}

pub trait ReservationStore: Send + Sync + 'static {
    /// Insert a new reservation; fails with [`StoreError::Overlap`] when the
    /// server already has a reservation intersecting its window.
    fn insert_reservation(
        &self,
        reservation: &Reservation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_reservation(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Reservation>, StoreError>> + Send;

    fn delete_reservation(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_server(&self, id: Uuid) -> impl Future<Output = Result<Option<Server>, StoreError>> + Send;

    /// Reservations for which [`Reservation::is_overdue`] holds at `now`.
    fn overdue_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Reservation>, StoreError>> + Send;

    /// Reservations for which [`Reservation::is_newly_due`] holds at `now`.
    fn due_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Reservation>, StoreError>> + Send;

    /// Reservations for which [`Reservation::is_active_at`] holds at `now`.
    fn active_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Reservation>, StoreError>> + Send;

    /// Whether any reservation other than `exclude` on `server_id` intersects the window.
    fn has_overlap(
        &self,
        server_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Set `provisioned` and lock the current password.
    fn mark_provisioned(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set `ended`; a reservation ended early has `ends_at` pulled in to `at`.
    fn mark_ended(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Flag the reservation for the instant-end path, pulling `ends_at` in to `ends_at`.
    fn mark_end_instantly(
        &self,
        id: Uuid,
        ends_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_ends_at(
        &self,
        id: Uuid,
        ends_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn record_health(
        &self,
        id: Uuid,
        last_number_of_players: i32,
        inactive_minute_counter: i32,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_server_address(
        &self,
        server_id: Uuid,
        addr: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_player(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ReservationPlayer>, StoreError>> + Send;

    fn reservation_players(
        &self,
        reservation_id: Uuid,
    ) -> impl Future<Output = Result<Vec<ReservationPlayer>, StoreError>> + Send;

    fn mark_player_whitelisted(
        &self,
        player_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append a human-readable entry to the reservation's status history.
    fn add_status(
        &self,
        reservation_id: Uuid,
        status: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
