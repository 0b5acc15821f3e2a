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

use chrono::{DateTime, Duration, Utc};
use gamelease_types::{Reservation, ReservationPlayer, Server};
use ipnetwork::IpNetwork;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{ReservationStore, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    user_id: Uuid,
    server_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    provisioned: bool,
    ended: bool,
    start_instantly: bool,
    end_instantly: bool,
    auto_end: bool,
    inactive_minute_counter: i32,
    last_number_of_players: i32,
    first_map: String,
    password: String,
    rcon: String,
    tv_password: String,
    locked_password: Option<String>,
}

impl From<ReservationRow> for Reservation {
    fn from(row: ReservationRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            server_id: row.server_id,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            provisioned: row.provisioned,
            ended: row.ended,
            start_instantly: row.start_instantly,
            end_instantly: row.end_instantly,
            auto_end: row.auto_end,
            inactive_minute_counter: row.inactive_minute_counter,
            last_number_of_players: row.last_number_of_players,
            first_map: row.first_map,
            password: row.password,
            rcon: row.rcon,
            tv_password: row.tv_password,
            locked_password: row.locked_password,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ServerRow {
    id: Uuid,
    name: String,
    ip: String,
    port: i32,
    rcon_password: String,
    ftp_port: i32,
    ftp_user: String,
    ftp_password: String,
    game_dir: String,
    ssh_user: String,
    ssh_port: i32,
    service_unit: String,
    sdr: bool,
    mitigations_enabled: bool,
    last_known_addr: Option<String>,
}

impl From<ServerRow> for Server {
    fn from(row: ServerRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            ip: row.ip,
            port: row.port as u16,
            rcon_password: row.rcon_password,
            ftp_port: row.ftp_port as u16,
            ftp_user: row.ftp_user,
            ftp_password: row.ftp_password,
            game_dir: row.game_dir,
            ssh_user: row.ssh_user,
            ssh_port: row.ssh_port as u16,
            service_unit: row.service_unit,
            sdr: row.sdr,
            mitigations_enabled: row.mitigations_enabled,
            last_known_addr: row.last_known_addr,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlayerRow {
    id: Uuid,
    reservation_id: Uuid,
    steam_uid: String,
    ip: IpNetwork,
    whitelisted: bool,
    created_at: DateTime<Utc>,
}

impl From<PlayerRow> for ReservationPlayer {
    fn from(row: PlayerRow) -> Self {
        Self {
            id: row.id,
            reservation_id: row.reservation_id,
            steam_uid: row.steam_uid,
            ip: row.ip.ip(),
            whitelisted: row.whitelisted,
            created_at: row.created_at,
        }
    }
}

fn map_overlap(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db_err)
            if matches!(
                db_err.constraint(),
                Some("reservations_no_overlap" | "reservations_server_id_starts_at_key")
            ) =>
        {
            StoreError::Overlap
        }
        _ => StoreError::Database(e),
    }
}

const OVERLAP_QUERY: &str = "SELECT EXISTS (
        SELECT 1 FROM reservations
        WHERE server_id = $1 AND starts_at < $3 AND ends_at > $2
          AND ($4::uuid IS NULL OR id <> $4)
    )";

// ---------------------------------------------------------------------------
// PgReservationStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_server(tx: &mut Transaction<'_, Postgres>, server_id: Uuid) -> Result<()> {
        sqlx::query("SELECT id FROM servers WHERE id = $1 FOR UPDATE")
            .bind(server_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn touch(&self, query: &'static str, id: Uuid) -> Result<()> {
        let result = sqlx::query(query).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

impl ReservationStore for PgReservationStore {
    #[tracing::instrument(skip_all, fields(reservation_id = %reservation.id))]
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_server(&mut tx, reservation.server_id).await?;

        let (overlaps,): (bool,) = sqlx::query_as(OVERLAP_QUERY)
            .bind(reservation.server_id)
            .bind(reservation.starts_at)
            .bind(reservation.ends_at)
            .bind(None::<Uuid>)
            .fetch_one(&mut *tx)
            .await?;
        if overlaps {
            return Err(StoreError::Overlap);
        }

        sqlx::query(
            "INSERT INTO reservations (id, user_id, server_id, starts_at, ends_at, provisioned, ended,
                start_instantly, end_instantly, auto_end, inactive_minute_counter, last_number_of_players,
                first_map, password, rcon, tv_password, locked_password)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(reservation.id)
        .bind(reservation.user_id)
        .bind(reservation.server_id)
        .bind(reservation.starts_at)
        .bind(reservation.ends_at)
        .bind(reservation.provisioned)
        .bind(reservation.ended)
        .bind(reservation.start_instantly)
        .bind(reservation.end_instantly)
        .bind(reservation.auto_end)
        .bind(reservation.inactive_minute_counter)
        .bind(reservation.last_number_of_players)
        .bind(&reservation.first_map)
        .bind(&reservation.password)
        .bind(&reservation.rcon)
        .bind(&reservation.tv_password)
        .bind(&reservation.locked_password)
        .execute(&mut *tx)
        .await
        .map_err(map_overlap)?;

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        let row = sqlx::query_as::<_, ReservationRow>("SELECT * FROM reservations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    #[tracing::instrument(skip(self))]
    async fn delete_reservation(&self, id: Uuid) -> Result<()> {
        self.touch("DELETE FROM reservations WHERE id = $1", id).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    #[tracing::instrument(skip(self))]
    async fn overdue_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM reservations
             WHERE ends_at < $1 AND provisioned AND NOT ended AND NOT end_instantly
             ORDER BY ends_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        debug!(count = rows.len(), "overdue reservations");
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn due_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM reservations
             WHERE NOT provisioned AND NOT ended
               AND ((starts_at >= $1 AND starts_at < $2 AND NOT start_instantly)
                    OR (starts_at < $1 AND ends_at > $1))
             ORDER BY starts_at",
        )
        .bind(now)
        .bind(now + Duration::minutes(1))
        .fetch_all(&self.pool)
        .await?;
        debug!(count = rows.len(), "due reservations");
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn active_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM reservations
             WHERE provisioned AND NOT ended AND starts_at <= $1 AND ends_at > $1
             ORDER BY starts_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn has_overlap(
        &self,
        server_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        let (overlaps,): (bool,) = sqlx::query_as(OVERLAP_QUERY)
            .bind(server_id)
            .bind(starts_at)
            .bind(ends_at)
            .bind(exclude)
            .fetch_one(&self.pool)
            .await?;
        Ok(overlaps)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_provisioned(&self, id: Uuid) -> Result<()> {
        self.touch(
            "UPDATE reservations
             SET provisioned = true, locked_password = COALESCE(locked_password, password),
                 updated_at = now()
             WHERE id = $1",
            id,
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn mark_ended(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE reservations
             SET ended = true, ends_at = LEAST(ends_at, GREATEST(starts_at, $2)), updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_end_instantly(&self, id: Uuid, ends_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE reservations
             SET end_instantly = true, ends_at = LEAST(ends_at, GREATEST(starts_at, $2)),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(ends_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_ends_at(&self, id: Uuid, ends_at: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("UPDATE reservations SET ends_at = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(ends_at)
                .execute(&self.pool)
                .await
                .map_err(map_overlap)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn record_health(
        &self,
        id: Uuid,
        last_number_of_players: i32,
        inactive_minute_counter: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE reservations
             SET last_number_of_players = $2, inactive_minute_counter = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(last_number_of_players)
        .bind(inactive_minute_counter)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_server_address(&self, server_id: Uuid, addr: &str) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET last_known_addr = $2, updated_at = now()
             WHERE id = $1 AND last_known_addr IS DISTINCT FROM $2",
        )
        .bind(server_id)
        .bind(addr)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_player(&self, id: Uuid) -> Result<Option<ReservationPlayer>> {
        let row = sqlx::query_as::<_, PlayerRow>("SELECT * FROM reservation_players WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    #[tracing::instrument(skip(self))]
    async fn reservation_players(&self, reservation_id: Uuid) -> Result<Vec<ReservationPlayer>> {
        let rows = sqlx::query_as::<_, PlayerRow>(
            "SELECT * FROM reservation_players WHERE reservation_id = $1 ORDER BY created_at",
        )
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_player_whitelisted(&self, player_id: Uuid) -> Result<()> {
        self.touch(
            "UPDATE reservation_players SET whitelisted = true WHERE id = $1 AND NOT whitelisted",
            player_id,
        )
        .await
        .or_else(|e| match e {
            // already whitelisted by a concurrent call
            StoreError::NotFound => Ok(()),
            other => Err(other),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn add_status(&self, reservation_id: Uuid, status: &str) -> Result<()> {
        sqlx::query("INSERT INTO reservation_statuses (reservation_id, status) VALUES ($1, $2)")
            .bind(reservation_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
