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
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Shortest window a reservation may cover, in minutes.
pub const MIN_RESERVATION_MINUTES: i64 = 30;

/// A leased time window binding one user to one server.
///
/// The half-open interval `[starts_at, ends_at)` never overlaps another
/// reservation on the same server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique identifier.
    pub id: Uuid,
    /// Owner of the reservation.
    pub user_id: Uuid,
    /// Server the reservation is bound to.
    pub server_id: Uuid,
    /// Start of the window (inclusive).
    pub starts_at: DateTime<Utc>,
    /// End of the window (exclusive).
    pub ends_at: DateTime<Utc>,
    /// The remote server has been configured and started.
    pub provisioned: bool,
    /// Teardown has been attempted and recorded.
    pub ended: bool,
    /// Started synchronously at creation instead of by the clock.
    pub start_instantly: bool,
    /// Ended by user action instead of by the clock.
    pub end_instantly: bool,
    /// End automatically once the server has been empty long enough.
    pub auto_end: bool,
    /// Consecutive health checks that observed zero players.
    pub inactive_minute_counter: i32,
    /// Player count from the most recent health check.
    pub last_number_of_players: i32,
    /// Map loaded when the reservation starts.
    pub first_map: String,
    /// Server join password.
    pub password: String,
    /// RCON password while the reservation is active.
    pub rcon: String,
    /// SourceTV password.
    pub tv_password: String,
    /// Password as it was when the server was provisioned.
    pub locked_password: Option<String>,
}

impl Reservation {
    /// Current lifecycle state reconstructed from the storage flags.
    pub fn state(&self) -> ReservationState {
        ReservationState::from_flags(self.provisioned, self.ended)
    }

    /// Length of the reserved window.
    pub fn duration(&self) -> Duration {
        self.ends_at - self.starts_at
    }

    /// Time left until `ends_at`, zero once past.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.ends_at - now).max(Duration::zero())
    }

    /// Whether `[starts_at, ends_at)` intersects `[starts_at, ends_at)` of the other window.
    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        self.starts_at < ends_at && starts_at < self.ends_at
    }

    /// Provisioned, past its end, and not handled by the instant-end path.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.ends_at < now && self.provisioned && !self.ended && !self.end_instantly
    }

    /// Should be started by the clock pass running at `now`.
    ///
    /// Covers reservations starting within the next minute, and reservations
    /// whose window already began but whose start has not succeeded yet.
    pub fn is_newly_due(&self, now: DateTime<Utc>) -> bool {
        if self.provisioned || self.ended {
            return false;
        }
        let upcoming = self.starts_at >= now
            && self.starts_at < now + Duration::minutes(1)
            && !self.start_instantly;
        let retry = self.starts_at < now && now < self.ends_at;
        upcoming || retry
    }

    /// Running at `now` and eligible for a health check.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.provisioned && !self.ended && self.starts_at <= now && now < self.ends_at
    }
}

/// Parameters for booking a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    /// Owner of the reservation.
    pub user_id: Uuid,
    /// Server to reserve.
    pub server_id: Uuid,
    /// Start of the window.
    pub starts_at: DateTime<Utc>,
    /// End of the window.
    pub ends_at: DateTime<Utc>,
    /// Start right away instead of waiting for the clock.
    pub start_instantly: bool,
    /// End automatically when the server sits empty.
    pub auto_end: bool,
    /// Map to load on start.
    pub first_map: String,
}

impl NewReservation {
    /// Check the window invariants that do not need storage access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ends_at <= self.starts_at {
            return Err(ValidationError::EndsBeforeStart);
        }
        if self.ends_at - self.starts_at < Duration::minutes(MIN_RESERVATION_MINUTES) {
            return Err(ValidationError::TooShort {
                minutes: (self.ends_at - self.starts_at).num_minutes(),
            });
        }
        if self.first_map.trim().is_empty() {
            return Err(ValidationError::MissingMap);
        }
        if !is_valid_map_name(&self.first_map) {
            return Err(ValidationError::InvalidMap(self.first_map.clone()));
        }
        Ok(())
    }
}

/// Map names end up inside RCON command strings.
fn is_valid_map_name(map: &str) -> bool {
    map.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// Reasons a reservation change is rejected at the mutation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `ends_at` is not after `starts_at`.
    #[error("reservation must end after it starts")]
    EndsBeforeStart,

    /// Window shorter than [`MIN_RESERVATION_MINUTES`].
    #[error("reservation lasts {minutes} minutes, minimum is 30")]
    TooShort {
        /// Requested length.
        minutes: i64,
    },

    /// No first map given.
    #[error("a first map is required")]
    MissingMap,

    /// Map name with characters that are not allowed.
    #[error("invalid map name: {0}")]
    InvalidMap(String),

    /// Another reservation on the server intersects the window.
    #[error("reservation overlaps another reservation on this server")]
    Overlap,

    /// Extension requested while plenty of time remains.
    #[error("reservation can only be extended in its final {window_minutes} minutes")]
    TooEarlyToExtend {
        /// Window before `ends_at` in which extension is allowed.
        window_minutes: i64,
    },

    /// Transition not allowed from the current state.
    #[error("cannot {action} a reservation that is {state}")]
    InvalidState {
        /// Attempted action.
        action: &'static str,
        /// State the reservation is in.
        state: ReservationState,
    },
}

/// Lifecycle state of a reservation.
///
/// Only `provisioned` and `ended` are persisted; `Starting` and `Ending` exist
/// while a transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Booked, server not configured yet.
    Pending,
    /// Remote start in progress.
    Starting,
    /// Server configured and running for the reservation.
    Active,
    /// Remote teardown in progress.
    Ending,
    /// Teardown attempted and recorded. Terminal.
    Ended,
}

impl ReservationState {
    /// Rebuild the state from the persisted flags.
    pub fn from_flags(provisioned: bool, ended: bool) -> Self {
        match (provisioned, ended) {
            (_, true) => Self::Ended,
            (true, false) => Self::Active,
            (false, false) => Self::Pending,
        }
    }

    /// Persisted `(provisioned, ended)` flags for this state.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Self::Pending | Self::Starting => (false, false),
            Self::Active | Self::Ending => (true, false),
            Self::Ended => (true, true),
        }
    }

    /// Transition table.
    pub fn can_transition_to(self, next: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Ended)
                | (Starting, Active)
                | (Starting, Pending)
                | (Active, Ending)
                | (Ending, Ended)
        )
    }

    /// No transition leaves this state.
    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}
