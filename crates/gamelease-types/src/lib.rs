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

//! gamelease-types: Shared domain types for the gamelease reservation core.
//!
//! This crate holds the reservation and server models, the reservation state
//! machine, and the due-set predicates shared by every store implementation.

#![warn(missing_docs)]

mod reservation;

pub use reservation::{
    MIN_RESERVATION_MINUTES, NewReservation, Reservation, ReservationState, ValidationError,
};

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote game server that can be leased through reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name (e.g. "Amsterdam #3").
    pub name: String,
    /// Host name or IP address used for RCON, FTP and SSH.
    pub ip: String,
    /// Game port; RCON shares it.
    pub port: u16,
    /// RCON password the server runs with when no reservation config is loaded.
    pub rcon_password: String,
    /// FTP control port.
    pub ftp_port: u16,
    /// FTP user.
    pub ftp_user: String,
    /// FTP password.
    pub ftp_password: String,
    /// Game directory on the remote host, as seen from the FTP root.
    pub game_dir: String,
    /// SSH user allowed to run `sudo iptables` and `sudo systemctl`.
    pub ssh_user: String,
    /// SSH port.
    pub ssh_port: u16,
    /// systemd unit running the game server process.
    pub service_unit: String,
    /// Whether players reach this server through the SDR relay network.
    pub sdr: bool,
    /// Whether firewall mitigations are applied for reservations.
    pub mitigations_enabled: bool,
    /// Last public `ip:port` reported by the server itself.
    pub last_known_addr: Option<String>,
}

impl Server {
    /// Address of the RCON endpoint (`host:port`).
    pub fn rcon_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Path of a file relative to the game directory.
    pub fn game_path(&self, relative: &str) -> String {
        let dir = self.game_dir.trim_end_matches('/');
        if dir.is_empty() {
            relative.to_string()
        } else {
            format!("{dir}/{relative}")
        }
    }
}

/// A player seen on a reservation's server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPlayer {
    /// Unique identifier.
    pub id: Uuid,
    /// Reservation the player joined.
    pub reservation_id: Uuid,
    /// SteamID64 of the player.
    pub steam_uid: String,
    /// Source address the player connected from.
    pub ip: IpAddr,
    /// Whether the player's address has been allowed through the mitigation chain.
    pub whitelisted: bool,
    /// When the player was first seen.
    pub created_at: DateTime<Utc>,
}

impl ReservationPlayer {
    /// Whether `other` is the same person by address or Steam identity.
    pub fn is_duplicate_of(&self, other: &ReservationPlayer) -> bool {
        self.id != other.id
            && self.reservation_id == other.reservation_id
            && (self.ip == other.ip || self.steam_uid == other.steam_uid)
    }
}
