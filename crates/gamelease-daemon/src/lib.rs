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

//! gamelease-daemon: provisions, monitors and tears down leased game servers
//! on a minute-aligned clock.

pub mod clock;
pub mod config;
pub mod db;
pub mod filesync;
pub mod lifecycle;
pub mod mitigation;
pub mod rcon;
pub mod restart;
pub mod shell;
pub mod store;
