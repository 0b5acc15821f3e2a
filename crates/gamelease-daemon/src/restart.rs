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

//! Bring a server to a known-good state with as little downtime as possible.
//!
//! The fast path reloads the map over RCON. Whenever it fails, for whatever
//! reason, the game service is restarted over SSH instead. There is exactly
//! one fallback and nothing escapes [`RestartStrategy::restart`].

use std::sync::Arc;

use gamelease_types::Server;
use tracing::{info, warn};

use crate::rcon::{RemoteCommandChannel, ServerStatus, parse_status};
use crate::shell::{RemoteShell, ShellError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastRestart {
    Succeeded(ServerStatus),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// In-place changelevel worked; carries the status read before it.
    Fast(ServerStatus),
    /// Fast path failed, service restart succeeded.
    Slow,
    /// Both tiers failed.
    Failed(String),
}

impl RestartOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct RestartStrategy<R, S> {
    rcon: Arc<R>,
    shell: Arc<S>,
    status_marker: String,
    kick_message: String,
}

impl<R: RemoteCommandChannel, S: RemoteShell> RestartStrategy<R, S> {
    pub fn new(
        rcon: Arc<R>,
        shell: Arc<S>,
        status_marker: impl Into<String>,
        kick_message: impl Into<String>,
    ) -> Self {
        Self {
            rcon,
            shell,
            status_marker: status_marker.into(),
            kick_message: kick_message.into(),
        }
    }

    fn changelevel_command(&self, map: &str) -> String {
        let message = self.kick_message.replace('"', "'");
        format!("kickall \"{message}\"; changelevel {map}")
    }

    /// Query `status`, require the marker, then kick everyone and change level.
    pub async fn fast_restart(&self, server: &Server, rcon_password: &str, map: &str) -> FastRestart {
        let addr = server.rcon_addr();

        let response = match self.rcon.execute(&addr, rcon_password, "status").await {
            Ok(response) => response,
            Err(e) => return FastRestart::Failed(format!("status query failed: {e}")),
        };
        if !response.contains(&self.status_marker) {
            return FastRestart::Failed(format!(
                "status response lacks marker {:?}",
                self.status_marker
            ));
        }
        let status = parse_status(&response);

        match self
            .rcon
            .execute(&addr, rcon_password, &self.changelevel_command(map))
            .await
        {
            Ok(_) => FastRestart::Succeeded(status),
            Err(e) => FastRestart::Failed(format!("changelevel failed: {e}")),
        }
    }

    pub async fn slow_restart(&self, server: &Server) -> Result<(), ShellError> {
        let command = format!("sudo systemctl restart {}", server.service_unit);
        self.shell.exec(server, &command).await.map(|_| ())
    }

    #[tracing::instrument(skip(self, server, rcon_password), fields(server = %server.name))]
    pub async fn restart(&self, server: &Server, rcon_password: &str, map: &str) -> RestartOutcome {
        let reason = match self.fast_restart(server, rcon_password, map).await {
            FastRestart::Succeeded(status) => {
                info!("fast restart succeeded");
                return RestartOutcome::Fast(status);
            }
            FastRestart::Failed(reason) => reason,
        };

        warn!(reason = %reason, "fast restart failed, restarting service");
        match self.slow_restart(server).await {
            Ok(()) => {
                info!("slow restart succeeded");
                RestartOutcome::Slow
            }
            Err(e) => {
                warn!(error = %e, "slow restart failed");
                RestartOutcome::Failed(format!("{reason}; slow restart failed: {e}"))
            }
        }
    }
}
