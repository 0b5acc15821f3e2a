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

use std::future::Future;
use std::time::Duration;

use gamelease_types::Server;
use openssh::{KnownHosts, SessionBuilder};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("ssh error: {0}")]
    Ssh(#[from] openssh::Error),

    #[error("command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes a single composed shell command on a server's host.
pub trait RemoteShell: Send + Sync + 'static {
    fn exec(
        &self,
        server: &Server,
        command: &str,
    ) -> impl Future<Output = Result<ShellOutput, ShellError>> + Send;
}

/// SSH exec through the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct OpensshShell {
    timeout: Duration,
}

impl OpensshShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, server: &Server, command: &str) -> Result<ShellOutput, ShellError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(server.ssh_user.clone())
            .port(server.ssh_port)
            .connect_timeout(self.timeout)
            .known_hosts_check(KnownHosts::Add);

        let session = builder.connect(&server.ip).await?;
        let output = session.raw_command(command).output().await;
        if let Err(e) = session.close().await {
            debug!(server = %server.name, error = %e, "failed to close ssh session");
        }
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ShellError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(ShellOutput { stdout, stderr })
    }
}

impl RemoteShell for OpensshShell {
    #[tracing::instrument(skip_all, fields(server = %server.name))]
    async fn exec(&self, server: &Server, command: &str) -> Result<ShellOutput, ShellError> {
        debug!(command, "running remote command");
        match tokio::time::timeout(self.timeout, self.run(server, command)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(error = %e, "remote command failed");
                }
                result
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "remote command timed out");
                Err(ShellError::Timeout(self.timeout))
            }
        }
    }
}
