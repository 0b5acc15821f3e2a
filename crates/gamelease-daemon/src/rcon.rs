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

//! Remote console channel to a game server.
//!
//! Each call opens a fresh TCP connection, authenticates, runs one command and
//! closes. The whole exchange is bounded by a single timeout.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;

const AUTH_ID: i32 = 1;
const COMMAND_ID: i32 = 2;
const SENTINEL_ID: i32 = 3;

/// id + type + two NUL terminators
const MIN_PACKET_SIZE: i32 = 10;
const MAX_PACKET_SIZE: i32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication rejected")]
    AuthFailed,

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub trait RemoteCommandChannel: Send + Sync + 'static {
    /// Authenticate against `addr` and run a single command, returning its output.
    fn execute(
        &self,
        addr: &str,
        password: &str,
        command: &str,
    ) -> impl Future<Output = Result<String, RconError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self { id, kind, body: body.into() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (body.len() + MIN_PACKET_SIZE as usize) as i32;
        let mut buf = Vec::with_capacity(size as usize + 4);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, RconError> {
    let size = reader.read_i32_le().await?;
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(RconError::Malformed(format!("packet size {size}")));
    }

    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).await?;

    let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body = &buf[8..buf.len() - 2];
    let body = match body.iter().position(|&b| b == 0) {
        Some(end) => &body[..end],
        None => body,
    };

    Ok(Packet {
        id,
        kind,
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

/// Source engine RCON over TCP.
#[derive(Debug, Clone)]
pub struct SourceRcon {
    timeout: Duration,
}

impl SourceRcon {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(addr: &str, password: &str, command: &str) -> Result<String, RconError> {
        let mut stream = TcpStream::connect(addr).await?;

        stream
            .write_all(&Packet::new(AUTH_ID, SERVERDATA_AUTH, password).encode())
            .await?;

        loop {
            let packet = read_packet(&mut stream).await?;
            if packet.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if packet.id == -1 {
                return Err(RconError::AuthFailed);
            }
            if packet.id != AUTH_ID {
                return Err(RconError::Malformed(format!("auth response id {}", packet.id)));
            }
            break;
        }

        // Multi-packet responses end where the reply to the empty sentinel begins.
        let mut request = Packet::new(COMMAND_ID, SERVERDATA_EXECCOMMAND, command).encode();
        request.extend(Packet::new(SENTINEL_ID, SERVERDATA_RESPONSE_VALUE, "").encode());
        stream.write_all(&request).await?;

        let mut output = String::new();
        loop {
            let packet = read_packet(&mut stream).await?;
            match packet.id {
                SENTINEL_ID => break,
                COMMAND_ID => output.push_str(&packet.body),
                other => debug!(id = other, "ignoring unexpected rcon packet"),
            }
        }

        let _ = stream.shutdown().await;
        Ok(output)
    }
}

impl RemoteCommandChannel for SourceRcon {
    #[tracing::instrument(skip(self, password))]
    async fn execute(&self, addr: &str, password: &str, command: &str) -> Result<String, RconError> {
        match tokio::time::timeout(self.timeout, Self::exchange(addr, password, command)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(addr, error = %e, "rcon command failed");
                }
                result
            }
            Err(_) => {
                warn!(addr, timeout = ?self.timeout, "rcon command timed out");
                Err(RconError::Timeout(self.timeout))
            }
        }
    }
}

/// Fields of interest from the `status` command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub hostname: Option<String>,
    pub players: Option<u32>,
    pub public_addr: Option<String>,
}

pub fn parse_status(text: &str) -> ServerStatus {
    let mut status = ServerStatus::default();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "hostname" => status.hostname = Some(value.to_string()),
            "players" => {
                status.players = value
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok());
            }
            "udp/ip" => status.public_addr = parse_public_addr(value),
            _ => {}
        }
    }

    status
}

/// Always `ip:port` when a port is known. A bare public IP borrows the port
/// of the bind address in front of it.
fn parse_public_addr(value: &str) -> Option<String> {
    let bind = value.split_whitespace().next()?;
    let port = bind.rsplit_once(':').map(|(_, port)| port);
    for marker in ["public IP from Steam:", "public ip:"] {
        let public = value
            .split_once(marker)
            .and_then(|(_, rest)| rest.split(')').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = public {
            return Some(match port {
                Some(port) if !ip.contains(':') => format!("{ip}:{port}"),
                _ => ip.to_string(),
            });
        }
    }
    (!bind.starts_with("0.0.0.0")).then(|| bind.to_string())
}
