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

//! Per-reservation iptables chains in the raw table.
//!
//! Every mutation passes `-w <secs>` so concurrent reservations on one host
//! queue on the xtables lock for a bounded time instead of failing or hanging.

use std::net::IpAddr;
use std::sync::Arc;

use gamelease_types::{ReservationPlayer, Server};
use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, MitigationSection};
use crate::shell::{RemoteShell, ShellError};
use crate::store::{ReservationStore, StoreError};

/// iptables limits chain names to 28 characters.
const CHAIN_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum MitigationError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct MitigationSettings {
    pub management_host: Option<IpNetwork>,
    pub lock_wait_secs: u64,
    pub udp_limit_per_sec: u32,
    pub tcp_limit_per_sec: u32,
    pub sdr_udp_limit_per_sec: u32,
}

impl TryFrom<&MitigationSection> for MitigationSettings {
    type Error = ConfigError;

    fn try_from(section: &MitigationSection) -> Result<Self, Self::Error> {
        Ok(Self {
            management_host: section.management_network()?,
            lock_wait_secs: section.lock_wait_secs,
            udp_limit_per_sec: section.udp_limit_per_sec,
            tcp_limit_per_sec: section.tcp_limit_per_sec,
            sdr_udp_limit_per_sec: section.sdr_udp_limit_per_sec,
        })
    }
}

pub fn chain_name(reservation_id: Uuid) -> String {
    let id = reservation_id.simple().to_string();
    format!("mitigation-{}", &id[..CHAIN_ID_LEN])
}

/// Lines iptables prints when the chain or hook being removed is already gone.
const MISSING_CHAIN_MARKERS: [&str; 4] = [
    "No chain/target/match",
    "does a matching rule exist",
    "Couldn't load target",
    "Try `iptables -h'",
];

/// Whether a failed removal only complained about rules that do not exist.
fn is_missing_chain(error: &ShellError) -> bool {
    let ShellError::NonZeroExit { stderr, .. } = error else {
        return false;
    };
    let mut lines = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();
    lines.peek().is_some()
        && lines.all(|line| {
            MISSING_CHAIN_MARKERS
                .iter()
                .any(|marker| line.contains(marker))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// Builds the composed shell commands; kept separate from execution so the
/// exact rule sets are testable.
#[derive(Debug, Clone)]
pub struct RuleBuilder<'a> {
    settings: &'a MitigationSettings,
    chain: String,
    port: u16,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(settings: &'a MitigationSettings, reservation_id: Uuid, port: u16) -> Self {
        Self {
            settings,
            chain: chain_name(reservation_id),
            port,
        }
    }

    fn iptables(&self, args: &str) -> String {
        format!("sudo iptables -w {} -t raw {args}", self.settings.lock_wait_secs)
    }

    fn rate_limited_accept(&self, proto: Proto, per_sec: u32) -> String {
        self.iptables(&format!(
            "-A {} -p {} -m limit --limit {per_sec}/sec --limit-burst {} -j ACCEPT",
            self.chain,
            proto.as_str(),
            per_sec.saturating_mul(2),
        ))
    }

    fn hook(&self, action: &str, proto: Proto) -> String {
        self.iptables(&format!(
            "{action} PREROUTING -p {} --dport {} -j {}",
            proto.as_str(),
            self.port,
            self.chain
        ))
    }

    fn enable_with(&self, limits: &[(Proto, u32)]) -> String {
        let mut steps = vec![self.iptables(&format!("-N {}", self.chain))];
        for &(proto, per_sec) in limits {
            steps.push(self.rate_limited_accept(proto, per_sec));
        }
        steps.push(self.iptables(&format!("-A {} -j DROP", self.chain)));
        for &(proto, _) in limits {
            steps.push(self.hook("-I", proto));
        }
        if let Some(host) = self.settings.management_host {
            steps.push(self.iptables(&format!("-I {} -s {host} -j ACCEPT", self.chain)));
        }
        steps.join(" && ")
    }

    pub fn enable(&self) -> String {
        self.enable_with(&[
            (Proto::Udp, self.settings.udp_limit_per_sec),
            (Proto::Tcp, self.settings.tcp_limit_per_sec),
        ])
    }

    pub fn enable_sdr(&self) -> String {
        self.enable_with(&[(Proto::Udp, self.settings.sdr_udp_limit_per_sec)])
    }

    pub fn allow(&self, ip: IpAddr) -> String {
        self.iptables(&format!("-I {} -s {ip} -j ACCEPT", self.chain))
    }

    /// Each step runs regardless of the previous one; the exit status is that
    /// of the final chain deletion.
    pub fn disable(&self) -> String {
        [
            self.hook("-D", Proto::Udp),
            self.hook("-D", Proto::Tcp),
            self.iptables(&format!("-F {}", self.chain)),
            self.iptables(&format!("-X {}", self.chain)),
        ]
        .join("; ")
    }
}

#[derive(Debug)]
pub struct NetworkMitigationController<S> {
    shell: Arc<S>,
    settings: MitigationSettings,
}

impl<S: RemoteShell> NetworkMitigationController<S> {
    pub fn new(shell: Arc<S>, settings: MitigationSettings) -> Self {
        Self { shell, settings }
    }

    fn rules(&self, server: &Server, reservation_id: Uuid) -> RuleBuilder<'_> {
        RuleBuilder::new(&self.settings, reservation_id, server.port)
    }

    /// Create the chain for a directly reachable server. Any chain left over
    /// from an earlier attempt is removed first.
    #[tracing::instrument(skip(self, server), fields(server = %server.name))]
    pub async fn enable_mitigations(
        &self,
        server: &Server,
        reservation_id: Uuid,
    ) -> Result<(), MitigationError> {
        self.disable_mitigations(server, reservation_id, true).await?;
        let command = self.rules(server, reservation_id).enable();
        self.shell.exec(server, &command).await?;
        info!(chain = %chain_name(reservation_id), "mitigations enabled");
        Ok(())
    }

    /// Create the stricter UDP-only chain for a server behind the SDR relay.
    #[tracing::instrument(skip(self, server), fields(server = %server.name))]
    pub async fn enable_sdr_mitigations(
        &self,
        server: &Server,
        reservation_id: Uuid,
    ) -> Result<(), MitigationError> {
        self.disable_mitigations(server, reservation_id, true).await?;
        let command = self.rules(server, reservation_id).enable_sdr();
        self.shell.exec(server, &command).await?;
        info!(chain = %chain_name(reservation_id), "sdr mitigations enabled");
        Ok(())
    }

    /// Picks the SDR or direct variant from the server's reachability.
    pub async fn apply(&self, server: &Server, reservation_id: Uuid) -> Result<(), MitigationError> {
        if server.sdr {
            self.enable_sdr_mitigations(server, reservation_id).await
        } else {
            self.enable_mitigations(server, reservation_id).await
        }
    }

    /// Remove the PREROUTING hooks and destroy the chain. With `ignore_errors`
    /// a missing chain or failed removal is logged and reported as success.
    #[tracing::instrument(skip(self, server), fields(server = %server.name))]
    pub async fn disable_mitigations(
        &self,
        server: &Server,
        reservation_id: Uuid,
        ignore_errors: bool,
    ) -> Result<(), MitigationError> {
        let command = self.rules(server, reservation_id).disable();
        match self.shell.exec(server, &command).await {
            Ok(_) => {
                info!(chain = %chain_name(reservation_id), "mitigations removed");
                Ok(())
            }
            Err(e) if is_missing_chain(&e) => {
                debug!(chain = %chain_name(reservation_id), "no mitigations to remove");
                Ok(())
            }
            Err(e) if ignore_errors => {
                debug!(error = %e, "ignoring mitigation removal failure");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Let a player through the chain unless they, or a duplicate of them, are
    /// already whitelisted. Returns whether a rule was inserted.
    #[tracing::instrument(skip_all, fields(server = %server.name, player = %player.id))]
    pub async fn allow_reservation_player<St: ReservationStore>(
        &self,
        store: &St,
        server: &Server,
        player: &ReservationPlayer,
    ) -> Result<bool, MitigationError> {
        if player.whitelisted {
            debug!("player already whitelisted");
            return Ok(false);
        }

        let others = store.reservation_players(player.reservation_id).await?;
        if others
            .iter()
            .any(|other| other.whitelisted && player.is_duplicate_of(other))
        {
            debug!("duplicate of a whitelisted player, skipping");
            return Ok(false);
        }

        let command = self.rules(server, player.reservation_id).allow(player.ip);
        if let Err(e) = self.shell.exec(server, &command).await {
            warn!(ip = %player.ip, error = %e, "failed to allow player");
            return Err(e.into());
        }
        store.mark_player_whitelisted(player.id).await?;
        info!(ip = %player.ip, "player allowed through mitigations");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn settings(management: Option<&str>) -> MitigationSettings {
        MitigationSettings {
            management_host: management.map(|m| m.parse().unwrap()),
            lock_wait_secs: 5,
            udp_limit_per_sec: 256,
            tcp_limit_per_sec: 32,
            sdr_udp_limit_per_sec: 64,
        }
    }

    fn id() -> Uuid {
        Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn chain_name_fits_iptables_limit() {
        let name = chain_name(Uuid::new_v4());
        assert!(name.len() <= 28, "{name} too long");
        assert_eq!(chain_name(id()), "mitigation-0123456789abcdef");
    }

    #[test]
    fn enable_is_single_short_circuit_command() {
        let settings = settings(Some("198.51.100.10/32"));
        let cmd = RuleBuilder::new(&settings, id(), 27015).enable();
        let steps: Vec<&str> = cmd.split(" && ").collect();

        assert!(steps.iter().all(|s| s.starts_with("sudo iptables -w 5 -t raw ")));
        assert!(steps[0].ends_with("-N mitigation-0123456789abcdef"));
        assert!(steps[1].contains("-p udp -m limit --limit 256/sec --limit-burst 512 -j ACCEPT"));
        assert!(steps[2].contains("-p tcp -m limit --limit 32/sec"));
        assert!(steps[3].ends_with("-A mitigation-0123456789abcdef -j DROP"));
        assert!(steps[4].contains("-I PREROUTING -p udp --dport 27015 -j mitigation-"));
        assert!(steps[5].contains("-I PREROUTING -p tcp --dport 27015 -j mitigation-"));
        assert!(steps[6].ends_with("-I mitigation-0123456789abcdef -s 198.51.100.10/32 -j ACCEPT"));
        assert_eq!(steps.len(), 7);
    }

    #[test]
    fn sdr_is_udp_only_and_stricter() {
        let settings = settings(None);
        let cmd = RuleBuilder::new(&settings, id(), 27015).enable_sdr();
        assert!(!cmd.contains("-p tcp"));
        assert!(cmd.contains("--limit 64/sec"));
        assert!(!cmd.contains("-s "), "no management host configured");
    }

    #[test]
    fn disable_does_not_short_circuit() {
        let settings = settings(None);
        let cmd = RuleBuilder::new(&settings, id(), 27015).disable();
        assert!(!cmd.contains("&&"));
        assert!(cmd.ends_with("-X mitigation-0123456789abcdef"));
        assert_eq!(cmd.matches("-D PREROUTING").count(), 2);
    }

    #[test_case("iptables: No chain/target/match by that name.", true ; "missing chain")]
    #[test_case(
        "iptables v1.8.7 (legacy): Couldn't load target `mitigation-0123456789abcdef':No such file or directory\n\nTry `iptables -h' or 'iptables --help' for more information.",
        true ; "missing jump target"
    )]
    #[test_case("iptables: Bad rule (does a matching rule exist in that chain?).", true ; "missing rule")]
    #[test_case("iptables: No chain/target/match by that name.\nsudo: a password is required", false ; "mixed failure")]
    #[test_case("", false ; "no output")]
    fn missing_chain_detection(stderr: &str, expected: bool) {
        let error = ShellError::NonZeroExit {
            status: 1,
            stderr: stderr.to_string(),
        };
        assert_eq!(is_missing_chain(&error), expected);
    }

    #[test]
    fn allow_inserts_at_top() {
        let settings = settings(None);
        let cmd = RuleBuilder::new(&settings, id(), 27015).allow("192.0.2.55".parse().unwrap());
        assert_eq!(
            cmd,
            "sudo iptables -w 5 -t raw -I mitigation-0123456789abcdef -s 192.0.2.55 -j ACCEPT"
        );
    }
}
