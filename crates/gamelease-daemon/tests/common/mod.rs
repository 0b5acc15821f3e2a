#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gamelease_types::{Reservation, ReservationPlayer, Server};
use tokio::sync::Notify;
use uuid::Uuid;

use gamelease_daemon::config::DaemonToml;
use gamelease_daemon::filesync::{FileSession, FileSyncError, FileTransport};
use gamelease_daemon::lifecycle::ReservationLifecycle;
use gamelease_daemon::rcon::{RconError, RemoteCommandChannel};
use gamelease_daemon::shell::{RemoteShell, ShellError, ShellOutput};
use gamelease_daemon::store::{ReservationStore, StoreError};

/// Whole minute, so clock passes run at `base_time() + n minutes`.
pub const BASE_SECS: i64 = 1_700_000_040;

pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(BASE_SECS, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

// -- In-memory store --

#[derive(Default)]
struct Tables {
    reservations: HashMap<Uuid, Reservation>,
    servers: HashMap<Uuid, Server>,
    players: HashMap<Uuid, ReservationPlayer>,
    statuses: Vec<(Uuid, String)>,
}

/// Store backed by hash maps; queries use the same predicates the SQL mirrors.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn add_server(&self, server: Server) {
        self.tables.lock().unwrap().servers.insert(server.id, server);
    }

    pub fn add_player(&self, player: ReservationPlayer) {
        self.tables.lock().unwrap().players.insert(player.id, player);
    }

    pub fn put(&self, reservation: Reservation) {
        self.tables
            .lock()
            .unwrap()
            .reservations
            .insert(reservation.id, reservation);
    }

    pub fn reservation(&self, id: Uuid) -> Reservation {
        self.tables.lock().unwrap().reservations[&id].clone()
    }

    pub fn server(&self, id: Uuid) -> Server {
        self.tables.lock().unwrap().servers[&id].clone()
    }

    pub fn player(&self, id: Uuid) -> ReservationPlayer {
        self.tables.lock().unwrap().players[&id].clone()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tables.lock().unwrap().reservations.contains_key(&id)
    }

    pub fn statuses(&self, id: Uuid) -> Vec<String> {
        self.tables
            .lock()
            .unwrap()
            .statuses
            .iter()
            .filter(|(r, _)| *r == id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Status history across all reservations, in insertion order.
    pub fn all_statuses(&self) -> Vec<(Uuid, String)> {
        self.tables.lock().unwrap().statuses.clone()
    }

    fn select(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let tables = self.tables.lock().unwrap();
        let mut found: Vec<Reservation> = tables
            .reservations
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.starts_at);
        found
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Reservation)) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let reservation = tables.reservations.get_mut(&id).ok_or(StoreError::NotFound)?;
        f(reservation);
        Ok(())
    }

    fn overlapping(
        tables: &Tables,
        server_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> bool {
        tables.reservations.values().any(|r| {
            r.server_id == server_id
                && Some(r.id) != exclude
                && r.overlaps(starts_at, ends_at)
        })
    }
}

impl ReservationStore for MemoryStore {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if Self::overlapping(
            &tables,
            reservation.server_id,
            reservation.starts_at,
            reservation.ends_at,
            None,
        ) {
            return Err(StoreError::Overlap);
        }
        tables.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get_reservation(&self, id: Uuid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.tables.lock().unwrap().reservations.get(&id).cloned())
    }

    async fn delete_reservation(&self, id: Uuid) -> Result<(), StoreError> {
        self.tables.lock().unwrap().reservations.remove(&id);
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        Ok(self.tables.lock().unwrap().servers.get(&id).cloned())
    }

    async fn overdue_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.select(|r| r.is_overdue(now)))
    }

    async fn due_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.select(|r| r.is_newly_due(now)))
    }

    async fn active_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.select(|r| r.is_active_at(now)))
    }

    async fn has_overlap(
        &self,
        server_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::overlapping(&tables, server_id, starts_at, ends_at, exclude))
    }

    async fn mark_provisioned(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |r| {
            r.provisioned = true;
            r.locked_password = Some(r.password.clone());
        })
    }

    async fn mark_ended(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |r| {
            if !r.ended {
                r.ended = true;
                r.ends_at = r.ends_at.min(r.starts_at.max(at));
            }
        })
    }

    async fn mark_end_instantly(&self, id: Uuid, ends_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |r| {
            r.end_instantly = true;
            r.ends_at = r.ends_at.min(r.starts_at.max(ends_at));
        })
    }

    async fn update_ends_at(&self, id: Uuid, ends_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |r| r.ends_at = ends_at)
    }

    async fn record_health(
        &self,
        id: Uuid,
        last_number_of_players: i32,
        inactive_minute_counter: i32,
    ) -> Result<(), StoreError> {
        self.update(id, |r| {
            r.last_number_of_players = last_number_of_players;
            r.inactive_minute_counter = inactive_minute_counter;
        })
    }

    async fn update_server_address(&self, server_id: Uuid, addr: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let server = tables.servers.get_mut(&server_id).ok_or(StoreError::NotFound)?;
        server.last_known_addr = Some(addr.to_string());
        Ok(())
    }

    async fn get_player(&self, id: Uuid) -> Result<Option<ReservationPlayer>, StoreError> {
        Ok(self.tables.lock().unwrap().players.get(&id).cloned())
    }

    async fn reservation_players(
        &self,
        reservation_id: Uuid,
    ) -> Result<Vec<ReservationPlayer>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .players
            .values()
            .filter(|p| p.reservation_id == reservation_id)
            .cloned()
            .collect())
    }

    async fn mark_player_whitelisted(&self, player_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let player = tables.players.get_mut(&player_id).ok_or(StoreError::NotFound)?;
        player.whitelisted = true;
        Ok(())
    }

    async fn add_status(&self, reservation_id: Uuid, status: &str) -> Result<(), StoreError> {
        self.tables
            .lock()
            .unwrap()
            .statuses
            .push((reservation_id, status.to_string()));
        Ok(())
    }
}

// -- Mock RCON --

pub fn status_text(players: u32) -> String {
    format!(
        "hostname: test server\n\
         udp/ip  : 0.0.0.0:27015  (public IP from Steam: 198.51.100.4)\n\
         players : {players} humans, 0 bots (24 max)\n"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconCall {
    pub addr: String,
    pub password: String,
    pub command: String,
}

/// Parks one `status` call until released, so a test can run another
/// transition while the first is mid-flight.
#[derive(Default)]
pub struct StatusGate {
    entered: Notify,
    released: Notify,
}

impl StatusGate {
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Answers `status` with a canned response, or refuses when unreachable.
pub struct MockRcon {
    status: Mutex<Option<String>>,
    changelevel_fails: AtomicBool,
    calls: Mutex<Vec<RconCall>>,
    gate: Mutex<Option<Arc<StatusGate>>>,
}

impl MockRcon {
    pub fn with_players(players: u32) -> Self {
        Self {
            status: Mutex::new(Some(status_text(players))),
            changelevel_fails: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            status: Mutex::new(None),
            changelevel_fails: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn set_status(&self, response: Option<String>) {
        *self.status.lock().unwrap() = response;
    }

    pub fn set_players(&self, players: u32) {
        self.set_status(Some(status_text(players)));
    }

    pub fn fail_changelevel(&self, fail: bool) {
        self.changelevel_fails.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RconCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// The next `status` call waits on the returned gate.
    pub fn hold_next_status(&self) -> Arc<StatusGate> {
        let gate = Arc::new(StatusGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }
}

impl RemoteCommandChannel for MockRcon {
    async fn execute(&self, addr: &str, password: &str, command: &str) -> Result<String, RconError> {
        self.calls.lock().unwrap().push(RconCall {
            addr: addr.to_string(),
            password: password.to_string(),
            command: command.to_string(),
        });

        if command == "status" {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.released.notified().await;
            }
            return self.status.lock().unwrap().clone().ok_or_else(|| {
                RconError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))
            });
        }
        if command.contains("changelevel") && self.changelevel_fails.load(Ordering::SeqCst) {
            return Err(RconError::Timeout(Duration::from_secs(5)));
        }
        Ok(String::new())
    }
}

// -- Mock shell --

/// Records every command; commands containing a registered needle fail.
#[derive(Default)]
pub struct MockShell {
    commands: Mutex<Vec<String>>,
    failing: Mutex<Vec<(String, String)>>,
}

pub const MISSING_CHAIN: &str = "iptables: No chain/target/match by that name.";

impl MockShell {
    /// Commands containing `needle` exit 1 as if the chain did not exist.
    pub fn fail_when(&self, needle: &str) {
        self.fail_with(needle, MISSING_CHAIN);
    }

    pub fn fail_with(&self, needle: &str, stderr: &str) {
        self.failing
            .lock()
            .unwrap()
            .push((needle.to_string(), stderr.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }
}

impl RemoteShell for MockShell {
    async fn exec(&self, _server: &Server, command: &str) -> Result<ShellOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        let stderr = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, stderr)| stderr.clone());
        if let Some(stderr) = stderr {
            return Err(ShellError::NonZeroExit { status: 1, stderr });
        }
        Ok(ShellOutput::default())
    }
}

// -- Mock file transport --

#[derive(Default)]
struct RemoteFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    slow_delay: Mutex<Option<Duration>>,
}

/// Remote file area held in memory. Downloading a path containing `slow`
/// blocks for the configured delay.
#[derive(Default, Clone)]
pub struct MockTransport {
    fs: Arc<RemoteFs>,
}

impl MockTransport {
    pub fn put(&self, path: &str, contents: &[u8]) {
        self.fs
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.files.lock().unwrap().get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.files.lock().unwrap().contains_key(path)
    }

    pub fn connects(&self) -> usize {
        self.fs.connects.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.fs.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn slow_downloads(&self, delay: Duration) {
        *self.fs.slow_delay.lock().unwrap() = Some(delay);
    }
}

pub struct MockSession {
    fs: Arc<RemoteFs>,
}

impl FileTransport for MockTransport {
    type Session = MockSession;

    fn connect(&self, _server: &Server) -> Result<MockSession, FileSyncError> {
        self.fs.connects.fetch_add(1, Ordering::SeqCst);
        if self.fs.refuse.load(Ordering::SeqCst) {
            return Err(FileSyncError::Transport("connection refused".into()));
        }
        Ok(MockSession { fs: self.fs.clone() })
    }
}

impl FileSession for MockSession {
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FileSyncError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .fs
            .files
            .lock()
            .unwrap()
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn upload(&mut self, path: &str, contents: &[u8]) -> Result<(), FileSyncError> {
        self.fs
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn download(&mut self, path: &str) -> Result<Vec<u8>, FileSyncError> {
        if path.contains("slow") {
            let delay = *self.fs.slow_delay.lock().unwrap();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }
        self.fs
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| FileSyncError::Transport(format!("550 {path}: no such file")))
    }

    fn delete(&mut self, path: &str) -> Result<(), FileSyncError> {
        self.fs
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileSyncError::Transport(format!("550 {path}: no such file")))
    }

    fn close(self) {}
}

// -- Fixtures --

pub fn server() -> Server {
    Server {
        id: Uuid::new_v4(),
        name: "Amsterdam #1".into(),
        ip: "192.0.2.10".into(),
        port: 27015,
        rcon_password: "server-default".into(),
        ftp_port: 21,
        ftp_user: "tf2".into(),
        ftp_password: "ftp-secret".into(),
        game_dir: "tf".into(),
        ssh_user: "gamelease".into(),
        ssh_port: 22,
        service_unit: "tf2@1.service".into(),
        sdr: false,
        mitigations_enabled: false,
        last_known_addr: None,
    }
}

pub fn reservation(server_id: Uuid, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Reservation {
    Reservation {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        server_id,
        starts_at,
        ends_at,
        provisioned: false,
        ended: false,
        start_instantly: false,
        end_instantly: false,
        auto_end: true,
        inactive_minute_counter: 0,
        last_number_of_players: 0,
        first_map: "cp_badlands".into(),
        password: "join-pw".into(),
        rcon: "reservation-rcon".into(),
        tv_password: "tv-pw".into(),
        locked_password: None,
    }
}

pub fn player(reservation_id: Uuid, ip: &str, steam_uid: &str) -> ReservationPlayer {
    ReservationPlayer {
        id: Uuid::new_v4(),
        reservation_id,
        steam_uid: steam_uid.into(),
        ip: ip.parse().unwrap(),
        whitelisted: false,
        created_at: base_time(),
    }
}

pub fn test_config(download_dir: &Path) -> DaemonToml {
    let mut config = DaemonToml::default();
    config.ftp.download_dir = download_dir.to_path_buf();
    config.lifecycle.idle_threshold_minutes = 3;
    config
}

pub type TestLifecycle = ReservationLifecycle<MemoryStore, MockRcon, MockTransport, MockShell>;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub rcon: Arc<MockRcon>,
    pub transport: MockTransport,
    pub shell: Arc<MockShell>,
    pub lifecycle: Arc<TestLifecycle>,
    pub server: Server,
    pub download_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(rcon: MockRcon) -> Self {
        Self::with_server(rcon, server())
    }

    pub fn with_server(rcon: MockRcon, server: Server) -> Self {
        let download_dir = tempfile::tempdir().unwrap();
        Self::build(rcon, server, test_config(download_dir.path()), download_dir)
    }

    pub fn build(
        rcon: MockRcon,
        server: Server,
        config: DaemonToml,
        download_dir: tempfile::TempDir,
    ) -> Self {
        let store = Arc::new(MemoryStore::default());
        store.add_server(server.clone());
        let rcon = Arc::new(rcon);
        let transport = MockTransport::default();
        let shell = Arc::new(MockShell::default());
        let lifecycle = Arc::new(
            ReservationLifecycle::new(
                store.clone(),
                rcon.clone(),
                Arc::new(transport.clone()),
                shell.clone(),
                &config,
            )
            .unwrap(),
        );
        Self {
            store,
            rcon,
            transport,
            shell,
            lifecycle,
            server,
            download_dir,
        }
    }

    /// Reservation on the harness server starting at `start` minutes from the base time.
    pub fn book(&self, start: i64, length: i64) -> Reservation {
        let r = reservation(
            self.server.id,
            base_time() + minutes(start),
            base_time() + minutes(start + length),
        );
        self.store.put(r.clone());
        r
    }

    /// Already provisioned reservation covering the base time.
    pub fn book_active(&self, start: i64, length: i64) -> Reservation {
        let mut r = reservation(
            self.server.id,
            base_time() + minutes(start),
            base_time() + minutes(start + length),
        );
        r.provisioned = true;
        self.store.put(r.clone());
        r
    }
}
