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

//! Configuration uploads and artifact retrieval over FTP.
//!
//! Single-file operations run on the calling path. Bulk downloads and deletes
//! are split into batches, each on its own connection inside the blocking
//! pool. All batches share one deadline set at dispatch, covering the wait
//! for a worker as well as the transfer. A batch still queued or running at
//! the deadline is abandoned and its files are reported individually, so a
//! bulk call returns within one batch timeout.

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gamelease_types::Server;
use suppaftp::FtpStream;
use suppaftp::types::FileType;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FileSyncError {
    #[error("ftp error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve {0}")]
    Address(String),

    #[error("transfer worker failed: {0}")]
    Worker(String),

    #[error("{0}")]
    Transport(String),
}

/// Opens connections to a server's file area. Calls block.
pub trait FileTransport: Send + Sync + 'static {
    type Session: FileSession;

    fn connect(&self, server: &Server) -> Result<Self::Session, FileSyncError>;
}

/// One open connection. Calls block.
pub trait FileSession: Send + 'static {
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FileSyncError>;
    fn upload(&mut self, path: &str, contents: &[u8]) -> Result<(), FileSyncError>;
    fn download(&mut self, path: &str) -> Result<Vec<u8>, FileSyncError>;
    fn delete(&mut self, path: &str) -> Result<(), FileSyncError>;
    fn close(self);
}

#[derive(Debug, Clone)]
pub struct FtpTransport {
    timeout: Duration,
}

impl FtpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl FileTransport for FtpTransport {
    type Session = FtpSession;

    fn connect(&self, server: &Server) -> Result<FtpSession, FileSyncError> {
        let host = format!("{}:{}", server.ip, server.ftp_port);
        let addr = host
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FileSyncError::Address(host.clone()))?;

        let mut stream = FtpStream::connect_timeout(addr, self.timeout)?;
        stream.get_ref().set_read_timeout(Some(self.timeout))?;
        stream.get_ref().set_write_timeout(Some(self.timeout))?;
        stream.login(&server.ftp_user, &server.ftp_password)?;
        stream.transfer_type(FileType::Binary)?;
        debug!(host = %host, "ftp session opened");
        Ok(FtpSession { stream })
    }
}

pub struct FtpSession {
    stream: FtpStream,
}

impl FileSession for FtpSession {
    fn list(&mut self, dir: &str) -> Result<Vec<String>, FileSyncError> {
        Ok(self.stream.nlst(Some(dir))?)
    }

    fn upload(&mut self, path: &str, contents: &[u8]) -> Result<(), FileSyncError> {
        let mut reader = contents;
        self.stream.put_file(path, &mut reader)?;
        Ok(())
    }

    fn download(&mut self, path: &str) -> Result<Vec<u8>, FileSyncError> {
        Ok(self.stream.retr_as_buffer(path)?.into_inner())
    }

    fn delete(&mut self, path: &str) -> Result<(), FileSyncError> {
        Ok(self.stream.rm(path)?)
    }

    fn close(mut self) {
        if let Err(e) = self.stream.quit() {
            debug!(error = %e, "ftp quit failed");
        }
    }
}

/// Per-file accounting for a bulk operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub batches: usize,
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub abandoned: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

enum BatchResult {
    Finished(Vec<(String, Result<(), String>)>),
    Abandoned(Vec<String>),
}

pub fn partition(files: &[String], batch_size: usize) -> Vec<Vec<String>> {
    files
        .chunks(batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect()
}

/// `NLST` may answer with bare names or with paths; normalize to paths.
fn qualify(dir: &str, entry: &str) -> String {
    if entry.contains('/') || dir.is_empty() {
        entry.to_string()
    } else {
        format!("{}/{entry}", dir.trim_end_matches('/'))
    }
}

fn run_batch<F, Op>(
    transport: &F,
    server: &Server,
    files: &[String],
    op: &Op,
) -> Vec<(String, Result<(), String>)>
where
    F: FileTransport,
    Op: Fn(&mut F::Session, &str) -> Result<(), FileSyncError>,
{
    let mut session = match transport.connect(server) {
        Ok(session) => session,
        Err(e) => {
            let reason = format!("connect failed: {e}");
            return files.iter().map(|f| (f.clone(), Err(reason.clone()))).collect();
        }
    };

    let results = files
        .iter()
        .map(|file| (file.clone(), op(&mut session, file).map_err(|e| e.to_string())))
        .collect();
    session.close();
    results
}

#[derive(Debug)]
pub struct FileSyncChannel<F> {
    transport: Arc<F>,
    batch_size: usize,
    batch_timeout: Duration,
    workers: Arc<Semaphore>,
}

impl<F: FileTransport> FileSyncChannel<F> {
    pub fn new(
        transport: Arc<F>,
        batch_size: usize,
        batch_timeout: Duration,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            transport,
            batch_size: batch_size.max(1),
            batch_timeout,
            workers: Arc::new(Semaphore::new(max_concurrent_batches.max(1))),
        }
    }

    async fn single<T, Op>(&self, server: &Server, op: Op) -> Result<T, FileSyncError>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Session) -> Result<T, FileSyncError> + Send + 'static,
    {
        let transport = self.transport.clone();
        let server = server.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = transport.connect(&server)?;
            let result = op(&mut session);
            session.close();
            result
        })
        .await
        .map_err(|e| FileSyncError::Worker(e.to_string()))?
    }

    #[tracing::instrument(skip(self, server), fields(server = %server.name))]
    pub async fn list(&self, server: &Server, dir: &str) -> Result<Vec<String>, FileSyncError> {
        let dir = dir.to_string();
        self.single(server, move |session| session.list(&dir)).await
    }

    #[tracing::instrument(skip(self, server, contents), fields(server = %server.name))]
    pub async fn upload(
        &self,
        server: &Server,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<(), FileSyncError> {
        let path = path.to_string();
        self.single(server, move |session| session.upload(&path, &contents))
            .await?;
        debug!("uploaded file");
        Ok(())
    }

    #[tracing::instrument(skip(self, server), fields(server = %server.name))]
    pub async fn delete(&self, server: &Server, path: &str) -> Result<(), FileSyncError> {
        let path = path.to_string();
        self.single(server, move |session| session.delete(&path)).await
    }

    async fn run_batches<Op>(&self, server: &Server, files: Vec<String>, op: Op) -> SyncReport
    where
        Op: Fn(&mut F::Session, &str) -> Result<(), FileSyncError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let batches = partition(&files, self.batch_size);
        let batch_count = batches.len();
        let deadline = tokio::time::Instant::now() + self.batch_timeout;

        let pending = batches.into_iter().map(|batch| {
            let transport = self.transport.clone();
            let workers = self.workers.clone();
            let server = server.clone();
            let op = op.clone();
            let names = batch.clone();

            let work = async move {
                let Ok(permit) = workers.acquire_owned().await else {
                    return None;
                };
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    run_batch(&*transport, &server, &batch, &*op)
                });
                Some(handle.await)
            };
            async move {
                match tokio::time::timeout_at(deadline, work).await {
                    Ok(Some(Ok(results))) => BatchResult::Finished(results),
                    Ok(Some(Err(e))) => BatchResult::Finished(
                        names.into_iter().map(|f| (f, Err(e.to_string()))).collect(),
                    ),
                    Ok(None) | Err(_) => BatchResult::Abandoned(names),
                }
            }
        });

        let mut report = SyncReport {
            batches: batch_count,
            ..SyncReport::default()
        };
        for result in join_all(pending).await {
            match result {
                BatchResult::Finished(files) => {
                    for (file, outcome) in files {
                        match outcome {
                            Ok(()) => report.completed.push(file),
                            Err(e) => {
                                warn!(file = %file, error = %e, "file transfer failed");
                                report.failed.push((file, e));
                            }
                        }
                    }
                }
                BatchResult::Abandoned(files) => {
                    for file in files {
                        warn!(file = %file, timeout = ?self.batch_timeout, "batch timed out, file abandoned");
                        report.abandoned.push(file);
                    }
                }
            }
        }
        report
    }

    /// Download `files` into `local_dir`, keeping their base names.
    #[tracing::instrument(skip_all, fields(server = %server.name, count = files.len()))]
    pub async fn download_files(
        &self,
        server: &Server,
        files: Vec<String>,
        local_dir: &Path,
    ) -> Result<SyncReport, FileSyncError> {
        tokio::fs::create_dir_all(local_dir).await?;
        let local_dir: PathBuf = local_dir.to_path_buf();

        let report = self
            .run_batches(server, files, move |session, path| {
                let name = Path::new(path)
                    .file_name()
                    .ok_or_else(|| FileSyncError::Transport(format!("no file name in {path}")))?;
                let contents = session.download(path)?;
                std::fs::write(local_dir.join(name), contents)?;
                Ok(())
            })
            .await;

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "download finished"
        );
        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(server = %server.name, count = files.len()))]
    pub async fn delete_files(&self, server: &Server, files: Vec<String>) -> SyncReport {
        let report = self
            .run_batches(server, files, |session, path| session.delete(path))
            .await;
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "delete finished"
        );
        report
    }

    /// Demos from the game directory and logs from `logs/`.
    pub async fn list_artifacts(&self, server: &Server) -> Result<Vec<String>, FileSyncError> {
        let game_dir = server.game_path("");
        let game_dir = game_dir.trim_end_matches('/');
        let logs_dir = server.game_path("logs");

        let demos = self.list(server, game_dir).await?;
        let logs = self.list(server, &logs_dir).await?;

        Ok(demos
            .iter()
            .filter(|f| f.ends_with(".dem"))
            .map(|f| qualify(game_dir, f))
            .chain(
                logs.iter()
                    .filter(|f| f.ends_with(".log"))
                    .map(|f| qualify(&logs_dir, f)),
            )
            .collect())
    }

    /// Copy demos and logs off the server, then remove the copies that arrived.
    pub async fn fetch_artifacts(
        &self,
        server: &Server,
        local_dir: &Path,
    ) -> Result<SyncReport, FileSyncError> {
        let files = self.list_artifacts(server).await?;
        if files.is_empty() {
            debug!(server = %server.name, "no artifacts to fetch");
            return Ok(SyncReport::default());
        }

        let report = self.download_files(server, files, local_dir).await?;
        if !report.completed.is_empty() {
            self.delete_files(server, report.completed.clone()).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("demo-{i}.dem")).collect()
    }

    #[test_case(9, 4, &[4, 4, 1] ; "nine files")]
    #[test_case(8, 4, &[4, 4] ; "exact multiple")]
    #[test_case(0, 4, &[] ; "nothing to do")]
    #[test_case(3, 0, &[1, 1, 1] ; "zero batch size treated as one")]
    fn partition_sizes(count: usize, size: usize, expected: &[usize]) {
        let sizes: Vec<usize> = partition(&names(count), size).iter().map(Vec::len).collect();
        assert_eq!(sizes, expected);
    }

    #[test_case("tf/logs", "L1018000.log", "tf/logs/L1018000.log" ; "bare name")]
    #[test_case("tf/logs/", "L1018000.log", "tf/logs/L1018000.log" ; "trailing slash")]
    #[test_case("tf/logs", "tf/logs/L1018000.log", "tf/logs/L1018000.log" ; "already qualified")]
    #[test_case("", "match.dem", "match.dem" ; "ftp root")]
    fn qualify_paths(dir: &str, entry: &str, expected: &str) {
        assert_eq!(qualify(dir, entry), expected);
    }
}
