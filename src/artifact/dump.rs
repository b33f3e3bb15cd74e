//! Database-kind artifacts
//!
//! Dumps are produced and replayed by a [`DatabaseDumper`]. The command
//! implementation shells out to the engine's own tools and gzips the output
//! as it streams, so every database artifact is a `.sql.gz` (or a gzipped
//! SQLite file) and no dump is ever held in memory whole.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::ArtifactSink;
use crate::error::{VaultError, VaultResult};

/// Read size for dump output and artifact files
const CHUNK_SIZE: usize = 64 * 1024;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Mysql,
    Postgres,
    Sqlite,
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mysql => write!(f, "mysql"),
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for DatabaseEngine {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" | "pgsql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(VaultError::Validation(format!("Unknown database engine: {}", other))),
        }
    }
}

/// Where a database lives and how to reach it.
///
/// For SQLite `database` is the path of the database file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    pub engine: DatabaseEngine,
    pub database: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DatabaseTarget {
    pub fn new(engine: DatabaseEngine, database: impl Into<String>) -> Self {
        Self {
            engine,
            database: database.into(),
            host: None,
            port: None,
            username: None,
            password: None,
        }
    }
}

/// Produces and replays logical database dumps
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Stream a complete compressed dump of `target` into `out`
    async fn dump(&self, target: &DatabaseTarget, out: &mut dyn ArtifactSink) -> VaultResult<()>;

    /// Replay a dump produced by [`DatabaseDumper::dump`], read from the
    /// local file `artifact`
    async fn restore(&self, target: &DatabaseTarget, artifact: &Path) -> VaultResult<()>;

    /// Whether the target already holds data a restore would replace
    async fn has_data(&self, target: &DatabaseTarget) -> VaultResult<bool>;
}

/// [`DatabaseDumper`] that runs `mysqldump`/`mysql`, `pg_dump`/`psql`, or
/// copies the SQLite file
#[derive(Debug, Clone, Default)]
pub struct CommandDumper;

impl CommandDumper {
    pub fn new() -> Self {
        Self
    }

    /// Dump command for server engines; SQLite is a plain file copy
    fn dump_command(target: &DatabaseTarget) -> Option<(Command, &'static str)> {
        match target.engine {
            DatabaseEngine::Mysql => {
                let mut cmd = Command::new("mysqldump");
                cmd.args(["--single-transaction", "--quick", "--lock-tables=false"]);
                mysql_connection_args(&mut cmd, target);
                cmd.arg(&target.database);
                Some((cmd, "mysqldump"))
            }
            DatabaseEngine::Postgres => {
                let mut cmd = Command::new("pg_dump");
                postgres_connection_args(&mut cmd, target);
                cmd.arg(&target.database);
                Some((cmd, "pg_dump"))
            }
            DatabaseEngine::Sqlite => None,
        }
    }

    fn restore_command(target: &DatabaseTarget) -> Option<(Command, &'static str)> {
        match target.engine {
            DatabaseEngine::Mysql => {
                let mut cmd = Command::new("mysql");
                mysql_connection_args(&mut cmd, target);
                cmd.arg(&target.database);
                Some((cmd, "mysql"))
            }
            DatabaseEngine::Postgres => {
                let mut cmd = Command::new("psql");
                postgres_connection_args(&mut cmd, target);
                cmd.args(["--quiet", "--set", "ON_ERROR_STOP=1"]);
                cmd.arg(&target.database);
                Some((cmd, "psql"))
            }
            DatabaseEngine::Sqlite => None,
        }
    }

    async fn run_capture(mut cmd: Command, program: &str) -> VaultResult<Vec<u8>> {
        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VaultError::Io(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(VaultError::Io(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Pipe the dump tool's stdout through gzip into `out`
    async fn stream_capture(
        mut cmd: Command,
        program: &str,
        gzip: &mut GzipChunker,
        out: &mut dyn ArtifactSink,
    ) -> VaultResult<()> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VaultError::Io(format!("Failed to run {}: {}", program, e)))?;
        let stderr = collect_stderr(&mut child);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| VaultError::Io(format!("{} stdout unavailable", program)))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| VaultError::Io(format!("Failed to read {} output: {}", program, e)))?;
            if n == 0 {
                break;
            }
            emit(out, gzip.update(&buf[..n])?).await?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| VaultError::Io(format!("Failed to wait for {}: {}", program, e)))?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(VaultError::Io(format!(
                "{} exited with {}: {}",
                program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }
}

fn mysql_connection_args(cmd: &mut Command, target: &DatabaseTarget) {
    if let Some(host) = &target.host {
        cmd.arg(format!("--host={}", host));
    }
    if let Some(port) = target.port {
        cmd.arg(format!("--port={}", port));
    }
    if let Some(user) = &target.username {
        cmd.arg(format!("--user={}", user));
    }
    if let Some(password) = &target.password {
        cmd.env("MYSQL_PWD", password);
    }
}

fn postgres_connection_args(cmd: &mut Command, target: &DatabaseTarget) {
    if let Some(host) = &target.host {
        cmd.arg("--host").arg(host);
    }
    if let Some(port) = target.port {
        cmd.arg("--port").arg(port.to_string());
    }
    if let Some(user) = &target.username {
        cmd.arg("--username").arg(user);
    }
    if let Some(password) = &target.password {
        cmd.env("PGPASSWORD", password);
    }
}

/// Drain a child's stderr in the background so it can never fill its pipe
fn collect_stderr(child: &mut Child) -> JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn emit(out: &mut dyn ArtifactSink, bytes: Vec<u8>) -> VaultResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    out.write(&bytes).await
}

/// Decompress the artifact file into `dest` chunk by chunk
async fn replay_into<W>(artifact: &Path, dest: &mut W) -> VaultResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(artifact)
        .await
        .map_err(|e| VaultError::Io(format!("Failed to open {}: {}", artifact.display(), e)))?;
    let mut gunzip = GunzipChunker::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dest.write_all(&gunzip.update(&buf[..n])?).await?;
    }
    dest.write_all(&gunzip.finish()?).await?;
    dest.flush().await?;
    Ok(())
}

/// Incremental gzip: raw chunks in, compressed bytes out as they are ready
pub struct GzipChunker {
    encoder: GzEncoder<Vec<u8>>,
}

impl Default for GzipChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipChunker {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) -> VaultResult<Vec<u8>> {
        self.encoder.write_all(chunk)?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    pub fn finish(self) -> VaultResult<Vec<u8>> {
        Ok(self.encoder.finish()?)
    }
}

/// Incremental gunzip, the inverse of [`GzipChunker`]
pub struct GunzipChunker {
    decoder: GzDecoder<Vec<u8>>,
}

impl Default for GunzipChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl GunzipChunker {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) -> VaultResult<Vec<u8>> {
        self.decoder
            .write_all(chunk)
            .map_err(|e| VaultError::Io(format!("Failed to decompress dump: {}", e)))?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    pub fn finish(self) -> VaultResult<Vec<u8>> {
        self.decoder
            .finish()
            .map_err(|e| VaultError::Io(format!("Failed to decompress dump: {}", e)))
    }
}

#[async_trait]
impl DatabaseDumper for CommandDumper {
    async fn dump(&self, target: &DatabaseTarget, out: &mut dyn ArtifactSink) -> VaultResult<()> {
        debug!(engine = %target.engine, database = %target.database, "dumping database");
        let mut gzip = GzipChunker::new();

        match Self::dump_command(target) {
            Some((cmd, program)) => Self::stream_capture(cmd, program, &mut gzip, out).await?,
            None => {
                let mut file = tokio::fs::File::open(&target.database).await.map_err(|e| {
                    VaultError::Io(format!("Failed to read {}: {}", target.database, e))
                })?;
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    emit(out, gzip.update(&buf[..n])?).await?;
                }
            }
        }

        emit(out, gzip.finish()?).await
    }

    async fn restore(&self, target: &DatabaseTarget, artifact: &Path) -> VaultResult<()> {
        let (mut cmd, program) = match Self::restore_command(target) {
            Some(command) => command,
            None => {
                let path = PathBuf::from(&target.database);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
                    VaultError::Io(format!("Failed to create {}: {}", path.display(), e))
                })?;
                return replay_into(artifact, &mut file).await;
            }
        };

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VaultError::Io(format!("Failed to run {}: {}", program, e)))?;
        let stderr = collect_stderr(&mut child);

        let fed = match child.stdin.take() {
            Some(mut stdin) => match replay_into(artifact, &mut stdin).await {
                Ok(()) => stdin.shutdown().await.map_err(VaultError::from),
                Err(e) => Err(e),
            },
            None => Err(VaultError::Io(format!("{} stdin unavailable", program))),
        };

        // a client that dies early shows up as a broken pipe; its exit status
        // and stderr say more
        let status = child
            .wait()
            .await
            .map_err(|e| VaultError::Io(format!("Failed to wait for {}: {}", program, e)))?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(VaultError::Io(format!(
                "{} exited with {}: {}",
                program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        fed
    }

    async fn has_data(&self, target: &DatabaseTarget) -> VaultResult<bool> {
        match target.engine {
            DatabaseEngine::Sqlite => match tokio::fs::metadata(&target.database).await {
                Ok(meta) => Ok(meta.len() > 0),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
            DatabaseEngine::Mysql => {
                let mut cmd = Command::new("mysql");
                mysql_connection_args(&mut cmd, target);
                cmd.args(["--batch", "--skip-column-names", "-e"]).arg(format!(
                    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = '{}'",
                    target.database.replace('\'', "''")
                ));
                let out = Self::run_capture(cmd, "mysql").await?;
                Ok(parse_count(&out) > 0)
            }
            DatabaseEngine::Postgres => {
                let mut cmd = Command::new("psql");
                postgres_connection_args(&mut cmd, target);
                cmd.args([
                    "--tuples-only",
                    "--no-align",
                    "--command",
                    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public'",
                ])
                .arg(&target.database);
                let out = Self::run_capture(cmd, "psql").await?;
                Ok(parse_count(&out) > 0)
            }
        }
    }
}

fn parse_count(output: &[u8]) -> u64 {
    String::from_utf8_lossy(output)
        .trim()
        .parse()
        .unwrap_or(0)
}
