//! File-kind artifacts
//!
//! A file backup is a gzip-compressed tar of the project tree, minus the
//! excluded paths. The manifest records every archived file with its size,
//! relative to the source root and `/`-separated on every platform.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::ArtifactSink;
use crate::error::{VaultError, VaultResult};
use crate::models::ManifestEntry;

/// Bytes handed to the uploader at a time
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between the archive thread and the uploader
const CHANNEL_DEPTH: usize = 8;

/// Compiled exclude globs, matched against root-relative paths
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> VaultResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                VaultError::Validation(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| VaultError::Validation(format!("invalid exclude patterns: {}", e)))?;

        Ok(Self {
            set,
            patterns: patterns.to_vec(),
        })
    }

    /// Whether `rel` is excluded. Directories also match patterns written
    /// for their contents, so `vendor/*` prunes `vendor` itself.
    pub fn is_excluded(&self, rel: &str, is_dir: bool) -> bool {
        self.set.is_match(rel) || (is_dir && self.set.is_match(format!("{}/", rel)))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Blocking-side writer that hands compressed chunks to the async uploader.
/// A dropped receiver means the upload stopped, so the archive build does too.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "artifact upload stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Archive the tree under `root` into `out`, returning the manifest.
///
/// With `since` set only files modified after that instant are included,
/// which is how incremental file backups are built. The tar and gzip work
/// runs on a blocking thread; compressed chunks are streamed to `out` as
/// they are produced.
pub async fn capture_files(
    root: PathBuf,
    matcher: ExcludeMatcher,
    since: Option<DateTime<Utc>>,
    token: CancellationToken,
    out: &mut dyn ArtifactSink,
) -> VaultResult<Vec<ManifestEntry>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let build = tokio::task::spawn_blocking(move || {
        build_archive(&root, &matcher, since, &token, ChannelWriter { tx })
    });

    let mut sink_error = None;
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = out.write(&chunk).await {
            sink_error = Some(e);
            break;
        }
    }
    drop(rx);

    let built = build
        .await
        .map_err(|e| VaultError::Io(format!("archive task failed: {}", e)))?;
    match sink_error {
        Some(e) => Err(e),
        None => built,
    }
}

fn build_archive(
    root: &Path,
    matcher: &ExcludeMatcher,
    since: Option<DateTime<Utc>>,
    token: &CancellationToken,
    sink: ChannelWriter,
) -> VaultResult<Vec<ManifestEntry>> {
    if !root.is_dir() {
        return Err(VaultError::Validation(format!(
            "source path {} is not a directory",
            root.display()
        )));
    }

    let encoder = GzEncoder::new(
        io::BufWriter::with_capacity(CHUNK_SIZE, sink),
        Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    let mut manifest = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match relative_path(root, entry.path()) {
            Some(rel) => !matcher.is_excluded(&rel, entry.file_type().is_dir()),
            None => true,
        });

    for entry in walker {
        if token.is_cancelled() {
            return Err(VaultError::Cancelled("cancelled".into()));
        }

        let entry = entry
            .map_err(|e| VaultError::Io(format!("Failed to walk {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| {
            VaultError::Io(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;

        if let Some(since) = since {
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified <= since {
                continue;
            }
        }

        let rel = relative_path(root, entry.path()).ok_or_else(|| {
            VaultError::Io(format!("{} is outside {}", entry.path().display(), root.display()))
        })?;

        builder.append_path_with_name(entry.path(), &rel)?;
        manifest.push(ManifestEntry {
            path: rel,
            size: metadata.len(),
        });
    }

    let mut buffered = builder.into_inner()?.finish()?;
    buffered.flush()?;

    Ok(manifest)
}

/// `/`-joined path of `path` below `root`
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// First manifest path that already exists under `dest`
pub fn find_conflict<'a, I>(entries: I, dest: &Path) -> Option<String>
where
    I: IntoIterator<Item = &'a ManifestEntry>,
{
    entries
        .into_iter()
        .find(|entry| dest.join(&entry.path).symlink_metadata().is_ok())
        .map(|entry| entry.path.clone())
}

/// Unpack the archive file `artifact` into `dest`, replacing files that are
/// already there. Returns the number of entries written.
pub async fn apply_files(artifact: PathBuf, dest: PathBuf) -> VaultResult<usize> {
    tokio::task::spawn_blocking(move || unpack(&artifact, &dest))
        .await
        .map_err(|e| VaultError::Io(format!("unpack task failed: {}", e)))?
}

fn unpack(artifact: &Path, dest: &Path) -> VaultResult<usize> {
    std::fs::create_dir_all(dest)?;

    let file = File::open(artifact).map_err(|e| {
        VaultError::Io(format!("Failed to open {}: {}", artifact.display(), e))
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(io::BufReader::new(file)));
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.unpack_in(dest)? {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn set_mtime(root: &Path, rel: &str, at: SystemTime) {
        let file = fs::File::options().write(true).open(root.join(rel)).unwrap();
        file.set_modified(at).unwrap();
    }

    fn matcher(patterns: &[&str]) -> ExcludeMatcher {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ExcludeMatcher::new(&patterns).unwrap()
    }

    fn project_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.php", "<?php echo 1;");
        write(dir.path(), "app/Models/User.php", "<?php class User {}");
        write(dir.path(), "node_modules/left-pad/index.js", "module.exports = 1");
        write(dir.path(), "storage/logs/laravel.log", "boom");
        write(dir.path(), ".env", "APP_KEY=secret");
        dir
    }

    async fn capture(
        root: &Path,
        patterns: &[&str],
        since: Option<DateTime<Utc>>,
    ) -> (Vec<ManifestEntry>, Vec<u8>) {
        let mut bytes = Vec::new();
        let manifest = capture_files(
            root.to_path_buf(),
            matcher(patterns),
            since,
            CancellationToken::new(),
            &mut bytes,
        )
        .await
        .unwrap();
        (manifest, bytes)
    }

    /// Accepts one chunk, then fails like a dropped connection
    struct BrokenSink {
        chunks: usize,
    }

    #[async_trait]
    impl ArtifactSink for BrokenSink {
        async fn write(&mut self, _chunk: &[u8]) -> VaultResult<()> {
            self.chunks += 1;
            if self.chunks > 1 {
                return Err(VaultError::StorageIo("connection reset".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_exclude_matcher() {
        let m = matcher(&["node_modules/*", "*.log", ".env"]);
        assert!(m.is_excluded("node_modules", true));
        assert!(m.is_excluded("node_modules/a/b.js", false));
        assert!(m.is_excluded("storage/logs/laravel.log", false));
        assert!(m.is_excluded(".env", false));
        assert!(!m.is_excluded("app/Models/User.php", false));
        assert!(!m.is_excluded("app", true));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let patterns = vec!["[unclosed".to_string()];
        assert!(matches!(
            ExcludeMatcher::new(&patterns),
            Err(VaultError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_applies_excludes() {
        let src = project_tree();
        let (manifest, bytes) = capture(src.path(), &["node_modules/*", "*.log", ".env"], None).await;

        let paths: Vec<_> = manifest.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["app/Models/User.php", "index.php"]);
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_capture_since_only_takes_newer_files() {
        let src = project_tree();
        let past = SystemTime::now() - Duration::from_secs(3600);
        for rel in ["index.php", "app/Models/User.php"] {
            set_mtime(src.path(), rel, past);
        }
        write(src.path(), "app/Http/Kernel.php", "<?php class Kernel {}");
        set_mtime(
            src.path(),
            "app/Http/Kernel.php",
            SystemTime::now() + Duration::from_secs(3600),
        );

        let (manifest, _) = capture(
            src.path(),
            &["node_modules/*", "storage/*", ".env"],
            Some(Utc::now()),
        )
        .await;

        let paths: Vec<_> = manifest.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["app/Http/Kernel.php"]);
    }

    #[tokio::test]
    async fn test_capture_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let mut bytes = Vec::new();
        let result = capture_files(
            dir.path().join("nope"),
            matcher(&[]),
            None,
            CancellationToken::new(),
            &mut bytes,
        )
        .await;
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }

    #[tokio::test]
    async fn test_capture_cancelled() {
        let src = project_tree();
        let token = CancellationToken::new();
        token.cancel();

        let mut bytes = Vec::new();
        let result = capture_files(src.path().to_path_buf(), matcher(&[]), None, token, &mut bytes).await;
        assert!(matches!(result, Err(VaultError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_sink_failure_stops_capture() {
        let src = TempDir::new().unwrap();
        // incompressible content so the archive spans several chunks
        let noise: String = (0..400_000u32)
            .map(|i| char::from(b'!' + (i.wrapping_mul(2_654_435_761) >> 27) as u8))
            .collect();
        for n in 0..4 {
            write(src.path(), &format!("blob{}.txt", n), &noise);
        }

        let mut sink = BrokenSink { chunks: 0 };
        let result = capture_files(
            src.path().to_path_buf(),
            matcher(&[]),
            None,
            CancellationToken::new(),
            &mut sink,
        )
        .await;

        match result {
            Err(VaultError::StorageIo(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("expected the sink error, got {:?}", other.map(|m| m.len())),
        }
        assert_eq!(sink.chunks, 2);
    }

    #[tokio::test]
    async fn test_apply_and_conflicts() {
        let src = project_tree();
        let (manifest, bytes) = capture(src.path(), &["node_modules/*", "*.log", ".env"], None).await;
        let staging = TempDir::new().unwrap();
        let artifact = staging.path().join("000.artifact");
        fs::write(&artifact, &bytes).unwrap();

        let dest = TempDir::new().unwrap();
        assert_eq!(find_conflict(&manifest, dest.path()), None);

        let applied = apply_files(artifact.clone(), dest.path().to_path_buf())
            .await
            .unwrap();
        assert!(applied >= 2);
        assert_eq!(
            fs::read_to_string(dest.path().join("app/Models/User.php")).unwrap(),
            "<?php class User {}"
        );
        assert_eq!(
            find_conflict(&manifest, dest.path()),
            Some("app/Models/User.php".to_string())
        );

        write(dest.path(), "index.php", "changed");
        apply_files(artifact, dest.path().to_path_buf()).await.unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("index.php")).unwrap(),
            "<?php echo 1;"
        );
    }
}
