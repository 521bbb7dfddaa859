use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::address::{self, HASH_ALGORITHM, IO_BUFFER_SIZE};
use crate::error::{CafError, Result};
use crate::generate::{default_concurrency, is_reserved};
use crate::manifest::{FileRecord, Manifest, RunMeta};
use crate::progress::Progress;

/// Outcome of checking one manifest record against the file on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    /// Content differs. `actual_digest` is absent when the size alone gave it away.
    Mismatch { actual_size: u64, actual_digest: Option<String> },
    Missing,
    /// The file exists but could not be read.
    Unreadable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: FileStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerificationReport {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    /// Every non-OK record, sorted by name.
    pub failures: Vec<FileOutcome>,
    /// Files in the directory that the manifest does not know (strict mode only).
    pub unreferenced: Vec<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl VerificationReport {
    pub fn is_pass(&self) -> bool {
        self.failures.is_empty() && self.unreferenced.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|o| o.name.as_str()).collect()
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.with_status(|s| matches!(s, FileStatus::Missing))
    }

    pub fn mismatched(&self) -> impl Iterator<Item = &str> {
        self.with_status(|s| matches!(s, FileStatus::Mismatch { .. }))
    }

    fn with_status(&self, pred: impl Fn(&FileStatus) -> bool) -> impl Iterator<Item = &str> {
        self.failures.iter().filter(move |o| pred(&o.status)).map(|o| o.name.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub concurrency: usize,
    /// Also fail on files the manifest does not mention.
    pub strict: bool,
    pub progress: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self { concurrency: default_concurrency(), strict: false, progress: false }
    }
}

pub struct VerificationEngine;

impl VerificationEngine {
    /// Re-hash every file recorded in `dir`'s manifest. Never modifies the
    /// directory. Per-file problems are collected, not returned as errors.
    pub fn run(dir: &Path, opts: &VerifyOptions) -> Result<VerificationReport> {
        let t0 = Instant::now();
        let manifest = Manifest::load(dir)?;
        match RunMeta::read(dir) {
            Ok(Some(meta)) if meta.hash_algorithm != HASH_ALGORITHM => {
                return Err(CafError::UnsupportedHash(meta.hash_algorithm))
            }
            Ok(Some(meta)) => log::debug!(
                "manifest written by caf {} at {} ({} files)",
                meta.tool_version,
                meta.finished_utc,
                meta.files_created
            ),
            Ok(None) => {}
            Err(e) => log::warn!("ignoring unreadable run metadata: {e}"),
        }

        let records = manifest.records();
        let workers = opts.concurrency.max(1);
        log::debug!("verifying {} files in {} with {} workers", records.len(), dir.display(), workers);

        let progress = Progress::new(opts.progress);
        progress.set_stage("Verifying");
        progress.set_files_total(records.len() as u64);
        progress.start();

        let cursor = AtomicUsize::new(0);
        let passed = AtomicU64::new(0);
        let failures = Mutex::new(Vec::new());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("caf-verify-{i}"))
            .build()?;
        pool.scope(|s| {
            for _ in 0..workers {
                let (cursor, passed, failures, progress) = (&cursor, &passed, &failures, &progress);
                s.spawn(move |_| {
                    let mut buf = vec![0u8; IO_BUFFER_SIZE];
                    while let Some(rec) = records.get(cursor.fetch_add(1, Ordering::Relaxed)) {
                        let status = check_file(dir, rec, &mut buf);
                        progress.inc_file(rec.size);
                        if status == FileStatus::Ok {
                            passed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        log::debug!("{}: {:?}", rec.name, status);
                        failures
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push(FileOutcome { name: rec.name.clone(), status });
                    }
                });
            }
        });
        progress.stop();

        let mut failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
        failures.sort_by(|a, b| a.name.cmp(&b.name));
        let unreferenced = if opts.strict { scan_unreferenced(dir, &manifest)? } else { Vec::new() };

        Ok(VerificationReport {
            total: records.len() as u64,
            passed: passed.into_inner(),
            failed: failures.len() as u64,
            failures,
            unreferenced,
            elapsed: t0.elapsed(),
        })
    }
}

/// Check one record. Size is compared before hashing so truncation and
/// growth are caught without reading the file.
pub fn check_file(dir: &Path, rec: &FileRecord, buf: &mut [u8]) -> FileStatus {
    let mut f = match File::open(dir.join(&rec.name)) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return FileStatus::Missing,
        Err(e) => return FileStatus::Unreadable { reason: e.to_string() },
    };
    let meta = match f.metadata() {
        Ok(m) => m,
        Err(e) => return FileStatus::Unreadable { reason: e.to_string() },
    };
    if !meta.is_file() {
        return FileStatus::Unreadable { reason: "not a regular file".into() };
    }
    if meta.len() != rec.size {
        return FileStatus::Mismatch { actual_size: meta.len(), actual_digest: None };
    }
    match address::digest_reader(&mut f, buf) {
        Ok(d) if d == rec.digest => FileStatus::Ok,
        Ok(d) => FileStatus::Mismatch { actual_size: meta.len(), actual_digest: Some(d) },
        Err(e) => FileStatus::Unreadable { reason: e.to_string() },
    }
}

/// Stream the directory and collect entries the manifest does not cover.
fn scan_unreferenced(dir: &Path, manifest: &Manifest) -> Result<Vec<String>> {
    let mut extra = Vec::new();
    for ent in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let ent = ent.map_err(|e| {
            CafError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")))
        })?;
        if ent.file_type().is_dir() {
            continue;
        }
        let name = ent.file_name().to_string_lossy();
        if is_reserved(&name) || manifest.contains(&name) {
            continue;
        }
        extra.push(name.into_owned());
    }
    extra.sort();
    Ok(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::digest;

    fn write(dir: &Path, content: &[u8]) -> FileRecord {
        let d = digest(content);
        std::fs::write(dir.join(&d), content).unwrap();
        FileRecord { name: d.clone(), size: content.len() as u64, digest: d }
    }

    #[test]
    fn check_file_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = vec![0u8; 64];
        let ok = write(dir.path(), b"intact content");
        assert_eq!(check_file(dir.path(), &ok, &mut buf), FileStatus::Ok);

        let gone = write(dir.path(), b"to be removed");
        std::fs::remove_file(dir.path().join(&gone.name)).unwrap();
        assert_eq!(check_file(dir.path(), &gone, &mut buf), FileStatus::Missing);

        let flipped = write(dir.path(), b"abcdef");
        std::fs::write(dir.path().join(&flipped.name), b"abcdeX").unwrap();
        match check_file(dir.path(), &flipped, &mut buf) {
            FileStatus::Mismatch { actual_size: 6, actual_digest: Some(d) } => {
                assert_eq!(d, digest(b"abcdeX"))
            }
            other => panic!("unexpected {other:?}"),
        }

        let short = write(dir.path(), b"longer content");
        std::fs::write(dir.path().join(&short.name), b"short").unwrap();
        assert_eq!(
            check_file(dir.path(), &short, &mut buf),
            FileStatus::Mismatch { actual_size: 5, actual_digest: None }
        );
    }

    #[test]
    fn directory_in_place_of_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let d = digest(b"dir");
        std::fs::create_dir(dir.path().join(&d)).unwrap();
        let rec = FileRecord { name: d.clone(), size: 3, digest: d };
        let mut buf = vec![0u8; 16];
        assert!(matches!(check_file(dir.path(), &rec, &mut buf), FileStatus::Unreadable { .. }));
    }

    #[test]
    fn report_helpers() {
        let report = VerificationReport {
            total: 3,
            passed: 1,
            failed: 2,
            failures: vec![
                FileOutcome { name: "a".into(), status: FileStatus::Missing },
                FileOutcome {
                    name: "b".into(),
                    status: FileStatus::Mismatch { actual_size: 1, actual_digest: None },
                },
            ],
            unreferenced: vec![],
            elapsed: Duration::ZERO,
        };
        assert!(!report.is_pass());
        assert_eq!(report.failed_names(), vec!["a", "b"]);
        assert_eq!(report.missing().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(report.mismatched().collect::<Vec<_>>(), vec!["b"]);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"missing\""));
    }
}
