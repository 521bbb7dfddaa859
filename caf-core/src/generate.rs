use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::NamedTempFile;

use crate::address::{self, ContentHasher, HASH_ALGORITHM, IO_BUFFER_SIZE};
use crate::budget::BudgetTracker;
use crate::error::{CafError, Result};
use crate::manifest::{FileRecord, Manifest, ManifestWriter, RunMeta, RESERVED_PREFIX};
use crate::progress::Progress;
use crate::size::{SizeSampler, SizeSpec};

/// Prefix for in-flight files; they are renamed to their identity once complete.
pub const TEMP_PREFIX: &str = ".caf-tmp-";

/// What to do when a file's identity is already taken in the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Name the file `digest-N` with the first free `N`.
    #[default]
    Suffix,
    /// Drop the file and count the unit as a failed write.
    Fail,
}

#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub size_spec: SizeSpec,
    pub max_files: Option<u64>,
    pub max_disk_usage: Option<u64>,
    pub destination: PathBuf,
    pub concurrency: usize,
    /// Base seed for every worker's RNG streams; random when unset.
    pub seed: Option<u64>,
    pub on_collision: CollisionPolicy,
    /// Add to an existing manifest instead of refusing to run.
    pub append: bool,
    /// `sync_data` each file before it is recorded.
    pub fsync: bool,
    pub progress: bool,
}

impl GenerationRequest {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            size_spec: SizeSpec::default(),
            max_files: None,
            max_disk_usage: None,
            destination: destination.into(),
            concurrency: default_concurrency(),
            seed: None,
            on_collision: CollisionPolicy::default(),
            append: false,
            fsync: false,
            progress: false,
        }
    }

    /// Reject requests that could never stop on their own.
    pub fn validate(&self) -> Result<()> {
        if self.max_files.is_none() && self.max_disk_usage.is_none() {
            return Err(CafError::UnboundedRun("set a file count or a disk usage limit"));
        }
        if self.max_files.is_none() && self.size_spec.max_size() == Some(0) {
            return Err(CafError::UnboundedRun(
                "a disk usage limit alone cannot stop a run that only produces empty files",
            ));
        }
        Ok(())
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug)]
pub struct GenerationReport {
    pub manifest: Manifest,
    pub files_created: u64,
    pub bytes_written: u64,
    pub failed_writes: u64,
    /// Files whose identity was already taken (suffixed or dropped per policy).
    pub collisions: u64,
    pub seed: u64,
    pub elapsed: Duration,
}

struct Sink {
    writer: ManifestWriter,
    manifest: Manifest,
}

/// Next `-N` suffix worth trying per digest, so repeated content does not
/// re-probe every name it already used.
#[derive(Default)]
struct SuffixHints {
    next: Mutex<HashMap<String, u32>>,
}

impl SuffixHints {
    fn start(&self, digest: &str) -> u32 {
        let next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        next.get(digest).copied().unwrap_or(0)
    }

    fn used(&self, digest: &str, attempt: u32) {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        let slot = next.entry(digest.to_string()).or_insert(0);
        *slot = (*slot).max(attempt.saturating_add(1));
    }
}

struct Shared<'a> {
    req: &'a GenerationRequest,
    budget: BudgetTracker,
    sink: Mutex<Sink>,
    taken: HashSet<String>,
    hints: SuffixHints,
    stop: AtomicBool,
    fatal: Mutex<Option<CafError>>,
    failed: AtomicU64,
    collisions: AtomicU64,
    progress: Progress,
}

pub struct GenerationEngine;

impl GenerationEngine {
    /// Fill `req.destination` with random content-addressed files until the
    /// budget is exhausted.
    pub fn run(req: &GenerationRequest) -> Result<GenerationReport> {
        req.validate()?;
        let t0 = Instant::now();
        let created_utc = chrono::Utc::now().to_rfc3339();
        let dir = &req.destination;
        std::fs::create_dir_all(dir)?;

        // Names already recorded by an earlier run are off limits even if the
        // file itself has since been deleted.
        let taken: HashSet<String> = if req.append {
            match Manifest::load(dir) {
                Ok(m) => m.records().iter().map(|r| r.name.clone()).collect(),
                Err(CafError::ManifestMissing(_)) => HashSet::new(),
                Err(e) => return Err(e),
            }
        } else {
            HashSet::new()
        };
        let writer = ManifestWriter::open(dir, req.append)?;
        warn_if_short_on_space(dir, req.max_disk_usage);

        let seed = req.seed.unwrap_or_else(rand::random);
        let workers = req.concurrency.max(1);
        log::debug!(
            "generating into {} with {} workers, size {}, seed {}",
            dir.display(),
            workers,
            req.size_spec,
            seed
        );

        let progress = Progress::new(req.progress);
        progress.set_stage("Generating");
        progress.set_files_total(req.max_files.unwrap_or(0));
        progress.start();

        let shared = Shared {
            req,
            budget: BudgetTracker::new(req.max_files, req.max_disk_usage),
            sink: Mutex::new(Sink { writer, manifest: Manifest::new() }),
            taken,
            hints: SuffixHints::default(),
            stop: AtomicBool::new(false),
            fatal: Mutex::new(None),
            failed: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            progress: progress.clone(),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("caf-gen-{i}"))
            .build()?;
        pool.scope(|s| {
            for id in 0..workers {
                let shared = &shared;
                s.spawn(move |_| shared.worker(id, seed));
            }
        });
        progress.stop();

        let Shared { sink, fatal, failed, collisions, .. } = shared;
        if let Some(err) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(err);
        }
        let Sink { writer, manifest } = sink.into_inner().unwrap_or_else(|p| p.into_inner());
        writer.finish()?;

        let report = GenerationReport {
            files_created: manifest.len() as u64,
            bytes_written: manifest.total_bytes(),
            failed_writes: failed.into_inner(),
            collisions: collisions.into_inner(),
            seed,
            elapsed: t0.elapsed(),
            manifest,
        };
        RunMeta {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
            created_utc,
            finished_utc: chrono::Utc::now().to_rfc3339(),
            size_spec: req.size_spec.to_string(),
            max_files: req.max_files,
            max_disk_usage: req.max_disk_usage,
            seed: Some(seed),
            concurrency: workers,
            files_created: report.files_created,
            bytes_written: report.bytes_written,
            failed_writes: report.failed_writes,
        }
        .write(dir)?;
        log::debug!(
            "generated {} files ({} bytes) in {:.2?}",
            report.files_created,
            report.bytes_written,
            report.elapsed
        );
        Ok(report)
    }
}

impl Shared<'_> {
    fn worker(&self, id: usize, seed: u64) {
        let mut sampler = match SizeSampler::new(self.req.size_spec, worker_rng(seed, id, "size")) {
            Ok(s) => s,
            Err(e) => return self.abort(e),
        };
        let mut content = worker_rng(seed, id, "content");
        let cap = self
            .req
            .size_spec
            .max_size()
            .map_or(IO_BUFFER_SIZE, |m| m.min(IO_BUFFER_SIZE as u64) as usize);
        let mut buf = vec![0u8; cap.max(1)];

        while !self.stop.load(Ordering::Relaxed) {
            let size = sampler.next_size();
            if !self.budget.reserve(size) {
                log::debug!("worker {id}: budget exhausted");
                break;
            }
            match self.create_file(size, &mut content, &mut buf) {
                Ok(record) => {
                    if let Err(e) = self.record(record) {
                        return self.abort(e);
                    }
                }
                Err(e) => {
                    log::warn!("{e}");
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Write one file of `size` random bytes. The record is only produced once
    /// the bytes are fully written and the file sits under its final name.
    fn create_file(&self, size: u64, rng: &mut StdRng, buf: &mut [u8]) -> Result<FileRecord> {
        let dir = &self.req.destination;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|source| CafError::Write { path: dir.clone(), source })?;
        let tmp_path = tmp.path().to_path_buf();
        let write_err = |source| CafError::Write { path: tmp_path.clone(), source };

        let mut hasher = ContentHasher::new();
        let f = tmp.as_file_mut();
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            rng.fill_bytes(&mut buf[..n]);
            hasher.update(&buf[..n]);
            f.write_all(&buf[..n]).map_err(write_err)?;
            remaining -= n as u64;
        }
        f.flush().map_err(write_err)?;
        if self.req.fsync {
            f.sync_data().map_err(write_err)?;
        }
        let digest = hasher.finalize();
        let name = self.persist(tmp, &digest)?;
        Ok(FileRecord { name, size, digest })
    }

    /// Move a finished temp file to its identity name without ever replacing
    /// an existing file. Dropping `tmp` on any error path removes it.
    fn persist(&self, mut tmp: NamedTempFile, digest: &str) -> Result<String> {
        let dir = &self.req.destination;
        let start = match self.req.on_collision {
            CollisionPolicy::Suffix => self.hints.start(digest),
            CollisionPolicy::Fail => 0,
        };
        for attempt in start..=u32::MAX {
            let name = address::name_for(digest, attempt);
            if !self.taken.contains(&name) {
                match tmp.persist_noclobber(dir.join(&name)) {
                    Ok(_) => {
                        self.hints.used(digest, attempt);
                        if attempt > 0 {
                            self.collisions.fetch_add(1, Ordering::Relaxed);
                            log::debug!("identity {digest} taken, stored as {name}");
                        }
                        return Ok(name);
                    }
                    Err(e) if e.error.kind() == ErrorKind::AlreadyExists => tmp = e.file,
                    Err(e) => return Err(CafError::Write { path: dir.join(&name), source: e.error }),
                }
            }
            if self.req.on_collision == CollisionPolicy::Fail {
                self.collisions.fetch_add(1, Ordering::Relaxed);
                return Err(CafError::DuplicateIdentity(digest.to_string()));
            }
        }
        Err(CafError::DuplicateIdentity(digest.to_string()))
    }

    fn record(&self, record: FileRecord) -> Result<()> {
        let size = record.size;
        {
            let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
            sink.writer.append(&record)?;
            sink.manifest.append(record);
        }
        self.progress.inc_file(size);
        Ok(())
    }

    fn abort(&self, err: CafError) {
        log::error!("stopping generation: {err}");
        self.stop.store(true, Ordering::Relaxed);
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        fatal.get_or_insert(err);
    }
}

/// Independent RNG stream for one worker, derived from the run seed.
fn worker_rng(seed: u64, worker: usize, stream: &str) -> StdRng {
    let mut material = Vec::with_capacity(32);
    material.extend_from_slice(&seed.to_le_bytes());
    material.extend_from_slice(&(worker as u64).to_le_bytes());
    material.extend_from_slice(stream.as_bytes());
    StdRng::from_seed(blake3::derive_key("caf 2024 worker rng stream", &material))
}

fn warn_if_short_on_space(dir: &Path, max_disk_usage: Option<u64>) {
    let Some(want) = max_disk_usage else { return };
    match fs2::available_space(dir) {
        Ok(avail) if avail < want => log::warn!(
            "disk usage limit {} exceeds available space {} in {}",
            want,
            avail,
            dir.display()
        ),
        Ok(_) => {}
        Err(e) => log::debug!("could not query free space for {}: {e}", dir.display()),
    }
}

/// True for names caf reserves for its own bookkeeping.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}
