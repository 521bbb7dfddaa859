use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::address::{self, HASH_ALGORITHM};
use crate::error::{CafError, Result};

/// Manifest file name inside a generated directory.
pub const MANIFEST_FILE: &str = ".caf-manifest";
/// Run metadata file name inside a generated directory.
pub const RUN_META_FILE: &str = ".caf-run.json";
/// Every file caf writes besides generated content starts with this.
pub const RESERVED_PREFIX: &str = ".caf-";

const HEADER_TAG: &str = "#caf-manifest";
const FORMAT_VERSION: &str = "v1";
const FLUSH_EVERY: usize = 256;
// Longest record line is well under this; used to find a torn tail.
const TAIL_PROBE: u64 = 4096;

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub digest: String,
}

impl FileRecord {
    pub fn to_line(&self) -> String {
        format!("{},{},{}\n", self.name, self.size, self.digest)
    }

    /// Parse one complete line (without its newline).
    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let mut fields = line.split(',');
        let (Some(name), Some(size), Some(digest), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err("expected name,size,digest".into());
        };
        if !address::is_valid_name(name) {
            return Err(format!("invalid file name {name:?}"));
        }
        if !address::is_valid_digest(digest) {
            return Err(format!("invalid digest {digest:?}"));
        }
        if address::digest_part(name) != digest {
            return Err(format!("name {name} does not match digest {digest}"));
        }
        let size = size.parse().map_err(|_| format!("invalid size {size:?}"))?;
        Ok(Self { name: name.to_string(), size, digest: digest.to_string() })
    }
}

/// In-memory manifest: records in completion order plus a name index.
///
/// On disk it is one `name,size,digest` line per file, append-only, so an
/// interrupted run leaves a parseable prefix. A trailing line without a
/// newline is a torn write and is dropped on load; any other malformed line
/// is corruption.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    records: Vec<FileRecord>,
    index: HashMap<String, usize>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Returns `false` (and ignores the record) if the name is
    /// already present.
    pub fn append(&mut self, record: FileRecord) -> bool {
        if self.index.contains_key(&record.name) {
            return false;
        }
        self.index.insert(record.name.clone(), self.records.len());
        self.records.push(record);
        true
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    /// Read the manifest stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = manifest_path(dir);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CafError::ManifestMissing(path))
            }
            Err(e) => return Err(e.into()),
        };
        if FileExt::try_lock_shared(&file).is_err() {
            return Err(CafError::ManifestLocked(path));
        }
        let manifest = Self::read_from(BufReader::new(&file));
        let _ = FileExt::unlock(&file);
        manifest
    }

    fn read_from(mut reader: impl BufRead) -> Result<Self> {
        let mut manifest = Manifest::new();
        let mut raw = Vec::with_capacity(256);
        let mut line_no = 0usize;
        loop {
            raw.clear();
            let n = reader.read_until(b'\n', &mut raw)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            if raw.last() != Some(&b'\n') {
                log::warn!("ignoring torn manifest line {line_no} ({n} bytes)");
                break;
            }
            raw.pop();
            let line = std::str::from_utf8(&raw).map_err(|_| CafError::ManifestCorrupt {
                line: line_no,
                reason: "not valid UTF-8".into(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(HEADER_TAG) {
                check_header(rest, line_no)?;
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let rec = FileRecord::parse_line(line)
                .map_err(|reason| CafError::ManifestCorrupt { line: line_no, reason })?;
            let name = rec.name.clone();
            if !manifest.append(rec) {
                return Err(CafError::ManifestCorrupt {
                    line: line_no,
                    reason: format!("duplicate name {name}"),
                });
            }
        }
        Ok(manifest)
    }
}

fn check_header(rest: &str, line: usize) -> Result<()> {
    let mut parts = rest.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if version != FORMAT_VERSION {
        return Err(CafError::ManifestCorrupt {
            line,
            reason: format!("unsupported manifest version {version:?}"),
        });
    }
    match parts.next() {
        Some(alg) if alg != HASH_ALGORITHM => Err(CafError::UnsupportedHash(alg.to_string())),
        _ => Ok(()),
    }
}

/// Append-side handle on a manifest, held for the duration of a generation
/// run. Holds an exclusive lock so two runs never interleave records.
pub struct ManifestWriter {
    path: PathBuf,
    lock: File,
    out: BufWriter<File>,
    pending: usize,
}

impl ManifestWriter {
    /// Open the manifest in `dir`. Without `append`, an existing manifest is
    /// an error; with it, new records go after the existing ones.
    pub fn open(dir: &Path, append: bool) -> Result<Self> {
        let path = manifest_path(dir);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if append {
            opts.create(true);
        } else {
            opts.create_new(true);
        }
        let mut file = match opts.open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CafError::ManifestExists(path))
            }
            Err(e) => return Err(e.into()),
        };
        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(CafError::ManifestLocked(path));
        }
        let end = drop_torn_tail(&mut file)?;
        let mut out = BufWriter::new(file.try_clone()?);
        out.seek(SeekFrom::Start(end))?;
        if end == 0 {
            out.write_all(format!("{HEADER_TAG} {FORMAT_VERSION} {HASH_ALGORITHM}\n").as_bytes())?;
        }
        Ok(Self { path, lock: file, out, pending: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The line is handed to the buffer in a single write
    /// so a crash can only tear the final line.
    pub fn append(&mut self, record: &FileRecord) -> Result<()> {
        self.out.write_all(record.to_line().as_bytes())?;
        self.pending += 1;
        if self.pending >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        self.pending = 0;
        Ok(())
    }

    /// Flush, sync to stable storage and release the lock.
    pub fn finish(mut self) -> Result<()> {
        self.flush()?;
        self.out.get_ref().sync_all()?;
        let _ = FileExt::unlock(&self.lock);
        Ok(())
    }
}

/// Truncate an unterminated final line left by an interrupted run. Returns
/// the resulting file length.
fn drop_torn_tail(f: &mut File) -> Result<u64> {
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let probe = len.min(TAIL_PROBE);
    f.seek(SeekFrom::Start(len - probe))?;
    let mut tail = vec![0u8; probe as usize];
    f.read_exact(&mut tail)?;
    if tail.last() == Some(&b'\n') {
        return Ok(len);
    }
    let keep = match tail.iter().rposition(|&b| b == b'\n') {
        Some(i) => len - probe + i as u64 + 1,
        None if probe == len => 0,
        None => {
            return Err(CafError::ManifestCorrupt {
                line: 0,
                reason: "final line exceeds record length limit".into(),
            })
        }
    };
    log::warn!("truncating torn manifest tail ({} bytes)", len - keep);
    f.set_len(keep)?;
    Ok(keep)
}

/// Metadata describing the generation run that produced a directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub tool_version: String,
    pub hash_algorithm: String,
    pub created_utc: String,
    pub finished_utc: String,
    pub size_spec: String,
    pub max_files: Option<u64>,
    pub max_disk_usage: Option<u64>,
    pub seed: Option<u64>,
    pub concurrency: usize,
    pub files_created: u64,
    pub bytes_written: u64,
    pub failed_writes: u64,
}

impl RunMeta {
    pub fn write(&self, dir: &Path) -> Result<()> {
        let mut tmp = tempfile::Builder::new().prefix(".caf-tmp-meta").tempfile_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.persist(dir.join(RUN_META_FILE)).map_err(|e| CafError::Io(e.error))?;
        Ok(())
    }

    /// Read run metadata if the directory has any.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(RUN_META_FILE);
        match File::open(&path) {
            Ok(f) => Ok(Some(serde_json::from_reader(BufReader::new(f))?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
