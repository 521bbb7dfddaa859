use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Default)]
struct Usage {
    files: u64,
    bytes: u64,
}

/// Shared stopping conditions for a generation run.
///
/// `reserve` is the only synchronization point between generation workers:
/// the check against both ceilings and the commit of both counters happen
/// under one lock, so concurrent workers can never overshoot either limit.
#[derive(Debug)]
pub struct BudgetTracker {
    max_files: Option<u64>,
    max_bytes: Option<u64>,
    usage: Mutex<Usage>,
}

impl BudgetTracker {
    pub fn new(max_files: Option<u64>, max_bytes: Option<u64>) -> Self {
        Self { max_files, max_bytes, usage: Mutex::new(Usage::default()) }
    }

    /// Claim room for one more file of `size` bytes. Returns `false` and
    /// commits nothing when either ceiling would be exceeded.
    pub fn reserve(&self, size: u64) -> bool {
        let mut usage = match self.usage.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let files = usage.files + 1;
        let Some(bytes) = usage.bytes.checked_add(size) else {
            return false;
        };
        if self.max_files.is_some_and(|max| files > max) {
            return false;
        }
        if self.max_bytes.is_some_and(|max| bytes > max) {
            return false;
        }
        usage.files = files;
        usage.bytes = bytes;
        true
    }

    fn snapshot(&self) -> Usage {
        match self.usage.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Files reserved so far.
    pub fn files(&self) -> u64 {
        self.snapshot().files
    }

    /// Bytes reserved so far.
    pub fn bytes(&self) -> u64 {
        self.snapshot().bytes
    }

    pub fn is_bounded(&self) -> bool {
        self.max_files.is_some() || self.max_bytes.is_some()
    }
}
