//! Options shared by the create and extract engines.

use std::env;
use std::path::PathBuf;

/// Granularity of parallel data units (also the default preallocation
/// stripe width on parallel file systems).
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

/// Per-worker I/O buffer size.
pub const DEFAULT_BUF_SIZE: usize = 1 << 20;

/// Environment variable selecting the create backend: `LIBCIRCLE` for the
/// work-stealing backend, `CHUNK` for the static-chunk backend. Overrides
/// the [`ArchiveOptions::steal_create`] flag.
pub const BACKEND_ENV: &str = "MFU_FLIST_ARCHIVE_CREATE";

/// Which data-phase strategy the create engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateBackend {
    /// Workers drain a shared queue of per-chunk copy items.
    Steal,
    /// Chunks are owned by a deterministic round-robin formula.
    Chunks,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Destination: the archive path on create, the extraction anchor
    /// directory on extract.
    pub dest: PathBuf,
    /// Worker count; 0 auto-detects from the CPU count.
    pub ranks: usize,
    /// Size of one parallel data unit in bytes.
    pub chunk_size: u64,
    /// Per-worker I/O buffer size in bytes.
    pub buf_size: usize,
    /// Capture extended attributes into headers (create) and restore them
    /// (extract).
    pub preserve: bool,
    /// Select the work-stealing create backend.
    pub steal_create: bool,
    /// Select the library-driven extract path when offsets are available.
    pub lib_extract: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            dest: PathBuf::new(),
            ranks: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buf_size: DEFAULT_BUF_SIZE,
            preserve: false,
            steal_create: false,
            lib_extract: false,
        }
    }
}

impl ArchiveOptions {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        let n = if self.ranks == 0 {
            num_cpus::get()
        } else {
            self.ranks
        };
        n.max(1)
    }

    /// Resolve the create backend, giving the environment override
    /// priority over the option flag. Unrecognized values fall back to
    /// the flag.
    pub fn create_backend(&self) -> CreateBackend {
        match env::var(BACKEND_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("LIBCIRCLE") => CreateBackend::Steal,
            Ok(v) if v.eq_ignore_ascii_case("CHUNK") => CreateBackend::Chunks,
            _ => {
                if self.steal_create {
                    CreateBackend::Steal
                } else {
                    CreateBackend::Chunks
                }
            }
        }
    }
}
