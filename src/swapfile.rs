// Swap backing file: sizing, allocation, pre-warming and activation
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::FallocateFlags;
use thiserror::Error;

use crate::defaults::{
    PREWARM_CHUNK, PREWARM_FILL, SWAP_FREE_SPACE_MARGIN, SWAP_RESERVED_SLACK,
};
use crate::helpers::{format_size, CommandRunner, HelperError, MB};
use crate::logging::Logger;
use crate::{debug, info};

/// Alignment required for O_DIRECT buffers, offsets and lengths
const DIRECT_ALIGN: usize = 4096;

#[derive(Error, Debug)]
pub enum SwapFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot query free space on {}: {source}", .path.display())]
    Statvfs {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("Not enough space on {}: need {need} bytes, have {available} bytes", .path.display())]
    NoSpace {
        path: PathBuf,
        need: u64,
        available: u64,
    },
    #[error("{step} failed: {source}")]
    Activation {
        step: &'static str,
        #[source]
        source: HelperError,
    },
}

pub type Result<T> = std::result::Result<T, SwapFileError>;

/// Where the swap file lives and how big it must be
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTarget {
    pub path: PathBuf,
    pub size: u64,
    /// Shortfall tolerated when comparing against an existing swap size
    pub slack: u64,
}

impl SwapTarget {
    /// Size is the larger of `swap_mb` MiB and `percentage`% of RAM
    pub fn compute<P: Into<PathBuf>>(path: P, ram_bytes: u64, swap_mb: u64, percentage: u64) -> Self {
        let absolute = swap_mb.saturating_mul(MB);
        let relative = ram_bytes.saturating_mul(percentage) / 100;
        Self {
            path: path.into(),
            size: absolute.max(relative),
            slack: SWAP_RESERVED_SLACK,
        }
    }

    pub fn is_satisfied_by(&self, existing: u64) -> bool {
        existing >= self.size.saturating_sub(self.slack)
    }

    /// Directory whose filesystem will hold the file
    pub fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Current length of the backing file, 0 if it does not exist
    pub fn existing_len(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Bytes that must be free before allocation may start
pub fn required_free_space(target: &SwapTarget) -> u64 {
    target.size.saturating_add(SWAP_FREE_SPACE_MARGIN)
}

/// Fail unless `available` covers the whole target plus the safety margin
pub fn ensure_free_space(target: &SwapTarget, available: u64) -> Result<()> {
    let need = required_free_space(target);
    if available < need {
        return Err(SwapFileError::NoSpace {
            path: target.parent_dir().to_path_buf(),
            need,
            available,
        });
    }
    Ok(())
}

/// Free bytes available to unprivileged writers on the filesystem of `dir`
pub fn free_space(dir: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).map_err(|source| SwapFileError::Statvfs {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(stat.blocks_available() as u64 * stat.block_size() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// File was already large enough and left untouched
    AlreadySized,
    /// Space reserved with fallocate
    Reserved,
    /// fallocate unsupported; file extended with a trailing byte
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    Complete,
    Truncated { written: u64 },
}

/// Page-aligned fill buffer for direct writes
struct AlignedChunk {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedChunk {
    fn new(len: usize, fill: u8) -> Self {
        let storage = vec![fill; len + DIRECT_ALIGN];
        let offset = storage.as_ptr().align_offset(DIRECT_ALIGN);
        Self { storage, offset, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }
}

/// Space reservation step; fails with `EOPNOTSUPP` and friends where the
/// filesystem cannot preallocate
pub type ReserveFn = fn(&File, u64) -> nix::Result<()>;

/// Owns creation, sizing, pre-warming and activation of the swap file
pub struct SwapAreaController {
    runner: Arc<dyn CommandRunner>,
    reserve: ReserveFn,
    log: Logger,
}

impl SwapAreaController {
    pub fn new(runner: Arc<dyn CommandRunner>, log: Logger) -> Self {
        Self {
            runner,
            reserve: fallocate,
            log,
        }
    }

    pub fn with_reserve(mut self, reserve: ReserveFn) -> Self {
        self.reserve = reserve;
        self
    }

    /// Create or extend the file to `target.size` bytes. No-op if the file
    /// already satisfies the target.
    pub fn ensure_allocated(&self, target: &SwapTarget) -> Result<AllocOutcome> {
        let existing = target.existing_len();
        if target.path.exists() && target.is_satisfied_by(existing) {
            debug!(
                self.log,
                "swap: {} already {} (target {})",
                target.path.display(),
                format_size(existing),
                format_size(target.size)
            );
            return Ok(AllocOutcome::AlreadySized);
        }

        info!(
            self.log,
            "swap: allocating {} at {}",
            format_size(target.size),
            target.path.display()
        );

        // Create file with secure permissions (0600)
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&target.path)?;
        fs::set_permissions(&target.path, fs::Permissions::from_mode(0o600))?;

        let outcome = match (self.reserve)(&file, target.size) {
            Ok(()) => AllocOutcome::Reserved,
            Err(e) if is_unsupported(e) => {
                debug!(self.log, "swap: fallocate unsupported ({}), extending instead", e);
                file.write_all_at(&[0], target.size.saturating_sub(1))?;
                AllocOutcome::Extended
            }
            Err(e) => return Err(io::Error::from(e).into()),
        };
        file.sync_all()?;
        Ok(outcome)
    }

    /// Write the fill byte over the whole file with cache-bypassing writes.
    /// `should_abort` is checked before every chunk; an abort leaves the
    /// file correctly sized but only partially written.
    pub fn pre_warm<F: Fn() -> bool>(&self, target: &SwapTarget, should_abort: F) -> Result<WarmOutcome> {
        let chunk = AlignedChunk::new(PREWARM_CHUNK, PREWARM_FILL);
        let (mut file, mut direct) = open_for_warm(&target.path)?;
        if !direct {
            debug!(self.log, "swap: O_DIRECT unavailable, using buffered writes");
        }

        info!(self.log, "swap: pre-warming {}", target.path.display());
        let mut offset = 0u64;
        while offset < target.size {
            if should_abort() {
                file.sync_data()?;
                info!(
                    self.log,
                    "swap: pre-warm cut off after {} of {}",
                    format_size(offset),
                    format_size(target.size)
                );
                return Ok(WarmOutcome::Truncated { written: offset });
            }

            let len = (target.size - offset).min(PREWARM_CHUNK as u64) as usize;
            if direct && len % DIRECT_ALIGN != 0 {
                file = open_buffered(&target.path)?;
                direct = false;
            }

            let buf = &chunk.as_slice()[..len];
            if let Err(e) = file.write_all_at(buf, offset) {
                if !(direct && e.raw_os_error() == Some(libc::EINVAL)) {
                    return Err(e.into());
                }
                debug!(self.log, "swap: direct write rejected, falling back to buffered");
                file = open_buffered(&target.path)?;
                direct = false;
                file.write_all_at(buf, offset)?;
            }
            offset += len as u64;
        }

        file.sync_data()?;
        info!(self.log, "swap: pre-warm complete ({})", format_size(offset));
        Ok(WarmOutcome::Complete)
    }

    /// Format and enable the swap file via the configured command templates
    pub fn activate(&self, target: &SwapTarget, mkswap: &str, swapon: &str) -> Result<()> {
        let path = target.path.to_string_lossy();
        let args = [("swapfile", path.as_ref())];

        self.runner
            .run(mkswap, &args)
            .map_err(|source| SwapFileError::Activation { step: "mkswap", source })?;
        self.runner
            .run(swapon, &args)
            .map_err(|source| SwapFileError::Activation { step: "swapon", source })?;

        info!(self.log, "swap: {} enabled", target.path.display());
        Ok(())
    }
}

fn fallocate(file: &File, size: u64) -> nix::Result<()> {
    let len = libc::off_t::try_from(size).map_err(|_| Errno::EFBIG)?;
    nix::fcntl::fallocate(file.as_raw_fd(), FallocateFlags::empty(), 0, len)
}

fn is_unsupported(e: Errno) -> bool {
    matches!(e, Errno::EOPNOTSUPP | Errno::ENOSYS | Errno::EINVAL)
}

fn open_buffered(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

/// Open for direct I/O where the filesystem allows it
fn open_for_warm(path: &Path) -> io::Result<(File, bool)> {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
    {
        Ok(file) => Ok((file, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok((open_buffered(path)?, false)),
        Err(e) => Err(e),
    }
}
