// Resume binding: swap file -> (block device, page offset) -> kernel
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::bootconfig::{BootConfig, BootConfigError};
use crate::defaults::SNAPSHOT_DEVICE;
use crate::logging::Logger;
use crate::meminfo::get_page_size;
use crate::{debug, info};

const SYS_DEV_BLOCK: &str = "/sys/dev/block";

#[derive(Error, Debug)]
pub enum BindError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{} cannot be used for resume: {reason}", .path.display())]
    NotAddressable { path: PathBuf, reason: String },
    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("Boot config error: {0}")]
    BootConfig(#[from] BootConfigError),
}

pub type Result<T> = std::result::Result<T, BindError>;

/// Block device number as the kernel sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn from_dev(dev: u64) -> Self {
        Self {
            major: nix::sys::stat::major(dev as libc::dev_t) as u32,
            minor: nix::sys::stat::minor(dev as libc::dev_t) as u32,
        }
    }

    /// The kernel's 32-bit `new_encode_dev` layout
    pub fn encode(&self) -> u32 {
        (self.minor & 0xff) | (self.major << 8) | ((self.minor & !0xff) << 12)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Where a suspended image will be found at resume time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapBinding {
    pub device: DeviceId,
    /// Device node, when sysfs could name it
    pub device_path: Option<PathBuf>,
    /// Offset of the swap header, in pages
    pub offset: u64,
}

impl SwapBinding {
    /// Value for the `resume=` kernel argument
    pub fn resume_arg(&self) -> String {
        match &self.device_path {
            Some(path) => path.display().to_string(),
            None => self.device.to_string(),
        }
    }
}

/// Privileged kernel operations needed for resume binding
pub trait SuspendControl: Send + Sync {
    /// Page offset of the first block of `path` on its device
    fn resolve_block_offset(&self, path: &Path) -> Result<u64>;

    /// Arm the resume path with the given device and page offset
    fn bind_suspend_area(&self, device: DeviceId, offset: u64) -> Result<()>;

    fn device_of(&self, path: &Path) -> Result<DeviceId> {
        let device = DeviceId::from_dev(fs::metadata(path)?.dev());
        if device.major == 0 {
            return Err(BindError::NotAddressable {
                path: path.to_path_buf(),
                reason: format!("backing device {} is virtual", device),
            });
        }
        Ok(device)
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default)]
struct FiemapRequest {
    header: FiemapHeader,
    extents: [FiemapExtent; 1],
}

#[repr(C, packed)]
struct ResumeSwapArea {
    offset: i64,
    dev: u32,
}

const FIEMAP_FLAG_SYNC: u32 = 0x0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0002;
const FIEMAP_EXTENT_DELALLOC: u32 = 0x0004;
const FIEMAP_EXTENT_ENCODED: u32 = 0x0008;
const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x0100;
const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0200;
const FIEMAP_EXTENT_DATA_TAIL: u32 = 0x0400;

const UNADDRESSABLE_EXTENT: u32 = FIEMAP_EXTENT_UNKNOWN
    | FIEMAP_EXTENT_DELALLOC
    | FIEMAP_EXTENT_ENCODED
    | FIEMAP_EXTENT_NOT_ALIGNED
    | FIEMAP_EXTENT_DATA_INLINE
    | FIEMAP_EXTENT_DATA_TAIL;

mod ioctl {
    use super::{FiemapHeader, ResumeSwapArea};

    nix::ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, FiemapHeader);
    nix::ioctl_write_ptr!(snapshot_set_swap_area, b'3', 13, ResumeSwapArea);
}

/// FIEMAP for offsets and /dev/snapshot for arming resume
#[derive(Debug, Clone)]
pub struct KernelSuspendControl {
    snapshot: PathBuf,
}

impl Default for KernelSuspendControl {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from(SNAPSHOT_DEVICE),
        }
    }
}

impl SuspendControl for KernelSuspendControl {
    fn resolve_block_offset(&self, path: &Path) -> Result<u64> {
        let file = File::open(path)?;
        let mut req = FiemapRequest::default();
        req.header.fm_length = u64::MAX;
        req.header.fm_flags = FIEMAP_FLAG_SYNC;
        req.header.fm_extent_count = 1;

        // The kernel writes the extent array that follows the header
        let ptr = (&mut req as *mut FiemapRequest).cast::<FiemapHeader>();
        unsafe { ioctl::fs_ioc_fiemap(file.as_raw_fd(), ptr) }
            .map_err(|source| BindError::Ioctl { op: "FS_IOC_FIEMAP", source })?;

        first_extent_offset(path, &req, get_page_size())
    }

    fn bind_suspend_area(&self, device: DeviceId, offset: u64) -> Result<()> {
        let snapshot = File::open(&self.snapshot)?;
        let area = ResumeSwapArea {
            offset: offset as i64,
            dev: device.encode(),
        };
        unsafe { ioctl::snapshot_set_swap_area(snapshot.as_raw_fd(), &area) }
            .map_err(|source| BindError::Ioctl { op: "SNAPSHOT_SET_SWAP_AREA", source })?;
        Ok(())
    }
}

fn first_extent_offset(path: &Path, req: &FiemapRequest, page_size: u64) -> Result<u64> {
    let not_addressable = |reason: String| BindError::NotAddressable {
        path: path.to_path_buf(),
        reason,
    };

    if req.header.fm_mapped_extents == 0 {
        return Err(not_addressable("no mapped extents".into()));
    }
    let extent = &req.extents[0];
    if extent.fe_logical != 0 {
        return Err(not_addressable(format!(
            "file starts with a hole ({} bytes)",
            extent.fe_logical
        )));
    }
    if extent.fe_flags & UNADDRESSABLE_EXTENT != 0 {
        return Err(not_addressable(format!("extent flags {:#x}", extent.fe_flags)));
    }
    if extent.fe_physical % page_size != 0 {
        return Err(not_addressable(format!(
            "physical offset {} not page aligned",
            extent.fe_physical
        )));
    }
    Ok(extent.fe_physical / page_size)
}

/// Device node for a block device number, via sysfs `uevent`
fn lookup_device_node(sys_dev_block: &Path, device: DeviceId) -> Option<PathBuf> {
    let uevent = fs::read_to_string(sys_dev_block.join(device.to_string()).join("uevent")).ok()?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| Path::new("/dev").join(name.trim()))
}

/// Binds the ready swap file to the kernel resume path and, optionally,
/// the boot configuration. Safe to repeat for the same file.
pub struct SuspendOffsetBinder {
    control: Arc<dyn SuspendControl>,
    boot: BootConfig,
    sys_dev_block: PathBuf,
    log: Logger,
}

impl SuspendOffsetBinder {
    pub fn new(control: Arc<dyn SuspendControl>, boot: BootConfig, log: Logger) -> Self {
        Self {
            control,
            boot,
            sys_dev_block: PathBuf::from(SYS_DEV_BLOCK),
            log,
        }
    }

    pub fn with_sys_dev_block<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sys_dev_block = path.into();
        self
    }

    pub fn resolve_binding(&self, swap_file: &Path) -> Result<SwapBinding> {
        let device = self.control.device_of(swap_file)?;
        let offset = self.control.resolve_block_offset(swap_file)?;
        let device_path = lookup_device_node(&self.sys_dev_block, device);
        debug!(
            self.log,
            "resume: {} is on {} ({:?}) at page {}",
            swap_file.display(),
            device,
            device_path,
            offset
        );
        Ok(SwapBinding {
            device,
            device_path,
            offset,
        })
    }

    pub fn apply(&self, binding: &SwapBinding, update_boot_config: bool) -> Result<()> {
        self.control.bind_suspend_area(binding.device, binding.offset)?;
        info!(
            self.log,
            "resume: armed {} offset {}",
            binding.resume_arg(),
            binding.offset
        );

        if update_boot_config {
            self.boot.update(&binding.resume_arg(), binding.offset)?;
        }
        Ok(())
    }

    /// Resolve then apply in one step
    pub fn bind(&self, swap_file: &Path, update_boot_config: bool) -> Result<SwapBinding> {
        let binding = self.resolve_binding(swap_file)?;
        self.apply(&binding, update_boot_config)?;
        Ok(binding)
    }
}
