// Centralised default values for all configuration keys.
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Config resolution reads `flag.or(file).unwrap_or(DEFAULT)`. Keeping the
// defaults here prevents drift between the CLI help, the config file
// template and the agent code.

use std::time::Duration;

use crate::helpers::MB;

// ── Swap ─────────────────────────────────────────────────────────────────────

pub const SWAP_FILE: &str = "/swap-hibinit";
pub const SWAP_MB: u64 = 4000;
pub const SWAP_PERCENTAGE: u64 = 100;
pub const MKSWAP: &str = "mkswap {swapfile}";
pub const SWAPON: &str = "swapon {swapfile}";
pub const TOUCH_SWAP: bool = true;
pub const CREATE_SWAP: bool = true;

/// Kernel-reported swap size may trail the file size by the header page
pub const SWAP_RESERVED_SLACK: u64 = 16 * MB;
/// Free space required on top of the swap file itself
pub const SWAP_FREE_SPACE_MARGIN: u64 = 100 * MB;
pub const PREWARM_CHUNK: usize = 1024 * 1024;
pub const PREWARM_FILL: u8 = b'b';

// ── Suspend ──────────────────────────────────────────────────────────────────

pub const HIBERNATE: &str = "systemctl hibernate";
pub const UPDATE_GRUB: bool = true;
pub const GRUB_UPDATE: &str = "grub2-mkconfig -o /boot/grub2/grub.cfg";
pub const GRUB_LEGACY_CONFIG: &str = "/boot/grub/menu.lst";
pub const GRUB_DROPIN_DIR: &str = "/etc/default/grub.d";
pub const GRUB_DROPIN_NAME: &str = "99-set-swap.cfg";
pub const FREEZE_TIMEOUT_CURVE: &str = "0-8:20,8-16:40,16-64:60,64-128:150,128-256:200,256-:400";
pub const PM_FREEZE_TIMEOUT: &str = "/sys/power/pm_freeze_timeout";
pub const SNAPSHOT_DEVICE: &str = "/dev/snapshot";

// ── Metadata service ─────────────────────────────────────────────────────────

pub const TOKEN_URL: &str = "http://169.254.169.254/latest/api/token";
pub const ACTION_URL: &str = "http://169.254.169.254/latest/meta-data/spot/instance-action";
pub const HIBERNATION_URL: &str =
    "http://169.254.169.254/latest/meta-data/hibernation/configured";
pub const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
pub const TOKEN_TTL_SECONDS: &str = "21600";
pub const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

// ── Watch loop ───────────────────────────────────────────────────────────────

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const SUSPEND_COOLDOWN: Duration = Duration::from_secs(20);
