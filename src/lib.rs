// hibinit-agent - Swap provisioning and hibernate-on-stop for cloud hosts
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod logging;

pub mod agent;
pub mod bootconfig;
pub mod config;
pub mod defaults;
pub mod freeze;
pub mod helpers;
pub mod meminfo;
pub mod metadata;
pub mod provision;
pub mod resume;
pub mod swapfile;
pub mod systemd;
pub mod watcher;
