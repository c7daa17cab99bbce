// Boot-loader kernel command line updates for resume-from-swap
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::defaults::{GRUB_DROPIN_DIR, GRUB_DROPIN_NAME, GRUB_LEGACY_CONFIG};
use crate::helpers::{write_file, CommandRunner, HelperError};
use crate::logging::Logger;
use crate::{info, warn};

const CONSOLE_SUSPEND_TOKEN: &str = "no_console_suspend=1";

#[derive(Error, Debug)]
pub enum BootConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Helper error: {0}")]
    Helper(#[from] HelperError),
    #[error("Boot config regeneration failed: {0}")]
    Regenerate(#[source] HelperError),
}

pub type Result<T> = std::result::Result<T, BootConfigError>;

/// Rewrite one legacy grub `kernel` line: drop old resume tokens, then
/// append the console-suspend guard (once) and the new resume pair.
pub fn rewrite_kernel_line(line: &str, resume: &str, offset: u64) -> String {
    let indent_len = line.len() - line.trim_start().len();
    let (indent, body) = line.split_at(indent_len);

    let mut tokens: Vec<String> = body
        .split_whitespace()
        .filter(|t| !t.starts_with("resume=") && !t.starts_with("resume_offset="))
        .map(str::to_string)
        .collect();
    if !tokens.iter().any(|t| t.starts_with("no_console_suspend")) {
        tokens.push(CONSOLE_SUSPEND_TOKEN.to_string());
    }
    tokens.push(format!("resume={}", resume));
    tokens.push(format!("resume_offset={}", offset));

    format!("{}{}", indent, tokens.join(" "))
}

/// Apply [`rewrite_kernel_line`] to every `kernel` line of a menu.lst
pub fn rewrite_legacy_config(content: &str, resume: &str, offset: u64) -> String {
    let mut out: Vec<String> = content
        .lines()
        .map(|line| {
            if line.split_whitespace().next() == Some("kernel") {
                rewrite_kernel_line(line, resume, offset)
            } else {
                line.to_string()
            }
        })
        .collect();
    if content.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}

/// grub2 drop-in extending the default kernel command line
pub fn dropin_fragment(resume: &str, offset: u64) -> String {
    format!(
        "GRUB_CMDLINE_LINUX_DEFAULT=\"$GRUB_CMDLINE_LINUX_DEFAULT {} resume={} resume_offset={}\"\n",
        CONSOLE_SUSPEND_TOKEN, resume, offset
    )
}

/// Persists the resume device and offset across reboots
pub struct BootConfig {
    legacy_path: PathBuf,
    dropin_dir: PathBuf,
    regenerate: String,
    runner: Arc<dyn CommandRunner>,
    log: Logger,
}

impl BootConfig {
    pub fn new(runner: Arc<dyn CommandRunner>, regenerate: &str, log: Logger) -> Self {
        Self {
            legacy_path: PathBuf::from(GRUB_LEGACY_CONFIG),
            dropin_dir: PathBuf::from(GRUB_DROPIN_DIR),
            regenerate: regenerate.to_string(),
            runner,
            log,
        }
    }

    pub fn with_paths<P: Into<PathBuf>, Q: Into<PathBuf>>(mut self, legacy: P, dropin_dir: Q) -> Self {
        self.legacy_path = legacy.into();
        self.dropin_dir = dropin_dir.into();
        self
    }

    /// Write the resume pair to whichever boot-loader layouts are present.
    /// Returns whether anything was updated.
    pub fn update(&self, resume: &str, offset: u64) -> Result<bool> {
        let mut updated = false;

        if self.legacy_path.is_file() {
            let content = fs::read_to_string(&self.legacy_path)?;
            let rewritten = rewrite_legacy_config(&content, resume, offset);
            if rewritten != content {
                write_file(&self.legacy_path, &rewritten)?;
                info!(self.log, "boot: updated {}", self.legacy_path.display());
            }
            updated = true;
        }

        if self.dropin_dir.is_dir() {
            let dropin = self.dropin_path();
            write_file(&dropin, &dropin_fragment(resume, offset))?;
            info!(self.log, "boot: wrote {}", dropin.display());
            self.runner
                .run(&self.regenerate, &[])
                .map_err(BootConfigError::Regenerate)?;
            updated = true;
        }

        if !updated {
            warn!(
                self.log,
                "boot: neither {} nor {} found, kernel command line left unchanged",
                self.legacy_path.display(),
                self.dropin_dir.display()
            );
        }
        Ok(updated)
    }

    fn dropin_path(&self) -> PathBuf {
        Path::new(&self.dropin_dir).join(GRUB_DROPIN_NAME)
    }
}
