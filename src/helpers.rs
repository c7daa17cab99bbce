// Helper utilities for hibinit-agent
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Not running as root")]
    NotRoot,
}

pub type Result<T> = std::result::Result<T, HelperError>;

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Check if running as root
pub fn am_i_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(HelperError::NotRoot)
    }
}

/// Write string to file
/// For sysfs/procfs (virtual filesystems), writes without fsync.
/// For real filesystem paths, calls sync_all to ensure persistence.
pub fn write_file<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path = path.as_ref();
    let mut file = fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    let path_str = path.to_string_lossy();
    if !path_str.starts_with("/sys/") && !path_str.starts_with("/proc/") {
        file.sync_all()?;
    }
    Ok(())
}

/// Replace each `{name}` placeholder in `template` with its value
pub fn substitute(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in args {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// External command seam. Every shell-out of the agent goes through here so
/// the provisioning logic can run against a recording fake.
pub trait CommandRunner: Send + Sync {
    fn run(&self, template: &str, args: &[(&str, &str)]) -> Result<()>;
}

/// Runs templates through `sh -c` after placeholder substitution
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, template: &str, args: &[(&str, &str)]) -> Result<()> {
        let cmd = substitute(template, args);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HelperError::CommandFailed(format!(
                "`{}` exited with {}: {}",
                cmd,
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    if bytes >= GB {
        format!("{:.1} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every command instead of running it
    #[derive(Default)]
    pub struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl RecordingRunner {
        pub fn failing_on(pattern: &str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail_on: Some(pattern.to_string()),
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, template: &str, args: &[(&str, &str)]) -> Result<()> {
            let cmd = substitute(template, args);
            self.commands.lock().unwrap().push(cmd.clone());
            match &self.fail_on {
                Some(p) if cmd.contains(p.as_str()) => Err(HelperError::CommandFailed(cmd)),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute() {
        assert_eq!(
            substitute("mkswap {swapfile}", &[("swapfile", "/swap")]),
            "mkswap /swap"
        );
        assert_eq!(substitute("swapon -a", &[("swapfile", "/swap")]), "swapon -a");
    }

    #[test]
    fn test_shell_runner() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("flag");
        let flag_str = flag.to_string_lossy().to_string();
        ShellRunner.run("touch {path}", &[("path", &flag_str)]).unwrap();
        assert!(flag.exists());

        let err = ShellRunner.run("exit 3", &[]).unwrap_err();
        assert!(matches!(err, HelperError::CommandFailed(_)));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(8 * GB), "8.0 GiB");
        assert_eq!(format_size(1536 * 1024), "1.5 MiB");
    }
}
