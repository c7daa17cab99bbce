// Configuration parsing for hibinit-agent
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;

use crate::defaults;
use crate::logging::Logger;
use crate::metadata::Endpoints;
use crate::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid boolean for {key}: '{value}'")]
    InvalidBool { key: String, value: String },
    #[error("Invalid number for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration paths
pub const ETC_CONFIG: &str = "/etc/hibinit/hibinit.conf";
pub const ETC_CONFIG_D: &str = "/etc/hibinit/conf.d";

/// Keys are stored with `-` separators; `swap_file` and `swap-file` are the same key
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('_', "-")
}

/// Raw key=value pairs from the config file and its conf.d fragments
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Load the main file (`--config` path or [`ETC_CONFIG`]) and then
    /// [`ETC_CONFIG_D`] fragments
    pub fn load(explicit: Option<&Path>, log: &Logger) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path, true, Path::new(ETC_CONFIG_D), log),
            None => Self::load_from(Path::new(ETC_CONFIG), false, Path::new(ETC_CONFIG_D), log),
        }
    }

    /// A missing main file is an error only when `required`
    pub fn load_from(main: &Path, required: bool, conf_d: &Path, log: &Logger) -> Result<Self> {
        let mut config = Self::default();

        if required || main.exists() {
            info!(log, "config: load {}", main.display());
            config.merge_file(main)?;
        }

        // Fragments apply in basename order, later ones win
        let pattern = format!("{}/*.conf", conf_d.display());
        if let Ok(entries) = glob(&pattern) {
            let mut fragments: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
            fragments.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            for path in fragments {
                info!(log, "config: load {}", path.display());
                config.merge_file(&path)?;
            }
        }

        debug!(log, "config: {} keys", config.values.len());
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.values.extend(Self::parse(&content));
        Ok(())
    }

    /// Parse `key = value` lines. Comments (`#`, `;`), `[section]` headers
    /// and lines without `=` are skipped; surrounding quotes are stripped.
    pub fn parse(content: &str) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                values.insert(normalize_key(key), value.to_string());
            }
        }
        values
    }

    pub fn from_content(content: &str) -> Self {
        Self {
            values: Self::parse(content),
        }
    }

    /// Get optional value
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(|s| s.as_str())
    }
}

/// yes/y/1/true/on and no/n/0/false/off, case-insensitive
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "y" | "1" | "true" | "on" => Ok(true),
        "no" | "n" | "0" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Command-line overrides; every flag beats the config file
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Swap file location
    #[arg(long)]
    pub swap_file: Option<String>,
    /// Minimum swap size in MiB
    #[arg(long)]
    pub swap_mb: Option<String>,
    /// Swap size as a percentage of RAM
    #[arg(long)]
    pub swap_percentage: Option<String>,
    /// Command that formats the swap file ({swapfile} is substituted)
    #[arg(long)]
    pub mkswap: Option<String>,
    /// Command that enables the swap file ({swapfile} is substituted)
    #[arg(long)]
    pub swapon: Option<String>,
    /// Command that hibernates the machine
    #[arg(long)]
    pub hibernate: Option<String>,
    /// Command that regenerates the boot-loader configuration
    #[arg(long)]
    pub grub_update: Option<String>,
    /// Pre-warm the swap file by writing every block
    #[arg(long)]
    pub touch_swap: Option<String>,
    /// Create the swap file when existing swap is too small
    #[arg(long)]
    pub create_swap: Option<String>,
    /// Write resume= and resume_offset= to the boot loader
    #[arg(long)]
    pub update_grub: Option<String>,
    /// RAM to pm_freeze_timeout curve, `lo-hi:secs` GiB ranges
    #[arg(long)]
    pub freeze_timeout_curve: Option<String>,
    #[arg(long)]
    pub token_url: Option<String>,
    #[arg(long)]
    pub action_url: Option<String>,
    #[arg(long)]
    pub hibernation_url: Option<String>,
    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Fully resolved agent settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub swap_file: PathBuf,
    pub swap_mb: u64,
    pub swap_percentage: u64,
    pub mkswap: String,
    pub swapon: String,
    pub hibernate: String,
    pub grub_update: String,
    pub touch_swap: bool,
    pub create_swap: bool,
    pub update_grub: bool,
    pub freeze_timeout_curve: String,
    pub endpoints: Endpoints,
    pub verbose: bool,
}

impl Settings {
    /// Flag, then config value, then built-in default
    pub fn resolve(flags: &Overrides, config: &Config) -> Result<Self> {
        let pick = |key: &str, flag: &Option<String>| -> Option<String> {
            flag.clone().or_else(|| config.get_opt(key).map(str::to_string))
        };
        let text = |key: &str, flag: &Option<String>, default: &str| -> String {
            pick(key, flag).unwrap_or_else(|| default.to_string())
        };
        let boolean = |key: &str, flag: &Option<String>, default: bool| -> Result<bool> {
            pick(key, flag).map_or(Ok(default), |v| parse_bool(key, &v))
        };
        let number = |key: &str, flag: &Option<String>, default: u64| -> Result<u64> {
            pick(key, flag).map_or(Ok(default), |v| parse_number(key, &v))
        };

        let verbose = if flags.verbose {
            true
        } else {
            config
                .get_opt("verbose")
                .map_or(Ok(false), |v| parse_bool("verbose", v))?
        };

        Ok(Self {
            swap_file: PathBuf::from(text("swap-file", &flags.swap_file, defaults::SWAP_FILE)),
            swap_mb: number("swap-mb", &flags.swap_mb, defaults::SWAP_MB)?,
            swap_percentage: number(
                "swap-percentage",
                &flags.swap_percentage,
                defaults::SWAP_PERCENTAGE,
            )?,
            mkswap: text("mkswap", &flags.mkswap, defaults::MKSWAP),
            swapon: text("swapon", &flags.swapon, defaults::SWAPON),
            hibernate: text("hibernate", &flags.hibernate, defaults::HIBERNATE),
            grub_update: text("grub-update", &flags.grub_update, defaults::GRUB_UPDATE),
            touch_swap: boolean("touch-swap", &flags.touch_swap, defaults::TOUCH_SWAP)?,
            create_swap: boolean("create-swap", &flags.create_swap, defaults::CREATE_SWAP)?,
            update_grub: boolean("update-grub", &flags.update_grub, defaults::UPDATE_GRUB)?,
            freeze_timeout_curve: text(
                "freeze-timeout-curve",
                &flags.freeze_timeout_curve,
                defaults::FREEZE_TIMEOUT_CURVE,
            ),
            endpoints: Endpoints {
                token_url: text("token-url", &flags.token_url, defaults::TOKEN_URL),
                action_url: text("action-url", &flags.action_url, defaults::ACTION_URL),
                hibernation_url: text(
                    "hibernation-url",
                    &flags.hibernation_url,
                    defaults::HIBERNATION_URL,
                ),
            },
            verbose,
        })
    }
}
