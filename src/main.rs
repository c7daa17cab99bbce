// hibinit-agent - Swap provisioning and hibernate-on-stop for cloud hosts
// SPDX-License-Identifier: GPL-3.0-or-later

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;

use hibinit_agent::agent::Agent;
use hibinit_agent::config::{Config, ConfigError, Overrides, Settings};
use hibinit_agent::logging::{self, Logger};
use hibinit_agent::{debug, error};

#[derive(Parser)]
#[command(name = "hibinit-agent")]
#[command(about = "Prepare swap for hibernation and hibernate when the instance is stopped")]
#[command(version)]
struct Cli {
    /// Config file to use instead of /etc/hibinit/hibinit.conf
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Config is read before the log backend exists, so its messages are dropped
fn load_settings(cli: &Cli) -> Result<Settings, ConfigError> {
    let config = Config::load(cli.config.as_deref(), &Logger::new("config"))?;
    Settings::resolve(&cli.overrides, &config)
}

fn run(settings: Settings, log: Logger) -> Result<(), Box<dyn Error>> {
    debug!(log, "settings: {:?}", settings);
    Agent::new(settings, log).run()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let settings = load_settings(&cli);
    let verbose = settings.as_ref().map_or(cli.overrides.verbose, |s| s.verbose);
    let log = logging::init(verbose);

    let result = match settings {
        Ok(settings) => run(settings, log.clone()),
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!(log, "{}", e);
        std::process::exit(1);
    }
}
