// Agent startup: decide what to provision, then watch for stop
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::bootconfig::BootConfig;
use crate::config::Settings;
use crate::defaults::PM_FREEZE_TIMEOUT;
use crate::freeze::apply_freeze_timeout;
use crate::helpers::{am_i_root, format_size, CommandRunner, HelperError, ShellRunner};
use crate::logging::Logger;
use crate::meminfo::{get_ram_size, get_swap_total, MemInfoError};
use crate::metadata::MetadataClient;
use crate::provision::{ProvisioningTask, SwapProvisioner};
use crate::resume::{KernelSuspendControl, SuspendControl, SuspendOffsetBinder};
use crate::swapfile::{ensure_free_space, free_space, SwapAreaController, SwapFileError, SwapTarget};
use crate::systemd::{notify_ready, notify_status};
use crate::watcher::{CommandSuspend, StopSignalWatcher};
use crate::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{0}")]
    Helper(#[from] HelperError),
    #[error("Memory info error: {0}")]
    MemInfo(#[from] MemInfoError),
    #[error("{0}")]
    Swap(#[from] SwapFileError),
    #[error("Existing swap {existing} bytes is below target {target} bytes and swap creation is disabled")]
    InsufficientSwap { existing: u64, target: u64 },
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    /// Enough swap is already active; only the resume binding is needed
    BindExisting,
    /// Create the swap file in the background
    Provision,
}

/// Decide how to start. `available` is only queried when provisioning is
/// needed and creation is allowed.
pub fn plan_startup<F>(target: &SwapTarget, existing_swap: u64, create_swap: bool, available: F) -> Result<StartupPlan>
where
    F: FnOnce() -> std::result::Result<u64, SwapFileError>,
{
    if target.is_satisfied_by(existing_swap) {
        return Ok(StartupPlan::BindExisting);
    }
    if !create_swap {
        return Err(AgentError::InsufficientSwap {
            existing: existing_swap,
            target: target.size,
        });
    }
    ensure_free_space(target, available()?)?;
    Ok(StartupPlan::Provision)
}

/// Wires the components from resolved settings
pub struct Agent {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn SuspendControl>,
    freeze_timeout_path: PathBuf,
    log: Logger,
}

impl Agent {
    pub fn new(settings: Settings, log: Logger) -> Self {
        Self::with_collaborators(
            settings,
            Arc::new(ShellRunner),
            Arc::new(KernelSuspendControl::default()),
            log,
        )
    }

    pub fn with_collaborators(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        control: Arc<dyn SuspendControl>,
        log: Logger,
    ) -> Self {
        Self {
            settings,
            runner,
            control,
            freeze_timeout_path: PathBuf::from(PM_FREEZE_TIMEOUT),
            log,
        }
    }

    pub fn with_freeze_timeout_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.freeze_timeout_path = path.into();
        self
    }

    fn binder(&self) -> SuspendOffsetBinder {
        let boot = BootConfig::new(
            self.runner.clone(),
            &self.settings.grub_update,
            self.log.scoped("boot"),
        );
        SuspendOffsetBinder::new(self.control.clone(), boot, self.log.scoped("resume"))
    }

    fn watcher(&self) -> StopSignalWatcher {
        let source = MetadataClient::new(self.settings.endpoints.clone(), self.log.scoped("metadata"));
        let action = CommandSuspend::new(self.runner.clone(), &self.settings.hibernate);
        StopSignalWatcher::new(Box::new(source), Box::new(action), self.log.scoped("watch"))
    }

    fn apply_freeze_timeout(&self, ram: u64) {
        match apply_freeze_timeout(&self.settings.freeze_timeout_curve, ram, &self.freeze_timeout_path) {
            Ok(Some(secs)) => info!(self.log, "freeze timeout set to {}s", secs),
            Ok(None) => debug!(self.log, "no freeze timeout for {} of RAM", format_size(ram)),
            Err(e) => warn!(self.log, "freeze timeout not applied: {}", e),
        }
    }

    /// Start the task and hand it to the watcher. A task that cannot be
    /// started leaves the watcher running without swap backing.
    fn start_provisioning(&self, watcher: &mut StopSignalWatcher, mut task: ProvisioningTask) {
        if let Err(e) = task.start() {
            error!(self.log, "swap provisioning not started: {}", e);
            notify_status("Swap provisioning failed");
            return;
        }
        if let Err(e) = watcher.attach(task) {
            warn!(self.log, "{}", e);
        }
    }

    /// Everything up to the watch loop. `None` means hibernation is managed
    /// by the platform and the agent has nothing to do.
    pub fn prepare(&self) -> Result<Option<StopSignalWatcher>> {
        let metadata = MetadataClient::new(self.settings.endpoints.clone(), self.log.scoped("metadata"));
        if metadata.hibernation_configured() {
            info!(self.log, "hibernation already configured, exiting");
            return Ok(None);
        }

        let ram = get_ram_size()?;
        self.apply_freeze_timeout(ram);

        let s = &self.settings;
        let target = SwapTarget::compute(&s.swap_file, ram, s.swap_mb, s.swap_percentage);
        let existing = get_swap_total()?;
        info!(
            self.log,
            "RAM {}, swap target {}, existing swap {}",
            format_size(ram),
            format_size(target.size),
            format_size(existing)
        );

        let plan = plan_startup(&target, existing, s.create_swap, || free_space(target.parent_dir()))?;
        let mut watcher = self.watcher();

        match plan {
            StartupPlan::BindExisting => {
                info!(self.log, "existing swap is sufficient");
                if let Err(e) = self.binder().bind(&target.path, s.update_grub) {
                    error!(self.log, "resume binding failed: {}", e);
                }
            }
            StartupPlan::Provision => {
                info!(self.log, "provisioning {} at {}", format_size(target.size), target.path.display());
                notify_status("Provisioning swap file...");
                let job = SwapProvisioner {
                    controller: SwapAreaController::new(self.runner.clone(), self.log.scoped("swap")),
                    binder: self.binder(),
                    target,
                    mkswap: s.mkswap.clone(),
                    swapon: s.swapon.clone(),
                    prewarm: s.touch_swap,
                    update_boot_config: s.update_grub,
                    log: self.log.scoped("provision"),
                };
                let task = ProvisioningTask::new(Box::new(job), self.log.scoped("provision"));
                self.start_provisioning(&mut watcher, task);
            }
        }
        Ok(Some(watcher))
    }

    /// Root check, startup, then the watch loop for the rest of the process
    pub fn run(self) -> Result<()> {
        am_i_root()?;
        let Some(mut watcher) = self.prepare()? else {
            return Ok(());
        };
        notify_ready();
        notify_status("Watching for stop signal...");
        watcher.run()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Method, Response, Server};

    use super::*;
    use crate::config::{Config, Overrides};
    use crate::helpers::testing::RecordingRunner;
    use crate::helpers::MB;
    use crate::provision::{CutoffToken, Provisioner};
    use crate::resume::testing::FakeSuspendControl;

    fn target(size: u64, dir: &std::path::Path) -> SwapTarget {
        SwapTarget {
            path: dir.join("swapfile"),
            size,
            slack: 16 * MB,
        }
    }

    #[test]
    fn test_plan_existing_swap_sufficient() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(1000 * MB, dir.path());
        let plan = plan_startup(&t, 990 * MB, false, || panic!("free space not needed")).unwrap();
        assert_eq!(plan, StartupPlan::BindExisting);
    }

    #[test]
    fn test_plan_creation_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(1000 * MB, dir.path());
        let err = plan_startup(&t, 0, false, || Ok(u64::MAX)).unwrap_err();
        assert!(matches!(err, AgentError::InsufficientSwap { existing: 0, .. }));
    }

    #[test]
    fn test_plan_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let t = target(1000 * MB, dir.path());
        assert_eq!(plan_startup(&t, 0, true, || Ok(2000 * MB)).unwrap(), StartupPlan::Provision);
        assert!(matches!(
            plan_startup(&t, 0, true, || Ok(900 * MB)),
            Err(AgentError::Swap(SwapFileError::NoSpace { .. }))
        ));
    }

    /// Metadata stub: token on PUT, `flag` body on GET (404 when `None`)
    fn metadata_server(flag: Option<&'static str>) -> String {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        thread::spawn(move || {
            for req in server.incoming_requests() {
                let response = match (req.method(), flag) {
                    (Method::Put, _) => Response::from_string("token"),
                    (_, Some(body)) => Response::from_string(body),
                    (_, None) => Response::from_string("").with_status_code(404),
                };
                let _ = req.respond(response);
            }
        });
        format!("http://127.0.0.1:{port}")
    }

    fn settings(base: &str, dir: &std::path::Path) -> Settings {
        let flags = Overrides {
            swap_file: Some(dir.join("swapfile").display().to_string()),
            swap_mb: Some("0".into()),
            swap_percentage: Some("0".into()),
            update_grub: Some("no".into()),
            token_url: Some(format!("{}/token", base)),
            action_url: Some(format!("{}/action", base)),
            hibernation_url: Some(format!("{}/configured", base)),
            ..Default::default()
        };
        Settings::resolve(&flags, &Config::default()).unwrap()
    }

    fn agent(settings: Settings, dir: &std::path::Path, control: Arc<FakeSuspendControl>) -> Agent {
        Agent::with_collaborators(settings, Arc::new(RecordingRunner::default()), control, Logger::new("test"))
            .with_freeze_timeout_path(dir.join("pm_freeze_timeout"))
    }

    #[test]
    fn test_prepare_exits_when_hibernation_configured() {
        let dir = tempfile::tempdir().unwrap();
        let base = metadata_server(Some("true"));
        let control = Arc::new(FakeSuspendControl::new(202, 1, 8));
        let agent = agent(settings(&base, dir.path()), dir.path(), control.clone());
        assert!(agent.prepare().unwrap().is_none());
        assert!(control.binds().is_empty());
    }

    #[test]
    fn test_prepare_binds_existing_swap() {
        let dir = tempfile::tempdir().unwrap();
        let base = metadata_server(None);
        let control = Arc::new(FakeSuspendControl::new(202, 1, 8));
        let agent = agent(settings(&base, dir.path()), dir.path(), control.clone());

        let watcher = agent.prepare().unwrap().unwrap();
        assert!(!watcher.has_task());
        assert_eq!(control.binds().len(), 1);
        assert!(dir.path().join("pm_freeze_timeout").exists());
    }

    #[test]
    fn test_prepare_flag_literal_false() {
        let dir = tempfile::tempdir().unwrap();
        let base = metadata_server(Some("False\n"));
        let control = Arc::new(FakeSuspendControl::new(202, 1, 8));
        let agent = agent(settings(&base, dir.path()), dir.path(), control);
        assert!(agent.prepare().unwrap().is_some());
    }

    struct Noop;

    impl Provisioner for Noop {
        fn provision(&mut self, _cutoff: &CutoffToken) -> crate::provision::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_start_failure_keeps_watching() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(FakeSuspendControl::new(202, 1, 8));
        let agent = agent(settings("http://127.0.0.1:9", dir.path()), dir.path(), control);
        let mut watcher = agent.watcher();

        // a task that was already started cannot be started again
        let mut task = ProvisioningTask::new(Box::new(Noop), Logger::new("test"));
        task.start().unwrap();
        task.force_cutoff().unwrap();

        agent.start_provisioning(&mut watcher, task);
        assert!(!watcher.has_task());
    }
}
