// Stop-signal watch loop and suspend trigger
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::defaults::{POLL_INTERVAL, SUSPEND_COOLDOWN};
use crate::helpers::{CommandRunner, HelperError};
use crate::logging::Logger;
use crate::provision::ProvisioningTask;
use crate::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Suspend failed: {0}")]
    Suspend(#[source] HelperError),
    #[error("A provisioning task is already attached")]
    TaskAttached,
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Answers "has the host been told to stop?" once per tick
pub trait StopSignalSource: Send {
    fn stop_requested(&self) -> bool;
}

/// Puts the machine to sleep
pub trait SuspendAction: Send {
    fn suspend(&self) -> Result<()>;
}

/// Suspend by running the configured hibernate command
pub struct CommandSuspend {
    runner: Arc<dyn CommandRunner>,
    command: String,
}

impl CommandSuspend {
    pub fn new(runner: Arc<dyn CommandRunner>, command: &str) -> Self {
        Self {
            runner,
            command: command.to_string(),
        }
    }
}

impl SuspendAction for CommandSuspend {
    fn suspend(&self) -> Result<()> {
        self.runner.run(&self.command, &[]).map_err(WatchError::Suspend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No stop signal this tick
    Idle,
    Suspended,
    /// Suspend action ran and reported failure
    SuspendFailed,
    /// Signal seen but a suspend was issued within the cooldown window
    CoolingDown,
}

pub struct StopSignalWatcher {
    source: Box<dyn StopSignalSource>,
    action: Box<dyn SuspendAction>,
    task: Option<ProvisioningTask>,
    interval: Duration,
    cooldown: Duration,
    last_suspend: Option<Instant>,
    log: Logger,
}

impl StopSignalWatcher {
    pub fn new(source: Box<dyn StopSignalSource>, action: Box<dyn SuspendAction>, log: Logger) -> Self {
        Self {
            source,
            action,
            task: None,
            interval: POLL_INTERVAL,
            cooldown: SUSPEND_COOLDOWN,
            last_suspend: None,
            log,
        }
    }

    pub fn with_timing(mut self, interval: Duration, cooldown: Duration) -> Self {
        self.interval = interval;
        self.cooldown = cooldown;
        self
    }

    /// Watch a running provisioning task. Only one may be attached.
    pub fn attach(&mut self, task: ProvisioningTask) -> Result<()> {
        if self.task.is_some() {
            return Err(WatchError::TaskAttached);
        }
        self.task = Some(task);
        Ok(())
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// One iteration without the trailing sleep.
    ///
    /// A finished provisioning task is detached, logging any failure it
    /// stored; the stop signal is queried on every tick regardless. Suspend
    /// is only issued once no task is running.
    pub fn poll_once(&mut self) -> TickOutcome {
        if let Some(task) = self.task.as_mut() {
            match task.poll_completion() {
                Ok(false) => {}
                Ok(true) => {
                    info!(self.log, "watch: provisioning finished ({:?})", task.state());
                    self.task = None;
                }
                Err(e) => {
                    error!(self.log, "watch: provisioning failed, continuing without swap: {}", e);
                    self.task = None;
                }
            }
        }

        if !self.source.stop_requested() {
            return TickOutcome::Idle;
        }

        if let Some(last) = self.last_suspend {
            if last.elapsed() < self.cooldown {
                debug!(self.log, "watch: stop signal ignored, suspend issued {:?} ago", last.elapsed());
                return TickOutcome::CoolingDown;
            }
        }

        info!(self.log, "watch: stop signal received");
        if let Some(mut task) = self.task.take() {
            info!(self.log, "watch: cutting off swap provisioning");
            match task.force_cutoff() {
                Ok(state) => info!(self.log, "watch: provisioning ended as {:?}", state),
                Err(e) => error!(self.log, "watch: provisioning failed, suspending anyway: {}", e),
            }
        }

        self.last_suspend = Some(Instant::now());
        match self.action.suspend() {
            Ok(()) => {
                info!(self.log, "watch: suspend triggered");
                TickOutcome::Suspended
            }
            Err(e) => {
                warn!(self.log, "watch: {}", e);
                TickOutcome::SuspendFailed
            }
        }
    }

    /// One iteration followed by the poll interval, or the cooldown after a
    /// suspend attempt
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.poll_once();
        let pause = match outcome {
            TickOutcome::Suspended | TickOutcome::SuspendFailed => self.cooldown,
            _ => self.interval,
        };
        thread::sleep(pause);
        outcome
    }

    /// Watch forever; the process ends by being suspended or killed
    pub fn run(&mut self) -> ! {
        loop {
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::helpers::testing::RecordingRunner;
    use crate::provision::{CutoffToken, Provisioner, ProvisioningState};
    use crate::swapfile::SwapFileError;

    struct FakeSource {
        signal: Arc<AtomicBool>,
        polls: Arc<AtomicUsize>,
    }

    impl StopSignalSource for FakeSource {
        fn stop_requested(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.signal.load(Ordering::SeqCst)
        }
    }

    /// Records suspend calls and whether provisioning had finished by then
    struct FakeAction {
        calls: Arc<AtomicUsize>,
        provisioning_done: Arc<AtomicBool>,
        gated: Arc<AtomicBool>,
        fail: bool,
    }

    impl SuspendAction for FakeAction {
        fn suspend(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gated
                .store(self.provisioning_done.load(Ordering::SeqCst), Ordering::SeqCst);
            if self.fail {
                Err(WatchError::Suspend(HelperError::CommandFailed("hibernate".into())))
            } else {
                Ok(())
            }
        }
    }

    /// Runs until cut off, then lingers before marking itself done
    struct SlowProvisioner {
        done: Arc<AtomicBool>,
        fail: bool,
    }

    impl Provisioner for SlowProvisioner {
        fn provision(&mut self, cutoff: &CutoffToken) -> crate::provision::Result<()> {
            if self.fail {
                return Err(SwapFileError::Io(io::Error::other("allocation failed")).into());
            }
            while !cutoff.is_triggered() {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(50));
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        signal: Arc<AtomicBool>,
        polls: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
        done: Arc<AtomicBool>,
        gated: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                signal: Arc::new(AtomicBool::new(false)),
                polls: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
                done: Arc::new(AtomicBool::new(false)),
                gated: Arc::new(AtomicBool::new(false)),
            }
        }

        fn watcher(&self, fail_suspend: bool) -> StopSignalWatcher {
            let source = FakeSource {
                signal: self.signal.clone(),
                polls: self.polls.clone(),
            };
            let action = FakeAction {
                calls: self.calls.clone(),
                provisioning_done: self.done.clone(),
                gated: self.gated.clone(),
                fail: fail_suspend,
            };
            StopSignalWatcher::new(Box::new(source), Box::new(action), Logger::new("test"))
                .with_timing(Duration::from_millis(1), Duration::from_secs(60))
        }

        fn task(&self, fail: bool) -> ProvisioningTask {
            let job = SlowProvisioner {
                done: self.done.clone(),
                fail,
            };
            let mut task = ProvisioningTask::new(Box::new(job), Logger::new("test"));
            task.start().unwrap();
            task
        }
    }

    #[test]
    fn test_idle_without_signal() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        assert_eq!(w.poll_once(), TickOutcome::Idle);
        assert_eq!(w.poll_once(), TickOutcome::Idle);
        assert_eq!(h.polls.load(Ordering::SeqCst), 2);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_signal_cuts_off_provisioning_before_suspend() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        w.attach(h.task(false)).unwrap();

        assert_eq!(w.poll_once(), TickOutcome::Idle);
        assert!(w.has_task());

        h.signal.store(true, Ordering::SeqCst);
        assert_eq!(w.poll_once(), TickOutcome::Suspended);
        assert!(!w.has_task());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.gated.load(Ordering::SeqCst), "suspend ran before provisioning ended");
    }

    #[test]
    fn test_second_signal_within_cooldown_is_ignored() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        h.signal.store(true, Ordering::SeqCst);
        assert_eq!(w.poll_once(), TickOutcome::Suspended);
        assert_eq!(w.poll_once(), TickOutcome::CoolingDown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_after_cooldown_suspends_again() {
        let h = Harness::new();
        let mut w = h.watcher(false).with_timing(Duration::from_millis(1), Duration::from_millis(20));
        h.signal.store(true, Ordering::SeqCst);

        let start = Instant::now();
        assert_eq!(w.tick(), TickOutcome::Suspended);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(w.tick(), TickOutcome::Suspended);
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_suspend_failure_keeps_watching() {
        let h = Harness::new();
        let mut w = h.watcher(true);
        h.signal.store(true, Ordering::SeqCst);
        assert_eq!(w.poll_once(), TickOutcome::SuspendFailed);
        assert_eq!(w.poll_once(), TickOutcome::CoolingDown);
        h.signal.store(false, Ordering::SeqCst);
        assert_eq!(w.poll_once(), TickOutcome::Idle);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_provisioning_is_detached() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        w.attach(h.task(true)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while w.has_task() {
            assert_eq!(w.poll_once(), TickOutcome::Idle);
            assert!(Instant::now() < deadline, "task never detached");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(w.poll_once(), TickOutcome::Idle);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_provisioning_still_suspends_same_tick() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        let task = h.task(true);
        while task.state() == ProvisioningState::Running {
            thread::sleep(Duration::from_millis(5));
        }
        w.attach(task).unwrap();
        h.signal.store(true, Ordering::SeqCst);

        assert_eq!(w.poll_once(), TickOutcome::Suspended);
        assert!(!w.has_task());
        assert_eq!(h.polls.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_task_attached() {
        let h = Harness::new();
        let mut w = h.watcher(false);
        w.attach(h.task(false)).unwrap();
        let idle = SlowProvisioner {
            done: Arc::new(AtomicBool::new(false)),
            fail: false,
        };
        let second = ProvisioningTask::new(Box::new(idle), Logger::new("test"));
        assert!(matches!(w.attach(second), Err(WatchError::TaskAttached)));
        h.signal.store(true, Ordering::SeqCst);
        assert_eq!(w.poll_once(), TickOutcome::Suspended);
    }

    #[test]
    fn test_command_suspend() {
        let runner = Arc::new(RecordingRunner::default());
        CommandSuspend::new(runner.clone(), "systemctl hibernate").suspend().unwrap();
        assert_eq!(runner.commands(), vec!["systemctl hibernate".to_string()]);

        let failing = Arc::new(RecordingRunner::failing_on("hibernate"));
        assert!(matches!(
            CommandSuspend::new(failing, "systemctl hibernate").suspend(),
            Err(WatchError::Suspend(_))
        ));
    }
}
