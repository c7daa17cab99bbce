// Background swap provisioning with cooperative cutoff
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::logging::Logger;
use crate::resume::{BindError, SuspendOffsetBinder};
use crate::swapfile::{SwapAreaController, SwapFileError, SwapTarget, WarmOutcome};
use crate::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Swap file error: {0}")]
    Swap(#[from] SwapFileError),
    #[error("Resume binding error: {0}")]
    Binding(#[from] BindError),
    #[error("Provisioning thread panicked")]
    Panicked,
    #[error("Provisioning task already started")]
    AlreadyStarted,
    #[error("Cannot spawn provisioning thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    NotStarted,
    Running,
    Completed,
    Failed,
    /// Finished after a cutoff request; the swap area is usable but may be
    /// only partially pre-warmed
    Cancelled,
}

impl ProvisioningState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One-shot cutoff signal shared with the background thread
#[derive(Debug, Clone, Default)]
pub struct CutoffToken(Arc<AtomicBool>);

impl CutoffToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The work a [`ProvisioningTask`] runs off the main thread
pub trait Provisioner: Send + 'static {
    fn provision(&mut self, cutoff: &CutoffToken) -> Result<()>;
}

#[derive(Debug)]
struct Slot {
    state: ProvisioningState,
    error: Option<ProvisionError>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a [`Provisioner`] exactly once on a background thread.
///
/// State and error are the only data shared with that thread. A stored
/// error is handed to the first `poll_completion`/`force_cutoff` caller
/// after the thread ends.
pub struct ProvisioningTask {
    slot: Arc<Mutex<Slot>>,
    cutoff: CutoffToken,
    job: Option<Box<dyn Provisioner>>,
    handle: Option<JoinHandle<()>>,
    log: Logger,
}

impl ProvisioningTask {
    pub fn new(job: Box<dyn Provisioner>, log: Logger) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: ProvisioningState::NotStarted,
                error: None,
            })),
            cutoff: CutoffToken::new(),
            job: Some(job),
            handle: None,
            log,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        lock(&self.slot).state
    }

    pub fn start(&mut self) -> Result<()> {
        let mut job = self.job.take().ok_or(ProvisionError::AlreadyStarted)?;
        lock(&self.slot).state = ProvisioningState::Running;

        let slot = Arc::clone(&self.slot);
        let cutoff = self.cutoff.clone();
        let spawned = thread::Builder::new()
            .name("swap-provision".into())
            .spawn(move || {
                let result = job.provision(&cutoff);
                let mut slot = lock(&slot);
                match result {
                    Ok(()) if cutoff.is_triggered() => slot.state = ProvisioningState::Cancelled,
                    Ok(()) => slot.state = ProvisioningState::Completed,
                    Err(e) => {
                        slot.state = ProvisioningState::Failed;
                        slot.error = Some(e);
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                debug!(self.log, "provision: background thread started");
                Ok(())
            }
            Err(e) => {
                lock(&self.slot).state = ProvisioningState::Failed;
                Err(ProvisionError::Spawn(e))
            }
        }
    }

    /// Non-blocking: whether the task reached a terminal state. A failure
    /// stored by the thread is returned once, then the state stays `Failed`.
    pub fn poll_completion(&mut self) -> Result<bool> {
        let finished = self.handle.as_ref().map_or(true, JoinHandle::is_finished);
        if !finished {
            return Ok(false);
        }
        self.reap();
        self.take_error()?;
        Ok(self.state().is_terminal())
    }

    /// Request the cutoff and block until the thread is done. Allocation and
    /// activation still run to completion; only pre-warming is cut short.
    pub fn force_cutoff(&mut self) -> Result<ProvisioningState> {
        self.cutoff.trigger();

        if self.job.take().is_some() {
            lock(&self.slot).state = ProvisioningState::Cancelled;
            info!(self.log, "provision: cut off before start");
        } else if self.handle.is_some() {
            info!(self.log, "provision: cutoff requested, waiting for background thread");
            self.reap();
        }

        self.take_error()?;
        Ok(self.state())
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                let mut slot = lock(&self.slot);
                slot.state = ProvisioningState::Failed;
                slot.error = Some(ProvisionError::Panicked);
            }
        }
    }

    fn take_error(&self) -> Result<()> {
        match lock(&self.slot).error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What gets provisioned: allocate, pre-warm, activate, then bind
pub struct SwapProvisioner {
    pub controller: SwapAreaController,
    pub binder: SuspendOffsetBinder,
    pub target: SwapTarget,
    pub mkswap: String,
    pub swapon: String,
    pub prewarm: bool,
    pub update_boot_config: bool,
    pub log: Logger,
}

impl Provisioner for SwapProvisioner {
    fn provision(&mut self, cutoff: &CutoffToken) -> Result<()> {
        self.controller.ensure_allocated(&self.target)?;

        if self.prewarm {
            let outcome = self.controller.pre_warm(&self.target, || cutoff.is_triggered())?;
            if let WarmOutcome::Truncated { .. } = outcome {
                warn!(self.log, "provision: swap file only partially pre-warmed");
            }
        }

        self.controller
            .activate(&self.target, &self.mkswap, &self.swapon)?;
        self.binder.bind(&self.target.path, self.update_boot_config)?;
        info!(self.log, "provision: swap ready at {}", self.target.path.display());
        Ok(())
    }
}
