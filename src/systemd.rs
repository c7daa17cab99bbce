// systemd service notifications
// SPDX-License-Identifier: GPL-3.0-or-later

use libsystemd::daemon::{self, NotifyState};

/// Tell systemd the agent is up. A no-op outside a notify-type unit.
pub fn notify_ready() {
    let _ = daemon::notify(false, &[NotifyState::Ready]);
}

pub fn notify_status(status: &str) {
    let _ = daemon::notify(false, &[NotifyState::Status(status.to_string())]);
}
