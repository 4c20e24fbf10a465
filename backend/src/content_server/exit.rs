//! Interpreting content-server exits

use std::time::Duration;

use crate::config::ContentServerSettings;

/// How an unprompted exit is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Likely caused by a bad archive; triggers quarantine and retry
    Crash,
    /// Left stopped
    Normal,
}

/// Uptime limits below which an exit counts as a crash
#[derive(Debug, Clone, Copy)]
pub struct CrashThresholds {
    pub abnormal_uptime: Duration,
    pub clean_uptime: Duration,
}

impl From<&ContentServerSettings> for CrashThresholds {
    fn from(settings: &ContentServerSettings) -> Self {
        Self {
            abnormal_uptime: Duration::from_secs(settings.crash_uptime_secs),
            clean_uptime: Duration::from_millis(settings.clean_exit_crash_uptime_ms),
        }
    }
}

/// Classify an exit. `code` is `None` when the process died from a signal.
///
/// A non-zero or signal exit shortly after start is a crash. So is a clean
/// exit within the shorter clean-exit threshold, unless a deliberate restart
/// is in progress: the server may report success while refusing to load a
/// malformed archive.
pub fn classify_exit(
    code: Option<i32>,
    uptime: Duration,
    intentional_restart: bool,
    thresholds: &CrashThresholds,
) -> ExitKind {
    let crashed = match code {
        Some(0) => uptime < thresholds.clean_uptime && !intentional_restart,
        _ => uptime < thresholds.abnormal_uptime,
    };

    if crashed {
        ExitKind::Crash
    } else {
        ExitKind::Normal
    }
}
