//! Event system for UI decoupling.
//!
//! Front ends (CLI, future GUIs) subscribe to session events without tight
//! coupling to the orchestrator. Events are delivered in strict
//! phase-and-offset order and nothing is emitted after a terminal event.

use std::fmt;
use std::path::PathBuf;

use crate::uds::SeedKeyAlgorithm;

/// Log level for observer-routed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Orchestrator phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Connect,
    Backup,
    Refresh,
    Erase,
    Write,
    Verify,
    Finalize,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Connect => "connect",
            Phase::Backup => "backup",
            Phase::Refresh => "refresh",
            Phase::Erase => "erase",
            Phase::Write => "write",
            Phase::Verify => "verify",
            Phase::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by a flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Transport bound to the diagnostic identifiers.
    Connected { tx_id: u32, rx_id: u32 },
    /// Phase transition.
    PhaseChanged { from: Phase, to: Phase },
    /// Byte progress inside the current phase.
    Progress {
        phase: Phase,
        bytes_done: u64,
        bytes_total: u64,
    },
    /// Non-fatal validator finding.
    Warning { offset: usize, message: String },
    /// Durable backup written and verified.
    BackupWritten { path: PathBuf, sha256: String },
    /// Security access granted. `algorithm` is `None` for a zero seed.
    Unlocked { algorithm: Option<SeedKeyAlgorithm> },
    /// Best-effort restore of the backup has begun.
    RollbackStarted,
    /// Rollback finished.
    RollbackFinished { ok: bool },
    /// Free-form log line routed through the observer.
    Log { level: LogLevel, message: String },
    /// Terminal: all phases completed.
    Finalized,
    /// Terminal: cancelled by the caller.
    Aborted { phase: Phase },
    /// Terminal: failed.
    Failed { phase: Phase, message: String },
}

impl FlashEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashEvent::Finalized | FlashEvent::Aborted { .. } | FlashEvent::Failed { .. }
        )
    }
}

/// Observer trait for receiving session events.
///
/// Implement this in the UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events through tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Connected { tx_id, rx_id } => {
                tracing::info!(tx = format_args!("0x{tx_id:03X}"), rx = format_args!("0x{rx_id:03X}"), "connected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(%from, %to, "phase changed");
            }
            FlashEvent::Progress {
                phase,
                bytes_done,
                bytes_total,
            } => {
                let pct = if *bytes_total > 0 {
                    bytes_done * 100 / bytes_total
                } else {
                    0
                };
                tracing::debug!(%phase, pct, "progress");
            }
            FlashEvent::Warning { offset, message } => {
                tracing::warn!(offset = format_args!("0x{offset:06X}"), "{message}");
            }
            FlashEvent::BackupWritten { path, sha256 } => {
                tracing::info!(path = %path.display(), sha256 = %&sha256[..16], "backup written");
            }
            FlashEvent::Unlocked { algorithm } => match algorithm {
                Some(a) => tracing::info!(algorithm = %a, "controller unlocked"),
                None => tracing::info!("controller already unlocked"),
            },
            FlashEvent::RollbackStarted => tracing::warn!("attempting rollback"),
            FlashEvent::RollbackFinished { ok } => {
                tracing::warn!(ok, "rollback finished");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
            FlashEvent::Finalized => tracing::info!("flash finalized"),
            FlashEvent::Aborted { phase } => tracing::warn!(%phase, "session aborted"),
            FlashEvent::Failed { phase, message } => {
                tracing::error!(%phase, "session failed: {message}");
            }
        }
    }
}
