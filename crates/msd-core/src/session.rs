//! Flash orchestrator and safety gate.
//!
//! Drives one `FlashSession` end to end: validate, connect, back up,
//! refresh CRCs, erase, write, verify, finalize. Every other layer is
//! passive; retry and rollback policy lives here and nowhere below.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::backup::{BackupError, BackupRecord, BackupStore};
use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, Phase, TracingObserver};
use crate::image::CalibrationImage;
use crate::integrity::{refresh_all_crcs, verify_all_crcs};
use crate::isotp::{IsoTpConfig, IsoTpError, IsoTpSession};
use crate::oplog::OperationLog;
use crate::transport::{CanTransport, TransportError};
use crate::uds::{
    DiagClient, DiagError, DiagTiming, MAX_TRANSFER_PAYLOAD, Unlock, UnlockPolicy,
};
use crate::validate::{ValidationRefused, ValidationWarning, validate};
use crate::variant::VariantSpec;

/// Routine status byte: still running.
const ROUTINE_IN_PROGRESS: u8 = 0x01;
/// Routine status byte: completed.
const ROUTINE_COMPLETE: u8 = 0x02;
/// Bound on erase-result polling rounds.
const ERASE_POLL_LIMIT: u32 = 50;

/// Cooperative cancellation signal, checked at phase boundaries and between
/// transfer blocks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a best-effort rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RollbackOk,
    RollbackFailed(String),
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::RollbackOk => write!(f, "rollback succeeded"),
            RollbackOutcome::RollbackFailed(why) => write!(f, "rollback failed: {why}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error(transparent)]
    Validation(#[from] ValidationRefused),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    IsoTp(#[from] IsoTpError),

    #[error(transparent)]
    Diag(#[from] DiagError),

    #[error("backup required: {0}")]
    BackupRequired(String),

    #[error("backup write failed: {0}")]
    BackupWriteFailed(#[from] BackupError),

    #[error("erase failed: {0}")]
    EraseFailed(String),

    #[error("download rejected: {0}")]
    DownloadRejected(String),

    #[error("transfer failed at block {block}: {detail}")]
    TransferFailed { block: u8, detail: String },

    #[error("transfer exit rejected: {0}")]
    ExitRejected(String),

    #[error("verify mismatch at offset 0x{first_bad_offset:06X}; {rollback}")]
    VerifyMismatch {
        first_bad_offset: u64,
        rollback: RollbackOutcome,
    },

    #[error("cancelled during {phase}")]
    Cancelled {
        phase: Phase,
        rollback: Option<RollbackOutcome>,
    },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Terminal failure with the context the caller needs: the phase reached,
/// bytes already transferred, and whether the controller can be powered
/// off without risk.
#[derive(Debug)]
pub struct FlashFailure {
    pub phase: Phase,
    pub bytes_sent: u64,
    pub safe_to_power_off: bool,
    pub source: FlashError,
}

impl std::fmt::Display for FlashFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flash failed during {} after {} bytes ({}safe to power off): {}",
            self.phase,
            self.bytes_sent,
            if self.safe_to_power_off { "" } else { "NOT " },
            self.source
        )
    }
}

impl std::error::Error for FlashFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl FlashFailure {
    /// Process exit classification: 2 validation refusal, 3 connect/unlock
    /// failure, 4 transfer failure with successful rollback, 5 without,
    /// 6 internal invariant.
    pub fn exit_code(&self) -> i32 {
        match &self.source {
            FlashError::Validation(_) => 2,
            FlashError::InternalInvariant(_) => 6,
            FlashError::VerifyMismatch { rollback, .. } => match rollback {
                RollbackOutcome::RollbackOk => 4,
                RollbackOutcome::RollbackFailed(_) => 5,
            },
            FlashError::Cancelled { rollback, .. } => match rollback {
                Some(RollbackOutcome::RollbackOk) => 4,
                Some(RollbackOutcome::RollbackFailed(_)) => 5,
                None => 3,
            },
            _ => match self.phase {
                Phase::Prepare => 2,
                Phase::Connect | Phase::Backup => 3,
                Phase::Refresh => 6,
                Phase::Erase | Phase::Write | Phase::Verify | Phase::Finalize => 5,
            },
        }
    }
}

/// Inputs for one flash attempt.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    /// Candidate calibration image.
    pub candidate: Vec<u8>,
    /// Known stock image for diffing, when available.
    pub stock: Option<Vec<u8>>,
    /// Caller has seen and accepted the validator's warnings.
    pub acknowledge_warnings: bool,
    /// Identity recorded in the backup sidecar.
    pub source_ecu_id: String,
}

/// Successful outcome.
#[derive(Debug)]
pub struct FlashSummary {
    pub warnings: Vec<ValidationWarning>,
    pub backup: Option<BackupRecord>,
    pub bytes_written: u64,
}

/// One flash attempt against one controller over one transport.
pub struct FlashSession<T: CanTransport, O: FlashObserver> {
    client: DiagClient<T>,
    config: FlashConfig,
    spec: &'static VariantSpec,
    observer: Arc<O>,
    store: BackupStore,
    oplog: Option<OperationLog>,
    cancel: CancelToken,
    session_id: String,
    phase: Phase,
    bytes_sent: u64,
    safe_to_power_off: bool,
    terminal: bool,
}

impl<T: CanTransport> FlashSession<T, TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(transport: T, config: FlashConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: CanTransport, O: FlashObserver> FlashSession<T, O> {
    pub fn with_observer(transport: T, config: FlashConfig, observer: Arc<O>) -> Self {
        let isotp_config = IsoTpConfig {
            tx_id: config.transport.tx_id,
            rx_id: config.transport.rx_id,
            fc_block_size: config.timing.block_size_override.unwrap_or(0),
            fc_st_min: config.timing.st_min_override.unwrap_or(0),
            ..IsoTpConfig::default()
        };
        let timing = DiagTiming {
            p2: config.timing.p2(),
            p2_star: config.timing.p2_star(),
        };
        let client = DiagClient::new(IsoTpSession::new(transport, isotp_config), timing);

        let spec = config.variant.id.spec();
        let store = BackupStore::new(&config.safety.backup_store_path);
        let oplog = config.safety.operation_log_path.as_ref().and_then(|path| {
            OperationLog::open(path)
                .inspect_err(|e| warn!(error = %e, "operation log unavailable"))
                .ok()
        });
        let session_id = format!(
            "{}-{}",
            config.variant.id,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );

        Self {
            client,
            config,
            spec,
            observer,
            store,
            oplog,
            cancel: CancelToken::new(),
            session_id,
            phase: Phase::Prepare,
            bytes_sent: 0,
            safe_to_power_off: true,
            terminal: false,
        }
    }

    /// Handle for cancelling this session from outside.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run a complete flash attempt, phases A through G.
    pub fn flash(&mut self, request: FlashRequest) -> Result<FlashSummary, FlashFailure> {
        match self.run_flash(request) {
            Ok(summary) => {
                self.emit(FlashEvent::Finalized);
                Ok(summary)
            }
            Err(source) => Err(self.fail(source)),
        }
    }

    /// Connect, unlock, and snapshot the calibration region to the backup
    /// store without writing anything to the controller.
    pub fn backup_only(&mut self, source_ecu_id: &str) -> Result<BackupRecord, FlashFailure> {
        match self.run_backup_only(source_ecu_id) {
            Ok(record) => {
                self.emit(FlashEvent::Finalized);
                Ok(record)
            }
            Err(source) => Err(self.fail(source)),
        }
    }

    /// Connect, unlock, and read the whole calibration region.
    pub fn read_calibration(&mut self) -> Result<Vec<u8>, FlashFailure> {
        match self.connect().and_then(|_| {
            self.set_phase(Phase::Backup);
            self.read_region(Phase::Backup)
        }) {
            Ok(data) => {
                self.emit(FlashEvent::Finalized);
                Ok(data)
            }
            Err(source) => Err(self.fail(source)),
        }
    }

    // ------------------------------------------------------------------
    // Phase drivers
    // ------------------------------------------------------------------

    fn run_flash(&mut self, request: FlashRequest) -> Result<FlashSummary, FlashError> {
        // Phase A: prepare & validate. Refusal here has no side effects.
        let report = validate(
            self.spec.variant,
            &request.candidate,
            request.stock.as_deref(),
            request.acknowledge_warnings,
            self.config.safety.require_explicit_warning_ack,
        )?;
        for w in &report.warnings {
            self.emit(FlashEvent::Warning {
                offset: w.offset,
                message: w.message.clone(),
            });
        }
        for c in &report.classified {
            info!(
                offset = format_args!("0x{:06X}", c.offset),
                len = c.len,
                category = %c.category,
                table = c.label,
                "modified table"
            );
        }
        let mut image = report.image;
        self.check_cancel(None)?;

        // Phase B: connect, unlock, back up.
        self.connect()?;
        self.check_cancel(None)?;

        self.set_phase(Phase::Backup);
        let current = self.read_region(Phase::Backup)?;
        let backup = self.write_backup(&request.source_ecu_id, &current)?;
        let backup_bytes = backup.as_ref().map(|(_, data)| data.clone());
        self.check_cancel(backup_bytes.as_deref())?;

        // Phase C: refresh the candidate's integrity codes. A mismatch
        // after a refresh is a bug, not user error.
        self.set_phase(Phase::Refresh);
        refresh_all_crcs(image.bytes_mut(), self.spec)
            .map_err(|e| FlashError::InternalInvariant(e.to_string()))?;
        if let Err(bad) = verify_all_crcs(image.bytes(), self.spec) {
            return Err(FlashError::InternalInvariant(format!(
                "{} zone(s) mismatched immediately after refresh",
                bad.len()
            )));
        }
        self.check_cancel(backup_bytes.as_deref())?;

        // Phase D: erase. Nothing transmitted yet, so failure aborts clean.
        self.set_phase(Phase::Erase);
        self.safe_to_power_off = false;
        self.erase_calibration()?;
        self.check_cancel(backup_bytes.as_deref())?;

        // Phase E: write.
        self.set_phase(Phase::Write);
        if let Some(cancelled_rollback) = self.write_image(&image, backup_bytes.as_deref())? {
            self.safe_to_power_off = cancelled_rollback == RollbackOutcome::RollbackOk;
            return Err(FlashError::Cancelled {
                phase: Phase::Write,
                rollback: Some(cancelled_rollback),
            });
        }

        // Phase F: verify, byte for byte.
        self.set_phase(Phase::Verify);
        if let Some(first_bad) = self.verify_readback(image.bytes())? {
            let rollback = self.rollback(backup_bytes.as_deref());
            self.safe_to_power_off = rollback == RollbackOutcome::RollbackOk;
            return Err(FlashError::VerifyMismatch {
                first_bad_offset: first_bad as u64,
                rollback,
            });
        }
        self.safe_to_power_off = true;
        self.check_cancel(backup_bytes.as_deref())?;

        // Phase G: finalize.
        self.set_phase(Phase::Finalize);
        if let Some(routine) = self.spec.checksum_routine {
            self.client.routine_start(routine, &[])?;
        }
        self.client.ecu_reset()?;
        let _ = self.client.isotp_mut().transport_mut().close();

        Ok(FlashSummary {
            warnings: report.warnings,
            backup: backup.map(|(record, _)| record),
            bytes_written: self.bytes_sent,
        })
    }

    fn run_backup_only(&mut self, source_ecu_id: &str) -> Result<BackupRecord, FlashError> {
        self.connect()?;
        self.set_phase(Phase::Backup);
        let current = self.read_region(Phase::Backup)?;
        let record = self.store.write(self.spec.variant, source_ecu_id, &current)?;
        self.emit(FlashEvent::BackupWritten {
            path: record.bin_path.clone(),
            sha256: record.sha256.clone(),
        });
        let _ = self.client.isotp_mut().transport_mut().close();
        Ok(record)
    }

    /// Phase B first half: transport binding, programming session, unlock.
    fn connect(&mut self) -> Result<(), FlashError> {
        self.set_phase(Phase::Connect);
        self.client.isotp_mut().bind()?;
        self.emit(FlashEvent::Connected {
            tx_id: self.config.transport.tx_id,
            rx_id: self.config.transport.rx_id,
        });
        self.client.start_programming_session()?;
        let unlock = self.client.security_unlock(&self.unlock_policy())?;
        self.emit(FlashEvent::Unlocked {
            algorithm: match unlock {
                Unlock::With(algorithm) => Some(algorithm),
                Unlock::AlreadyUnlocked => None,
            },
        });
        Ok(())
    }

    /// Write and verify the pre-erase backup. The session may not advance
    /// past this point without a verified backup unless the configuration
    /// explicitly tolerates running without a rollback source.
    fn write_backup(
        &mut self,
        source_ecu_id: &str,
        current: &[u8],
    ) -> Result<Option<(BackupRecord, Vec<u8>)>, FlashError> {
        match self.store.write(self.spec.variant, source_ecu_id, current) {
            Ok(record) => {
                let verified = self
                    .store
                    .verify(&record)
                    .map_err(|e| FlashError::BackupRequired(e.to_string()))?;
                self.emit(FlashEvent::BackupWritten {
                    path: record.bin_path.clone(),
                    sha256: record.sha256.clone(),
                });
                Ok(Some((record, verified)))
            }
            Err(e) if self.config.safety.forbid_missing_backup => {
                Err(FlashError::BackupWriteFailed(e))
            }
            Err(e) => {
                self.emit(FlashEvent::Warning {
                    offset: 0,
                    message: format!("backup failed ({e}); continuing without a rollback source"),
                });
                Ok(None)
            }
        }
    }

    fn erase_calibration(&mut self) -> Result<(), FlashError> {
        let mut args = [0u8; 8];
        BigEndian::write_u32(&mut args[0..4], self.config.base_addr());
        BigEndian::write_u32(&mut args[4..8], self.spec.cal_size as u32);

        let status = self
            .client
            .routine_start(self.spec.erase_routine, &args)
            .map_err(|e| match e {
                DiagError::Negative { .. } => FlashError::EraseFailed(e.to_string()),
                other => FlashError::from(other),
            })?;

        if self.spec.erase_poll_results {
            for _ in 0..ERASE_POLL_LIMIT {
                let result = self
                    .client
                    .routine_results(self.spec.erase_routine)
                    .map_err(|e| FlashError::EraseFailed(e.to_string()))?;
                match result.first() {
                    Some(&ROUTINE_IN_PROGRESS) => {
                        self.client.maybe_tester_present()?;
                        thread::sleep(Duration::from_millis(50));
                    }
                    Some(&ROUTINE_COMPLETE) | None => return Ok(()),
                    Some(&code) => {
                        return Err(FlashError::EraseFailed(format!(
                            "routine reported status 0x{code:02X}"
                        )));
                    }
                }
            }
            return Err(FlashError::EraseFailed("erase routine never completed".into()));
        }

        // Positive final response signals completion for this variant; a
        // status byte, when present, must not report an error.
        if let Some(&code) = status.first()
            && code != 0x00
            && code != ROUTINE_COMPLETE
        {
            return Err(FlashError::EraseFailed(format!(
                "routine reported status 0x{code:02X}"
            )));
        }
        Ok(())
    }

    /// Phase E body. Returns `Ok(Some(outcome))` when the caller cancelled
    /// mid-stream: the current block was completed, the download window was
    /// closed, and a rollback was attempted.
    fn write_image(
        &mut self,
        image: &CalibrationImage,
        backup: Option<&[u8]>,
    ) -> Result<Option<RollbackOutcome>, FlashError> {
        let bytes_total = image.len() as u64;
        let block_len = self.open_download(image.len() as u32)?;

        let mut counter: u8 = 1;
        let mut offset = 0usize;
        let mut cancelled = false;
        while offset < image.len() {
            let end = (offset + block_len).min(image.len());
            self.client
                .transfer_data(counter, &image.bytes()[offset..end])
                .map_err(|e| match e {
                    DiagError::Negative { .. } | DiagError::UnexpectedReply { .. } => {
                        FlashError::TransferFailed {
                            block: counter,
                            detail: e.to_string(),
                        }
                    }
                    other => FlashError::from(other),
                })?;
            self.bytes_sent += (end - offset) as u64;
            offset = end;
            counter = counter.wrapping_add(1);
            self.emit(FlashEvent::Progress {
                phase: Phase::Write,
                bytes_done: offset as u64,
                bytes_total,
            });
            self.client.maybe_tester_present()?;

            // Mid-stream cancellation is deferred to the block boundary.
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            let _ = self.client.request_transfer_exit();
            return Ok(Some(self.rollback(backup)));
        }

        self.client
            .request_transfer_exit()
            .map_err(|e| match e {
                DiagError::Negative { .. } => FlashError::ExitRejected(e.to_string()),
                other => FlashError::from(other),
            })?;
        Ok(None)
    }

    fn open_download(&mut self, size: u32) -> Result<usize, FlashError> {
        self.client
            .request_download(self.config.base_addr(), size)
            .map_err(|e| match e {
                DiagError::Negative { .. } | DiagError::UnexpectedReply { .. } => {
                    FlashError::DownloadRejected(e.to_string())
                }
                other => FlashError::from(other),
            })
    }

    /// Read the calibration region in transfer-sized chunks.
    fn read_region(&mut self, phase: Phase) -> Result<Vec<u8>, FlashError> {
        let base = self.config.base_addr();
        let total = self.spec.cal_size;
        let mut data = Vec::with_capacity(total);
        let mut offset = 0usize;
        while offset < total {
            let len = (total - offset).min(MAX_TRANSFER_PAYLOAD);
            let chunk = self.client.read_memory(base + offset as u32, len as u32)?;
            data.extend_from_slice(&chunk);
            offset += len;
            self.emit(FlashEvent::Progress {
                phase,
                bytes_done: offset as u64,
                bytes_total: total as u64,
            });
            self.client.maybe_tester_present()?;
        }
        Ok(data)
    }

    /// Read back and compare; returns the first mismatching offset.
    fn verify_readback(&mut self, expected: &[u8]) -> Result<Option<usize>, FlashError> {
        let base = self.config.base_addr();
        let total = expected.len();
        let mut offset = 0usize;
        while offset < total {
            let len = (total - offset).min(MAX_TRANSFER_PAYLOAD);
            let chunk = self.client.read_memory(base + offset as u32, len as u32)?;
            if let Some(i) = chunk
                .iter()
                .zip(&expected[offset..offset + len])
                .position(|(a, b)| a != b)
            {
                return Ok(Some(offset + i));
            }
            offset += len;
            self.emit(FlashEvent::Progress {
                phase: Phase::Verify,
                bytes_done: offset as u64,
                bytes_total: total as u64,
            });
            self.client.maybe_tester_present()?;
        }
        Ok(None)
    }

    /// Best-effort restore of the backup image via a second download.
    fn rollback(&mut self, backup: Option<&[u8]>) -> RollbackOutcome {
        self.emit(FlashEvent::RollbackStarted);
        let outcome = match backup {
            None => RollbackOutcome::RollbackFailed("no verified backup available".into()),
            Some(data) => match self.try_rollback(data) {
                Ok(()) => RollbackOutcome::RollbackOk,
                Err(e) => RollbackOutcome::RollbackFailed(e.to_string()),
            },
        };
        self.emit(FlashEvent::RollbackFinished {
            ok: outcome == RollbackOutcome::RollbackOk,
        });
        outcome
    }

    fn try_rollback(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let block_len = self.open_download(data.len() as u32)?;
        let mut counter: u8 = 1;
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + block_len).min(data.len());
            self.client.transfer_data(counter, &data[offset..end])?;
            counter = counter.wrapping_add(1);
            offset = end;
            self.client.maybe_tester_present()?;
        }
        self.client.request_transfer_exit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn unlock_policy(&self) -> UnlockPolicy {
        UnlockPolicy {
            access_level: self.config.security.access_level,
            order: self.config.security.algorithm_order.clone(),
            lockout_backoff: Duration::from_millis(self.config.security.lockout_backoff_ms),
        }
    }

    /// Phase-boundary cancellation checkpoint. While the calibration sector
    /// is known-good (before the erase, or after a clean verify) the session
    /// just closes; once the sector state is uncertain the backup is
    /// restored first and the outcome recorded, so the caller never
    /// inherits a blank calibration behind a benign exit code.
    fn check_cancel(&mut self, backup: Option<&[u8]>) -> Result<(), FlashError> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        let rollback = if self.safe_to_power_off {
            None
        } else {
            let outcome = self.rollback(backup);
            self.safe_to_power_off = outcome == RollbackOutcome::RollbackOk;
            Some(outcome)
        };
        Err(FlashError::Cancelled {
            phase: self.phase,
            rollback,
        })
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase;
        self.phase = to;
        self.emit(FlashEvent::PhaseChanged { from, to });
    }

    fn fail(&mut self, source: FlashError) -> FlashFailure {
        match &source {
            FlashError::Cancelled { .. } => self.emit(FlashEvent::Aborted { phase: self.phase }),
            _ => self.emit(FlashEvent::Failed {
                phase: self.phase,
                message: source.to_string(),
            }),
        }
        FlashFailure {
            phase: self.phase,
            bytes_sent: self.bytes_sent,
            safe_to_power_off: self.safe_to_power_off,
            source,
        }
    }

    fn emit(&mut self, event: FlashEvent) {
        if self.terminal {
            return;
        }
        if event.is_terminal() {
            self.terminal = true;
        }
        self.log_event(&event);
        self.observer.on_event(&event);
    }

    fn log_event(&mut self, event: &FlashEvent) {
        let Some(log) = self.oplog.as_mut() else {
            return;
        };
        // Per-block progress would swamp the log; everything else goes in.
        let (name, detail): (&str, String) = match event {
            FlashEvent::Progress { .. } => return,
            FlashEvent::Connected { tx_id, rx_id } => {
                ("connected", format!("tx=0x{tx_id:03X} rx=0x{rx_id:03X}"))
            }
            FlashEvent::PhaseChanged { from, to } => ("phase", format!("{from} -> {to}")),
            FlashEvent::Warning { offset, message } => {
                ("warning", format!("0x{offset:06X}: {message}"))
            }
            FlashEvent::BackupWritten { path, sha256 } => {
                ("backup", format!("{} sha256={sha256}", path.display()))
            }
            FlashEvent::Unlocked { algorithm } => (
                "unlocked",
                algorithm
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "zero-seed".into()),
            ),
            FlashEvent::RollbackStarted => ("rollback", "started".into()),
            FlashEvent::RollbackFinished { ok } => ("rollback", format!("ok={ok}")),
            FlashEvent::Log { message, .. } => ("log", message.clone()),
            FlashEvent::Finalized => ("finalized", String::new()),
            FlashEvent::Aborted { phase } => ("aborted", phase.to_string()),
            FlashEvent::Failed { phase, message } => ("failed", format!("{phase}: {message}")),
        };
        if let Err(e) = log.record(&self.session_id, self.phase.as_str(), name, &detail) {
            warn!(error = %e, "operation log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::integrity::refresh_all_crcs;
    use crate::transport::MockTransport;
    use crate::uds::SeedKeyAlgorithm;
    use crate::variant::{CAL_SIZE, EcuVariant};

    const BASE: u32 = 0x0090_0000;

    struct DmeState {
        memory: Vec<u8>,
        seed: u32,
        algorithm: SeedKeyAlgorithm,
        download: Option<(usize, u8)>,
        corrupt_write_at: Option<usize>,
        erase_polls: u8,
    }

    fn dme_handle(st: &mut DmeState, req: &[u8]) -> Vec<Vec<u8>> {
        match req {
            [0x10, 0x02] => vec![vec![0x50, 0x02]],
            [0x3E, 0x00] => vec![],
            [0x27, 0x01] => {
                let mut r = vec![0x67, 0x01];
                r.extend_from_slice(&st.seed.to_be_bytes());
                vec![r]
            }
            [0x27, 0x02, key @ ..] => {
                if *key == st.algorithm.compute(st.seed).to_be_bytes() {
                    vec![vec![0x67, 0x02]]
                } else {
                    vec![vec![0x7F, 0x27, 0x35]]
                }
            }
            [0x23, 0x44, rest @ ..] if rest.len() == 8 => {
                let addr = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
                let off = (addr - BASE) as usize;
                let mut r = vec![0x63];
                r.extend_from_slice(&st.memory[off..off + len]);
                vec![r]
            }
            [0x31, 0x01, 0xFF, 0x02, rest @ ..] if rest.len() == 8 => {
                let addr = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
                let off = (addr - BASE) as usize;
                st.memory[off..off + len].fill(0xFF);
                vec![vec![0x71, 0x01, 0xFF, 0x02]]
            }
            [0x31, 0x03, 0xFF, 0x02] => {
                let status = if st.erase_polls == 0 {
                    st.erase_polls += 1;
                    0x01
                } else {
                    0x02
                };
                vec![vec![0x71, 0x03, 0xFF, 0x02, status]]
            }
            [0x31, 0x01, 0xFF, 0x01] => vec![vec![0x71, 0x01, 0xFF, 0x01]],
            [0x34, 0x00, 0x44, rest @ ..] if rest.len() == 8 => {
                let addr = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                st.download = Some(((addr - BASE) as usize, 1));
                // maxNumberOfBlockLength 514 = 512 payload + 2 service bytes.
                vec![vec![0x74, 0x20, 0x02, 0x02]]
            }
            [0x36, counter, data @ ..] => {
                let Some((offset, expected)) = st.download else {
                    return vec![vec![0x7F, 0x36, 0x24]];
                };
                if *counter != expected {
                    return vec![vec![0x7F, 0x36, 0x73]];
                }
                st.memory[offset..offset + data.len()].copy_from_slice(data);
                if let Some(bad) = st.corrupt_write_at
                    && bad >= offset
                    && bad < offset + data.len()
                {
                    st.memory[bad] ^= 0xFF;
                }
                st.download = Some((offset + data.len(), expected.wrapping_add(1)));
                vec![vec![0x76, *counter]]
            }
            [0x37] => {
                st.download = None;
                vec![vec![0x77]]
            }
            [0x11, 0x01] => vec![vec![0x51, 0x01]],
            _ => vec![vec![0x7F, req[0], 0x11]],
        }
    }

    fn mock_dme(state: Arc<Mutex<DmeState>>) -> MockTransport {
        let mock = MockTransport::new(0x613);
        let shared = state.clone();
        mock.on_request(Box::new(move |req| {
            dme_handle(&mut shared.lock().unwrap(), req)
        }));
        mock
    }

    fn dme_state(memory: Vec<u8>) -> Arc<Mutex<DmeState>> {
        Arc::new(Mutex::new(DmeState {
            memory,
            seed: 0x4A3B_2C1D,
            algorithm: SeedKeyAlgorithm::Rftx,
            download: None,
            corrupt_write_at: None,
            erase_polls: 0,
        }))
    }

    struct RecordingObserver(Mutex<Vec<FlashEvent>>);

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<FlashEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl FlashObserver for RecordingObserver {
        fn on_event(&self, event: &FlashEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn stock_image(variant: EcuVariant) -> Vec<u8> {
        let mut data: Vec<u8> = (0..CAL_SIZE).map(|i| (i % 251) as u8).collect();
        refresh_all_crcs(&mut data, variant.spec()).unwrap();
        data
    }

    fn test_config(variant: EcuVariant, store: &str) -> FlashConfig {
        let dir = std::env::temp_dir().join(format!("msd-core-session-{}-{store}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut config = FlashConfig::default();
        config.variant.id = variant;
        config.safety.backup_store_path = dir;
        config.security.lockout_backoff_ms = 1;
        config
    }

    /// Candidate with the speed limiter and the WGDC base table modified:
    /// two CRC zones touched.
    fn tuned_candidate(stock: &[u8]) -> Vec<u8> {
        let mut cand = stock.to_vec();
        cand[0x0093A0] = 0xFA;
        cand[0x0093A1] = 0x00;
        for b in &mut cand[0x05F7F6..0x05F7F6 + 32] {
            *b = b.wrapping_add(5);
        }
        cand
    }

    #[test]
    fn happy_path_flashes_and_finalizes() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state.clone());
        let observer = RecordingObserver::new();
        let mut session = FlashSession::with_observer(
            mock.clone(),
            test_config(EcuVariant::Msd80, "happy"),
            observer.clone(),
        );

        let candidate = tuned_candidate(&stock);
        let summary = session
            .flash(FlashRequest {
                candidate: candidate.clone(),
                stock: Some(stock.clone()),
                acknowledge_warnings: false,
                source_ecu_id: "I8A0S".into(),
            })
            .unwrap();

        assert_eq!(summary.bytes_written, CAL_SIZE as u64);
        assert!(summary.warnings.is_empty());
        let backup = summary.backup.expect("backup must exist");
        assert!(backup.bin_path.exists());

        // The controller now holds the candidate with refreshed CRCs.
        let mut expected = candidate;
        refresh_all_crcs(&mut expected, EcuVariant::Msd80.spec()).unwrap();
        assert_eq!(state.lock().unwrap().memory, expected);

        // Terminal event is last, exactly once.
        let events = observer.events();
        assert!(matches!(events.last(), Some(FlashEvent::Finalized)));
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1,
            "exactly one terminal event"
        );

        // The backup on disk matches what the controller held before.
        let store = BackupStore::new(backup.bin_path.parent().unwrap());
        assert_eq!(store.verify(&backup).unwrap(), stock);
    }

    #[test]
    fn msd81_polls_erase_results() {
        let stock = stock_image(EcuVariant::Msd81);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state.clone());
        let mut session = FlashSession::new(mock.clone(), test_config(EcuVariant::Msd81, "poll"));

        session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock),
                acknowledge_warnings: false,
                source_ecu_id: "I9A0S".into(),
            })
            .unwrap();

        let polled = mock
            .requests()
            .iter()
            .any(|r| r.as_slice() == [0x31, 0x03, 0xFF, 0x02]);
        assert!(polled, "MSD81 must poll requestRoutineResults after erase");
    }

    #[test]
    fn all_erased_image_refused_without_bus_traffic() {
        let state = dme_state(stock_image(EcuVariant::Msd80));
        let mock = mock_dme(state);
        let mut session = FlashSession::new(mock.clone(), test_config(EcuVariant::Msd80, "ff"));

        let failure = session
            .flash(FlashRequest {
                candidate: vec![0xFF; CAL_SIZE],
                stock: None,
                acknowledge_warnings: true,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        assert_eq!(failure.exit_code(), 2);
        assert!(matches!(failure.source, FlashError::Validation(_)));
        assert!(mock.writes().is_empty(), "no frame may be transmitted");
    }

    #[test]
    fn forbidden_diff_refused_without_bus_traffic() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state);
        let mut session = FlashSession::new(mock.clone(), test_config(EcuVariant::Msd80, "forbidden"));

        let mut candidate = stock.clone();
        candidate[0x054A90] ^= 0x01;
        let failure = session
            .flash(FlashRequest {
                candidate,
                stock: Some(stock),
                acknowledge_warnings: true,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        assert_eq!(failure.exit_code(), 2);
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn verify_mismatch_rolls_back() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        state.lock().unwrap().corrupt_write_at = Some(0x12340);
        let mock = mock_dme(state.clone());
        let observer = RecordingObserver::new();
        let mut session = FlashSession::with_observer(
            mock,
            test_config(EcuVariant::Msd80, "verify"),
            observer.clone(),
        );

        let failure = session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock),
                acknowledge_warnings: false,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        match &failure.source {
            FlashError::VerifyMismatch {
                first_bad_offset,
                rollback,
            } => {
                assert_eq!(*first_bad_offset, 0x12340);
                assert_eq!(*rollback, RollbackOutcome::RollbackOk);
            }
            other => panic!("expected verify mismatch, got {other}"),
        }
        assert_eq!(failure.exit_code(), 4);
        assert!(failure.safe_to_power_off);

        let events = observer.events();
        assert!(events.iter().any(|e| matches!(e, FlashEvent::RollbackStarted)));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, FlashEvent::RollbackFinished { ok: true }))
        );
        assert!(matches!(events.last(), Some(FlashEvent::Failed { .. })));
    }

    #[test]
    fn backup_failure_stops_before_erase() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state);

        // Point the store at a path that cannot become a directory.
        let blocker = std::env::temp_dir().join(format!("msd-core-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = test_config(EcuVariant::Msd80, "nobackup");
        config.safety.backup_store_path = blocker.join("store");

        let mut session = FlashSession::new(mock.clone(), config);
        let failure = session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock),
                acknowledge_warnings: false,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        assert!(matches!(failure.source, FlashError::BackupWriteFailed(_)));
        assert_eq!(failure.phase, Phase::Backup);
        assert_eq!(failure.exit_code(), 3);
        assert!(failure.safe_to_power_off);

        // No erase, download, or transfer was attempted.
        for req in mock.requests() {
            assert!(
                !matches!(req[0], 0x31 | 0x34 | 0x36),
                "write-path service 0x{:02X} after backup failure",
                req[0]
            );
        }
    }

    #[test]
    fn cancellation_between_phases_aborts_cleanly() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state);
        let observer = RecordingObserver::new();
        let mut session = FlashSession::with_observer(
            mock.clone(),
            test_config(EcuVariant::Msd80, "cancel"),
            observer.clone(),
        );

        session.cancel_token().cancel();
        let failure = session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock),
                acknowledge_warnings: false,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        assert!(matches!(
            failure.source,
            FlashError::Cancelled { rollback: None, .. }
        ));
        assert!(mock.writes().is_empty());

        let events = observer.events();
        assert!(matches!(events.last(), Some(FlashEvent::Aborted { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn cancellation_after_erase_rolls_back() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state.clone());
        let observer = RecordingObserver::new();
        let mut session = FlashSession::with_observer(
            mock.clone(),
            test_config(EcuVariant::Msd80, "cancel-erase"),
            observer.clone(),
        );

        // Cancel the moment the controller acknowledges the erase routine,
        // so the boundary between erase and write sees a blank sector.
        let token = session.cancel_token();
        let shared = state.clone();
        mock.on_request(Box::new(move |req| {
            if req.starts_with(&[0x31, 0x01, 0xFF, 0x02]) {
                token.cancel();
            }
            dme_handle(&mut shared.lock().unwrap(), req)
        }));

        let failure = session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock.clone()),
                acknowledge_warnings: false,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        match &failure.source {
            FlashError::Cancelled {
                rollback: Some(RollbackOutcome::RollbackOk),
                ..
            } => {}
            other => panic!("expected cancellation with rollback, got {other}"),
        }
        assert_eq!(failure.phase, Phase::Erase);
        assert_eq!(failure.exit_code(), 4);
        assert!(failure.safe_to_power_off);

        // The backup was restored over the erased sector.
        assert_eq!(state.lock().unwrap().memory, stock);

        let events = observer.events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, FlashEvent::RollbackFinished { ok: true }))
        );
        assert!(matches!(events.last(), Some(FlashEvent::Aborted { .. })));
    }

    #[test]
    fn cancellation_after_erase_without_backup_is_manual_recovery() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state.clone());

        // Break the backup store and let the session continue without a
        // rollback source, then cancel once the sector is erased.
        let blocker =
            std::env::temp_dir().join(format!("msd-core-cancel-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = test_config(EcuVariant::Msd80, "cancel-nobackup");
        config.safety.backup_store_path = blocker.join("store");
        config.safety.forbid_missing_backup = false;

        let mut session = FlashSession::new(mock.clone(), config);
        let token = session.cancel_token();
        let shared = state.clone();
        mock.on_request(Box::new(move |req| {
            if req.starts_with(&[0x31, 0x01, 0xFF, 0x02]) {
                token.cancel();
            }
            dme_handle(&mut shared.lock().unwrap(), req)
        }));

        let failure = session
            .flash(FlashRequest {
                candidate: tuned_candidate(&stock),
                stock: Some(stock),
                acknowledge_warnings: false,
                source_ecu_id: "x".into(),
            })
            .unwrap_err();

        match &failure.source {
            FlashError::Cancelled {
                rollback: Some(RollbackOutcome::RollbackFailed(_)),
                ..
            } => {}
            other => panic!("expected failed rollback, got {other}"),
        }
        assert_eq!(failure.exit_code(), 5);
        assert!(!failure.safe_to_power_off);
    }

    #[test]
    fn backup_only_snapshots_without_writing() {
        let stock = stock_image(EcuVariant::Msd80);
        let state = dme_state(stock.clone());
        let mock = mock_dme(state);
        let mut session =
            FlashSession::new(mock.clone(), test_config(EcuVariant::Msd80, "snapshot"));

        let record = session.backup_only("I8A0S").unwrap();
        let store = BackupStore::new(record.bin_path.parent().unwrap());
        assert_eq!(store.verify(&record).unwrap(), stock);

        for req in mock.requests() {
            assert!(
                !matches!(req[0], 0x31 | 0x34 | 0x36),
                "backup-only must never touch a write service"
            );
        }
    }
}
