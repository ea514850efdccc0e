//! UDS (ISO 14229) byte assignments used by the flashing core.

// ============================================================================
// Service identifiers
// ============================================================================

/// DiagnosticSessionControl
pub const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
/// ECUReset
pub const SID_ECU_RESET: u8 = 0x11;
/// ReadMemoryByAddress
pub const SID_READ_MEMORY_BY_ADDRESS: u8 = 0x23;
/// SecurityAccess
pub const SID_SECURITY_ACCESS: u8 = 0x27;
/// RoutineControl
pub const SID_ROUTINE_CONTROL: u8 = 0x31;
/// RequestDownload
pub const SID_REQUEST_DOWNLOAD: u8 = 0x34;
/// TransferData
pub const SID_TRANSFER_DATA: u8 = 0x36;
/// RequestTransferExit
pub const SID_REQUEST_TRANSFER_EXIT: u8 = 0x37;
/// TesterPresent
pub const SID_TESTER_PRESENT: u8 = 0x3E;

/// Positive responses echo the service identifier plus this offset.
pub const POSITIVE_OFFSET: u8 = 0x40;
/// First byte of every negative response.
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

// ============================================================================
// Sub-functions and arguments
// ============================================================================

/// DiagnosticSessionControl: programming session.
pub const SESSION_PROGRAMMING: u8 = 0x02;

/// ECUReset: hard reset.
pub const RESET_HARD: u8 = 0x01;

/// TesterPresent: suppress positive response.
pub const TESTER_PRESENT_SUPPRESS: u8 = 0x00;

/// RoutineControl: start routine.
pub const ROUTINE_START: u8 = 0x01;
/// RoutineControl: request routine results.
pub const ROUTINE_REQUEST_RESULTS: u8 = 0x03;

/// Routine: recompute calibration checksums.
pub const ROUTINE_CHECKSUM: u16 = 0xFF01;
/// Routine: erase calibration sectors.
pub const ROUTINE_ERASE: u16 = 0xFF02;

/// addressAndLengthFormatIdentifier: 4-byte address, 4-byte length.
pub const ALFID_4_4: u8 = 0x44;
/// dataFormatIdentifier: no compression, no encryption.
pub const FORMAT_PLAIN: u8 = 0x00;

/// Controller-side limit on one TransferData payload.
pub const MAX_TRANSFER_PAYLOAD: usize = 512;

// ============================================================================
// Negative response codes
// ============================================================================

/// One negative response code with its ISO 14229 meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nrc(pub u8);

impl Nrc {
    pub const SERVICE_NOT_SUPPORTED: Nrc = Nrc(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Nrc = Nrc(0x12);
    pub const INCORRECT_MESSAGE_LENGTH: Nrc = Nrc(0x13);
    pub const BUSY_REPEAT_REQUEST: Nrc = Nrc(0x21);
    pub const CONDITIONS_NOT_CORRECT: Nrc = Nrc(0x22);
    pub const BUSY_ROUTINE_NOT_COMPLETE: Nrc = Nrc(0x23);
    pub const REQUEST_SEQUENCE_ERROR: Nrc = Nrc(0x24);
    pub const REQUEST_OUT_OF_RANGE: Nrc = Nrc(0x31);
    pub const SECURITY_ACCESS_DENIED: Nrc = Nrc(0x33);
    pub const INVALID_KEY: Nrc = Nrc(0x35);
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: Nrc = Nrc(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Nrc = Nrc(0x37);
    pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: Nrc = Nrc(0x70);
    pub const TRANSFER_DATA_SUSPENDED: Nrc = Nrc(0x71);
    pub const GENERAL_PROGRAMMING_FAILURE: Nrc = Nrc(0x72);
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: Nrc = Nrc(0x73);
    pub const RESPONSE_PENDING: Nrc = Nrc(0x78);

    /// True for the "busy" codes the client retries with backoff.
    pub fn is_busy(self) -> bool {
        self == Nrc::BUSY_REPEAT_REQUEST || self == Nrc::BUSY_ROUTINE_NOT_COMPLETE
    }

    pub fn describe(self) -> &'static str {
        match self.0 {
            0x11 => "service not supported",
            0x12 => "sub-function not supported",
            0x13 => "incorrect message length",
            0x21 => "busy, repeat request",
            0x22 => "conditions not correct",
            0x23 => "busy, routine not complete",
            0x24 => "request sequence error",
            0x31 => "request out of range",
            0x33 => "security access denied",
            0x35 => "invalid key",
            0x36 => "exceeded number of attempts",
            0x37 => "required time delay not expired",
            0x70 => "upload/download not accepted",
            0x71 => "transfer data suspended",
            0x72 => "general programming failure",
            0x73 => "wrong block sequence counter",
            0x78 => "response pending",
            _ => "unknown negative response code",
        }
    }
}

impl std::fmt::Display for Nrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes() {
        assert!(Nrc(0x21).is_busy());
        assert!(Nrc(0x23).is_busy());
        assert!(!Nrc(0x78).is_busy());
        assert!(!Nrc(0x35).is_busy());
    }

    #[test]
    fn display_includes_meaning() {
        assert_eq!(format!("{}", Nrc::INVALID_KEY), "0x35 (invalid key)");
    }
}
