//! Synchronous UDS client for the flashing subset of ISO 14229.
//!
//! One outstanding request at a time, serialised on the session; the
//! controller accepts nothing else. Negative `0x78` responses extend the
//! wait (`P2*`), busy codes retry with backoff, everything else surfaces as
//! a typed error for the orchestrator's policy layer.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::constants::*;
use super::response::UdsReply;
use crate::isotp::{IsoTpError, IsoTpSession};
use crate::transport::CanTransport;

/// Busy-NRC retries before surfacing.
const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Keep-alive interval while long-running routines are in flight.
pub const TESTER_PRESENT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DiagError {
    #[error("negative response to service 0x{service:02X}: {nrc}")]
    Negative { service: u8, nrc: Nrc },

    #[error("security access denied")]
    SecurityDenied,

    #[error("unexpected reply to service 0x{service:02X}")]
    UnexpectedReply { service: u8 },

    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
}

/// Request/response deadlines.
#[derive(Debug, Clone)]
pub struct DiagTiming {
    /// Budget for the first reply to a request.
    pub p2: Duration,
    /// Extended budget after each `0x78` pending response.
    pub p2_star: Duration,
}

impl Default for DiagTiming {
    fn default() -> Self {
        Self {
            p2: Duration::from_millis(1000),
            p2_star: Duration::from_millis(5000),
        }
    }
}

/// Session progression on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Default,
    Programming,
    Unlocked,
}

/// Blocking diagnostic client over one ISO-TP session.
pub struct DiagClient<T: CanTransport> {
    isotp: IsoTpSession<T>,
    timing: DiagTiming,
    state: SessionState,
    last_activity: Option<Instant>,
}

impl<T: CanTransport> DiagClient<T> {
    pub fn new(isotp: IsoTpSession<T>, timing: DiagTiming) -> Self {
        Self {
            isotp,
            timing,
            state: SessionState::Default,
            last_activity: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn isotp_mut(&mut self) -> &mut IsoTpSession<T> {
        &mut self.isotp
    }

    pub fn into_inner(self) -> IsoTpSession<T> {
        self.isotp
    }

    /// Send one request and wait for its final reply.
    pub fn request(&mut self, service: u8, payload: &[u8]) -> Result<Vec<u8>, DiagError> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(service);
        message.extend_from_slice(payload);

        for attempt in 0..=BUSY_RETRIES {
            trace!(service = format_args!("0x{service:02X}"), attempt, "request");
            self.isotp.send(&message)?;
            self.last_activity = Some(Instant::now());

            match self.await_reply(service)? {
                ReplyOutcome::Data(data) => return Ok(data),
                ReplyOutcome::Busy(nrc) => {
                    if attempt == BUSY_RETRIES {
                        return Err(DiagError::Negative { service, nrc });
                    }
                    let backoff = BUSY_BACKOFF * (attempt + 1);
                    debug!(%nrc, ?backoff, "controller busy, retrying");
                    thread::sleep(backoff);
                }
            }
        }
        unreachable!("busy retry loop always returns");
    }

    fn await_reply(&mut self, service: u8) -> Result<ReplyOutcome, DiagError> {
        let mut budget = self.timing.p2;
        loop {
            let raw = self.isotp.recv(budget)?;
            self.last_activity = Some(Instant::now());
            let Some(reply) = UdsReply::parse(&raw) else {
                return Err(DiagError::UnexpectedReply { service });
            };

            if reply.is_pending() && reply.answers(service) {
                // Not an error: the controller asked for more time.
                trace!("response pending, extending to P2*");
                budget = self.timing.p2_star;
                continue;
            }
            if !reply.answers(service) {
                warn!(service = format_args!("0x{service:02X}"), "reply for a different service");
                return Err(DiagError::UnexpectedReply { service });
            }
            return match reply {
                UdsReply::Positive { data, .. } => Ok(ReplyOutcome::Data(data)),
                UdsReply::Negative { nrc, .. } if nrc.is_busy() => Ok(ReplyOutcome::Busy(nrc)),
                UdsReply::Negative { nrc, .. } => Err(DiagError::Negative { service, nrc }),
            };
        }
    }

    // ------------------------------------------------------------------
    // Session and keep-alive
    // ------------------------------------------------------------------

    /// Bring the controller into the programming session.
    pub fn start_programming_session(&mut self) -> Result<(), DiagError> {
        self.request(SID_DIAGNOSTIC_SESSION_CONTROL, &[SESSION_PROGRAMMING])?;
        self.state = SessionState::Programming;
        debug!("programming session active");
        Ok(())
    }

    /// Emit TesterPresent with suppressed response. Fire-and-forget.
    pub fn tester_present(&mut self) -> Result<(), DiagError> {
        self.isotp
            .send(&[SID_TESTER_PRESENT, TESTER_PRESENT_SUPPRESS])?;
        self.last_activity = Some(Instant::now());
        Ok(())
    }

    /// Emit TesterPresent when the keep-alive interval has elapsed.
    pub fn maybe_tester_present(&mut self) -> Result<(), DiagError> {
        let due = match self.last_activity {
            Some(at) => at.elapsed() >= TESTER_PRESENT_INTERVAL,
            None => true,
        };
        if due {
            self.tester_present()?;
        }
        Ok(())
    }

    /// Hard-reset the controller.
    pub fn ecu_reset(&mut self) -> Result<(), DiagError> {
        self.request(SID_ECU_RESET, &[RESET_HARD])?;
        self.state = SessionState::Default;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory and routine services
    // ------------------------------------------------------------------

    /// Read `len` bytes starting at `addr` (ReadMemoryByAddress).
    pub fn read_memory(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, DiagError> {
        let mut payload = [0u8; 9];
        payload[0] = ALFID_4_4;
        BigEndian::write_u32(&mut payload[1..5], addr);
        BigEndian::write_u32(&mut payload[5..9], len);
        let data = self.request(SID_READ_MEMORY_BY_ADDRESS, &payload)?;
        if data.len() != len as usize {
            return Err(DiagError::UnexpectedReply {
                service: SID_READ_MEMORY_BY_ADDRESS,
            });
        }
        Ok(data)
    }

    /// Start a routine; returns the routine status record, if any.
    pub fn routine_start(&mut self, routine: u16, args: &[u8]) -> Result<Vec<u8>, DiagError> {
        let mut payload = Vec::with_capacity(3 + args.len());
        payload.push(ROUTINE_START);
        payload.extend_from_slice(&routine.to_be_bytes());
        payload.extend_from_slice(args);
        let mut data = self.request(SID_ROUTINE_CONTROL, &payload)?;
        // Strip the echoed sub-function and routine id.
        if data.len() >= 3 {
            data.drain(..3);
        }
        Ok(data)
    }

    /// Poll a routine's results record.
    pub fn routine_results(&mut self, routine: u16) -> Result<Vec<u8>, DiagError> {
        let mut payload = Vec::with_capacity(3);
        payload.push(ROUTINE_REQUEST_RESULTS);
        payload.extend_from_slice(&routine.to_be_bytes());
        let mut data = self.request(SID_ROUTINE_CONTROL, &payload)?;
        if data.len() >= 3 {
            data.drain(..3);
        }
        Ok(data)
    }

    /// Open a download window; returns the usable TransferData payload size
    /// (the controller's block length minus the two service bytes, capped
    /// at the 512-byte controller limit).
    pub fn request_download(&mut self, addr: u32, size: u32) -> Result<usize, DiagError> {
        let mut payload = [0u8; 10];
        payload[0] = FORMAT_PLAIN;
        payload[1] = ALFID_4_4;
        BigEndian::write_u32(&mut payload[2..6], addr);
        BigEndian::write_u32(&mut payload[6..10], size);
        let data = self.request(SID_REQUEST_DOWNLOAD, &payload)?;

        let field_len = (data.first().copied().unwrap_or(0) >> 4) as usize;
        if field_len == 0 || data.len() < 1 + field_len || field_len > 4 {
            return Err(DiagError::UnexpectedReply {
                service: SID_REQUEST_DOWNLOAD,
            });
        }
        let mut max_block = 0usize;
        for &b in &data[1..1 + field_len] {
            max_block = (max_block << 8) | b as usize;
        }
        let usable = max_block.saturating_sub(2).min(MAX_TRANSFER_PAYLOAD);
        if usable == 0 {
            return Err(DiagError::UnexpectedReply {
                service: SID_REQUEST_DOWNLOAD,
            });
        }
        debug!(max_block, usable, "download accepted");
        Ok(usable)
    }

    /// Transfer one block under the rolling sequence counter.
    pub fn transfer_data(&mut self, counter: u8, block: &[u8]) -> Result<(), DiagError> {
        let mut payload = Vec::with_capacity(1 + block.len());
        payload.push(counter);
        payload.extend_from_slice(block);
        let data = self.request(SID_TRANSFER_DATA, &payload)?;
        if let Some(&echo) = data.first()
            && echo != counter
        {
            return Err(DiagError::UnexpectedReply {
                service: SID_TRANSFER_DATA,
            });
        }
        Ok(())
    }

    /// Close the download window.
    pub fn request_transfer_exit(&mut self) -> Result<(), DiagError> {
        self.request(SID_REQUEST_TRANSFER_EXIT, &[])?;
        Ok(())
    }
}

enum ReplyOutcome {
    Data(Vec<u8>),
    Busy(Nrc),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::IsoTpConfig;
    use crate::transport::MockTransport;

    fn client_with(
        handler: crate::transport::ServiceHandler,
    ) -> (MockTransport, DiagClient<MockTransport>) {
        let mock = MockTransport::new(0x613);
        mock.on_request(handler);
        let isotp = IsoTpSession::new(mock.clone(), IsoTpConfig::default());
        (mock, DiagClient::new(isotp, DiagTiming::default()))
    }

    #[test]
    fn positive_round_trip() {
        let (_mock, mut client) = client_with(Box::new(|req| {
            assert_eq!(req, &[0x10, 0x02]);
            vec![vec![0x50, 0x02]]
        }));
        client.start_programming_session().unwrap();
        assert_eq!(client.state(), SessionState::Programming);
    }

    #[test]
    fn pending_three_times_then_positive() {
        // Scenario: the controller answers 0x78 three times before the
        // final positive response; the client waits them out.
        let (_mock, mut client) = client_with(Box::new(|req| {
            assert_eq!(req[0], 0x31);
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x02],
            ]
        }));
        let data = client.routine_start(0xFF02, &[]).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn busy_retries_then_succeeds() {
        let mut calls = 0u32;
        let (mock, mut client) = client_with(Box::new(move |_req| {
            calls += 1;
            if calls == 1 {
                vec![vec![0x7F, 0x11, 0x21]]
            } else {
                vec![vec![0x51, 0x01]]
            }
        }));
        client.ecu_reset().unwrap();
        assert_eq!(mock.requests().len(), 2);
    }

    #[test]
    fn negative_surfaces_nrc() {
        let (_mock, mut client) = client_with(Box::new(|_req| vec![vec![0x7F, 0x34, 0x70]]));
        let err = client.request_download(0x0090_0000, 0x8_0000).unwrap_err();
        match err {
            DiagError::Negative { service, nrc } => {
                assert_eq!(service, 0x34);
                assert_eq!(nrc, Nrc::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn download_block_length_parsing() {
        let (_mock, mut client) = client_with(Box::new(|_req| {
            // lengthFormatIdentifier 0x20: 2-byte field, 0x0202 = 514.
            vec![vec![0x74, 0x20, 0x02, 0x02]]
        }));
        let usable = client.request_download(0x0090_0000, 0x8_0000).unwrap();
        assert_eq!(usable, 512);
    }

    #[test]
    fn tester_present_is_fire_and_forget() {
        let (mock, mut client) = client_with(Box::new(|req| {
            assert_eq!(req, &[0x3E, 0x00]);
            vec![]
        }));
        client.tester_present().unwrap();
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn read_memory_length_checked() {
        let (_mock, mut client) = client_with(Box::new(|_req| vec![vec![0x63, 0x01, 0x02]]));
        let err = client.read_memory(0x0090_0000, 4).unwrap_err();
        assert!(matches!(err, DiagError::UnexpectedReply { service: 0x23 }));
    }
}
