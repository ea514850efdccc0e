//! ISO 15765-2 transport session for one request/response identifier pair.
//!
//! Segments service payloads of up to 4095 bytes into CAN frames and
//! reassembles the peer's frames back into payloads, driving flow control
//! in both directions. All waits are bounded by the standard timers:
//! `N_BS` for the peer's flow control, `N_CR` for consecutive frames.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::transport::{CanFrame, CanTransport, TransportError};

/// Largest payload a first frame can declare.
pub const MAX_PAYLOAD: usize = 4095;

/// Default padding byte for unused frame bytes.
pub const DEFAULT_PADDING: u8 = 0xAA;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

const FC_CONTINUE: u8 = 0x00;
const FC_WAIT: u8 = 0x01;
const FC_OVERFLOW: u8 = 0x02;

#[derive(Error, Debug)]
pub enum IsoTpError {
    #[error("ISO-TP timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected ISO-TP frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("ISO-TP payload too large: {declared} bytes")]
    Overflow { declared: usize },

    #[error("peer rejected the transfer (flow control overflow)")]
    Rejected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Timing and addressing for one ISO-TP link.
#[derive(Debug, Clone)]
pub struct IsoTpConfig {
    /// Tester → ECU identifier.
    pub tx_id: u32,
    /// ECU → tester identifier.
    pub rx_id: u32,
    /// Fill byte for unused frame bytes.
    pub padding: u8,
    /// Wait budget for the peer's flow control after a first frame.
    pub n_bs: Duration,
    /// Per-frame budget for consecutive frames during reassembly.
    pub n_cr: Duration,
    /// Block size announced in our flow control (0 = no limit).
    pub fc_block_size: u8,
    /// STmin announced in our flow control.
    pub fc_st_min: u8,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            tx_id: 0x612,
            rx_id: 0x613,
            padding: DEFAULT_PADDING,
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            fc_block_size: 0,
            fc_st_min: 0,
        }
    }
}

/// Decode an STmin byte into the minimum gap between consecutive frames.
///
/// `0x00..=0x7F` are milliseconds, `0xF1..=0xF9` are 100 µs steps.
/// Reserved values clamp to the 127 ms maximum.
pub fn decode_st_min(st: u8) -> Duration {
    match st {
        0x00..=0x7F => Duration::from_millis(st as u64),
        0xF1..=0xF9 => Duration::from_micros((st - 0xF0) as u64 * 100),
        _ => Duration::from_millis(127),
    }
}

/// Blocking ISO-TP session owning its transport.
pub struct IsoTpSession<T: CanTransport> {
    transport: T,
    config: IsoTpConfig,
}

impl<T: CanTransport> IsoTpSession<T> {
    pub fn new(transport: T, config: IsoTpConfig) -> Self {
        Self { transport, config }
    }

    /// Restrict reception to the peer identifier.
    pub fn bind(&mut self) -> Result<(), TransportError> {
        self.transport.set_rx_filter(&[self.config.rx_id])
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Transmit one frame, retrying once on a transient transport error.
    fn send_raw(&mut self, frame: &CanFrame) -> Result<(), IsoTpError> {
        match self.transport.send_frame(frame) {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(TransportError::Closed.into()),
            Err(first) => {
                debug!(error = %first, "frame send failed, retrying once");
                self.transport.send_frame(frame).map_err(IsoTpError::from)
            }
        }
    }

    fn padded(&self, used: &[u8]) -> CanFrame {
        let mut buf = [self.config.padding; 8];
        buf[..used.len()].copy_from_slice(used);
        CanFrame::new(self.config.tx_id, &buf)
    }

    /// Send one service payload, segmenting as required.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(IsoTpError::Overflow {
                declared: payload.len(),
            });
        }

        if payload.len() <= 7 {
            let mut buf = [0u8; 8];
            buf[0] = PCI_SINGLE | payload.len() as u8;
            buf[1..1 + payload.len()].copy_from_slice(payload);
            let frame = self.padded(&buf[..1 + payload.len()]);
            trace!(len = payload.len(), "SF");
            return self.send_raw(&frame);
        }

        let mut first = [0u8; 8];
        first[0] = PCI_FIRST | ((payload.len() >> 8) & 0x0F) as u8;
        first[1] = (payload.len() & 0xFF) as u8;
        first[2..8].copy_from_slice(&payload[..6]);
        trace!(len = payload.len(), "FF");
        self.send_raw(&CanFrame::new(self.config.tx_id, &first))?;

        let (mut block_size, mut st_min) = self.wait_flow_control()?;
        let mut gap = decode_st_min(st_min);

        let mut offset = 6usize;
        let mut sn = 1u8;
        let mut in_block = 0u32;
        while offset < payload.len() {
            if block_size != 0 && in_block == block_size as u32 {
                // Block exhausted; the peer owes us another flow control.
                let (bs, st) = self.wait_flow_control()?;
                block_size = bs;
                st_min = st;
                gap = decode_st_min(st_min);
                in_block = 0;
            }

            let chunk = (payload.len() - offset).min(7);
            let mut cf = [0u8; 8];
            cf[0] = PCI_CONSECUTIVE | (sn & 0x0F);
            cf[1..1 + chunk].copy_from_slice(&payload[offset..offset + chunk]);
            let frame = self.padded(&cf[..1 + chunk]);
            self.send_raw(&frame)?;

            offset += chunk;
            sn = (sn + 1) & 0x0F;
            in_block += 1;
            if offset < payload.len() && !gap.is_zero() {
                thread::sleep(gap);
            }
        }
        Ok(())
    }

    /// Wait for a flow control frame within `N_BS`, restarting on `Wait`.
    fn wait_flow_control(&mut self) -> Result<(u8, u8), IsoTpError> {
        loop {
            let deadline = Instant::now() + self.config.n_bs;
            let frame = loop {
                match self.transport.recv_frame(deadline) {
                    Ok(f) if f.id() == self.config.rx_id => break f,
                    Ok(_) => continue,
                    Err(TransportError::RxTimeout) => {
                        return Err(IsoTpError::Timeout("flow control"));
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let data = frame.data();
            if data.is_empty() || data[0] & 0xF0 != PCI_FLOW_CONTROL {
                return Err(IsoTpError::UnexpectedFrame("expected flow control"));
            }
            match data[0] & 0x0F {
                FC_CONTINUE => {
                    if data.len() < 3 {
                        return Err(IsoTpError::UnexpectedFrame("short flow control"));
                    }
                    trace!(bs = data[1], st_min = data[2], "FC continue");
                    return Ok((data[1], data[2]));
                }
                FC_WAIT => {
                    trace!("FC wait, restarting N_BS");
                    continue;
                }
                FC_OVERFLOW => return Err(IsoTpError::Rejected),
                _ => return Err(IsoTpError::UnexpectedFrame("unknown flow status")),
            }
        }
    }

    /// Receive one service payload, reassembling as required. `timeout`
    /// bounds the wait for the first frame.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, IsoTpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = match self.transport.recv_frame(deadline) {
                Ok(f) if f.id() == self.config.rx_id => f,
                Ok(_) => continue,
                Err(TransportError::RxTimeout) => return Err(IsoTpError::Timeout("response")),
                Err(e) => return Err(e.into()),
            };

            let data = frame.data();
            if data.is_empty() {
                return Err(IsoTpError::UnexpectedFrame("empty frame"));
            }
            match data[0] & 0xF0 {
                PCI_SINGLE => {
                    let len = (data[0] & 0x0F) as usize;
                    if len == 0 || len > 7 || 1 + len > data.len() {
                        return Err(IsoTpError::UnexpectedFrame("bad single-frame length"));
                    }
                    return Ok(data[1..1 + len].to_vec());
                }
                PCI_FIRST => {
                    return self.recv_multi(&frame);
                }
                // Stray flow control from a previous exchange; skip it.
                PCI_FLOW_CONTROL => continue,
                _ => return Err(IsoTpError::UnexpectedFrame("consecutive frame while idle")),
            }
        }
    }

    fn recv_multi(&mut self, first: &CanFrame) -> Result<Vec<u8>, IsoTpError> {
        let data = first.data();
        if data.len() < 2 {
            return Err(IsoTpError::UnexpectedFrame("short first frame"));
        }
        let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        if total < 8 {
            return Err(IsoTpError::UnexpectedFrame("first frame below multi-frame minimum"));
        }

        let mut payload = Vec::with_capacity(total);
        payload.extend_from_slice(&data[2..]);

        // Clear to send, no block limit. Emitted well inside N_BR.
        let fc = self.padded(&[
            PCI_FLOW_CONTROL | FC_CONTINUE,
            self.config.fc_block_size,
            self.config.fc_st_min,
        ]);
        self.send_raw(&fc)?;

        let mut expected_sn = 1u8;
        while payload.len() < total {
            let deadline = Instant::now() + self.config.n_cr;
            let frame = match self.transport.recv_frame(deadline) {
                Ok(f) if f.id() == self.config.rx_id => f,
                Ok(_) => continue,
                Err(TransportError::RxTimeout) => {
                    return Err(IsoTpError::Timeout("consecutive frame"));
                }
                Err(e) => return Err(e.into()),
            };

            let data = frame.data();
            if data.is_empty() || data[0] & 0xF0 != PCI_CONSECUTIVE {
                return Err(IsoTpError::UnexpectedFrame("expected consecutive frame"));
            }
            let sn = data[0] & 0x0F;
            if sn != expected_sn {
                return Err(IsoTpError::UnexpectedFrame("sequence number discontinuity"));
            }
            expected_sn = (expected_sn + 1) & 0x0F;

            let remaining = total - payload.len();
            let take = remaining.min(data.len() - 1);
            payload.extend_from_slice(&data[1..1 + take]);
        }

        Ok(payload)
    }
}
