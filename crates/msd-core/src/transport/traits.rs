//! CAN transport abstraction.
//!
//! Defines the `CanTransport` trait over a single bidirectional CAN channel,
//! allowing different implementations (kernel socket, mock, etc.).

use std::time::Instant;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("CAN controller is bus-off")]
    BusOff,

    #[error("transmit queue overflow")]
    TxOverflow,

    #[error("timed out waiting for a frame")]
    RxTimeout,

    #[error("transport is closed")]
    Closed,

    #[error("CAN I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One classical CAN frame: an identifier and 0..8 payload bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from an identifier and up to 8 bytes. Longer slices
    /// are truncated to the CAN maximum.
    pub fn new(id: u32, bytes: &[u8]) -> Self {
        let len = bytes.len().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            id,
            len: len as u8,
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03X} [", self.id)?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "]")
    }
}

/// Abstract CAN channel at 500 kbit/s with 11-bit or 29-bit identifiers.
///
/// This trait enables:
/// - Production implementation over the kernel CAN socket
/// - Mock implementation for unit testing
/// - Future alternative backends (serial-line gateways, vendor drivers)
///
/// No retries happen at this layer; retry policy lives above.
pub trait CanTransport {
    /// Queue one frame for transmission.
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Block until a frame arrives or `deadline` passes.
    fn recv_frame(&mut self, deadline: Instant) -> Result<CanFrame, TransportError>;

    /// Restrict reception to the given identifiers.
    fn set_rx_filter(&mut self, ids: &[u32]) -> Result<(), TransportError>;

    /// Release the channel. Further calls fail with `Closed`.
    fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_to_eight_bytes() {
        let frame = CanFrame::new(0x612, &[0u8; 12]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn frame_debug_format() {
        let frame = CanFrame::new(0x613, &[0x10, 0x02]);
        assert_eq!(format!("{:?}", frame), "613 [10 02]");
    }
}
