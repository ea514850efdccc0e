//! Production transport over the Linux kernel CAN socket.

use std::io;
use std::time::Instant;

use socketcan::{CanFilter, CanSocket, EmbeddedFrame, Id, Socket, SocketOptions, StandardId};
use tracing::{debug, info};

use super::traits::{CanFrame, CanTransport, TransportError};

/// ENOBUFS from the kernel means the interface tx queue is full.
const ENOBUFS: i32 = 105;

/// `CanTransport` backed by a `socketcan` raw socket.
pub struct SocketCanTransport {
    socket: Option<CanSocket>,
    channel: String,
}

impl SocketCanTransport {
    /// Open the named interface (e.g. `can0`).
    pub fn open(channel: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(channel)?;
        info!(channel = %channel, "CAN socket opened");
        Ok(Self {
            socket: Some(socket),
            channel: channel.to_string(),
        })
    }

    fn socket(&self) -> Result<&CanSocket, TransportError> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }

    fn to_kernel_frame(frame: &CanFrame) -> Result<socketcan::CanFrame, TransportError> {
        let invalid = |what: &str| {
            TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, what.to_string()))
        };
        let id: Id = if frame.id() <= StandardId::MAX.as_raw() as u32 {
            StandardId::new(frame.id() as u16)
                .map(Id::Standard)
                .ok_or_else(|| invalid("bad standard identifier"))?
        } else {
            socketcan::ExtendedId::new(frame.id())
                .map(Id::Extended)
                .ok_or_else(|| invalid("bad extended identifier"))?
        };
        socketcan::CanFrame::new(id, frame.data())
            .ok_or_else(|| invalid("frame payload exceeds 8 bytes"))
    }

    fn raw_id(id: Id) -> u32 {
        match id {
            Id::Standard(s) => s.as_raw() as u32,
            Id::Extended(e) => e.as_raw(),
        }
    }
}

impl CanTransport for SocketCanTransport {
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let socket = self.socket()?;
        let kernel = Self::to_kernel_frame(frame)?;
        debug!(frame = ?frame, "TX");
        match socket.write_frame(&kernel) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(ENOBUFS) => Err(TransportError::TxOverflow),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn recv_frame(&mut self, deadline: Instant) -> Result<CanFrame, TransportError> {
        loop {
            let socket = self.socket()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::RxTimeout);
            }
            socket
                .set_read_timeout(deadline - now)
                .map_err(TransportError::Io)?;

            match socket.read_frame() {
                Ok(socketcan::CanFrame::Data(f)) => {
                    let frame = CanFrame::new(Self::raw_id(f.id()), f.data());
                    debug!(frame = ?frame, "RX");
                    return Ok(frame);
                }
                // Remote frames are not part of the diagnostic link.
                Ok(socketcan::CanFrame::Remote(_)) => continue,
                Ok(socketcan::CanFrame::Error(_)) => return Err(TransportError::BusOff),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(TransportError::RxTimeout);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn set_rx_filter(&mut self, ids: &[u32]) -> Result<(), TransportError> {
        let socket = self.socket()?;
        let filters: Vec<CanFilter> = ids
            .iter()
            .map(|&id| CanFilter::new(id, 0x1FFF_FFFF))
            .collect();
        socket.set_filters(filters.as_slice())?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.socket.take().is_some() {
            info!(channel = %self.channel, "CAN socket closed");
        }
        Ok(())
    }
}
