//! Mock CAN transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::traits::{CanFrame, CanTransport, TransportError};

/// Service handler scripted by a test: receives one reassembled request
/// payload and returns the response payloads to queue, in order.
pub type ServiceHandler = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

struct MockInner {
    connected: bool,
    /// Frames waiting to be delivered to the tester.
    rx_queue: VecDeque<CanFrame>,
    /// Every frame the tester transmitted.
    write_log: Vec<CanFrame>,
    /// Complete service requests reassembled from the tester's frames.
    requests: Vec<Vec<u8>>,
    rx_filter: Vec<u32>,
    /// ECU-side reassembly state.
    assembling: Option<(usize, Vec<u8>)>,
    handler: Option<ServiceHandler>,
}

/// Mock transport that plays the ECU side of the link.
///
/// The mock runs its own ISO-TP engine: it reassembles the tester's frames
/// into service requests, hands each to the scripted handler, and segments
/// the handler's responses back into frames on the receive queue. Flow
/// control towards the tester is always `ContinueToSend, bs=0, st=0`; flow
/// control *from* the tester is absorbed because responses are queued whole.
///
/// Handles are cheap clones over shared state so a test can keep one for
/// assertions after the session takes ownership of another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
    /// Identifier the mock answers on (ECU → tester).
    ecu_id: u32,
    padding: u8,
}

impl MockTransport {
    pub fn new(ecu_id: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                connected: true,
                rx_queue: VecDeque::new(),
                write_log: Vec::new(),
                requests: Vec::new(),
                rx_filter: Vec::new(),
                assembling: None,
                handler: None,
            })),
            ecu_id,
            padding: 0xAA,
        }
    }

    /// Install the scripted service handler.
    pub fn on_request(&self, handler: ServiceHandler) {
        self.inner.lock().unwrap().handler = Some(handler);
    }

    /// Queue a raw frame for the tester to receive.
    pub fn queue_frame(&self, frame: CanFrame) {
        self.inner.lock().unwrap().rx_queue.push_back(frame);
    }

    /// All frames the tester transmitted.
    pub fn writes(&self) -> Vec<CanFrame> {
        self.inner.lock().unwrap().write_log.clone()
    }

    /// Complete service requests seen so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn clear_writes(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_log.clear();
        inner.requests.clear();
    }

    /// Identifiers the tester asked to receive.
    pub fn rx_filter(&self) -> Vec<u32> {
        self.inner.lock().unwrap().rx_filter.clone()
    }

    /// Simulate losing the link.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn segment_response(&self, inner: &mut MockInner, payload: &[u8]) {
        if payload.len() <= 7 {
            let mut buf = [self.padding; 8];
            buf[0] = payload.len() as u8;
            buf[1..1 + payload.len()].copy_from_slice(payload);
            inner
                .rx_queue
                .push_back(CanFrame::new(self.ecu_id, &buf[..1 + payload.len()]));
            return;
        }

        let mut buf = [self.padding; 8];
        buf[0] = 0x10 | ((payload.len() >> 8) & 0x0F) as u8;
        buf[1] = (payload.len() & 0xFF) as u8;
        buf[2..8].copy_from_slice(&payload[..6]);
        inner.rx_queue.push_back(CanFrame::new(self.ecu_id, &buf));

        let mut offset = 6;
        let mut sn = 1u8;
        while offset < payload.len() {
            let chunk = (payload.len() - offset).min(7);
            let mut buf = [self.padding; 8];
            buf[0] = 0x20 | (sn & 0x0F);
            buf[1..1 + chunk].copy_from_slice(&payload[offset..offset + chunk]);
            inner.rx_queue.push_back(CanFrame::new(self.ecu_id, &buf));
            offset += chunk;
            sn = (sn + 1) & 0x0F;
        }
    }

    fn complete_request(&self, inner: &mut MockInner, request: Vec<u8>) {
        inner.requests.push(request.clone());
        if let Some(mut handler) = inner.handler.take() {
            let responses = handler(&request);
            inner.handler = Some(handler);
            for response in responses {
                self.segment_response(inner, &response);
            }
        }
    }

    fn process_tester_frame(&self, inner: &mut MockInner, frame: &CanFrame) {
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        match data[0] >> 4 {
            0x0 => {
                let len = (data[0] & 0x0F) as usize;
                if len > 0 && len < data.len() {
                    let request = data[1..1 + len].to_vec();
                    self.complete_request(inner, request);
                }
            }
            0x1 => {
                let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                let mut buf = Vec::with_capacity(total);
                buf.extend_from_slice(&data[2..]);
                inner.assembling = Some((total, buf));
                // Answer with ContinueToSend immediately.
                let fc = [0x30, 0x00, 0x00, self.padding, self.padding, self.padding, self.padding, self.padding];
                inner.rx_queue.push_back(CanFrame::new(self.ecu_id, &fc));
            }
            0x2 => {
                if let Some((total, mut buf)) = inner.assembling.take() {
                    buf.extend_from_slice(&data[1..]);
                    if buf.len() >= total {
                        buf.truncate(total);
                        self.complete_request(inner, buf);
                    } else {
                        inner.assembling = Some((total, buf));
                    }
                }
            }
            // Flow control from the tester: responses were queued whole.
            _ => {}
        }
    }
}

impl CanTransport for MockTransport {
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Closed);
        }
        inner.write_log.push(*frame);
        self.process_tester_frame(&mut inner, frame);
        Ok(())
    }

    fn recv_frame(&mut self, _deadline: Instant) -> Result<CanFrame, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Closed);
        }
        inner.rx_queue.pop_front().ok_or(TransportError::RxTimeout)
    }

    fn set_rx_filter(&mut self, ids: &[u32]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::Closed);
        }
        inner.rx_filter = ids.to_vec();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().connected = false;
        Ok(())
    }
}
