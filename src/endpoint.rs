//! Network-side proxy for one peripheral.
//!
//! Each configured device gets one `Endpoint`: a datagram session, a
//! framing mode and its own sequence counter. The endpoint translates
//! between the bus addressing model and its network wire format in both
//! directions. It never routes; frames it produces go back to the
//! router, frames it is handed get written to its own session only.

use std::sync::Arc;

use log::{debug, trace, warn};
use maitake_sync::WaitQueue;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;

use crate::bridge::Bridge;
use crate::config::EndpointMode;
use crate::frame::{self, BROADCAST, Frame, FrameKind, NETWORK_CHANGE, RESET_SEQUENCE};
use crate::router::{FrameSink, SendError};
use crate::seq::SequenceCounter;
use crate::status::{StatusSink, hex_str};

const MAX_DATAGRAM: usize = 2048;

pub struct Endpoint {
    id: u8,
    mode: EndpointMode,
    seq: SequenceCounter,
    sink: mpsc::Sender<Vec<u8>>,
    last_sent: Option<Vec<u8>>,
    status: Arc<dyn StatusSink>,
}

impl Endpoint {
    pub fn new(
        id: u8,
        mode: EndpointMode,
        sink: mpsc::Sender<Vec<u8>>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            id,
            mode,
            seq: SequenceCounter::new(),
            sink,
            last_sent: None,
            status,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn mode(&self) -> EndpointMode {
        self.mode
    }

    /// Bus bytes of the most recently sent frame, for diagnostics.
    pub fn last_sent(&self) -> Option<&[u8]> {
        self.last_sent.as_deref()
    }

    /// Session established. Framed peers get their sequence tracking
    /// reset; raw peers hear a network-change broadcast carrying our id.
    pub fn on_ready(&mut self) {
        match self.mode {
            EndpointMode::Framed => {
                let seq = self.seq.next();
                if let Ok(bytes) =
                    frame::encode_datagram(FrameKind::CONTROL, seq.value, &RESET_SEQUENCE)
                {
                    let _ = self.push(bytes);
                }
            }
            EndpointMode::Raw => {
                let announce = Frame {
                    sender: self.id,
                    receiver: BROADCAST,
                    kind: None,
                    payload: NETWORK_CHANGE.to_vec(),
                };
                if let Err(e) = self.send_frame(&announce) {
                    debug!("endpoint {}: network-change dropped: {e:?}", self.id);
                }
            }
        }
    }

    /// Translate one inbound datagram into a bus-model frame, or discard
    /// it. Malformed input is dropped here and never reaches the router.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Option<Frame> {
        match self.mode {
            EndpointMode::Framed => {
                let dg = match frame::decode_datagram(bytes) {
                    Ok(dg) => dg,
                    Err(e) => {
                        debug!("endpoint {}: dropping datagram: {e:?}", self.id);
                        return None;
                    }
                };
                let mut f = match frame::decode_bus(&dg.payload) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!("endpoint {}: dropping payload: {e:?}", self.id);
                        return None;
                    }
                };
                // The peripheral answers as itself no matter what it put
                // in the sender nibble; the receiver nibble is preserved.
                f.sender = self.id;
                f.kind = Some(dg.kind);
                if f.is_interface_clear_broadcast() {
                    // Our own broadcast bounced back. It must not
                    // re-enter the bus.
                    trace!(
                        "endpoint {}: discarding reflected clear broadcast",
                        self.id
                    );
                    return None;
                }
                Some(f)
            }
            EndpointMode::Raw => {
                let f = match frame::decode_bus(bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!("endpoint {}: dropping bus bytes: {e:?}", self.id);
                        return None;
                    }
                };
                // A relay carries the whole bus; only frames addressed
                // through this endpoint's id belong to it. Anything else
                // would arrive in duplicate via its own endpoint.
                if f.sender != self.id {
                    trace!(
                        "endpoint {}: ignoring frame from sender {}",
                        self.id, f.sender
                    );
                    return None;
                }
                Some(f)
            }
        }
    }

    fn push(&mut self, bytes: Vec<u8>) -> Result<(), SendError> {
        trace!("endpoint {} tx {}", self.id, hex_str(&bytes));
        match self.sink.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Inactive),
        }
    }
}

impl FrameSink for Endpoint {
    fn send_frame(&mut self, f: &Frame) -> Result<(), SendError> {
        let bus = frame::encode_bus(f).map_err(SendError::Encode)?;
        match self.mode {
            EndpointMode::Raw => {
                self.push(bus.clone())?;
            }
            EndpointMode::Framed => {
                let kind = f.kind.unwrap_or_else(|| {
                    if f.is_interface_clear_broadcast() {
                        FrameKind::DEVICE_SETTING
                    } else {
                        FrameKind::COMMAND
                    }
                });
                let seq = self.seq.next();
                if seq.rollover {
                    // Announce the restart before any frame carries zero
                    // again.
                    if let Ok(reset) =
                        frame::encode_datagram(FrameKind::CONTROL, 0, &RESET_SEQUENCE)
                    {
                        let _ = self.push(reset);
                    }
                }
                let wire =
                    frame::encode_datagram(kind, seq.value, &bus).map_err(SendError::Encode)?;
                self.push(wire)?;
            }
        }
        self.status.frame_sent(self.id, &bus);
        self.last_sent = Some(bus);
        Ok(())
    }
}

// ---- session workers ----

pub(crate) struct RxWorker {
    pub bridge: Bridge,
    pub epoch: u64,
    pub id: u8,
    pub skt: Arc<UdpSocket>,
    pub closer: Arc<WaitQueue>,
}

impl RxWorker {
    pub(crate) async fn run(mut self) {
        trace!("endpoint {}: rx worker up", self.id);
        self.run_inner().await;
        trace!("endpoint {}: rx worker down", self.id);
    }

    async fn run_inner(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let rd = self.skt.recv(&mut buf);
            let close = self.closer.wait();

            let ct = select! {
                r = rd => match r {
                    Ok(ct) => ct,
                    Err(e) => {
                        warn!("endpoint {}: recv error, retrying: {e}", self.id);
                        continue;
                    }
                },
                _c = close => return,
            };

            self.bridge.endpoint_rx(self.epoch, self.id, &buf[..ct]);
        }
    }
}

pub(crate) struct TxWorker {
    pub bridge: Bridge,
    pub epoch: u64,
    pub id: u8,
    pub skt: Arc<UdpSocket>,
    pub queue: mpsc::Receiver<Vec<u8>>,
    pub closer: Arc<WaitQueue>,
}

impl TxWorker {
    pub(crate) async fn run(mut self) {
        loop {
            let next = self.queue.recv();
            let close = self.closer.wait();

            let bytes = select! {
                b = next => match b {
                    Some(b) => b,
                    None => break,
                },
                _c = close => break,
            };

            if let Err(e) = self.skt.send(&bytes).await {
                warn!("endpoint {}: send error: {e}", self.id);
                self.bridge.endpoint_failed(self.epoch, self.id);
                break;
            }
        }
        trace!("endpoint {}: tx worker down", self.id);
    }
}
