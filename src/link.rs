//! The shared serial bus transport.
//!
//! One link serves every purely-serial peripheral on the daisy chain.
//! Inbound bytes are re-framed at the `0xFF` terminator and decoded into
//! bus frames; outbound frames are encoded and drained by a tx worker.
//! The link never reconnects on its own: a fault is reported upward and
//! recovery is a reconfiguration.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use maitake_sync::WaitQueue;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};

use crate::acc::{FeedResult, FrameAccumulator};
use crate::bridge::Bridge;
use crate::config::{Parity, SerialConfig};
use crate::frame::{self, Frame};
use crate::router::{FrameSink, SendError};
use crate::status::{LinkState, hex_str};

/// Bus messages are short; anything beyond this is line noise.
const ACC_CAPACITY: usize = 128;
const READ_CHUNK: usize = 512;

pub struct SerialLink {
    sink: mpsc::Sender<Vec<u8>>,
    state: LinkState,
}

impl SerialLink {
    pub fn new(sink: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            sink,
            state: LinkState::Opening,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Write already-framed bus bytes as-is (the pass-through path).
    pub fn write_raw(&mut self, bytes: Vec<u8>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Inactive);
        }
        trace!("serial tx {}", hex_str(&bytes));
        match self.sink.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Inactive),
        }
    }
}

impl FrameSink for SerialLink {
    fn send_frame(&mut self, f: &Frame) -> Result<(), SendError> {
        let bytes = frame::encode_bus(f).map_err(SendError::Encode)?;
        self.write_raw(bytes)
    }
}

/// Open the configured port. Not async: the builder hands back a stream
/// already registered with the reactor.
pub fn open(config: &SerialConfig) -> Result<SerialStream, tokio_serial::Error> {
    let data_bits = match config.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };
    let parity = match config.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    tokio_serial::new(&config.path, config.baud)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open_native_async()
}

/// How the rx worker ended.
#[derive(Debug, PartialEq)]
pub(crate) enum LinkDown {
    Closed,
    Faulted,
}

// ---- port workers ----

pub(crate) struct RxWorker {
    pub bridge: Bridge,
    pub epoch: u64,
    pub port: ReadHalf<SerialStream>,
    pub closer: Arc<WaitQueue>,
}

impl RxWorker {
    pub(crate) async fn run(mut self) {
        info!("serial rx worker up");
        let down = self.run_inner().await;
        // A teardown-initiated stop carries a stale epoch and reports
        // nothing; a real fault flips the link state.
        self.bridge.serial_down(self.epoch, down);
        info!("serial rx worker down");
    }

    async fn run_inner(&mut self) -> LinkDown {
        let mut acc = FrameAccumulator::new(ACC_CAPACITY);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let rd = self.port.read(&mut buf);
            let close = self.closer.wait();

            let ct = select! {
                r = rd => match r {
                    Ok(0) => {
                        warn!("serial stream closed");
                        return LinkDown::Closed;
                    }
                    Ok(ct) => ct,
                    Err(e) => {
                        warn!("serial read error: {e}");
                        return LinkDown::Faulted;
                    }
                },
                _c = close => return LinkDown::Closed,
            };

            let mut window = &buf[..ct];
            while !window.is_empty() {
                window = match acc.feed(window) {
                    FeedResult::Consumed => break,
                    FeedResult::OverFull(remaining) => {
                        debug!("serial: oversized message dropped");
                        remaining
                    }
                    FeedResult::Success { data, remaining }
                    | FeedResult::SuccessInput { data, remaining } => {
                        self.bridge.serial_rx(self.epoch, data);
                        remaining
                    }
                };
            }
        }
    }
}

pub(crate) struct TxWorker {
    pub bridge: Bridge,
    pub epoch: u64,
    pub port: WriteHalf<SerialStream>,
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

            if let Err(e) = self.port.write_all(&bytes).await {
                warn!("serial write error: {e}");
                self.bridge.serial_down(self.epoch, LinkDown::Faulted);
                break;
            }
        }
        trace!("serial tx worker down");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::BROADCAST;

    #[test]
    fn closed_link_refuses_writes() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut link = SerialLink::new(tx);

        let f = Frame {
            sender: 0,
            receiver: 1,
            kind: None,
            payload: vec![0x01, 0xFF],
        };
        // Opening: not writable yet.
        assert_eq!(link.send_frame(&f), Err(SendError::Inactive));

        link.set_state(LinkState::Open);
        link.send_frame(&f).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![0x81, 0x01, 0xFF]);

        link.set_state(LinkState::Faulted);
        assert_eq!(link.send_frame(&f), Err(SendError::Inactive));
    }

    #[test]
    fn encodes_broadcast_header() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut link = SerialLink::new(tx);
        link.set_state(LinkState::Open);

        link.send_frame(&Frame {
            sender: 0,
            receiver: BROADCAST,
            kind: None,
            payload: vec![0x30, 0x04, 0xFF],
        })
        .unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![0x88, 0x30, 0x04, 0xFF]);
    }
}
