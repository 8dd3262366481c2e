//! Legacy TCP pass-through.
//!
//! The bridge's original operating mode, kept for controllers that
//! predate per-device datagram sessions: a TCP server whose clients
//! speak raw bus bytes. Client bytes go to the serial port verbatim and
//! serial traffic fans back to every client. No decoding, no routing.
//!
//! An optional watchdog covers the one diagnostic the raw path cannot
//! give a controller: if the bus stays silent after a command, every
//! client hears a configurable error string instead of nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use maitake_sync::WaitQueue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::bridge::QUEUE_DEPTH;
use crate::config::PassthroughConfig;
use crate::status::hex_str;

const READ_CHUNK: usize = 1024;

pub struct Passthrough {
    config: PassthroughConfig,
    /// Write side of every connected client.
    clients: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    /// Raw byte sink of the serial link, if one is configured.
    serial: Option<mpsc::Sender<Vec<u8>>>,
    /// Bumped by serial traffic and by every armed command; a watchdog
    /// only fires while its own generation is still current.
    generation: AtomicU64,
    closer: Arc<WaitQueue>,
}

impl Passthrough {
    pub(crate) fn new(
        config: PassthroughConfig,
        serial: Option<mpsc::Sender<Vec<u8>>>,
        closer: Arc<WaitQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: Mutex::new(Vec::new()),
            serial,
            generation: AtomicU64::new(0),
            closer,
        })
    }

    /// Serial traffic: feed the watchdog, then fan out to every client.
    pub(crate) fn on_serial_data(&self, bytes: &[u8]) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.fanout(bytes);
    }

    fn fanout(&self, bytes: &[u8]) {
        let mut clients = self.lock_clients();
        clients.retain(|tx| match tx.try_send(bytes.to_vec()) {
            Ok(()) => true,
            // A slow client loses bytes, it does not stall the bus.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn on_client_data(self: &Arc<Self>, bytes: &[u8]) {
        debug!("tcp> {}", hex_str(bytes));
        let Some(serial) = &self.serial else {
            warn!("pass-through: no serial link, dropping {} bytes", bytes.len());
            return;
        };
        if serial.try_send(bytes.to_vec()).is_err() {
            warn!("pass-through: serial queue full, dropping {} bytes", bytes.len());
            return;
        }
        if let Some(ms) = self.config.response_timeout_ms {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let pt = self.clone();
            tokio::task::spawn(async move {
                sleep(Duration::from_millis(ms)).await;
                if pt.generation.load(Ordering::Relaxed) == generation {
                    error!("no serial response within {ms} ms");
                    pt.fanout(pt.config.error_message.as_bytes());
                }
            });
        }
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<Vec<u8>>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accept loop. Runs until the configuration epoch is torn down.
pub(crate) async fn serve(pt: Arc<Passthrough>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!("pass-through listening on {addr}");
    }
    loop {
        let accept = listener.accept();
        let close = pt.closer.wait();

        let (stream, addr) = select! {
            r = accept => match r {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("pass-through accept error: {e}");
                    continue;
                }
            },
            _c = close => break,
        };

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        {
            let mut clients = pt.lock_clients();
            if clients.len() >= pt.config.max_clients {
                // Dropping the stream closes it.
                warn!("pass-through: refusing {addr}, client limit reached");
                continue;
            }
            clients.push(tx);
        }
        info!("pass-through client {addr}");
        tokio::task::spawn(client_run(pt.clone(), stream, rx));
    }
    debug!("pass-through server down");
}

async fn client_run(pt: Arc<Passthrough>, stream: TcpStream, mut queue: mpsc::Receiver<Vec<u8>>) {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let read = rd.read(&mut buf);
        let write = queue.recv();
        let close = pt.closer.wait();

        select! {
            r = read => match r {
                Ok(0) => break,
                Ok(ct) => pt.on_client_data(&buf[..ct]),
                Err(e) => {
                    debug!("pass-through client read error: {e}");
                    break;
                }
            },
            w = write => match w {
                Some(bytes) => {
                    if wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _c = close => break,
        }
    }
    // The fan-out prunes our sender once the queue reads as closed.
    debug!("pass-through client gone");
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(timeout_ms: Option<u64>) -> PassthroughConfig {
        PassthroughConfig {
            listen_port: 0,
            max_clients: 4,
            response_timeout_ms: timeout_ms,
            error_message: "&& ERR:NORESPONSE".to_string(),
        }
    }

    async fn start(
        timeout_ms: Option<u64>,
    ) -> (Arc<Passthrough>, mpsc::Receiver<Vec<u8>>, std::net::SocketAddr) {
        let (serial_tx, serial_rx) = mpsc::channel(8);
        let closer = Arc::new(WaitQueue::new());
        let pt = Passthrough::new(test_config(timeout_ms), Some(serial_tx), closer);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::task::spawn(serve(pt.clone(), listener));
        (pt, serial_rx, addr)
    }

    #[tokio::test]
    async fn client_bytes_reach_the_serial_sink() {
        let (_pt, mut serial_rx, addr) = start(None).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x81, 0x01, 0x04, 0x00, 0x02, 0xFF]).await.unwrap();

        let bytes = timeout(Duration::from_secs(1), serial_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, vec![0x81, 0x01, 0x04, 0x00, 0x02, 0xFF]);
    }

    #[tokio::test]
    async fn serial_bytes_fan_out_to_clients() {
        let (pt, _serial_rx, addr) = start(None).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        // Let the accept loop register both before fanning out.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pt.on_serial_data(&[0x90, 0x41, 0xFF]);

        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 16];
            let ct = timeout(Duration::from_secs(1), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..ct], &[0x90, 0x41, 0xFF]);
        }
    }

    #[tokio::test]
    async fn silent_bus_trips_the_watchdog() {
        let (_pt, mut serial_rx, addr) = start(Some(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x81, 0x09, 0x00, 0x02, 0xFF]).await.unwrap();
        // The command reaches the serial sink but nothing answers.
        assert!(serial_rx.recv().await.is_some());

        let mut buf = [0u8; 64];
        let ct = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..ct], b"&& ERR:NORESPONSE");
    }

    #[tokio::test]
    async fn serial_reply_clears_the_watchdog() {
        let (pt, mut serial_rx, addr) = start(Some(100)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x81, 0x09, 0x00, 0x02, 0xFF]).await.unwrap();
        assert!(serial_rx.recv().await.is_some());

        // The bus answers inside the window.
        pt.on_serial_data(&[0x90, 0x50, 0x02, 0xFF]);

        let mut buf = [0u8; 64];
        let ct = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..ct], &[0x90, 0x50, 0x02, 0xFF]);

        // And no error string follows.
        let followup = timeout(Duration::from_millis(300), client.read(&mut buf)).await;
        assert!(followup.is_err(), "unexpected extra bytes after the reply");
    }
}
