//! Bridge lifecycle and event plumbing.
//!
//! All decoding, routing and re-encoding runs synchronously under one
//! lock; transport workers only hand bytes in or drain bytes out.
//! Reconfiguration is the single cancellation point: it tears the whole
//! endpoint set down before the replacement exists, and every worker
//! entry point carries the configuration epoch it was spawned under, so
//! events against a torn-down epoch are no-ops.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use maitake_sync::WaitQueue;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use crate::assign::AddressAssigner;
use crate::config::{Config, ConfigError, DeviceConfig};
use crate::endpoint::{self, Endpoint};
use crate::frame::{self, Frame};
use crate::link::{self, LinkDown, SerialLink};
use crate::passthrough::{self, Passthrough};
use crate::router::{Origin, Router};
use crate::status::{LinkState, SessionState, StatusSink, hex_str};

/// Depth of every outbound byte queue. Writes beyond it are dropped, not
/// awaited; the command rate of the control protocol never gets close.
pub(crate) const QUEUE_DEPTH: usize = 32;

struct Inner {
    epoch: u64,
    closer: Arc<WaitQueue>,
    router: Router<Endpoint, SerialLink>,
    assigner: AddressAssigner,
    sessions: BTreeMap<u8, SessionState>,
    link_state: LinkState,
    passthrough: Option<Arc<Passthrough>>,
}

struct Shared {
    inner: Mutex<Inner>,
    status: Arc<dyn StatusSink>,
}

/// Cheaply cloneable handle to the bridge; workers and the host share
/// the same instance.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    pub fn new(status: Arc<dyn StatusSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    epoch: 0,
                    closer: Arc::new(WaitQueue::new()),
                    router: Router::new(),
                    assigner: AddressAssigner::new(),
                    sessions: BTreeMap::new(),
                    link_state: LinkState::Closed,
                    passthrough: None,
                }),
                status,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> &dyn StatusSink {
        &*self.shared.status
    }

    /// Apply a configuration snapshot: tear down the current epoch, then
    /// construct the replacement. A validation failure leaves the
    /// current epoch untouched.
    pub async fn apply(&self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;

        let (epoch, closer) = {
            let mut inner = self.lock();
            self.teardown(&mut inner);
            (inner.epoch, inner.closer.clone())
        };
        info!(
            "applying configuration: {} device(s), serial {}",
            config.devices.len(),
            config.serial.as_ref().map(|s| s.path.as_str()).unwrap_or("none"),
        );

        // Bus first, so the initial address pass can reach purely-serial
        // peripherals.
        let mut serial_sink = None;
        if let Some(serial_config) = &config.serial {
            self.report_link(epoch, LinkState::Opening);
            match link::open(serial_config) {
                Ok(stream) => {
                    let (rd, wr) = tokio::io::split(stream);
                    let (tx, queue) = mpsc::channel(QUEUE_DEPTH);
                    serial_sink = Some(tx.clone());
                    {
                        let mut inner = self.lock();
                        if inner.epoch != epoch {
                            return Ok(());
                        }
                        inner.router.set_serial(SerialLink::new(tx));
                    }
                    tokio::task::spawn(
                        link::RxWorker {
                            bridge: self.clone(),
                            epoch,
                            port: rd,
                            closer: closer.clone(),
                        }
                        .run(),
                    );
                    tokio::task::spawn(
                        link::TxWorker {
                            bridge: self.clone(),
                            epoch,
                            port: wr,
                            queue,
                            closer: closer.clone(),
                        }
                        .run(),
                    );
                    self.report_link(epoch, LinkState::Open);
                }
                Err(e) => {
                    warn!("serial open failed: {e}");
                    self.report_link(epoch, LinkState::Faulted);
                }
            }
        }

        // One endpoint per configured device, ascending id order. A
        // device whose session cannot open still gets its endpoint: the
        // set mirrors configuration, and its sends simply drop.
        let mut devices: Vec<&DeviceConfig> = config.devices.iter().collect();
        devices.sort_by_key(|d| d.id);
        let mut ready = Vec::new();
        for dev in devices {
            self.report_session(epoch, dev.id, SessionState::Connecting);
            let (tx, queue) = mpsc::channel(QUEUE_DEPTH);
            let ep = Endpoint::new(dev.id, dev.mode, tx, self.shared.status.clone());
            {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return Ok(());
                }
                inner.router.insert_endpoint(dev.id, ep);
            }
            match open_session(dev).await {
                Ok(skt) => {
                    let skt = Arc::new(skt);
                    tokio::task::spawn(
                        endpoint::TxWorker {
                            bridge: self.clone(),
                            epoch,
                            id: dev.id,
                            skt: skt.clone(),
                            queue,
                            closer: closer.clone(),
                        }
                        .run(),
                    );
                    tokio::task::spawn(
                        endpoint::RxWorker {
                            bridge: self.clone(),
                            epoch,
                            id: dev.id,
                            skt,
                            closer: closer.clone(),
                        }
                        .run(),
                    );
                    ready.push(dev.id);
                }
                Err(e) => {
                    warn!("endpoint {}: session open failed: {e}", dev.id);
                    self.report_session(epoch, dev.id, SessionState::Failed);
                }
            }
        }

        // Ready pass: per-mode announcements in id order; the first
        // ready session triggers the address pass for the whole epoch.
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Ok(());
            }
            for id in &ready {
                inner.sessions.insert(*id, SessionState::Ready);
                let Inner {
                    router, assigner, ..
                } = &mut *inner;
                if let Some(ep) = router.endpoint_mut(*id) {
                    ep.on_ready();
                }
                assigner.on_session_ready(router);
            }
        }
        for id in &ready {
            self.status().endpoint_state(*id, SessionState::Ready);
        }

        if let Some(pt_config) = &config.passthrough {
            match TcpListener::bind(("0.0.0.0", pt_config.listen_port)).await {
                Ok(listener) => {
                    let pt = Passthrough::new(pt_config.clone(), serial_sink, closer.clone());
                    {
                        let mut inner = self.lock();
                        if inner.epoch != epoch {
                            return Ok(());
                        }
                        inner.passthrough = Some(pt.clone());
                    }
                    tokio::task::spawn(passthrough::serve(pt, listener));
                }
                Err(e) => warn!("pass-through bind failed: {e}"),
            }
        }

        Ok(())
    }

    /// Tear down the current epoch: close every session, discard every
    /// counter. Safe at any time; a later `apply` starts fresh.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        self.teardown(&mut inner);
    }

    fn teardown(&self, inner: &mut Inner) {
        inner.epoch += 1;
        // Wakes every worker of the old epoch; their entry points are
        // now stale and turn into no-ops.
        inner.closer.close();
        inner.closer = Arc::new(WaitQueue::new());
        inner.router = Router::new();
        inner.assigner.rearm();
        inner.passthrough = None;
        if inner.link_state != LinkState::Closed {
            inner.link_state = LinkState::Closed;
            self.status().serial_state(LinkState::Closed);
        }
        let ids: Vec<u8> = inner.sessions.keys().copied().collect();
        inner.sessions.clear();
        for id in ids {
            self.status().endpoint_state(id, SessionState::Closed);
        }
    }

    // ---- worker entry points ----

    pub(crate) fn endpoint_rx(&self, epoch: u64, id: u8, bytes: &[u8]) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        let Some(ep) = inner.router.endpoint_mut(id) else {
            return;
        };
        let Some(f) = ep.on_datagram(bytes) else {
            return;
        };
        inner.router.route(Origin::Endpoint(id), &f);
    }

    pub(crate) fn serial_rx(&self, epoch: u64, bytes: &[u8]) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        debug!("serial rx {}", hex_str(bytes));
        if let Some(pt) = &inner.passthrough {
            pt.on_serial_data(bytes);
        }
        let f = match frame::decode_bus(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!("serial: dropping malformed frame: {e:?}");
                return;
            }
        };
        // An address-set heard on the bus re-runs the numbering pass
        // from its target instead of being routed.
        if let Some(target) = f.address_set_target() {
            let Inner {
                router, assigner, ..
            } = &mut *inner;
            assigner.run(router, target);
            return;
        }
        inner.router.route(Origin::Serial, &f);
    }

    pub(crate) fn endpoint_failed(&self, epoch: u64, id: u8) {
        self.report_session(epoch, id, SessionState::Failed);
    }

    pub(crate) fn serial_down(&self, epoch: u64, down: LinkDown) {
        let state = match down {
            LinkDown::Closed => LinkState::Closed,
            LinkDown::Faulted => LinkState::Faulted,
        };
        self.report_link(epoch, state);
    }

    // ---- host-facing surface ----

    /// Route a frame as if it originated locally, e.g. a host-initiated
    /// command toward one peripheral or the whole bus.
    pub fn send(&self, frame: &Frame) {
        let mut inner = self.lock();
        inner.router.route(Origin::Local, frame);
    }

    /// Bus bytes of the most recent frame sent to the given device.
    pub fn last_sent(&self, id: u8) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        inner
            .router
            .endpoint_mut(id)
            .and_then(|ep| ep.last_sent().map(<[u8]>::to_vec))
    }

    pub fn serial_state(&self) -> LinkState {
        self.lock().link_state
    }

    pub fn endpoint_state(&self, id: u8) -> Option<SessionState> {
        self.lock().sessions.get(&id).copied()
    }

    /// Ids of the currently configured endpoints, ascending.
    pub fn endpoint_ids(&self) -> Vec<u8> {
        self.lock().router.endpoint_ids().collect()
    }

    // Status reports go out after the lock is released; sinks may do
    // their own locking.

    fn report_link(&self, epoch: u64, state: LinkState) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.link_state = state;
            if let Some(serial) = inner.router.serial_mut() {
                serial.set_state(state);
            }
        }
        self.status().serial_state(state);
    }

    fn report_session(&self, epoch: u64, id: u8, state: SessionState) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.sessions.insert(id, state);
        }
        self.status().endpoint_state(id, state);
    }
}

async fn open_session(dev: &DeviceConfig) -> std::io::Result<UdpSocket> {
    let bind_addr = match dev.host {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let skt = UdpSocket::bind(bind_addr).await?;
    skt.connect((dev.host, dev.port)).await?;
    Ok(skt)
}
