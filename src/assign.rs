//! Sequential bus-address assignment.
//!
//! Peripherals come up with whatever id they last held; one address-set
//! pass renumbers every network-attached device onto consecutive ids and
//! then hands the next id to the bus, so purely-serial peripherals
//! continue the numbering. The pass is deterministic and re-running it
//! reissues identical commands.

use log::{debug, info};

use crate::config::MIN_DEVICE_ID;
use crate::frame::Frame;
use crate::router::{FrameSink, Router};

pub struct AddressAssigner {
    /// The initial pass fires at most once per configuration epoch.
    armed: bool,
}

impl AddressAssigner {
    pub const fn new() -> Self {
        Self { armed: true }
    }

    /// Arm the initial pass again; called on every reconfiguration.
    pub fn rearm(&mut self) {
        self.armed = true;
    }

    /// A network session came up. The first such report per epoch runs
    /// the full pass; later ones are no-ops.
    pub fn on_session_ready<E: FrameSink, L: FrameSink>(&mut self, router: &mut Router<E, L>) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.run(router, MIN_DEVICE_ID);
    }

    /// Renumber every endpoint with `id >= start` in ascending order,
    /// then send the next id onto the bus. Bus-initiated runs (an
    /// address-set heard on the serial link) land here directly.
    pub fn run<E: FrameSink, L: FrameSink>(&mut self, router: &mut Router<E, L>, start: u8) {
        info!("address pass from {start}");
        let mut next = start;
        for (id, ep) in router.endpoints_mut() {
            if id < start {
                continue;
            }
            if let Err(e) = ep.send_frame(&Frame::address_set(id)) {
                debug!("endpoint {id}: address-set dropped: {e:?}");
            }
            next = id + 1;
        }
        if let Some(link) = router.serial_mut() {
            if let Err(e) = link.send_frame(&Frame::address_set(next)) {
                debug!("serial: address-set dropped: {e:?}");
            }
        }
    }
}

impl Default for AddressAssigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::encode_bus;
    use crate::router::SendError;

    #[derive(Default)]
    struct Record {
        sent: Vec<Vec<u8>>,
    }

    impl FrameSink for Record {
        fn send_frame(&mut self, frame: &Frame) -> Result<(), SendError> {
            self.sent.push(encode_bus(frame).unwrap());
            Ok(())
        }
    }

    fn router_with(ids: &[u8]) -> Router<Record, Record> {
        let mut router = Router::new();
        for &id in ids {
            router.insert_endpoint(id, Record::default());
        }
        router.set_serial(Record::default());
        router
    }

    #[test]
    fn full_pass_numbers_endpoints_then_the_bus() {
        let mut router = router_with(&[1, 2, 3]);
        let mut assigner = AddressAssigner::new();
        assigner.run(&mut router, 1);

        for id in [1u8, 2, 3] {
            let sent = &router.endpoint_mut(id).unwrap().sent;
            assert_eq!(sent.as_slice(), &[vec![0x88, 0x30, id, 0xFF]]);
        }
        assert_eq!(
            router.serial_mut().unwrap().sent.as_slice(),
            &[vec![0x88, 0x30, 0x04, 0xFF]]
        );
    }

    #[test]
    fn start_offset_skips_lower_ids() {
        let mut router = router_with(&[1, 2, 3]);
        let mut assigner = AddressAssigner::new();
        assigner.run(&mut router, 3);

        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
        assert!(router.endpoint_mut(2).unwrap().sent.is_empty());
        assert_eq!(
            router.endpoint_mut(3).unwrap().sent.as_slice(),
            &[vec![0x88, 0x30, 0x03, 0xFF]]
        );
        assert_eq!(
            router.serial_mut().unwrap().sent.as_slice(),
            &[vec![0x88, 0x30, 0x04, 0xFF]]
        );
    }

    #[test]
    fn start_past_every_endpoint_still_reaches_the_bus() {
        let mut router = router_with(&[1, 2]);
        let mut assigner = AddressAssigner::new();
        assigner.run(&mut router, 6);

        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
        assert_eq!(
            router.serial_mut().unwrap().sent.as_slice(),
            &[vec![0x88, 0x30, 0x06, 0xFF]]
        );
    }

    #[test]
    fn session_ready_fires_once_per_epoch() {
        let mut router = router_with(&[1, 2]);
        let mut assigner = AddressAssigner::new();

        assigner.on_session_ready(&mut router);
        assigner.on_session_ready(&mut router);
        assert_eq!(router.endpoint_mut(1).unwrap().sent.len(), 1);
        assert_eq!(router.endpoint_mut(2).unwrap().sent.len(), 1);

        // A new epoch arms the pass again.
        assigner.rearm();
        assigner.on_session_ready(&mut router);
        assert_eq!(router.endpoint_mut(1).unwrap().sent.len(), 2);
    }
}
