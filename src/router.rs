//! Fan-out of decoded frames to their destination transports.
//!
//! The router holds no protocol state: just the current endpoint set
//! keyed by bus id, and the serial link if one is configured. It is
//! rebuilt from scratch whenever configuration changes.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::frame::{BROADCAST, Frame, FrameError};

/// Where a frame entered the bridge. Broadcast delivery skips the
/// origin so a reflected frame cannot echo onto the transport it
/// arrived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Serial,
    Endpoint(u8),
    /// Host-initiated traffic, e.g. a command injected by the plugin.
    Local,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The transport is not in a state that accepts writes.
    Inactive,
    /// The outbound queue is full; the frame is dropped.
    Full,
    Encode(FrameError),
}

/// Anything a routed frame can be written to.
pub trait FrameSink {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), SendError>;
}

pub struct Router<E, L> {
    endpoints: BTreeMap<u8, E>,
    serial: Option<L>,
}

impl<E: FrameSink, L: FrameSink> Router<E, L> {
    pub fn new() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            serial: None,
        }
    }

    pub fn insert_endpoint(&mut self, id: u8, endpoint: E) {
        self.endpoints.insert(id, endpoint);
    }

    pub fn set_serial(&mut self, link: L) {
        self.serial = Some(link);
    }

    pub fn endpoint_mut(&mut self, id: u8) -> Option<&mut E> {
        self.endpoints.get_mut(&id)
    }

    /// Endpoints in ascending id order.
    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = (u8, &mut E)> {
        self.endpoints.iter_mut().map(|(id, ep)| (*id, ep))
    }

    pub fn serial_mut(&mut self) -> Option<&mut L> {
        self.serial.as_mut()
    }

    pub fn endpoint_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.endpoints.keys().copied()
    }

    /// Deliver a frame according to its receiver address: one endpoint,
    /// everything (broadcast), or the bus as the default route for ids
    /// with no endpoint — including 0, the controller role, which no
    /// endpoint ever holds.
    ///
    /// Delivery failures are observations, not errors: the bridge keeps
    /// running on a full queue or a closed transport.
    pub fn route(&mut self, origin: Origin, frame: &Frame) {
        if frame.receiver == BROADCAST {
            for (id, ep) in self.endpoints.iter_mut() {
                if origin == Origin::Endpoint(*id) {
                    continue;
                }
                if let Err(e) = ep.send_frame(frame) {
                    debug!("endpoint {id}: broadcast dropped: {e:?}");
                }
            }
            if origin != Origin::Serial {
                if let Some(link) = self.serial.as_mut() {
                    if let Err(e) = link.send_frame(frame) {
                        debug!("serial: broadcast dropped: {e:?}");
                    }
                }
            }
        } else if let Some(ep) = self.endpoints.get_mut(&frame.receiver) {
            if let Err(e) = ep.send_frame(frame) {
                debug!("endpoint {}: send dropped: {e:?}", frame.receiver);
            }
        } else if let Some(link) = self.serial.as_mut() {
            if let Err(e) = link.send_frame(frame) {
                debug!("serial: send dropped: {e:?}");
            }
        } else {
            trace!("no route for receiver {}", frame.receiver);
        }
    }
}

impl<E: FrameSink, L: FrameSink> Default for Router<E, L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Record {
        sent: Vec<Frame>,
    }

    impl FrameSink for Record {
        fn send_frame(&mut self, frame: &Frame) -> Result<(), SendError> {
            self.sent.push(frame.clone());
            Ok(())
        }
    }

    fn frame(receiver: u8) -> Frame {
        Frame {
            sender: 0,
            receiver,
            kind: None,
            payload: vec![0x01, 0xFF],
        }
    }

    fn router_with(ids: &[u8], serial: bool) -> Router<Record, Record> {
        let mut router = Router::new();
        for &id in ids {
            router.insert_endpoint(id, Record::default());
        }
        if serial {
            router.set_serial(Record::default());
        }
        router
    }

    #[test]
    fn broadcast_from_serial_reaches_endpoints_only() {
        let mut router = router_with(&[1, 2, 3], true);
        router.route(Origin::Serial, &frame(BROADCAST));
        for id in [1, 2, 3] {
            assert_eq!(router.endpoint_mut(id).unwrap().sent.len(), 1);
        }
        // Never echoed back onto the bus it came from.
        assert!(router.serial_mut().unwrap().sent.is_empty());
    }

    #[test]
    fn broadcast_from_endpoint_skips_its_origin() {
        let mut router = router_with(&[1, 2], true);
        router.route(Origin::Endpoint(1), &frame(BROADCAST));
        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
        assert_eq!(router.endpoint_mut(2).unwrap().sent.len(), 1);
        assert_eq!(router.serial_mut().unwrap().sent.len(), 1);
    }

    #[test]
    fn broadcast_from_local_reaches_everything() {
        let mut router = router_with(&[1, 2], true);
        router.route(Origin::Local, &frame(BROADCAST));
        assert_eq!(router.endpoint_mut(1).unwrap().sent.len(), 1);
        assert_eq!(router.endpoint_mut(2).unwrap().sent.len(), 1);
        assert_eq!(router.serial_mut().unwrap().sent.len(), 1);
    }

    #[test]
    fn unicast_reaches_only_its_endpoint() {
        let mut router = router_with(&[1, 3], true);
        router.route(Origin::Serial, &frame(3));
        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
        assert_eq!(router.endpoint_mut(3).unwrap().sent.len(), 1);
        assert!(router.serial_mut().unwrap().sent.is_empty());
    }

    #[test]
    fn unmatched_receiver_falls_back_to_serial() {
        let mut router = router_with(&[1], true);
        router.route(Origin::Local, &frame(5));
        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
        assert_eq!(router.serial_mut().unwrap().sent.len(), 1);

        // The controller id is never an endpoint; it takes the bus route
        // too.
        router.route(Origin::Endpoint(1), &frame(0));
        assert_eq!(router.serial_mut().unwrap().sent.len(), 2);
    }

    #[test]
    fn unmatched_receiver_without_serial_is_dropped() {
        let mut router = router_with(&[1], false);
        router.route(Origin::Local, &frame(5));
        assert!(router.endpoint_mut(1).unwrap().sent.is_empty());
    }

    #[test]
    fn failed_delivery_does_not_stop_the_fanout() {
        struct Refuse;
        impl FrameSink for Refuse {
            fn send_frame(&mut self, _frame: &Frame) -> Result<(), SendError> {
                Err(SendError::Full)
            }
        }
        let mut router: Router<Refuse, Refuse> = Router::new();
        router.insert_endpoint(1, Refuse);
        router.insert_endpoint(2, Refuse);
        router.set_serial(Refuse);
        // Must not panic or bail early.
        router.route(Origin::Local, &frame(BROADCAST));
        router.route(Origin::Local, &frame(1));
    }
}
