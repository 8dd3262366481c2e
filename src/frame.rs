//! Wire formats for the camera-control protocol.
//!
//! The same frames travel in two encodings. On the serial bus a single
//! header byte carries sender and receiver as nibbles, followed by the
//! message bytes up to and including the `0xFF` terminator. On the network
//! the full bus bytes are wrapped in an 8-byte header of kind tag, payload
//! length and sequence number. Everything here is pure encode/decode; the
//! transports own all state.

/// Receiver address meaning "all peripherals and the bus".
pub const BROADCAST: u8 = 8;

/// One-byte control payload asking the peer to restart its sequence
/// tracking at zero.
pub const RESET_SEQUENCE: [u8; 1] = [0x01];

/// Broadcast payload clearing peripheral command buffers. A reflected copy
/// must never re-enter the transport it was sent on.
pub const INTERFACE_CLEAR: [u8; 4] = [0x01, 0x00, 0x01, 0xFF];

/// Address-set template as it appears on the bus; byte 2 carries the id
/// being assigned.
pub const ADDRESS_SET: [u8; 4] = [0x88, 0x30, 0x00, 0xFF];

/// Payload of the network-change broadcast a bus relay announces itself
/// with; the header byte carries the relay's own id.
pub const NETWORK_CHANGE: [u8; 2] = [0x38, 0xFF];

/// Two-byte kind tag of the network wire format.
///
/// Unknown tags are carried losslessly; peers are free to extend the set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameKind(pub [u8; 2]);

impl FrameKind {
    pub const COMMAND: Self = FrameKind([0x01, 0x00]);
    pub const CONTROL: Self = FrameKind([0x02, 0x00]);
    pub const INQUIRY: Self = FrameKind([0x01, 0x10]);
    pub const REPLY: Self = FrameKind([0x01, 0x11]);
    pub const CONTROL_REPLY: Self = FrameKind([0x02, 0x01]);
    pub const DEVICE_SETTING: Self = FrameKind([0x01, 0x20]);
}

/// One decoded message in the bus addressing model.
///
/// `kind` is only meaningful on the network wire format; frames decoded
/// from the bus carry `None` and pick up a tag when re-encoded for a
/// framed network session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub sender: u8,
    pub receiver: u8,
    pub kind: Option<FrameKind>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// The address-set command assigning `id`, ready for routing.
    pub fn address_set(id: u8) -> Self {
        let mut bytes = ADDRESS_SET;
        bytes[2] = id;
        Frame {
            sender: 0,
            receiver: BROADCAST,
            kind: Some(FrameKind::DEVICE_SETTING),
            payload: bytes[1..].to_vec(),
        }
    }

    /// If this frame is an address-set broadcast, the id it assigns.
    pub fn address_set_target(&self) -> Option<u8> {
        if self.sender != 0 || self.receiver != BROADCAST {
            return None;
        }
        match self.payload.as_slice() {
            [a, id, b] if *a == ADDRESS_SET[1] && *b == ADDRESS_SET[3] => Some(*id),
            _ => None,
        }
    }

    /// Whether this is the interface-clear command addressed to the whole
    /// bus. Content comparison, byte for byte.
    pub fn is_interface_clear_broadcast(&self) -> bool {
        self.receiver == BROADCAST && self.payload == INTERFACE_CLEAR
    }
}

/// One decoded network datagram. The sequence number is informational on
/// receive; senders allocate it from their own counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub kind: FrameKind,
    pub seq: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Empty input where at least a header byte is required.
    Empty,
    /// Bus header byte without its marker bit.
    BadHeader(u8),
    /// Input shorter than the fixed network header.
    Truncated(usize),
    /// Length field disagrees with the actual payload length.
    LengthMismatch { claimed: u16, actual: usize },
    /// Sender or receiver outside the encodable range.
    BadAddress(u8),
    /// Payload does not fit the 16-bit length field.
    Oversize(usize),
}

/// Decode a complete bus message: header nibbles, then payload.
///
/// `sender = (header >> 4) - 8`, `receiver = header & 0x0F`. A header
/// without the `0x80` marker bit cannot have come from a conforming
/// sender and is rejected rather than mis-decoded.
pub fn decode_bus(bytes: &[u8]) -> Result<Frame, FrameError> {
    let Some((&header, payload)) = bytes.split_first() else {
        return Err(FrameError::Empty);
    };
    if header & 0x80 == 0 {
        return Err(FrameError::BadHeader(header));
    }
    Ok(Frame {
        sender: (header >> 4) - 8,
        receiver: header & 0x0F,
        kind: None,
        payload: payload.to_vec(),
    })
}

/// Encode a frame for the bus: `0x80 | sender << 4 | receiver`, payload.
pub fn encode_bus(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    if frame.sender > BROADCAST {
        return Err(FrameError::BadAddress(frame.sender));
    }
    if frame.receiver > BROADCAST {
        return Err(FrameError::BadAddress(frame.receiver));
    }
    let mut out = Vec::with_capacity(1 + frame.payload.len());
    out.push(0x80 | (frame.sender << 4) | frame.receiver);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Decode one network datagram: `[kind:2][len:2 BE][seq:4 BE][payload]`.
pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, FrameError> {
    if bytes.len() < 8 {
        return Err(FrameError::Truncated(bytes.len()));
    }
    let claimed = u16::from_be_bytes([bytes[2], bytes[3]]);
    let actual = bytes.len() - 8;
    if claimed as usize != actual {
        return Err(FrameError::LengthMismatch { claimed, actual });
    }
    Ok(Datagram {
        kind: FrameKind([bytes[0], bytes[1]]),
        seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        payload: bytes[8..].to_vec(),
    })
}

/// Encode one network datagram around already-encoded bus bytes.
pub fn encode_datagram(kind: FrameKind, seq: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::Oversize(payload.len()))?;
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&kind.0);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}
