//! Bridge between a shared serial control bus and per-peripheral network
//! sessions speaking the same camera-control protocol.
//!
//! A daisy-chained control bus addresses up to seven peripherals with a
//! 4-bit id per frame. This crate puts each of those peripherals behind
//! its own datagram session instead: inbound traffic from any transport
//! is decoded into a common frame model, routed by receiver address
//! (unicast, broadcast, or bus fallback), and re-encoded for the wire
//! format of wherever it lands.
//!
//! A session either speaks the framed, sequence-numbered datagram
//! protocol ([`EndpointMode::Framed`]) or carries raw bus-addressed bytes
//! for a remote serial relay ([`EndpointMode::Raw`]). On startup the
//! bridge renumbers every peripheral onto consecutive bus ids, and it
//! filters reflected maintenance broadcasts so they cannot loop back
//! onto the transport they came from.
//!
//! Everything is event driven: transport workers hand bytes to the
//! [`Bridge`], which decodes, routes and re-encodes synchronously.
//! Reconfiguration replaces the entire endpoint set atomically; there is
//! no other mutation path.

pub mod acc;
pub mod assign;
pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod frame;
pub mod link;
pub mod passthrough;
pub mod router;
pub mod seq;
pub mod status;

pub use bridge::Bridge;
pub use config::{
    Config, ConfigError, DeviceConfig, EndpointMode, Parity, PassthroughConfig, SerialConfig,
};
pub use frame::{BROADCAST, Frame, FrameError, FrameKind};
pub use router::{FrameSink, Origin, Router, SendError};
pub use seq::{SeqNo, SequenceCounter};
pub use status::{LinkState, LogStatus, SessionState, StatusSink};
