//! Wire layer for host-worker communication.
//!
//! `codec` frames messages (length prefix + JSON), `protocol` defines the
//! single envelope type exchanged over a worker's rendezvous connection.

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::Message;
