//! ringmesh wire protocol: tagged binary messages over framed TCP.
//!
//! Every message on a connection is a 4-byte big-endian length followed by
//! that many payload bytes. The payload starts with a one-byte tag naming one
//! of the eleven message kinds; the remaining bytes follow that kind's fixed
//! field schema.
//!
//! ## Architecture
//!
//! - **schema**: field codecs and the `wire_structs!` declaration macro
//! - **message**: the message catalogue and tag dispatch
//! - **frame**: length-prefixed framing over any async byte stream
//! - **connection**: `Connection`, `Listener` and the `EventHandler` seam

pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod schema;

pub use connection::{Connection, EventHandler, Listener};
pub use error::WireError;
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use message::{
    DataPacket, Deregister, FingerEntry, Manifest, Message, Register, Status, TaskFinished,
    TaskInitiate, TrafficSummary, TrafficSummaryRequest,
};
