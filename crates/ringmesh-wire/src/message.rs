//! Wire protocol message types.
//!
//! All communication between the registry and messaging nodes uses these
//! eleven message kinds. A payload is the kind's one-byte tag followed by its
//! fields; integers are big-endian and strings and blobs carry a one-byte
//! length. Decoding dispatches purely on the tag byte.

use crate::error::WireError;
use crate::schema::{wire_structs, Schema};
use bytes::{BufMut, Bytes, BytesMut};

wire_structs! {
    /// A node asks to join the overlay.
    pub struct Register {
        /// The node's address as seen by itself (4 or 16 bytes).
        pub ip: Vec<u8> => blob,
        /// Port of the node's peer listener.
        pub port: i32 => int32,
    }

    /// Outcome of a registration, deregistration or overlay setup.
    ///
    /// `id` is the subject node's id on success and `-1` on failure.
    pub struct Status {
        pub id: i32 => int32,
        pub message: String => text,
    }

    /// A node asks to leave the overlay.
    pub struct Deregister {
        pub ip: Vec<u8> => blob,
        /// Local port of the node's registry connection.
        pub port: i32 => int32,
        pub id: i32 => int32,
    }

    /// One routing-table entry inside a manifest.
    pub struct FingerEntry {
        pub id: i32 => int32,
        pub ip: Vec<u8> => blob,
        /// Peer listener port of the finger.
        pub port: i32 => int32,
    }

    /// The registry pushes a node its fingers and the full membership.
    pub struct Manifest {
        /// Finger `i` is the member `2^i` positions ahead on the ring.
        pub fingers: Vec<FingerEntry> => list8,
        /// Every member id of the overlay.
        pub members: Vec<i32> => list8,
    }

    /// The registry starts a task round.
    pub struct TaskInitiate {
        pub message_count: i32 => int32,
    }

    /// A traffic packet routed through the overlay.
    pub struct DataPacket {
        pub dest: i32 => int32,
        pub src: i32 => int32,
        pub payload: i32 => int32,
        /// Every node the packet visited, for diagnostics only.
        pub trace: Vec<i32> => trace,
    }

    /// A node finished sending its packets for the round.
    pub struct TaskFinished {
        pub ip: Vec<u8> => blob,
        pub port: i32 => int32,
        pub id: i32 => int32,
    }

    /// The registry asks every node for its counters.
    pub struct TrafficSummaryRequest {}

    /// A node's counters for the round.
    pub struct TrafficSummary {
        pub id: i32 => int32,
        pub sent: i32 => int32,
        pub relayed: i32 => int32,
        pub sum_sent: i64 => int64,
        pub received: i32 => int32,
        pub sum_received: i64 => int64,
    }
}

macro_rules! message_catalogue {
    ($( $tag:literal => $variant:ident($ty:ty), )*) => {
        /// Tag bytes of every message kind.
        pub mod tag {
            $( #[allow(non_upper_case_globals)] pub const $variant: u8 = $tag; )*
        }

        /// A decoded or to-be-sent protocol message.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $( $variant($ty), )*
        }

        impl Message {
            /// The one-byte tag that leads this message's payload.
            pub fn tag(&self) -> u8 {
                match self {
                    $( Message::$variant(_) => $tag, )*
                }
            }

            /// Human-readable kind name, for logs.
            pub fn kind(&self) -> &'static str {
                match self {
                    $( Message::$variant(_) => stringify!($variant), )*
                }
            }

            fn put_body(&self, buf: &mut BytesMut) -> Result<(), WireError> {
                match self {
                    $( Message::$variant(m) => m.put(buf), )*
                }
            }

            fn get_body(tag: u8, buf: &mut &[u8]) -> Result<Self, WireError> {
                match tag {
                    $( $tag => Ok(Message::$variant(<$ty>::get(buf)?)), )*
                    other => Err(WireError::UnknownTag(other)),
                }
            }
        }
    };
}

message_catalogue! {
    2 => Register(Register),
    3 => RegisterStatus(Status),
    4 => Deregister(Deregister),
    5 => DeregisterStatus(Status),
    6 => Manifest(Manifest),
    7 => SetupStatus(Status),
    8 => TaskInitiate(TaskInitiate),
    9 => DataPacket(DataPacket),
    10 => TaskFinished(TaskFinished),
    11 => TrafficSummaryRequest(TrafficSummaryRequest),
    12 => TrafficSummary(TrafficSummary),
}

impl Message {
    /// Encode into a payload (tag + fields, without the length prefix).
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.tag());
        self.put_body(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a payload produced by [`Message::encode`].
    ///
    /// The whole payload must be consumed; leftover bytes mean the sender
    /// and receiver disagree about the layout.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (&tag, mut rest) = payload.split_first().ok_or(WireError::EmptyFrame)?;
        let msg = Self::get_body(tag, &mut rest)?;
        if !rest.is_empty() {
            return Err(WireError::TrailingBytes {
                kind: msg.kind(),
                extra: rest.len(),
            });
        }
        Ok(msg)
    }
}

impl Status {
    pub fn success(id: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            id: -1,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.id >= 0
    }
}
