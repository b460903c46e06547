//! Field codecs and the declarative message schema.
//!
//! Each message kind is declared once with [`wire_structs!`], listing its
//! fields in wire order together with the codec that lays each field out.
//! The macro derives both directions from that single list, so the encoder
//! and decoder of a kind can never disagree about its layout.
//!
//! | codec   | Rust type  | layout                                        |
//! |---------|------------|-----------------------------------------------|
//! | `int32` | `i32`      | 4 bytes, big-endian                           |
//! | `int64` | `i64`      | 8 bytes, big-endian                           |
//! | `blob`  | `Vec<u8>`  | 1-byte length, then the bytes                 |
//! | `text`  | `String`   | 1-byte length, then UTF-8 bytes               |
//! | `list8` | `Vec<T>`   | 1-byte element count, then each element       |
//! | `trace` | `Vec<i32>` | `int32` byte length, then `int32` per element |

use crate::error::WireError;
use bytes::{Buf, BufMut, BytesMut};

/// A type with a fixed field layout on the wire.
pub trait Schema: Sized {
    fn put(&self, buf: &mut BytesMut) -> Result<(), WireError>;
    fn get(buf: &mut &[u8]) -> Result<Self, WireError>;
}

impl Schema for i32 {
    fn put(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        int32::put(self, buf, "element")
    }

    fn get(buf: &mut &[u8]) -> Result<Self, WireError> {
        int32::get(buf, "element")
    }
}

fn ensure(buf: &[u8], needed: usize, field: &'static str) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::InsufficientData {
            field,
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn short_len(len: usize, field: &'static str) -> Result<u8, WireError> {
    u8::try_from(len).map_err(|_| WireError::FieldTooLong {
        field,
        len,
        max: u8::MAX as usize,
    })
}

pub mod int32 {
    use super::*;

    pub fn put(v: &i32, buf: &mut BytesMut, _field: &'static str) -> Result<(), WireError> {
        buf.put_i32(*v);
        Ok(())
    }

    pub fn get(buf: &mut &[u8], field: &'static str) -> Result<i32, WireError> {
        ensure(buf, 4, field)?;
        Ok(buf.get_i32())
    }
}

pub mod int64 {
    use super::*;

    pub fn put(v: &i64, buf: &mut BytesMut, _field: &'static str) -> Result<(), WireError> {
        buf.put_i64(*v);
        Ok(())
    }

    pub fn get(buf: &mut &[u8], field: &'static str) -> Result<i64, WireError> {
        ensure(buf, 8, field)?;
        Ok(buf.get_i64())
    }
}

pub mod blob {
    use super::*;

    pub fn put(v: &[u8], buf: &mut BytesMut, field: &'static str) -> Result<(), WireError> {
        buf.put_u8(short_len(v.len(), field)?);
        buf.put_slice(v);
        Ok(())
    }

    pub fn get(buf: &mut &[u8], field: &'static str) -> Result<Vec<u8>, WireError> {
        ensure(buf, 1, field)?;
        let len = buf.get_u8() as usize;
        ensure(buf, len, field)?;
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }
}

pub mod text {
    use super::*;

    pub fn put(v: &str, buf: &mut BytesMut, field: &'static str) -> Result<(), WireError> {
        blob::put(v.as_bytes(), buf, field)
    }

    pub fn get(buf: &mut &[u8], field: &'static str) -> Result<String, WireError> {
        String::from_utf8(blob::get(buf, field)?).map_err(|e| WireError::Malformed {
            field,
            reason: e.to_string(),
        })
    }
}

pub mod list8 {
    use super::*;

    pub fn put<T: Schema>(v: &[T], buf: &mut BytesMut, field: &'static str) -> Result<(), WireError> {
        buf.put_u8(short_len(v.len(), field)?);
        for item in v {
            item.put(buf)?;
        }
        Ok(())
    }

    pub fn get<T: Schema>(buf: &mut &[u8], field: &'static str) -> Result<Vec<T>, WireError> {
        ensure(buf, 1, field)?;
        let count = buf.get_u8() as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::get(buf)?);
        }
        Ok(items)
    }
}

pub mod trace {
    use super::*;

    pub fn put(v: &[i32], buf: &mut BytesMut, field: &'static str) -> Result<(), WireError> {
        let byte_len = v
            .len()
            .checked_mul(4)
            .and_then(|n| i32::try_from(n).ok())
            .ok_or(WireError::FieldTooLong {
                field,
                len: v.len(),
                max: (i32::MAX / 4) as usize,
            })?;
        buf.put_i32(byte_len);
        for hop in v {
            buf.put_i32(*hop);
        }
        Ok(())
    }

    pub fn get(buf: &mut &[u8], field: &'static str) -> Result<Vec<i32>, WireError> {
        ensure(buf, 4, field)?;
        let byte_len = buf.get_i32();
        if byte_len < 0 || byte_len % 4 != 0 {
            return Err(WireError::Malformed {
                field,
                reason: format!("byte length {byte_len} is not a non-negative multiple of 4"),
            });
        }
        let byte_len = byte_len as usize;
        ensure(buf, byte_len, field)?;
        Ok((0..byte_len / 4).map(|_| buf.get_i32()).collect())
    }
}

/// Declare message structs together with their wire layout.
///
/// ```ignore
/// wire_structs! {
///     /// A node asks to join.
///     pub struct Register {
///         pub ip: Vec<u8> => blob,
///         pub port: i32 => int32,
///     }
/// }
/// ```
///
/// Fields are encoded in declaration order by the named codec module.
macro_rules! wire_structs {
    ($(
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                pub $field:ident : $fty:ty => $codec:ident
            ),* $(,)?
        }
    )*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $fty,
            )*
        }

        impl $crate::schema::Schema for $name {
            #[allow(unused_variables)]
            fn put(&self, buf: &mut ::bytes::BytesMut) -> Result<(), $crate::error::WireError> {
                $( $crate::schema::$codec::put(&self.$field, buf, stringify!($field))?; )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn get(buf: &mut &[u8]) -> Result<Self, $crate::error::WireError> {
                Ok(Self {
                    $( $field: $crate::schema::$codec::get(buf, stringify!($field))?, )*
                })
            }
        }
    )*};
}

pub(crate) use wire_structs;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_is_big_endian() {
        let mut buf = BytesMut::new();
        int32::put(&0x0102_0304, &mut buf, "x").unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_text_rejects_long_strings() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        let err = text::put(&long, &mut buf, "message").unwrap_err();
        assert!(matches!(
            err,
            WireError::FieldTooLong {
                field: "message",
                len: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_text_max_length_fits() {
        let s = "y".repeat(255);
        let mut buf = BytesMut::new();
        text::put(&s, &mut buf, "message").unwrap();
        assert_eq!(buf[0], 255);
        let mut rd = &buf[..];
        assert_eq!(text::get(&mut rd, "message").unwrap(), s);
        assert!(rd.is_empty());
    }

    #[test]
    fn test_blob_truncated() {
        let bytes = [4u8, 127, 0];
        let mut rd = &bytes[..];
        let err = blob::get(&mut rd, "ip").unwrap_err();
        assert!(matches!(
            err,
            WireError::InsufficientData {
                field: "ip",
                needed: 4,
                have: 2
            }
        ));
    }

    #[test]
    fn test_trace_uses_byte_length() {
        let mut buf = BytesMut::new();
        trace::put(&[7, 15], &mut buf, "trace").unwrap();
        assert_eq!(&buf[..4], &8i32.to_be_bytes());
        let mut rd = &buf[..];
        assert_eq!(trace::get(&mut rd, "trace").unwrap(), vec![7, 15]);
    }

    #[test]
    fn test_trace_rejects_ragged_length() {
        let mut bytes = 6i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 6]);
        let mut rd = &bytes[..];
        assert!(matches!(
            trace::get(&mut rd, "trace"),
            Err(WireError::Malformed { field: "trace", .. })
        ));
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let bytes = [2u8, 0xff, 0xfe];
        let mut rd = &bytes[..];
        assert!(matches!(
            text::get(&mut rd, "message"),
            Err(WireError::Malformed { .. })
        ));
    }
}
