//! Bencode encoding and decoding ([BEP-3]).
//!
//! KRPC messages are bencoded dictionaries, one per UDP datagram. This module
//! is the serializer the DHT codec is built on. Dictionaries are kept in a
//! `BTreeMap`, so encoding always emits keys in the canonical sorted order.
//!
//! # Examples
//!
//! ```
//! use rbit_dht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:ti7e1:y1:qe").unwrap();
//! assert_eq!(value.require_int(b"t").unwrap(), 7);
//! assert_eq!(value.require_str(b"y").unwrap(), "q");
//!
//! assert_eq!(encode(&value), b"d1:ti7e1:y1:qe");
//! ```
//!
//! # Error Handling
//!
//! Structural errors (truncated input, bad integers, trailing bytes, nesting
//! deeper than 64 levels) are reported by [`decode`]. The typed accessors on
//! [`Value`] report [`BencodeError::MissingKey`] and [`BencodeError::WrongType`]
//! so callers can tell an absent optional field from a corrupt message.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
