//! Binary serializer for object records and values.
//!
//! Everything is built from one primitive: a self-terminating variable-length
//! integer ([`varint`]). Strings, buffers and collections are length- or
//! count-prefixed so a reader can step over a value without materializing it.
//!
//! - **varint**: integers, strings, raw byte runs
//! - **value**: the dynamic [`Value`](crate::value::Value) type
//! - **object**: whole [`ObjectRecord`](crate::object::ObjectRecord)s

pub mod object;
pub mod value;
pub mod varint;

pub use object::{decode_object, encode_object, object_size, OBJECT_MAGIC, TOMBSTONE};
pub use value::{decode_value, encode_value, skip_value, value_size};
