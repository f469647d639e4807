//! Foundation types for the reference data store.
//!
//! This crate provides the identity, key and status types shared by the
//! store engine and by callers that load or query reference data. Every other
//! refdata crate depends on `refdata-types`.
//!
//! # Key Types
//!
//! - [`Uid`] / [`UidRef`] -- 4-byte surrogate key for a map definition (owned / borrowed)
//! - [`UnsignedBytes`] -- codec for unsigned integers packed into 1-8 big-endian bytes
//! - [`RefStreamDefinition`] -- identity of one reference stream load
//! - [`MapDefinition`] -- one lookup map within a reference stream
//! - [`KeyRange`] -- half-open numeric key range `[from, to)`
//! - [`ProcessingInfo`] / [`ProcessingState`] -- per-stream load status
//! - [`RefDataValue`] / [`TypedBytes`] -- lookup values and their serialized form

pub mod definition;
pub mod error;
pub mod processing;
pub mod range;
pub mod uid;
pub mod unsigned_bytes;
pub mod value;

pub use definition::{MapDefinition, RefStreamDefinition};
pub use error::TypeError;
pub use processing::{now_ms, ProcessingInfo, ProcessingState};
pub use range::KeyRange;
pub use uid::{Uid, UidRef, UID_LEN};
pub use unsigned_bytes::UnsignedBytes;
pub use value::{RefDataValue, TypedBytes, STRING_TYPE_ID, STRUCTURED_TYPE_ID};
