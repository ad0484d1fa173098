//! Delta stream wire format and shared vocabulary for imgdelta.
//!
//! This crate defines the schema layer: the JSON header carried at the front
//! of every delta stream (`DeltaMetadata`), the header framing and its
//! incremental parser (`encode_header`, `try_consume`, `HeaderParser`),
//! storage driver kinds (`DriverKind`), and image identity computation
//! (`compute_image_id`).

pub mod driver;
pub mod frame;
pub mod identity;
pub mod metadata;
pub mod types;

pub use driver::DriverKind;
pub use frame::{
    decode_header, encode_header, try_consume, Consumed, HeaderParser, ProtocolError,
    DEFAULT_MAX_HEADER_LEN, HEADER_SEPARATOR,
};
pub use identity::{compute_image_id, ImageIdentity};
pub use metadata::{DeltaMetadata, HeaderMode, DELTA_VERSION};
pub use types::{ImageId, LayerId, ShortId};
