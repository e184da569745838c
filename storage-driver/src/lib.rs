//! # Registry storage driver contract
//!
//! The contract every registry storage backend satisfies: how entities map to
//! paths ([`paths`]), how path segments are escaped ([`encode`]), the
//! primitive operations a backend supplies ([`StorageDriver`]), the operations
//! derived from them ([`StorageDriverExt`]) and scans over the entity
//! hierarchy ([`enumerate`]).

mod convenience;
mod driver;
mod encode;
pub mod enumerate;
mod error;
pub mod paths;

pub use convenience::StorageDriverExt;
pub use driver::chunked;
pub use driver::ByteRange;
pub use driver::ByteStream;
pub use driver::Capabilities;
pub use driver::StorageDriver;
pub use driver::CHUNK_SIZE;
pub use encode::{decode, encode};
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
