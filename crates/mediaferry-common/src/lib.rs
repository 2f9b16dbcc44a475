//! Mediaferry-Common: Shared ids and error types.
//!
//! This crate provides functionality used across the mediaferry workspace:
//!
//! - **Typed IDs**: wrappers for stream ids, sticker ids and resource keys
//! - **Error Handling**: common error type and result alias
//!
//! # Examples
//!
//! ```
//! use mediaferry_common::{ResourceKey, StreamId, Error, Result};
//!
//! let key = ResourceKey::from_path("/stream/doc_42?x=1").unwrap();
//! assert_eq!(key.as_str(), "doc_42");
//!
//! let id = StreamId::from("video-1");
//! assert_eq!(id.to_string(), "video-1");
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("stream"))
//! }
//! assert!(example().is_err());
//! ```

pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::*;
