//! Progressive streaming.
//!
//! - [`ProgressiveLoader`] fetches a container in windows, feeds a demuxer
//!   and publishes [`StreamEvent`]s per stream.
//! - [`RangeInterceptor`] holds ranged HTTP reads until someone delivers
//!   the data, coalescing concurrent reads of one resource.
//! - [`RangeBroker`] delivers that data from a [`RangeSource`].
//!
//! # Routes
//!
//! - `GET {stream_prefix}{key}` - ranged read, answered with 206
//! - `GET {profiles_prefix}{key}` - cached resource, held until completed
//! - `GET /health` - liveness
//! - anything else - forwarded to the configured upstream

mod broker;
mod intercept;
mod loader;
mod session;
mod source;

pub use broker::{Locator, RangeBroker};
pub use intercept::{
    router, CachedRange, HttpPassThrough, PassThrough, RangeCompleted, RangeInterceptor,
    RangeNeeded,
};
pub use loader::{DemuxerFactory, ProgressiveLoader, StreamEvent};
pub use session::{StreamRegistry, StreamSession};
pub use source::{FetchOptions, FileRangeSource, HttpRangeSource, RangeSource};
