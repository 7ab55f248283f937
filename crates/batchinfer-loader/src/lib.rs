#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod dataset;
pub mod decode;
pub mod listing;
pub mod location;
#[cfg(feature = "s3")]
pub mod s3;
pub mod store;

pub use dataset::{Dataset, LoaderMetrics};
pub use location::Location;
pub use store::ObjectStore;
