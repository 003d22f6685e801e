//! Table I/O, immutable page storage and throttled HTTP fetching for courselink.

pub mod artifacts;
pub mod http;
pub mod tables;

pub use artifacts::{sha256_hex, ArtifactStore, StoredPage};
pub use http::{BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "courselink-storage";
