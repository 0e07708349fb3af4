//! Image Fetcher
//!
//! Downloads remote images over HTTP(S) and hands the bytes to the image
//! cache through its `Transport` trait.

pub mod error;
pub mod fetcher;

pub use error::{FetchError, Result};
pub use fetcher::{HttpTransport, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
