//! Cloud SQL Auth Proxy management.
//!
//! Acquires the proxy binary, launches it as a child process and decides
//! when it is ready to carry database traffic.

mod binary;
mod fetch;
mod mock;
mod process;

pub use binary::ProxyBinary;
pub use fetch::{Fetcher, HttpFetcher};
pub use mock::{FailingFetcher, StaticFetcher};
pub use process::{proxy_args, ProxyHandle};
