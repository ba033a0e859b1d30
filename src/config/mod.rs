//! Configuration: CLI-facing models and the runtime config derived from them.

pub mod models;
pub mod rt;

pub use models::{Browser, ProxyOpts};
pub use rt::RtcProxy;
