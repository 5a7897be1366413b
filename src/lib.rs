//! convertd: ephemeral file conversion gateway
//!
//! Every conversion leaves one server-held artifact behind a time-boxed,
//! single-use download link. Sessions live in memory; artifacts are deleted on
//! download, on expiry and on shutdown.

pub mod cli;
pub mod config;
pub mod convert;
pub mod gateway;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod utils;
