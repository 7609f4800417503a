//! Implementation agnostic traits and types, plus re-exports of 3rd party
//! types used in the public interface.

pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod elector;
pub mod identity;
pub mod listener;
