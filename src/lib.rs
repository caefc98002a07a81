//! mediapress: a long-running daemon that keeps a media library compressed
//! in place. An incremental scanner reconciles the filesystem against a
//! SQLite catalog, and a bounded worker pool re-encodes pending files behind
//! size-reduction and quality gates, inside a configured nightly window and
//! only while the host is lightly loaded.

pub mod press_core;
pub(crate) mod process_ext;
pub(crate) mod sync_ext;

pub use press_core::catalog::Catalog;
pub use press_core::config::Config;
pub use press_core::orchestrator::Daemon;
pub use press_core::pipeline::Pipeline;
pub use press_core::scanner::Scanner;
