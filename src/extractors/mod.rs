// One extractor per external system. Each gathers raw text from config
// files, command output or the filesystem, parses it, and writes a fact
// file plus optional monitoring scalars.

pub mod apache;
pub mod checkouts;
pub mod docker;
pub mod geoserver;
pub mod haproxy;
pub mod nginx;
pub mod parsers;
pub mod pbis;
pub mod postgres;
pub mod rabbitmq;

use crate::fs::FileSystem;
use anyhow::Result;

/// A single information-gathering step
pub trait Extractor {
    /// Short name used for logging and CLI dispatch
    fn name(&self) -> &'static str;

    /// Gather, parse and write this extractor's facts.
    ///
    /// Missing inputs (no config dir, binary not installed) are not errors:
    /// the extractor logs and returns Ok. An Err means the extractor itself
    /// failed (unreadable config file, output dir not writable).
    fn run(&self, fs: &dyn FileSystem) -> Result<()>;
}

pub use apache::ApacheExtractor;
pub use checkouts::CheckoutsExtractor;
pub use docker::DockerExtractor;
pub use geoserver::GeoserverExtractor;
pub use haproxy::HaproxyExtractor;
pub use nginx::NginxExtractor;
pub use pbis::PbisExtractor;
pub use postgres::PostgresExtractor;
pub use rabbitmq::RabbitmqExtractor;
