//! serverfacts - information-gathering scripts for Linux servers
//!
//! A suite of extractors that turn local configuration files, command
//! output and version-control checkouts into facts for an inventory
//! system and scalars for a monitoring agent.
//!
//! # Core Concepts
//!
//! - **Extractor**: one independent information-gathering step per
//!   external system (nginx, apache, haproxy, postgres, docker,
//!   rabbitmq, /srv checkouts, pbis, geoserver)
//! - **Fact file**: a JSON document per extractor with sorted keys and
//!   stable indentation, written atomically to a fixed path
//! - **Scalar file**: a single numeric/boolean value per file for the
//!   monitoring agent
//!
//! # Project Structure
//!
//! - [`extractors`]: the extractors and their text parsers
//! - [`sites`]: the shared site record model of the web config parsers
//! - [`facts`]: fact and scalar file output
//! - [`runner`]: the sequential run-everything batch
//! - [`fs`]: filesystem abstraction so parsers are testable

pub mod cli;
pub mod extractors;
pub mod facts;
pub mod fs;
pub mod runner;
pub mod sites;
pub mod util;

pub use extractors::Extractor;
pub use sites::{Protocol, SiteRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
