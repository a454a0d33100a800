//! Run-everything batch
//!
//! Collects all info in one go: better than having eight different
//! cronjobs. One failing extractor must never keep the others from
//! writing their facts.

use tracing::{error, info};

use crate::extractors::{
    ApacheExtractor, CheckoutsExtractor, DockerExtractor, Extractor, HaproxyExtractor,
    NginxExtractor, PbisExtractor, PostgresExtractor, RabbitmqExtractor,
};
use crate::fs::FileSystem;

/// Every extractor in batch order.
///
/// geoserver is not part of the batch: it reads potentially huge rotated
/// access log collections and runs on demand instead.
pub fn registry() -> Vec<Box<dyn Extractor>> {
    vec![
        Box::new(ApacheExtractor::default()),
        Box::new(CheckoutsExtractor::default()),
        Box::new(PostgresExtractor::default()),
        Box::new(DockerExtractor::default()),
        Box::new(HaproxyExtractor::default()),
        Box::new(NginxExtractor::default()),
        Box::new(PbisExtractor::default()),
        Box::new(RabbitmqExtractor::default()),
    ]
}

/// Run all extractors sequentially; log failures and continue.
///
/// Returns the number of extractors that failed.
pub fn run_all(fs: &dyn FileSystem) -> usize {
    let mut num_failures = 0;
    for extractor in registry() {
        info!("Running {} extractor", extractor.name());
        if let Err(err) = extractor.run(fs) {
            num_failures += 1;
            error!("Extractor {} failed: {:#}", extractor.name(), err);
        }
    }
    num_failures
}
