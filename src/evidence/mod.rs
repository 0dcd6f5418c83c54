pub mod aggregator;
pub mod backends;
pub mod types;

pub use aggregator::EvidenceAggregator;
pub use backends::EvidenceBackend;
pub use types::{EvidenceItem, EvidenceOutcome, EvidenceRequest, EvidenceResult};
