pub mod types;
pub mod verifier;

pub use types::{Claim, Verdict, VerdictLabel};
pub use verifier::{verdict_from_results, ClaimVerifier};
