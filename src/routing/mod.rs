//! Lead routing — eligibility resolution and the rank-ordered rotator.

pub mod eligibility;
pub mod model;
pub mod rotator;

pub use eligibility::EligibilityResolver;
pub use rotator::{AssignmentRotator, RouteOutcome};
