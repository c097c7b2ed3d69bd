//! Leads — lifecycle model, the claim action, and the expiry sweeper.

pub mod audit;
pub mod claim;
pub mod model;
pub mod sweeper;

pub use claim::claim_lead;
pub use model::{Lead, LeadStatus, LeadTransition};
pub use sweeper::{ClaimSweeper, SweepReport};
