//! Nurture campaigns — enrollment management and the step scheduler.

pub mod enrollment;
pub mod model;
pub mod scheduler;

pub use scheduler::{CampaignScheduler, CampaignTickReport, SchedulerConfig};
