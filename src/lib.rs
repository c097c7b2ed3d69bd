//! Lead Router — lead assignment, claim-window enforcement, and nurture campaigns.

pub mod campaigns;
pub mod config;
pub mod error;
pub mod leads;
pub mod notify;
pub mod routes;
pub mod routing;
pub mod schedule;
pub mod store;
