//! Shared building blocks for the capacity-regulated workers

pub mod median;
pub mod rate;

pub use median::MedianWindow;
pub use rate::RateGovernor;
