pub mod estimate;
pub mod eta;
pub mod phase;
pub mod reconciler;
pub mod session;
pub mod simulator;
pub mod trail;
