pub mod coordinate;
pub mod drone;
pub mod order;
pub mod reference;
pub mod restaurant;
pub mod session;
