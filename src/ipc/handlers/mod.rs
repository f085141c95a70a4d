pub mod catalog;
pub mod core;
pub mod reports;
pub mod roster;
