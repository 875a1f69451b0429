pub mod catalog;
pub mod composer;
pub mod fsrs;
pub mod progress;
