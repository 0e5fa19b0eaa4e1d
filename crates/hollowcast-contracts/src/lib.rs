pub mod cache;
pub mod control;
pub mod error;
pub mod events;
pub mod facts;
pub mod session;
