pub mod actions;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod pipeline;
pub mod recurrence;
pub mod report;
pub mod roster;
pub mod search;
