pub mod ai;
pub mod auth;
pub mod cleanup;
pub mod config;
