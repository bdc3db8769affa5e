pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod event;
pub mod logging;
pub mod query;
