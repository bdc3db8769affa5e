//! Client for the outreach dashboard backend.

pub mod client;
pub mod keys;
pub mod resources;
pub mod types;

pub use client::ApiClient;
pub use keys::ResourceKey;
pub use resources::Resources;
