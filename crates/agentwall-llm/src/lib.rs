//! Cost table (C1), provider router (C6), and upstream client (C7).

pub mod client;
pub mod cost;
pub mod provider;
pub mod router;

pub use client::{ClientMetrics, UpstreamClient};
pub use provider::{ProviderTable, ResolvedRoute};
pub use router::Router;
