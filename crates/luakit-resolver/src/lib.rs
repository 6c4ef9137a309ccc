//! luakit registry resolver
//!
//! Resolves container image references to their platform-specific OCI
//! image configs, with docker-config credential discovery and a
//! per-reference result cache.

pub mod auth;
pub mod client;
pub mod error;
pub mod resolver;

pub use auth::{Credentials, DockerConfig};
pub use client::RegistryClient;
pub use error::{ResolveError, ResolveResult};
pub use resolver::{ResolvedImage, Resolver};

/// luakit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
