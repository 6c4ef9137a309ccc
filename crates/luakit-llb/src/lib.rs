//! luakit LLB core
//!
//! Graph model, operation library and serializer for compiling build
//! scripts into BuildKit LLB definitions.

pub mod error;
pub mod exec;
pub mod file;
pub mod graph;
pub mod oci;
pub mod ops;
pub mod pb;
pub mod reference;
pub mod render;
pub mod serialize;
pub mod source;
pub mod telemetry;
pub mod writer;

pub use error::{BoxError, SerializeError, SerializeResult, ValidationError, ValidationResult};
pub use exec::{merge_env, run, CacheSharing, MountSpec, NetworkMode, RunOptions, SecurityMode};
pub use file::{
    copy, mkdir, mkfile, rm, symlink, ChownOpt, CopyOptions, FileActions, MkdirOptions,
    MkfileOptions, RmOptions, UserOpt,
};
pub use graph::{default_cache, digest_bytes, Edge, MarshalCache, NodeMeta, OpNode, Origin, State};
pub use oci::{ConfigResolver, ImageConfig, ImageSettings, Platform};
pub use ops::{diff, merge};
pub use render::{collect_records, render_dot, render_json, NodeRecord};
pub use serialize::{finalize_digests, serialize, SerializeOptions, DESCRIPTION_KEY, EXPORTER_CONFIG_KEY};
pub use source::{
    git, http, image, local, scratch, GitOptions, HttpOptions, ImageOptions, LocalOptions,
};
pub use telemetry::init_tracing;
pub use writer::{encode_definition, write_definition};

/// luakit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
