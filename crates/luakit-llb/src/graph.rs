//! Build graph model: operation nodes, typed edges and state handles.
//!
//! Nodes own their wire payload (`pb::Op`) and a typed edge list pointing at
//! their input nodes. Input digest strings inside the payload are
//! placeholders until the serializer back-patches them, which is why the
//! memoized digest can be invalidated after construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use prost::Message;
use sha2::{Digest as Sha2Digest, Sha256};

use crate::oci::{ImageConfig, Platform};
use crate::pb;

/// Upper bound on marshal-cache entries. Inserts are refused once full.
const MARSHAL_CACHE_CAPACITY: usize = 4096;

/// Compute the LLB digest of a marshaled operation.
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Where an operation was authored in the build script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// Script path as registered with the source-file table.
    pub file: String,
    /// 1-indexed line of the authoring call.
    pub line: i32,
}

impl Origin {
    pub fn new(file: impl Into<String>, line: i32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Authoring metadata fixed at node construction time.
#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub origin: Origin,
    /// Human-readable progress description (`llb.customname`).
    pub description: Option<String>,
    /// Progress-group id shared by related vertices.
    pub progress_group: Option<String>,
    /// Platform override used when this node's config is resolved.
    pub platform: Option<Platform>,
    /// True when this source node needs its image config fetched before
    /// serialization.
    pub resolve_config: bool,
    /// Cache hint: solve this vertex without consulting the build cache.
    pub ignore_cache: bool,
}

/// A typed input edge: the producing node and which of its outputs is used.
#[derive(Clone, Debug)]
pub struct Edge {
    pub node: Arc<OpNode>,
    pub output: i64,
}

/// A vertex of the build graph.
///
/// The payload is mutable for two post-construction operations only:
/// input-digest back-patching and image-config propagation, both performed
/// by the serializer. Each mutation invalidates the memoized digest.
#[derive(Debug)]
pub struct OpNode {
    op: Mutex<pb::Op>,
    edges: Mutex<Vec<Option<Edge>>>,
    meta: NodeMeta,
    digest: Mutex<Option<String>>,
    image_config: Mutex<Option<Arc<ImageConfig>>>,
}

impl OpNode {
    /// Wrap an operation payload. `op.inputs` should be empty; inputs are
    /// appended by [`OpNode::add_edge`] so the payload and the edge list
    /// stay in lockstep.
    pub fn new(op: pb::Op, meta: NodeMeta) -> Arc<Self> {
        Arc::new(Self {
            op: Mutex::new(op),
            edges: Mutex::new(Vec::new()),
            meta,
            digest: Mutex::new(None),
            image_config: Mutex::new(None),
        })
    }

    /// Append an input edge and its placeholder wire input.
    ///
    /// The placeholder digest is filled in at serialize time from the
    /// target's digest; `output` is recorded immediately.
    pub fn add_edge(self: &Arc<Self>, target: &Arc<OpNode>, output: i64) {
        self.edges.lock().unwrap().push(Some(Edge {
            node: Arc::clone(target),
            output,
        }));
        self.op.lock().unwrap().inputs.push(pb::Input {
            digest: String::new(),
            index: output,
        });
    }

    /// Append a hole in the edge list (tolerated by the walk, skipped at
    /// back-patch time). Validated constructors never produce these.
    pub fn add_nil_edge(self: &Arc<Self>) {
        self.edges.lock().unwrap().push(None);
        self.op.lock().unwrap().inputs.push(pb::Input::default());
    }

    /// Snapshot of the edge list.
    pub fn edges(&self) -> Vec<Option<Edge>> {
        self.edges.lock().unwrap().clone()
    }

    pub fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    /// Kind tag for rendering and capability assignment.
    pub fn kind(&self) -> &'static str {
        match self.op.lock().unwrap().op {
            Some(pb::op::Op::Source(_)) => "source",
            Some(pb::op::Op::Exec(_)) => "exec",
            Some(pb::op::Op::File(_)) => "file",
            Some(pb::op::Op::Merge(_)) => "merge",
            Some(pb::op::Op::Diff(_)) => "diff",
            Some(pb::op::Op::Build(_)) => "build",
            None => "terminal",
        }
    }

    /// Clone of the current payload (inspection only).
    pub fn op_snapshot(&self) -> pb::Op {
        self.op.lock().unwrap().clone()
    }

    /// Mutate the payload in place. Callers are responsible for calling
    /// [`OpNode::invalidate_digest`] afterwards when the bytes changed.
    pub fn with_op_mut<R>(&self, f: impl FnOnce(&mut pb::Op) -> R) -> R {
        f(&mut self.op.lock().unwrap())
    }

    /// Content digest of the operation as currently encoded.
    ///
    /// Memoized until [`OpNode::invalidate_digest`]. An opless node (no
    /// operation body) digests to the empty string, which callers treat as
    /// "not yet materialized".
    pub fn digest(&self) -> String {
        {
            let op = self.op.lock().unwrap();
            if op.op.is_none() {
                return String::new();
            }
        }
        let mut memo = self.digest.lock().unwrap();
        if let Some(d) = memo.as_ref() {
            return d.clone();
        }
        let d = digest_bytes(&self.encode_op());
        *memo = Some(d.clone());
        d
    }

    /// Drop the memoized digest; the next [`OpNode::digest`] re-encodes.
    pub fn invalidate_digest(&self) {
        *self.digest.lock().unwrap() = None;
    }

    /// Deterministic wire encoding, served from `cache` when the digest is
    /// already known there.
    pub fn marshal(&self, cache: &MarshalCache) -> Vec<u8> {
        let d = self.digest();
        if d.is_empty() {
            return Vec::new();
        }
        if let Some(bytes) = cache.get(&d) {
            return bytes.as_ref().clone();
        }
        let bytes = self.encode_op();
        cache.insert(d, bytes.clone());
        bytes
    }

    pub fn image_config(&self) -> Option<Arc<ImageConfig>> {
        self.image_config.lock().unwrap().clone()
    }

    /// Store the resolved image config. Immutable once observed by the
    /// propagation pass; callers set it at most once per serialization.
    pub fn set_image_config(&self, config: ImageConfig) {
        *self.image_config.lock().unwrap() = Some(Arc::new(config));
    }

    fn encode_op(&self) -> Vec<u8> {
        self.op.lock().unwrap().encode_to_vec()
    }
}

/// Immutable handle to one output of a node.
///
/// All `with_*` methods return a new handle sharing the same node, so
/// states are cheap to clone and safe to fan out.
#[derive(Clone, Debug)]
pub struct State {
    node: Arc<OpNode>,
    output: i64,
    platform: Option<Platform>,
    image_config: Option<Arc<ImageConfig>>,
    resolve_config: bool,
}

impl State {
    /// Handle to output 0 of `node`.
    pub fn new(node: Arc<OpNode>) -> Self {
        Self::with_output(node, 0)
    }

    /// Handle to a specific output index of `node`.
    pub fn with_output(node: Arc<OpNode>, output: i64) -> Self {
        Self {
            platform: node.meta().platform.clone(),
            resolve_config: node.meta().resolve_config,
            image_config: None,
            node,
            output,
        }
    }

    pub fn node(&self) -> &Arc<OpNode> {
        &self.node
    }

    pub fn output(&self) -> i64 {
        self.output
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn image_config(&self) -> Option<&Arc<ImageConfig>> {
        self.image_config.as_ref()
    }

    pub fn resolve_config(&self) -> bool {
        self.resolve_config
    }

    pub fn with_platform(&self, platform: Platform) -> Self {
        let mut s = self.clone();
        s.platform = Some(platform);
        s
    }

    pub fn with_image_config(&self, config: ImageConfig) -> Self {
        let mut s = self.clone();
        s.image_config = Some(Arc::new(config));
        s
    }

    pub fn with_resolve_config(&self, resolve: bool) -> Self {
        let mut s = self.clone();
        s.resolve_config = resolve;
        s
    }
}

/// Bounded digest-keyed cache of marshaled operation bytes.
///
/// Shared across serializations so re-emitting an unchanged DAG skips
/// re-encoding. Guarded by a reader-writer lock; once full, new entries
/// are refused until [`MarshalCache::clear`].
pub struct MarshalCache {
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    capacity: usize,
}

impl MarshalCache {
    pub fn new() -> Self {
        Self::with_capacity(MARSHAL_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get(&self, digest: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.read().unwrap().get(digest).cloned()
    }

    pub fn insert(&self, digest: String, bytes: Vec<u8>) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.capacity && !entries.contains_key(&digest) {
            return;
        }
        entries.insert(digest, Arc::new(bytes));
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for MarshalCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide cache used when the caller does not inject one.
pub fn default_cache() -> &'static MarshalCache {
    static CACHE: OnceLock<MarshalCache> = OnceLock::new();
    CACHE.get_or_init(MarshalCache::new)
}
