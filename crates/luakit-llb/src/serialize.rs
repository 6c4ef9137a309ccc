//! Definition assembly: config resolution, propagation and emission.
//!
//! Serialization happens in three passes over the graph: resolve image
//! configs for flagged source nodes, propagate configs down exec rootfs
//! chains, then emit a post-order walk with input digests back-patched.
//! The emitted sequence is a valid topological order with the terminal
//! vertex appended last.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use prost::Message;
use tracing::debug;

use crate::error::{SerializeError, SerializeResult};
use crate::exec::merge_env;
use crate::graph::{default_cache, Edge, MarshalCache, OpNode, State};
use crate::oci::{ConfigResolver, ImageConfig, Platform};
use crate::pb;

/// Metadata key the image exporter reads the config document from.
pub const EXPORTER_CONFIG_KEY: &str = "containerimage.config";
/// Metadata key carrying the human-readable vertex description.
pub const DESCRIPTION_KEY: &str = "llb.customname";

/// Inputs to [`serialize`] beyond the exported state itself.
pub struct SerializeOptions {
    /// Config document attached to the exported vertex for the image
    /// exporter.
    pub image_config: Option<ImageConfig>,
    /// Script payloads for the source-map section, keyed by path.
    pub source_files: Vec<(String, Vec<u8>)>,
    /// Fetches configs for source nodes flagged for resolution. Without
    /// one the resolve pass is skipped entirely.
    pub resolver: Option<Arc<dyn ConfigResolver>>,
    /// Platform used when a flagged node has no override of its own.
    pub default_platform: Platform,
    /// Marshal cache for this invocation; the process-wide cache is used
    /// when absent.
    pub cache: Option<Arc<MarshalCache>>,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            image_config: None,
            source_files: Vec::new(),
            resolver: None,
            default_platform: Platform::default(),
            cache: None,
        }
    }
}

/// Serialize the graph rooted at `root` into an LLB definition.
///
/// Repeated calls on the same root produce byte-identical output: the
/// walk order is fixed, encoding is deterministic and digests are
/// content-addressed.
pub async fn serialize(root: &State, opts: SerializeOptions) -> SerializeResult<pb::Definition> {
    let cache: &MarshalCache = match &opts.cache {
        Some(cache) => cache.as_ref(),
        None => default_cache(),
    };
    let nodes = collect_nodes(root.node());

    if let Some(resolver) = &opts.resolver {
        resolve_configs(&nodes, resolver.as_ref(), &opts.default_platform).await?;
    }
    propagate_configs(&nodes);

    let mut smap = SourceMapBuilder::new(&opts.source_files);
    let mut emitter = Emitter {
        cache,
        smap: &mut smap,
        visited: HashSet::new(),
        emitted: HashSet::new(),
        def: Vec::new(),
        metadata: BTreeMap::new(),
    };
    emitter.emit(root.node());
    let Emitter { mut def, mut metadata, .. } = emitter;

    let root_digest = root.node().digest();
    if let Some(config) = &opts.image_config {
        let json = serde_json::to_string(config)?;
        metadata
            .entry(root_digest.clone())
            .or_default()
            .description
            .insert(EXPORTER_CONFIG_KEY.to_string(), json);
    }

    // Trailing vertex with no operation body; its single input is the
    // exported state. Downstream provenance tooling keys on it.
    let terminal = pb::Op {
        inputs: vec![pb::Input {
            digest: root_digest,
            index: root.output(),
        }],
        ..Default::default()
    };
    def.push(terminal.encode_to_vec());

    debug!(ops = def.len(), "definition assembled");
    Ok(pb::Definition {
        def,
        metadata,
        source: smap.build(),
    })
}

/// Back-patch input digests along the graph so node digests are final.
///
/// The serializer does this as part of emission; renderers call it
/// directly so displayed digests match what a build would produce.
pub fn finalize_digests(root: &State) {
    for node in collect_nodes(root.node()) {
        patch_inputs(&node);
        node.invalidate_digest();
        node.digest();
    }
}

/// Post-order node listing, each node once, cycle-safe.
pub(crate) fn collect_nodes(root: &Arc<OpNode>) -> Vec<Arc<OpNode>> {
    fn visit(node: &Arc<OpNode>, seen: &mut HashSet<usize>, out: &mut Vec<Arc<OpNode>>) {
        if !seen.insert(Arc::as_ptr(node) as usize) {
            return;
        }
        for edge in node.edges().iter().flatten() {
            visit(&edge.node, seen, out);
        }
        out.push(Arc::clone(node));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    visit(root, &mut seen, &mut out);
    out
}

fn patch_inputs(node: &Arc<OpNode>) {
    // Digests are computed before the payload lock is taken: an edge may
    // point back at this very node.
    let patches: Vec<Option<(String, i64)>> = node
        .edges()
        .iter()
        .map(|edge| {
            edge.as_ref()
                .map(|edge| (edge.node.digest(), edge.output))
        })
        .collect();
    node.with_op_mut(|op| {
        for (i, patch) in patches.iter().enumerate() {
            if let Some((digest, output)) = patch {
                if let Some(input) = op.inputs.get_mut(i) {
                    input.digest = digest.clone();
                    input.index = *output;
                }
            }
        }
    });
}

async fn resolve_configs(
    nodes: &[Arc<OpNode>],
    resolver: &dyn ConfigResolver,
    default_platform: &Platform,
) -> SerializeResult<()> {
    for node in nodes {
        if !node.meta().resolve_config || node.image_config().is_some() {
            continue;
        }
        let identifier = match node.op_snapshot().op {
            Some(pb::op::Op::Source(src)) => src.identifier,
            _ => continue,
        };
        let Some(reference) = identifier.strip_prefix("docker-image://") else {
            continue;
        };
        let platform = node
            .meta()
            .platform
            .clone()
            .unwrap_or_else(|| default_platform.clone());
        debug!(reference, %platform, "resolving image config");
        let config = resolver
            .resolve_config(reference, &platform)
            .await
            .map_err(|source| SerializeError::Resolve {
                reference: reference.to_string(),
                source,
            })?;
        node.set_image_config(config);
    }
    Ok(())
}

/// The input edge feeding an exec's rootfs: the bind mounted at `/`, or
/// input 0 as a fallback. For other op kinds the first input.
fn rootfs_edge(node: &Arc<OpNode>) -> Option<Edge> {
    let input = match node.op_snapshot().op {
        Some(pb::op::Op::Exec(exec)) => exec
            .mounts
            .iter()
            .find(|m| m.dest == "/" && m.mount_type == pb::MountType::Bind as i32)
            .map(|m| m.input)
            .filter(|input| *input >= 0)
            .unwrap_or(0),
        _ => 0,
    };
    node.edges().into_iter().nth(input as usize).flatten()
}

/// Nearest ancestor along the rootfs chain carrying an image config.
fn nearest_config(start: Edge) -> Option<Arc<ImageConfig>> {
    let mut seen = HashSet::new();
    let mut current = start.node;
    loop {
        if !seen.insert(Arc::as_ptr(&current) as usize) {
            return None;
        }
        if let Some(config) = current.image_config() {
            return Some(config);
        }
        current = rootfs_edge(&current)?.node;
    }
}

fn propagate_configs(nodes: &[Arc<OpNode>]) {
    for node in nodes {
        if node.kind() != "exec" {
            continue;
        }
        let config = rootfs_edge(node).and_then(nearest_config);
        let changed = node.with_op_mut(|op| {
            let Some(pb::op::Op::Exec(exec)) = op.op.as_mut() else {
                return false;
            };
            let meta = exec.meta.get_or_insert_with(Default::default);
            let mut changed = false;
            if meta.cwd.is_empty() {
                let wd = config
                    .as_deref()
                    .map(ImageConfig::working_dir)
                    .filter(|wd| !wd.is_empty())
                    .unwrap_or("/");
                meta.cwd = wd.to_string();
                changed = true;
            }
            if let Some(config) = config.as_deref() {
                if !config.env().is_empty() {
                    let merged = merge_env(config.env(), &meta.env);
                    if merged != meta.env {
                        meta.env = merged;
                        changed = true;
                    }
                }
            }
            changed
        });
        if changed {
            node.invalidate_digest();
        }
    }
}

fn capability(node: &Arc<OpNode>) -> Option<&'static str> {
    match node.op_snapshot().op {
        Some(pb::op::Op::Source(src)) => {
            let id = &src.identifier;
            if id.starts_with("docker-image://") {
                Some("source.image")
            } else if id.starts_with("local://") {
                Some("source.local")
            } else if id.starts_with("git://") {
                Some("source.git")
            } else if id.starts_with("http://") || id.starts_with("https://") {
                Some("source.http")
            } else {
                None
            }
        }
        Some(pb::op::Op::Exec(_)) => Some("exec.meta.base"),
        Some(pb::op::Op::File(_)) => Some("file.base"),
        Some(pb::op::Op::Merge(_)) => Some("mergeop"),
        Some(pb::op::Op::Diff(_)) => Some("diffop"),
        _ => None,
    }
}

struct SourceMapBuilder {
    infos: Vec<pb::SourceInfo>,
    index: HashMap<String, i32>,
    locations: BTreeMap<String, pb::Locations>,
}

impl SourceMapBuilder {
    fn new(files: &[(String, Vec<u8>)]) -> Self {
        let mut infos = Vec::new();
        let mut index = HashMap::new();
        for (path, data) in files {
            if index.contains_key(path) {
                continue;
            }
            index.insert(path.clone(), infos.len() as i32);
            infos.push(pb::SourceInfo {
                filename: path.clone(),
                data: data.clone(),
                definition: None,
            });
        }
        Self {
            infos,
            index,
            locations: BTreeMap::new(),
        }
    }

    /// Record a single-line location for `digest`, if `file` was
    /// registered with the builder.
    fn add(&mut self, digest: &str, file: &str, line: i32) {
        let Some(&source_index) = self.index.get(file) else {
            return;
        };
        let position = pb::Position { line, character: 0 };
        self.locations
            .entry(digest.to_string())
            .or_default()
            .locations
            .push(pb::Location {
                source_index,
                ranges: vec![pb::Range {
                    start: Some(position.clone()),
                    end: Some(position),
                }],
            });
    }

    fn build(self) -> Option<pb::Source> {
        if self.infos.is_empty() && self.locations.is_empty() {
            return None;
        }
        Some(pb::Source {
            locations: self.locations,
            infos: self.infos,
        })
    }
}

struct Emitter<'a> {
    cache: &'a MarshalCache,
    smap: &'a mut SourceMapBuilder,
    visited: HashSet<usize>,
    emitted: HashSet<String>,
    def: Vec<Vec<u8>>,
    metadata: BTreeMap<String, pb::OpMetadata>,
}

impl Emitter<'_> {
    fn emit(&mut self, node: &Arc<OpNode>) {
        if !self.visited.insert(Arc::as_ptr(node) as usize) {
            return;
        }
        for edge in node.edges().iter().flatten() {
            self.emit(&edge.node);
        }
        patch_inputs(node);
        node.invalidate_digest();
        let digest = node.digest();
        if digest.is_empty() {
            // Opless node: nothing to materialize.
            return;
        }
        if !self.emitted.insert(digest.clone()) {
            return;
        }
        self.def.push(node.marshal(self.cache));

        let mut md = pb::OpMetadata::default();
        if let Some(cap) = capability(node) {
            md.caps.insert(cap.to_string(), true);
        }
        let meta = node.meta();
        if let Some(description) = &meta.description {
            md.description
                .insert(DESCRIPTION_KEY.to_string(), description.clone());
        }
        if let Some(group) = &meta.progress_group {
            md.progress_group = Some(pb::ProgressGroup {
                id: group.clone(),
                ..Default::default()
            });
        }
        if meta.ignore_cache {
            md.ignore_cache = true;
        }
        self.metadata.insert(digest.clone(), md);

        if !meta.origin.file.is_empty() && meta.origin.line > 0 {
            self.smap.add(&digest, &meta.origin.file, meta.origin.line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{run, RunOptions};
    use crate::graph::{NodeMeta, Origin};
    use crate::oci::ImageSettings;
    use crate::source::{image, ImageOptions};

    fn decode_ops(def: &pb::Definition) -> Vec<pb::Op> {
        def.def
            .iter()
            .map(|bytes| pb::Op::decode(bytes.as_slice()).unwrap())
            .collect()
    }

    fn test_config(env: &[&str], working_dir: &str) -> ImageConfig {
        ImageConfig {
            config: Some(ImageSettings {
                env: env.iter().map(|s| s.to_string()).collect(),
                working_dir: working_dir.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn terminal_vertex_is_last_and_opless() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        let def = serialize(&base, SerializeOptions::default()).await.unwrap();
        let ops = decode_ops(&def);
        assert_eq!(ops.len(), 2);
        let terminal = ops.last().unwrap();
        assert!(terminal.op.is_none());
        assert_eq!(terminal.inputs.len(), 1);
        assert_eq!(terminal.inputs[0].digest, base.node().digest());
    }

    #[tokio::test]
    async fn config_propagates_down_the_rootfs_chain() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        base.node().set_image_config(test_config(&["PATH=/bin"], "/srv"));
        let first = run(&base, vec!["a".to_string()], RunOptions::default(), Origin::default())
            .unwrap();
        let second = run(&first, vec!["b".to_string()], RunOptions::default(), Origin::default())
            .unwrap();
        let def = serialize(&second, SerializeOptions::default()).await.unwrap();
        for op in decode_ops(&def) {
            if let Some(pb::op::Op::Exec(exec)) = op.op {
                let meta = exec.meta.unwrap();
                assert_eq!(meta.cwd, "/srv");
                assert_eq!(meta.env, vec!["PATH=/bin"]);
            }
        }
    }

    #[tokio::test]
    async fn cwd_defaults_to_root_without_config() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        let step = run(&base, vec!["ls".to_string()], RunOptions::default(), Origin::default())
            .unwrap();
        let def = serialize(&step, SerializeOptions::default()).await.unwrap();
        let exec = decode_ops(&def)
            .into_iter()
            .find_map(|op| match op.op {
                Some(pb::op::Op::Exec(exec)) => Some(exec),
                _ => None,
            })
            .unwrap();
        assert_eq!(exec.meta.unwrap().cwd, "/");
    }

    #[tokio::test]
    async fn exported_image_config_lands_on_the_root_vertex() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        let config = test_config(&["A=1"], "/app");
        let opts = SerializeOptions {
            image_config: Some(config.clone()),
            ..Default::default()
        };
        let def = serialize(&base, opts).await.unwrap();
        let md = &def.metadata[&base.node().digest()];
        let embedded: ImageConfig =
            serde_json::from_str(&md.description[EXPORTER_CONFIG_KEY]).unwrap();
        assert_eq!(embedded, config);
    }

    #[tokio::test]
    async fn metadata_carries_caps_description_and_group() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        let opts = RunOptions {
            name: Some("compile".to_string()),
            progress_group: Some("stage-0".to_string()),
            ..Default::default()
        };
        let step = run(&base, vec!["make".to_string()], opts, Origin::default()).unwrap();
        let def = serialize(&step, SerializeOptions::default()).await.unwrap();

        let base_md = &def.metadata[&base.node().digest()];
        assert_eq!(base_md.caps.get("source.image"), Some(&true));

        let step_md = &def.metadata[&step.node().digest()];
        assert_eq!(step_md.caps.get("exec.meta.base"), Some(&true));
        assert_eq!(step_md.description[DESCRIPTION_KEY], "compile");
        assert_eq!(step_md.progress_group.as_ref().unwrap().id, "stage-0");
    }

    #[tokio::test]
    async fn source_map_records_registered_files_only() {
        let base = image(
            "alpine",
            ImageOptions::default(),
            Origin::new("build.lua", 1),
        )
        .unwrap();
        let step = run(
            &base,
            vec!["ls".to_string()],
            RunOptions::default(),
            Origin::new("unregistered.lua", 9),
        )
        .unwrap();
        let opts = SerializeOptions {
            source_files: vec![("build.lua".to_string(), b"local b = ...".to_vec())],
            ..Default::default()
        };
        let def = serialize(&step, opts).await.unwrap();
        let source = def.source.unwrap();
        assert_eq!(source.infos.len(), 1);
        assert_eq!(source.infos[0].filename, "build.lua");
        let locations = &source.locations[&base.node().digest()];
        assert_eq!(locations.locations[0].ranges[0].start.as_ref().unwrap().line, 1);
        assert!(!source.locations.contains_key(&step.node().digest()));
    }

    #[tokio::test]
    async fn repeated_serialization_is_byte_identical() {
        let base = image("alpine:3.19", ImageOptions::default(), Origin::new("build.lua", 1))
            .unwrap();
        let step = run(
            &base,
            vec!["echo".to_string(), "hi".to_string()],
            RunOptions::default(),
            Origin::new("build.lua", 2),
        )
        .unwrap();
        let opts = || SerializeOptions {
            source_files: vec![("build.lua".to_string(), b"x".to_vec())],
            ..Default::default()
        };
        let first = serialize(&step, opts()).await.unwrap().encode_to_vec();
        let second = serialize(&step, opts()).await.unwrap().encode_to_vec();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cyclic_graph_terminates_and_emits_each_node_once() {
        // Wire three source nodes into a loop through the raw edge API.
        let mk = |name: &str| {
            let op = pb::Op {
                op: Some(pb::op::Op::Source(pb::SourceOp {
                    identifier: format!("docker-image://docker.io/library/{name}"),
                    ..Default::default()
                })),
                ..Default::default()
            };
            crate::graph::OpNode::new(op, NodeMeta::default())
        };
        let a = mk("a");
        let b = mk("b");
        let c = mk("c");
        a.add_edge(&b, 0);
        b.add_edge(&c, 0);
        c.add_edge(&a, 0);

        let root = State::new(a);
        let def = serialize(&root, SerializeOptions::default()).await.unwrap();
        // Three unique ops plus the terminal vertex.
        assert!(def.def.len() <= 4);
    }

    #[tokio::test]
    async fn self_referential_edge_does_not_hang() {
        let op = pb::Op {
            op: Some(pb::op::Op::Source(pb::SourceOp {
                identifier: "docker-image://docker.io/library/a".to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let node = crate::graph::OpNode::new(op, NodeMeta::default());
        node.add_edge(&node, 0);
        let def = serialize(&State::new(node), SerializeOptions::default())
            .await
            .unwrap();
        assert!(def.def.len() <= 2);
    }

    #[tokio::test]
    async fn inputs_always_precede_their_consumers() {
        let base = image("alpine", ImageOptions::default(), Origin::default()).unwrap();
        let left = run(&base, vec!["a".to_string()], RunOptions::default(), Origin::default())
            .unwrap();
        let right = run(&base, vec!["b".to_string()], RunOptions::default(), Origin::default())
            .unwrap();
        let merged = crate::ops::merge(&[left, right], Origin::default()).unwrap();
        let def = serialize(&merged, SerializeOptions::default()).await.unwrap();

        let mut seen = HashSet::new();
        for op in decode_ops(&def) {
            for input in &op.inputs {
                assert!(seen.contains(&input.digest), "forward reference");
            }
            seen.insert(crate::graph::digest_bytes(&op.encode_to_vec()));
        }
    }
}
