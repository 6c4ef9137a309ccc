//! Source operation constructors: image, local context, git, http, scratch.

use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::{ValidationError, ValidationResult};
use crate::graph::{NodeMeta, OpNode, Origin, State};
use crate::oci::Platform;
use crate::pb;
use crate::reference;

fn local_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn scp_remote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9._-]+)@([A-Za-z0-9._-]+):(.+)$").unwrap())
}

fn source_node(
    identifier: String,
    attrs: Vec<(String, String)>,
    meta: NodeMeta,
) -> State {
    let platform = meta.platform.clone();
    let op = pb::Op {
        op: Some(pb::op::Op::Source(pb::SourceOp {
            identifier,
            attrs: attrs.into_iter().collect(),
        })),
        platform: platform.as_ref().map(Platform::to_pb),
        ..Default::default()
    };
    State::new(OpNode::new(op, meta))
}

/// Options for [`image`].
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Fetch the image config before serialization (sets the node's
    /// resolve flag). Defaults to true.
    pub resolve_digest: bool,
    /// Platform override used when the config is resolved.
    pub platform: Option<Platform>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            resolve_digest: true,
            platform: None,
        }
    }
}

/// Pull source for a container image reference.
///
/// The reference is normalized to canonical form and embedded as
/// `docker-image://<normalized>`.
pub fn image(reference_str: &str, opts: ImageOptions, origin: Origin) -> ValidationResult<State> {
    let normalized = reference::normalize(reference_str)?;
    let meta = NodeMeta {
        origin,
        platform: opts.platform,
        resolve_config: opts.resolve_digest,
        ..Default::default()
    };
    Ok(source_node(
        format!("docker-image://{normalized}"),
        Vec::new(),
        meta,
    ))
}

/// Options for [`local`].
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Cache-key hint shared by contexts with equal content.
    pub shared_key_hint: Option<String>,
}

/// Source for a named local build context, transferred from the client.
pub fn local(name: &str, opts: LocalOptions, origin: Origin) -> ValidationResult<State> {
    let reject = |reason: &str| {
        Err(ValidationError::InvalidLocalName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return reject("empty name");
    }
    if name.len() > 256 {
        return reject("longer than 256 characters");
    }
    if name.contains("..") {
        return reject("contains '..'");
    }
    if name.starts_with('.') {
        return reject("leading dot");
    }
    if name.contains('/') || name.contains('\\') {
        return reject("contains a path separator");
    }
    if !local_name_re().is_match(name) {
        return reject("allowed characters are [A-Za-z0-9_-]");
    }

    let mut attrs = Vec::new();
    for (i, pattern) in opts.include_patterns.iter().enumerate() {
        attrs.push((format!("includepattern.{i}"), pattern.clone()));
    }
    for (i, pattern) in opts.exclude_patterns.iter().enumerate() {
        attrs.push((format!("excludepattern.{i}"), pattern.clone()));
    }
    if let Some(hint) = &opts.shared_key_hint {
        attrs.push(("local.sharedkeyhint".to_string(), hint.clone()));
    }

    let meta = NodeMeta {
        origin,
        ..Default::default()
    };
    Ok(source_node(format!("local://{name}"), attrs, meta))
}

/// Options for [`git`].
#[derive(Debug, Clone, Default)]
pub struct GitOptions {
    /// Branch, tag or commit appended as the URL fragment.
    pub reference: Option<String>,
    /// Keep the `.git` directory in the checkout.
    pub keep_git_dir: bool,
}

/// Source for a git remote checkout.
///
/// Accepts http(s), git, ssh and git+ssh URLs plus the `git@host:path`
/// SCP form, which is rewritten to `ssh://` before validation.
pub fn git(url_str: &str, opts: GitOptions, origin: Origin) -> ValidationResult<State> {
    let reject = |reason: String| {
        Err(ValidationError::InvalidGitUrl {
            url: url_str.to_string(),
            reason,
        })
    };
    if url_str.is_empty() {
        return reject("empty url".to_string());
    }

    let rewritten = if !url_str.contains("://") {
        match scp_remote_re().captures(url_str) {
            Some(caps) => format!("ssh://{}@{}/{}", &caps[1], &caps[2], &caps[3]),
            None => return reject("missing scheme".to_string()),
        }
    } else {
        url_str.to_string()
    };

    let parsed = match Url::parse(&rewritten) {
        Ok(parsed) => parsed,
        Err(err) => return reject(err.to_string()),
    };
    match parsed.scheme() {
        "http" | "https" | "git" | "ssh" | "git+ssh" => {}
        other => return reject(format!("unsupported scheme '{other}'")),
    }
    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return reject("missing host".to_string()),
    };

    // The identifier carries host, path and optional user, but not the
    // transport scheme.
    let mut remote = String::new();
    if !parsed.username().is_empty() {
        remote.push_str(parsed.username());
        remote.push('@');
    }
    remote.push_str(host);
    if let Some(port) = parsed.port() {
        remote.push_str(&format!(":{port}"));
    }
    remote.push_str(parsed.path());

    let mut identifier = format!("git://{remote}");
    if let Some(reference) = &opts.reference {
        identifier.push('#');
        identifier.push_str(reference);
    }

    let mut attrs = Vec::new();
    if opts.keep_git_dir {
        attrs.push(("git.keepgitdir".to_string(), "true".to_string()));
    }

    let meta = NodeMeta {
        origin,
        ..Default::default()
    };
    Ok(source_node(identifier, attrs, meta))
}

/// Options for [`http`].
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Expected digest of the downloaded body.
    pub checksum: Option<String>,
    /// Target filename inside the result filesystem.
    pub filename: Option<String>,
    /// Permission bits of the downloaded file.
    pub mode: Option<u32>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Basic-auth credentials; the username must not contain ':'.
    pub basic_auth: Option<(String, String)>,
}

/// Source for a file fetched over http(s). The URL itself is the
/// identifier.
pub fn http(url_str: &str, opts: HttpOptions, origin: Origin) -> ValidationResult<State> {
    let reject = |reason: String| {
        Err(ValidationError::InvalidHttpUrl {
            url: url_str.to_string(),
            reason,
        })
    };
    let parsed = match Url::parse(url_str) {
        Ok(parsed) => parsed,
        Err(err) => return reject(err.to_string()),
    };
    match parsed.scheme() {
        "http" | "https" => {}
        other => return reject(format!("unsupported scheme '{other}'")),
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return reject("missing host".to_string());
    }

    let mut attrs = Vec::new();
    if let Some(checksum) = &opts.checksum {
        attrs.push(("checksum".to_string(), checksum.clone()));
    }
    if let Some(filename) = &opts.filename {
        attrs.push(("filename".to_string(), filename.clone()));
    }
    if let Some(mode) = opts.mode {
        attrs.push(("mode".to_string(), mode.to_string()));
    }
    for (name, value) in &opts.headers {
        attrs.push((format!("http.header.{name}"), value.clone()));
    }
    if let Some((user, password)) = &opts.basic_auth {
        if user.contains(':') {
            return Err(ValidationError::InvalidBasicAuthUser);
        }
        attrs.push(("http.basicauth".to_string(), format!("{user}:{password}")));
    }

    let meta = NodeMeta {
        origin,
        ..Default::default()
    };
    Ok(source_node(url_str.to_string(), attrs, meta))
}

/// The empty filesystem.
pub fn scratch(origin: Origin) -> State {
    source_node(
        "scratch".to_string(),
        Vec::new(),
        NodeMeta {
            origin,
            ..Default::default()
        },
    )
}
