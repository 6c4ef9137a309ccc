//! Container image reference parsing and normalization.
//!
//! Accepts the familiar short forms (`alpine`, `alpine:3.19`,
//! `name@sha256:...`) and expands them to the canonical
//! `registry/repository[:tag][@digest]` form, defaulting the registry to
//! Docker Hub and bare names to the `library/` namespace with `:latest`.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ValidationError, ValidationResult};

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap())
}

fn digest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").unwrap())
}

fn path_component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap())
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9.-]*[a-zA-Z0-9])?(?::[0-9]+)?$").unwrap())
}

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";

/// Strip the URL-style transport prefix from an image identifier.
pub fn strip_transport(reference: &str) -> &str {
    reference
        .strip_prefix("docker-image://")
        .or_else(|| reference.strip_prefix("oci-layout://"))
        .unwrap_or(reference)
}

fn invalid(reference: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Normalize `reference` to canonical form.
///
/// A bare name with neither tag nor digest gains `:latest`; a name with a
/// digest is left untagged.
pub fn normalize(reference: &str) -> ValidationResult<String> {
    if reference.is_empty() {
        return Err(ValidationError::EmptyReference);
    }

    let (remainder, digest) = match reference.split_once('@') {
        Some((name, digest)) => {
            if digest.contains('@') || name.contains('@') {
                return Err(invalid(reference, "multiple '@' separators"));
            }
            if !digest_re().is_match(digest) {
                return Err(invalid(reference, "malformed digest"));
            }
            (name, Some(digest))
        }
        None => (reference, None),
    };
    if remainder.is_empty() {
        return Err(invalid(reference, "missing name before digest"));
    }

    // The tag separator is a ':' after the last '/'; earlier colons can
    // only belong to a registry port.
    let (name, tag) = match remainder.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => {
            if !tag_re().is_match(tag) {
                return Err(invalid(reference, "malformed tag"));
            }
            (name, Some(tag))
        }
        _ => (remainder, None),
    };
    if name.is_empty() {
        return Err(invalid(reference, "empty name"));
    }

    // Leading component with a '.', a port, or the literal "localhost" is
    // a registry domain; everything else lives on Docker Hub.
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first, rest.to_string())
        }
        _ => (DOCKER_HUB_DOMAIN, name.to_string()),
    };
    if !domain_re().is_match(domain) {
        return Err(invalid(reference, "malformed registry host"));
    }
    if path.is_empty() {
        return Err(invalid(reference, "empty repository path"));
    }
    for component in path.split('/') {
        if !path_component_re().is_match(component) {
            return Err(invalid(
                reference,
                format!("malformed repository component '{component}'"),
            ));
        }
    }

    let path = if domain == DOCKER_HUB_DOMAIN && !path.contains('/') {
        format!("{OFFICIAL_NAMESPACE}/{path}")
    } else {
        path
    };

    let mut normalized = format!("{domain}/{path}");
    match (tag, digest) {
        (Some(tag), Some(digest)) => {
            normalized.push(':');
            normalized.push_str(tag);
            normalized.push('@');
            normalized.push_str(digest);
        }
        (Some(tag), None) => {
            normalized.push(':');
            normalized.push_str(tag);
        }
        (None, Some(digest)) => {
            normalized.push('@');
            normalized.push_str(digest);
        }
        (None, None) => normalized.push_str(":latest"),
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:9e2bbca079387d7965c3a9cee6d0c53f4f4e63ff7637877a83c4c05f2a666112";

    #[test]
    fn bare_name_expands_to_hub_library_latest() {
        assert_eq!(normalize("alpine").unwrap(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn name_and_tag_expand_to_hub_library() {
        assert_eq!(
            normalize("alpine:3.19").unwrap(),
            "docker.io/library/alpine:3.19"
        );
    }

    #[test]
    fn namespaced_name_keeps_namespace() {
        assert_eq!(
            normalize("grafana/loki:2.9").unwrap(),
            "docker.io/grafana/loki:2.9"
        );
    }

    #[test]
    fn registry_host_is_preserved() {
        assert_eq!(
            normalize("ghcr.io/org/tool").unwrap(),
            "ghcr.io/org/tool:latest"
        );
        assert_eq!(
            normalize("localhost:5000/tool:dev").unwrap(),
            "localhost:5000/tool:dev"
        );
    }

    #[test]
    fn digest_reference_stays_untagged() {
        let normalized = normalize(&format!("alpine@{DIGEST}")).unwrap();
        assert_eq!(normalized, format!("docker.io/library/alpine@{DIGEST}"));
    }

    #[test]
    fn fully_normalized_reference_round_trips() {
        let full = format!("docker.io/library/alpine:3.19@{DIGEST}");
        assert_eq!(normalize(&full).unwrap(), full);
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert_eq!(normalize(""), Err(ValidationError::EmptyReference));
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(normalize("Alpine").is_err());
        assert!(normalize("alpine@sha256:short").is_err());
        assert!(normalize("a@b@c").is_err());
        assert!(normalize("alpine:").is_err());
        assert!(normalize(&format!("@{DIGEST}")).is_err());
    }

    #[test]
    fn transport_prefix_is_stripped() {
        assert_eq!(
            strip_transport("docker-image://docker.io/library/alpine:latest"),
            "docker.io/library/alpine:latest"
        );
        assert_eq!(strip_transport("oci-layout://ref"), "ref");
        assert_eq!(strip_transport("alpine"), "alpine");
    }
}
