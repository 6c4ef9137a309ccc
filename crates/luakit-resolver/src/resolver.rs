//! Reference → image-config resolution with per-reference caching.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use luakit_llb::{reference, BoxError, ConfigResolver, ImageConfig, Platform};

use crate::auth::DockerConfig;
use crate::client::{Descriptor, RegistryClient};
use crate::error::{ResolveError, ResolveResult};

/// Outcome of resolving one reference for one platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    /// Canonical reference the lookup was performed with.
    pub reference: String,
    /// Digest of the platform manifest that was selected.
    pub digest: String,
    pub config: ImageConfig,
    pub platform: Platform,
}

/// Caching resolver over a [`RegistryClient`].
///
/// Results, successes and failures alike, are cached per normalized
/// reference + platform; a second lookup replays the first outcome
/// without touching the registry.
pub struct Resolver {
    client: RegistryClient,
    cache: RwLock<HashMap<String, ResolveResult<ResolvedImage>>>,
}

impl Resolver {
    /// Resolver with credentials discovered from the docker client
    /// config files.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_auth(DockerConfig::discover(), timeout)
    }

    pub fn with_auth(auth: DockerConfig, timeout: Option<Duration>) -> Self {
        Self {
            client: RegistryClient::new(auth, timeout),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop all cached outcomes.
    pub fn clear_cache(&self) {
        self.cache.write().unwrap().clear();
    }

    /// Resolve `image_ref` (with or without a transport prefix) for
    /// `platform`.
    pub async fn resolve(
        &self,
        image_ref: &str,
        platform: &Platform,
    ) -> ResolveResult<ResolvedImage> {
        let bare = reference::strip_transport(image_ref);
        let normalized =
            reference::normalize(bare).map_err(|err| ResolveError::Reference {
                reference: image_ref.to_string(),
                reason: err.to_string(),
            })?;

        let key = format!("{normalized}|{platform}");
        if let Some(cached) = self.cache.read().unwrap().get(&key) {
            debug!(reference = %normalized, "resolver cache hit");
            return cached.clone();
        }

        let result = self.resolve_uncached(&normalized, platform).await;
        self.cache.write().unwrap().insert(key, result.clone());
        result
    }

    async fn resolve_uncached(
        &self,
        normalized: &str,
        platform: &Platform,
    ) -> ResolveResult<ResolvedImage> {
        let parts = split_reference(normalized);
        debug!(reference = %normalized, %platform, "resolving via registry");

        let fetched = self
            .client
            .fetch_manifest(&parts.domain, &parts.repo, &parts.pull_ref, normalized)
            .await?;

        let (manifest, digest) = if fetched.manifest.is_index() {
            let chosen = select_platform(&fetched.manifest.manifests, platform).ok_or_else(
                || ResolveError::NoMatchingPlatform {
                    reference: normalized.to_string(),
                    platform: platform.to_string(),
                },
            )?;
            let digest = chosen.digest.clone();
            let fetched = self
                .client
                .fetch_manifest(&parts.domain, &parts.repo, &digest, normalized)
                .await?;
            (fetched.manifest, digest)
        } else {
            (fetched.manifest, fetched.digest)
        };

        let config_desc = manifest.config.ok_or_else(|| ResolveError::Manifest {
            reference: normalized.to_string(),
            message: "manifest has no config descriptor".to_string(),
        })?;
        let blob = self
            .client
            .fetch_blob(&parts.domain, &parts.repo, &config_desc.digest, normalized)
            .await?;
        let mut config: ImageConfig =
            serde_json::from_slice(&blob).map_err(|err| ResolveError::Config {
                reference: normalized.to_string(),
                message: err.to_string(),
            })?;

        // Backfill platform fields the config may omit.
        if config.os.is_empty() {
            config.os = platform.os.clone();
        }
        if config.architecture.is_empty() {
            config.architecture = platform.architecture.clone();
        }

        Ok(ResolvedImage {
            reference: normalized.to_string(),
            digest,
            config,
            platform: platform.clone(),
        })
    }
}

#[async_trait]
impl ConfigResolver for Resolver {
    async fn resolve_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<ImageConfig, BoxError> {
        let resolved = self.resolve(reference, platform).await?;
        Ok(resolved.config)
    }
}

struct ReferenceParts {
    domain: String,
    repo: String,
    /// Digest when pinned, tag otherwise.
    pull_ref: String,
}

/// Split a normalized reference into registry domain, repository path
/// and the reference to pull by.
fn split_reference(normalized: &str) -> ReferenceParts {
    let (domain, rest) = normalized
        .split_once('/')
        .unwrap_or(("docker.io", normalized));
    if let Some((repo_tag, digest)) = rest.split_once('@') {
        let repo = repo_tag
            .rsplit_once(':')
            .map(|(repo, _)| repo)
            .unwrap_or(repo_tag);
        return ReferenceParts {
            domain: domain.to_string(),
            repo: repo.to_string(),
            pull_ref: digest.to_string(),
        };
    }
    let (repo, tag) = rest.rsplit_once(':').unwrap_or((rest, "latest"));
    ReferenceParts {
        domain: domain.to_string(),
        repo: repo.to_string(),
        pull_ref: tag.to_string(),
    }
}

/// First index entry matching the requested platform.
fn select_platform<'a>(
    manifests: &'a [Descriptor],
    platform: &Platform,
) -> Option<&'a Descriptor> {
    manifests.iter().find(|descriptor| {
        descriptor
            .platform
            .as_ref()
            .map(|candidate| platform.matches(candidate))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(os: &str, arch: &str, variant: Option<&str>, digest: &str) -> Descriptor {
        Descriptor {
            media_type: crate::client::MT_OCI_MANIFEST.to_string(),
            digest: digest.to_string(),
            size: 1,
            platform: Some(Platform {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: variant.map(str::to_string),
            }),
        }
    }

    #[test]
    fn split_reference_handles_tag_and_digest_forms() {
        let parts = split_reference("docker.io/library/alpine:3.19");
        assert_eq!(parts.domain, "docker.io");
        assert_eq!(parts.repo, "library/alpine");
        assert_eq!(parts.pull_ref, "3.19");

        let parts = split_reference(
            "ghcr.io/org/tool:v1@sha256:7b6a3b67c1287515f6c4d9a71b94e5d4b44c9e27a0a1d437c1ba39dd933cf384",
        );
        assert_eq!(parts.domain, "ghcr.io");
        assert_eq!(parts.repo, "org/tool");
        assert!(parts.pull_ref.starts_with("sha256:"));
    }

    #[test]
    fn platform_selection_respects_variant() {
        let manifests = vec![
            descriptor("linux", "amd64", None, "sha256:amd"),
            descriptor("linux", "arm64", Some("v8"), "sha256:arm"),
        ];
        let chosen = select_platform(&manifests, &Platform::new("linux", "arm64")).unwrap();
        assert_eq!(chosen.digest, "sha256:arm");
        assert!(select_platform(&manifests, &Platform::new("linux", "s390x")).is_none());
        let v7 = Platform::new("linux", "arm64").with_variant("v7");
        assert!(select_platform(&manifests, &v7).is_none());
    }
}
