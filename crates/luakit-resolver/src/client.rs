//! Minimal OCI distribution client: manifest and config-blob fetches.
//!
//! Speaks just enough of the distribution protocol for config
//! resolution: a manifest GET with the usual Accept set, the bearer
//! token dance on 401, and blob GETs. No retries; the first failure
//! surfaces.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest as Sha2Digest, Sha256};
use tracing::debug;

use luakit_llb::Platform;

use crate::auth::DockerConfig;
use crate::error::{ResolveError, ResolveResult};

pub const MT_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MT_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Content descriptor as it appears in manifests and indexes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A manifest or index body; exactly one of `manifests` / `config` is
/// populated depending on the media type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default)]
    pub config: Option<Descriptor>,
}

impl Manifest {
    /// True for index/list media types (multi-platform images).
    pub fn is_index(&self) -> bool {
        match self.media_type.as_deref() {
            Some(MT_OCI_INDEX) | Some(MT_DOCKER_LIST) => true,
            Some(_) => false,
            None => !self.manifests.is_empty(),
        }
    }
}

/// A fetched manifest: decoded body plus the digest of its bytes.
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub digest: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
    auth: DockerConfig,
}

impl RegistryClient {
    /// Client with the given credentials and an optional overall request
    /// timeout, which doubles as the cancellation bound for resolution.
    pub fn new(auth: DockerConfig, timeout: Option<Duration>) -> Self {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("luakit/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().expect("construct HTTP client");
        Self { http, auth }
    }

    /// Host actually serving the v2 API for `domain`.
    pub fn registry_host(domain: &str) -> &str {
        if domain == "docker.io" {
            "registry-1.docker.io"
        } else {
            domain
        }
    }

    fn base_url(host: &str) -> String {
        // Local registries conventionally run without TLS.
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{host}")
        } else {
            format!("https://{host}")
        }
    }

    /// Fetch `/v2/<repo>/manifests/<reference>` from `domain`.
    pub async fn fetch_manifest(
        &self,
        domain: &str,
        repo: &str,
        reference: &str,
        image_ref: &str,
    ) -> ResolveResult<FetchedManifest> {
        let host = Self::registry_host(domain);
        let url = format!("{}/v2/{repo}/manifests/{reference}", Self::base_url(host));
        let accept = [MT_OCI_INDEX, MT_OCI_MANIFEST, MT_DOCKER_LIST, MT_DOCKER_MANIFEST]
            .join(", ");
        let response = self.get(host, repo, &url, &accept, image_ref).await?;
        let bytes = response.bytes().await.map_err(|err| ResolveError::Http {
            reference: image_ref.to_string(),
            message: err.to_string(),
        })?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        let manifest =
            serde_json::from_slice(&bytes).map_err(|err| ResolveError::Manifest {
                reference: image_ref.to_string(),
                message: err.to_string(),
            })?;
        Ok(FetchedManifest { manifest, digest })
    }

    /// Fetch `/v2/<repo>/blobs/<digest>` from `domain`.
    pub async fn fetch_blob(
        &self,
        domain: &str,
        repo: &str,
        digest: &str,
        image_ref: &str,
    ) -> ResolveResult<Vec<u8>> {
        let host = Self::registry_host(domain);
        let url = format!("{}/v2/{repo}/blobs/{digest}", Self::base_url(host));
        let response = self.get(host, repo, &url, "application/octet-stream", image_ref).await?;
        let bytes = response.bytes().await.map_err(|err| ResolveError::Http {
            reference: image_ref.to_string(),
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn get(
        &self,
        host: &str,
        repo: &str,
        url: &str,
        accept: &str,
        image_ref: &str,
    ) -> ResolveResult<reqwest::Response> {
        let http_err = |err: reqwest::Error| ResolveError::Http {
            reference: image_ref.to_string(),
            message: err.to_string(),
        };
        let credentials = self.auth.credentials_for(host);

        let mut request = self.http.get(url).header(ACCEPT, accept);
        if let Some(c) = &credentials {
            request = request.basic_auth(&c.username, Some(&c.password));
        }
        let mut response = request.send().await.map_err(http_err)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge);
            if let Some(challenge) = challenge {
                let token = self
                    .fetch_token(host, repo, &challenge, credentials.as_ref())
                    .await?;
                debug!(host, repo, "retrying with bearer token");
                response = self
                    .http
                    .get(url)
                    .header(ACCEPT, accept)
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .send()
                    .await
                    .map_err(http_err)?;
            }
        }

        if !response.status().is_success() {
            return Err(ResolveError::Http {
                reference: image_ref.to_string(),
                message: format!("{url}: status {}", response.status()),
            });
        }
        Ok(response)
    }

    async fn fetch_token(
        &self,
        host: &str,
        repo: &str,
        challenge: &BearerChallenge,
        credentials: Option<&crate::auth::Credentials>,
    ) -> ResolveResult<String> {
        let auth_err = |message: String| ResolveError::Auth {
            registry: host.to_string(),
            message,
        };
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repo}:pull"));
        let mut request = self.http.get(&challenge.realm).query(&[("scope", scope)]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(c) = credentials {
            request = request.basic_auth(&c.username, Some(&c.password));
        }
        let response = request
            .send()
            .await
            .map_err(|err| auth_err(err.to_string()))?;
        if !response.status().is_success() {
            return Err(auth_err(format!("token endpoint status {}", response.status())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| auth_err(err.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| auth_err("token endpoint returned no token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="..."` header.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
