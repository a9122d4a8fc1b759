//! Maps preferred image references to something the runtime can actually use.
//!
//! Registries referenced by blueprints come and go, so every image family has an
//! ordered fallback chain ending in an image that is almost always available.
//! Chains are data: the built-in set can be replaced with a JSON file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::runtime::{ContainerRuntime, RuntimeError};

pub const INSTALLER_FAMILY: &str = "installer";
const GENERIC_FAMILY: &str = "generic";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FallbackChain {
    pub family: String,
    /// Case-insensitive substrings that place an image reference in this family.
    #[serde(default)]
    pub patterns: Vec<String>,
    pub images: Vec<String>,
}

impl FallbackChain {
    fn matches(&self, image: &str) -> bool {
        let image = image.to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|p| !p.is_empty() && image.contains(&p.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    chains: Vec<FallbackChain>,
}

fn chain(family: &str, patterns: &[&str], images: &[&str]) -> FallbackChain {
    FallbackChain {
        family: family.to_string(),
        patterns: patterns.iter().map(|s| s.to_string()).collect(),
        images: images.iter().map(|s| s.to_string()).collect(),
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FallbackPolicy {
    pub fn new(chains: Vec<FallbackChain>) -> Self {
        Self { chains }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            chain(
                INSTALLER_FAMILY,
                &["installers"],
                &[
                    "ghcr.io/pterodactyl/installers:debian",
                    "debian:bookworm-slim",
                    "alpine:3.20",
                ],
            ),
            chain(
                "java",
                &["java", "temurin", "openjdk", "jdk", "jre"],
                &[
                    "eclipse-temurin:21-jre",
                    "eclipse-temurin:17-jre",
                    "eclipse-temurin:11-jre",
                    "eclipse-temurin:8-jre",
                    "debian:bookworm-slim",
                ],
            ),
            chain(
                "nodejs",
                &["nodejs", "node:"],
                &["node:20-bookworm-slim", "node:18-bookworm-slim", "debian:bookworm-slim"],
            ),
            chain(
                "python",
                &["python"],
                &["python:3.12-slim", "python:3.11-slim", "debian:bookworm-slim"],
            ),
            chain(
                "steamcmd",
                &["steamcmd", "wine", "source"],
                &["steamcmd/steamcmd:latest", "debian:bookworm-slim"],
            ),
            chain(GENERIC_FAMILY, &[], &["debian:bookworm-slim", "alpine:3.20"]),
        ])
    }

    /// Reads a JSON array of chains.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let chains: Vec<FallbackChain> = serde_json::from_slice(&raw)
            .map_err(|e| OrchestratorError::invalid(format!("fallback chains: {e}")))?;
        if chains.iter().any(|c| c.family.trim().is_empty()) {
            return Err(OrchestratorError::invalid("fallback chains: empty family name"));
        }
        Ok(Self::new(chains))
    }

    pub fn chains(&self) -> &[FallbackChain] {
        &self.chains
    }

    pub fn family(&self, name: &str) -> Option<&FallbackChain> {
        self.chains.iter().find(|c| c.family == name)
    }

    /// The chain whose patterns match `image`, or the generic chain.
    pub fn chain_for(&self, image: &str) -> Option<&FallbackChain> {
        self.chains
            .iter()
            .filter(|c| c.family != INSTALLER_FAMILY)
            .find(|c| c.matches(image))
            .or_else(|| self.family(GENERIC_FAMILY))
    }
}

/// Preferred candidates followed by the chain, without repeats.
pub fn candidate_list(preferred: &[String], chain: Option<&FallbackChain>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let fallbacks = chain.map(|c| c.images.as_slice()).unwrap_or_default();
    for image in preferred.iter().chain(fallbacks) {
        let image = image.trim();
        if !image.is_empty() && !out.iter().any(|i| i == image) {
            out.push(image.to_string());
        }
    }
    out
}

/// Image resolution for one provisioning attempt.
///
/// Outcomes are cached for the lifetime of the session only, so a later
/// attempt re-checks images that were unavailable before.
pub struct ResolutionSession {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<FallbackPolicy>,
    outcomes: HashMap<String, bool>,
}

impl ResolutionSession {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: Arc<FallbackPolicy>) -> Self {
        Self {
            runtime,
            policy,
            outcomes: HashMap::new(),
        }
    }

    /// Resolves the runtime image for a blueprint's ordered candidates.
    pub async fn resolve_runtime(&mut self, candidates: &[String]) -> Result<String> {
        let policy = self.policy.clone();
        let primary = candidates.first().map(String::as_str).unwrap_or_default();
        let chain = policy.chain_for(primary);
        let family = chain
            .map(|c| c.family.clone())
            .unwrap_or_else(|| GENERIC_FAMILY.to_string());
        self.resolve(&family, &candidate_list(candidates, chain)).await
    }

    /// Resolves the installer image, preferring the blueprint's own choice.
    pub async fn resolve_installer(&mut self, preferred: Option<&str>) -> Result<String> {
        let policy = self.policy.clone();
        let preferred: Vec<String> = preferred.map(|p| vec![p.to_string()]).unwrap_or_default();
        let candidates = candidate_list(&preferred, policy.family(INSTALLER_FAMILY));
        self.resolve(INSTALLER_FAMILY, &candidates).await
    }

    /// Returns the first candidate that is present or can be pulled.
    pub async fn resolve(&mut self, family: &str, candidates: &[String]) -> Result<String> {
        let mut tried = Vec::new();
        for image in candidates {
            if self.usable(image).await? {
                if !tried.is_empty() {
                    tracing::warn!(family, %image, tried = ?tried, "using fallback image");
                }
                return Ok(image.clone());
            }
            tried.push(image.clone());
        }
        Err(OrchestratorError::ImageResolutionExhausted {
            family: family.to_string(),
            tried,
        })
    }

    async fn usable(&mut self, image: &str) -> Result<bool> {
        if let Some(known) = self.outcomes.get(image) {
            return Ok(*known);
        }
        let ok = match self.runtime.image_present(image).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::info!(%image, "pulling image");
                match self.runtime.pull_image(image).await {
                    Ok(()) => true,
                    Err(RuntimeError::Unavailable(msg)) => {
                        return Err(OrchestratorError::RuntimeUnavailable(msg));
                    }
                    Err(e) => {
                        tracing::warn!(%image, error = %e, "image pull failed");
                        false
                    }
                }
            }
            Err(RuntimeError::Unavailable(msg)) => {
                return Err(OrchestratorError::RuntimeUnavailable(msg));
            }
            Err(e) => {
                tracing::warn!(%image, error = %e, "image inspect failed");
                false
            }
        };
        self.outcomes.insert(image.to_string(), ok);
        Ok(ok)
    }
}
