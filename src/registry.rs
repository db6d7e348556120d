//! Immutable per-handle repository registry.
//!
//! Built once from a validated [`RepoConfig`] and shared read-only (behind an
//! `Arc`) by every request.  Answers two questions: which repository a
//! request path belongs to, and whether a path names a cacheable file.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use reqwest::Url;

use crate::config::{self, RepoConfig};

/// A configured upstream repository.
#[derive(Debug, Clone)]
pub struct Repository {
    pub handle: String,
    pub cache_suffixes: Vec<String>,
    /// Mirror base URLs in failover order.
    pub mirrors: Vec<Url>,
}

impl Repository {
    /// Whether `uri` names a file whose suffix is cacheable for this
    /// repository.  Paths ending in `/` never are.
    pub fn is_candidate(&self, uri: &str) -> bool {
        match filename_from_uri(uri) {
            Some(name) => self
                .cache_suffixes
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str())),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    repositories: BTreeMap<String, Repository>,
}

impl Registry {
    /// Build the registry from a configuration that already passed
    /// validation.
    pub fn from_config(config: &RepoConfig) -> Result<Self> {
        let source = config
            .repositories
            .as_ref()
            .context("missing required key 'repositories'")?;

        let mut repositories = BTreeMap::new();
        for (handle, repo) in source {
            let cache_suffixes = repo
                .cache_suffixes
                .clone()
                .with_context(|| format!("missing required key for repository '{handle}': suffixes"))?;
            let mirrors = repo
                .mirrors
                .as_deref()
                .with_context(|| format!("missing required key for repository '{handle}': mirrors"))?
                .iter()
                .map(|m| config::parse_mirror(m))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("invalid mirror for repository '{handle}'"))?;

            repositories.insert(
                handle.clone(),
                Repository {
                    handle: handle.clone(),
                    cache_suffixes,
                    mirrors,
                },
            );
        }
        Ok(Self { repositories })
    }

    pub fn resolve(&self, handle: &str) -> Option<&Repository> {
        self.repositories.get(handle)
    }

    /// Resolve the repository addressed by the first segment of `uri`.
    pub fn resolve_uri(&self, uri: &str) -> Option<&Repository> {
        handle_from_uri(uri).and_then(|handle| self.resolve(handle))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.values()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

// ---------------------------------------------------------------------------
// URI helpers
// ---------------------------------------------------------------------------

/// Final path segment of `uri`, or `None` when the URI is empty or ends in
/// `/`.
pub fn filename_from_uri(uri: &str) -> Option<&str> {
    if uri.is_empty() || uri.ends_with('/') {
        return None;
    }
    uri.rsplit('/').next().filter(|name| !name.is_empty())
}

/// First path segment of `uri` (`/fedora/x.rpm` -> `fedora`).
pub fn handle_from_uri(uri: &str) -> Option<&str> {
    uri.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

/// Path relative to the repository handle (`/fedora/a/b.rpm` -> `/a/b.rpm`).
/// The result always starts with `/`.
pub fn strip_handle<'a>(uri: &'a str, handle: &str) -> &'a str {
    let trimmed = uri.trim_start_matches('/');
    match trimmed.strip_prefix(handle) {
        Some(rest) if rest.is_empty() => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => uri,
    }
}
