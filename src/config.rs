use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

/// Allowed characters for a repository handle.  Pure alphanumeric handles
/// from older configurations are a subset of this.
static HANDLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_~.-]+$").expect("handle pattern is valid"));

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The `repositories` document handed to the proxy at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Kept optional so a missing key yields a descriptive error instead of
    /// a generic serde message.
    pub repositories: Option<BTreeMap<String, RepositoryConfig>>,
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Filename suffixes that make a request a cache candidate (e.g. `.rpm`).
    #[serde(rename = "suffixes")]
    pub cache_suffixes: Option<Vec<String>>,
    /// Upstream base URLs in failover order.
    #[serde(alias = "upstreams")]
    pub mirrors: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`RepoConfig`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RepoConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML document.  Either the whole document is
/// accepted or an error is returned.
pub fn parse_config(contents: &str) -> Result<RepoConfig> {
    let config: RepoConfig =
        serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks that cannot be expressed purely with serde.
fn validate_config(config: &RepoConfig) -> Result<()> {
    let Some(repositories) = &config.repositories else {
        anyhow::bail!("missing required key 'repositories'");
    };

    for (handle, repo) in repositories {
        anyhow::ensure!(
            is_valid_handle(handle),
            "invalid repository name '{handle}'. Must be alphanumeric or in '-', '_', '.', '~'"
        );

        let Some(suffixes) = &repo.cache_suffixes else {
            anyhow::bail!("missing required key for repository '{handle}': suffixes");
        };
        anyhow::ensure!(
            !suffixes.is_empty(),
            "repository '{handle}' must list at least one suffix"
        );
        anyhow::ensure!(
            suffixes.iter().all(|s| !s.is_empty()),
            "repository '{handle}' has an empty suffix"
        );

        let Some(mirrors) = &repo.mirrors else {
            anyhow::bail!("missing required key for repository '{handle}': mirrors");
        };
        anyhow::ensure!(
            !mirrors.is_empty(),
            "repository '{handle}' must list at least one mirror"
        );
        for mirror in mirrors {
            parse_mirror(mirror)
                .with_context(|| format!("invalid mirror for repository '{handle}'"))?;
        }
    }
    Ok(())
}

pub fn is_valid_handle(handle: &str) -> bool {
    HANDLE_PATTERN.is_match(handle)
}

/// Parse a mirror base URL, accepting only absolute `http`/`https` URLs.
pub fn parse_mirror(mirror: &str) -> Result<Url> {
    let url = Url::parse(mirror).with_context(|| format!("'{mirror}' is not a valid URL"))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "'{mirror}' must use http or https"
    );
    anyhow::ensure!(url.host_str().is_some(), "'{mirror}' has no host");
    Ok(url)
}
