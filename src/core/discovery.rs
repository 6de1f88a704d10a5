//! Test discovery
//!
//! Discovery proper (reading test metadata out of compiled images) is the
//! host's business. The crate only needs the resulting [`TestCase`] list;
//! [`ManifestDiscoverer`] reads it from a TOML manifest.

use super::image::containing_dir;
use super::model::{TestCase, TestTrait};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Manifest could not be read
    #[error("Failed to read test manifest {path}: {source}")]
    Io {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Manifest could not be parsed
    #[error("Invalid test manifest {path}: {message}")]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Parser message
        message: String,
    },
}

/// Source of test cases
pub trait TestDiscoverer {
    /// Every discovered test
    fn discover(&self) -> Result<Vec<TestCase>, DiscoveryError>;
}

/// Test list stored as TOML
///
/// ```toml
/// [[tests]]
/// name = "Tests.Math.Add"
/// source = "bin/Tests.pe"
///
/// [[tests]]
/// name = "Tests.Math.Init"
/// source = "bin/Tests.pe"
/// traits = [{ name = "Type", value = "Setup" }]
/// ```
///
/// `display_name` defaults to the last segment of `name`; relative sources
/// resolve against the manifest's directory.
#[derive(Debug, Clone)]
pub struct ManifestDiscoverer {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    tests: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    source: PathBuf,
    #[serde(default)]
    traits: Vec<TestTrait>,
}

impl ManifestDiscoverer {
    /// Discoverer for the manifest at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse manifest text, resolving sources against `base`
    pub fn parse(content: &str, base: &Path) -> Result<Vec<TestCase>, toml::de::Error> {
        let manifest: Manifest = toml::from_str(content)?;
        Ok(manifest
            .tests
            .into_iter()
            .map(|entry| {
                let display_name = entry.display_name.unwrap_or_else(|| {
                    entry
                        .name
                        .rsplit('.')
                        .next()
                        .unwrap_or(&entry.name)
                        .to_string()
                });
                let source = if entry.source.is_absolute() {
                    entry.source
                } else {
                    base.join(entry.source)
                };
                TestCase {
                    fully_qualified_name: entry.name,
                    display_name,
                    source,
                    traits: entry.traits,
                }
            })
            .collect())
    }
}

impl TestDiscoverer for ManifestDiscoverer {
    fn discover(&self) -> Result<Vec<TestCase>, DiscoveryError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| DiscoveryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let base = containing_dir(&self.path);
        Self::parse(&content, base).map_err(|e| DiscoveryError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

/// Group tests by source image, keeping first-seen order
pub fn group_by_source(tests: &[TestCase]) -> Vec<(PathBuf, Vec<TestCase>)> {
    let mut groups: Vec<(PathBuf, Vec<TestCase>)> = Vec::new();
    for test in tests {
        match groups.iter_mut().find(|(source, _)| *source == test.source) {
            Some((_, group)) => group.push(test.clone()),
            None => groups.push((test.source.clone(), vec![test.clone()])),
        }
    }
    groups
}
