//! Dependency descriptors and resolution.
//!
//! A SQL job declares its extra classpath as a [`DependencyDescriptor`]: build
//! coordinates to resolve from artifact repositories plus jars that were
//! uploaded ahead of time. The [`DependencyResolver`] turns the coordinates
//! into local files, streaming progress through a [`ResolutionLog`].

mod log;
mod maven;
mod resolver;

pub use log::ResolutionLog;
pub use maven::{parse_pom, MavenRepository, PomDependency, PomModel};
pub use resolver::{ArtifactSource, DependencyResolver, ResolvedArtifact};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Exclusions that are always applied: logging bindings and shading shims
/// that clash with the cluster's own classpath.
pub const BUILTIN_EXCLUSIONS: &[(&str, &str)] = &[
    ("org.apache.flink", "force-shading"),
    ("com.google.code.findbugs", "jsr305"),
    ("org.slf4j", "*"),
    ("org.apache.logging.log4j", "*"),
];

/// A `group:artifact` exclusion; either part may be `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    /// Group pattern.
    pub group_id: String,
    /// Artifact pattern.
    pub artifact_id: String,
}

impl Exclusion {
    /// Create a new exclusion.
    #[must_use]
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
        }
    }

    /// Whether this exclusion covers `group:artifact`.
    #[must_use]
    pub fn matches(&self, group_id: &str, artifact_id: &str) -> bool {
        (self.group_id == "*" || self.group_id == group_id)
            && (self.artifact_id == "*" || self.artifact_id == artifact_id)
    }
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)
    }
}

/// A `group:artifact:version` build coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    /// Group id.
    pub group_id: String,
    /// Artifact id.
    pub artifact_id: String,
    /// Version.
    pub version: String,
    /// Exclusions applied to this coordinate's transitive dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<Exclusion>,
}

impl Coordinate {
    /// Create a coordinate without exclusions.
    #[must_use]
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            exclusions: Vec::new(),
        }
    }

    /// Add an exclusion.
    #[must_use]
    pub fn exclude(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    /// The `group:artifact` pair used for version conflict resolution.
    #[must_use]
    pub fn module(&self) -> (String, String) {
        (self.group_id.clone(), self.artifact_id.clone())
    }

    fn sort_key(&self) -> (String, String, String, BTreeSet<Exclusion>) {
        (
            self.group_id.clone(),
            self.artifact_id.clone(),
            self.version.clone(),
            self.exclusions.iter().cloned().collect(),
        )
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

impl std::str::FromStr for Coordinate {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(g), Some(a), Some(v), None) if !g.is_empty() && !a.is_empty() && !v.is_empty() => {
                Ok(Self::new(g, a, v))
            }
            _ => Err(ControlError::resolution(format!(
                "invalid coordinate '{s}', expected group:artifact:version"
            ))),
        }
    }
}

/// Build coordinates plus pre-uploaded jars a job depends on.
///
/// Equality ignores ordering of coordinates, exclusions and jars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    /// Coordinates to resolve.
    #[serde(default)]
    pub pom: Vec<Coordinate>,
    /// Names of jars previously uploaded to the shared uploads area.
    #[serde(default)]
    pub jar: Vec<String>,
}

impl DependencyDescriptor {
    /// Create a descriptor from coordinates only.
    #[must_use]
    pub fn from_coordinates(pom: Vec<Coordinate>) -> Self {
        Self {
            pom,
            jar: Vec::new(),
        }
    }

    /// Whether there is nothing to resolve or copy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pom.is_empty() && self.jar.is_empty()
    }
}

impl PartialEq for DependencyDescriptor {
    fn eq(&self, other: &Self) -> bool {
        let poms = |d: &Self| d.pom.iter().map(Coordinate::sort_key).collect::<BTreeSet<_>>();
        let jars = |d: &Self| d.jar.iter().cloned().collect::<BTreeSet<_>>();
        poms(self) == poms(other) && jars(self) == jars(other)
    }
}

impl Eq for DependencyDescriptor {}

/// Exclusions applied to every coordinate in a resolution.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    exclusions: Vec<Exclusion>,
}

impl ExclusionSet {
    /// The built-in denylist.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            exclusions: BUILTIN_EXCLUSIONS
                .iter()
                .map(|(g, a)| Exclusion::new(*g, *a))
                .collect(),
        }
    }

    /// Add exclusions, skipping duplicates.
    #[must_use]
    pub fn with(mut self, extra: impl IntoIterator<Item = Exclusion>) -> Self {
        for exclusion in extra {
            if !self.exclusions.contains(&exclusion) {
                self.exclusions.push(exclusion);
            }
        }
        self
    }

    /// Whether any exclusion covers `group:artifact`.
    #[must_use]
    pub fn excludes(&self, group_id: &str, artifact_id: &str) -> bool {
        self.exclusions
            .iter()
            .any(|e| e.matches(group_id, artifact_id))
    }

    /// Iterate over the exclusions.
    pub fn iter(&self) -> impl Iterator<Item = &Exclusion> {
        self.exclusions.iter()
    }
}
