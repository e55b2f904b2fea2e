//! Maven repository source.
//!
//! Poms and jars are fetched over HTTP from the configured repositories into a
//! local cache laid out like a Maven local repository. Only the parts of the
//! pom needed for resolution are read: parent, packaging, properties,
//! dependency management and the direct `compile`/`runtime` dependencies with
//! their exclusions. Parents and imported boms are followed so that inherited
//! properties and managed versions apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use regex::Regex;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::{ControlError, ControlResult};

use super::resolver::{ArtifactSource, ResolvedArtifact};
use super::{Coordinate, Exclusion};

const MAX_POM_DEPTH: usize = 16;

/// A dependency as declared in a pom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomDependency {
    /// Group id.
    pub group_id: String,
    /// Artifact id.
    pub artifact_id: String,
    /// Version, if declared here or by dependency management.
    pub version: Option<String>,
    /// Scope, if declared here or by dependency management.
    pub scope: Option<String>,
    /// Whether the dependency is optional.
    pub optional: bool,
    /// Declared exclusions.
    pub exclusions: Vec<Exclusion>,
}

impl PomDependency {
    /// Whether the dependency ends up on the runtime classpath.
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        let scope = self.scope.as_deref().unwrap_or("compile");
        !self.optional && matches!(scope, "compile" | "runtime")
    }

    fn key(&self) -> (&str, &str) {
        (self.group_id.as_str(), self.artifact_id.as_str())
    }

    fn is_import(&self) -> bool {
        self.scope.as_deref() == Some("import")
    }

    fn interpolate(&mut self, patterns: &PomPatterns, properties: &HashMap<String, String>) {
        self.group_id = substitute(patterns, &self.group_id, properties);
        self.artifact_id = substitute(patterns, &self.artifact_id, properties);
        self.version = self.version.as_deref().map(|v| substitute(patterns, v, properties));
    }
}

/// The parts of a pom used for resolution.
#[derive(Debug, Clone, Default)]
pub struct PomModel {
    /// Packaging, `jar` when absent.
    pub packaging: String,
    /// Parent pom, if any.
    pub parent: Option<Coordinate>,
    /// Declared properties plus `project.*` built-ins.
    pub properties: HashMap<String, String>,
    /// Direct dependencies.
    pub dependencies: Vec<PomDependency>,
    /// Entries of `dependencyManagement`.
    pub managed: Vec<PomDependency>,
}

impl PomModel {
    /// Overlay this pom on the effective model of its parent.
    #[must_use]
    pub fn inherit(self, parent: PomModel) -> PomModel {
        let mut properties = parent.properties;
        properties.extend(self.properties);

        let mut managed = self.managed;
        for entry in parent.managed {
            if !managed.iter().any(|m| m.key() == entry.key()) {
                managed.push(entry);
            }
        }

        let mut dependencies = self.dependencies;
        for dependency in parent.dependencies {
            if !dependencies.iter().any(|d| d.key() == dependency.key()) {
                dependencies.push(dependency);
            }
        }

        PomModel {
            packaging: self.packaging,
            parent: self.parent,
            properties,
            dependencies,
            managed,
        }
    }

    /// Add managed entries from an imported bom; entries already managed here win.
    pub fn import(&mut self, bom: PomModel) {
        for entry in bom.managed {
            if !self.managed.iter().any(|m| m.key() == entry.key()) {
                self.managed.push(entry);
            }
        }
    }

    fn interpolate(&mut self, patterns: &PomPatterns) {
        // Properties may refer to each other; a few passes settle any sane chain.
        for _ in 0..4 {
            let snapshot = self.properties.clone();
            let mut changed = false;
            for value in self.properties.values_mut() {
                let next = substitute(patterns, value, &snapshot);
                if next != *value {
                    *value = next;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for dependency in self.dependencies.iter_mut().chain(self.managed.iter_mut()) {
            dependency.interpolate(patterns, &self.properties);
        }
    }

    /// Fill missing versions and scopes of direct dependencies from management.
    fn apply_management(&mut self) {
        for dependency in &mut self.dependencies {
            let Some(entry) = self.managed.iter().find(|m| m.key() == dependency.key()) else {
                continue;
            };
            if dependency.version.is_none() {
                dependency.version.clone_from(&entry.version);
            }
            if dependency.scope.is_none() {
                dependency.scope.clone_from(&entry.scope);
            }
            if dependency.exclusions.is_empty() {
                dependency.exclusions.clone_from(&entry.exclusions);
            }
        }
    }
}

struct PomPatterns {
    comments: Regex,
    sections: Regex,
    management: Regex,
    parent: Regex,
    properties: Regex,
    property: Regex,
    dependencies: Regex,
    dependency: Regex,
    exclusions: Regex,
    exclusion: Regex,
    placeholder: Regex,
}

impl PomPatterns {
    fn new() -> ControlResult<Self> {
        let re = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ControlError::internal(format!("pom pattern: {e}")))
        };
        Ok(Self {
            comments: re(r"(?s)<!--.*?-->")?,
            sections: re(r"(?s)<(build|profiles|reporting)>.*?</(build|profiles|reporting)>")?,
            management: re(r"(?s)<dependencyManagement>(.*?)</dependencyManagement>")?,
            parent: re(r"(?s)<parent>(.*?)</parent>")?,
            properties: re(r"(?s)<properties>(.*?)</properties>")?,
            property: re(r"<([A-Za-z0-9_.\-]+)>\s*([^<]*?)\s*</[A-Za-z0-9_.\-]+>")?,
            dependencies: re(r"(?s)<dependencies>(.*?)</dependencies>")?,
            dependency: re(r"(?s)<dependency>(.*?)</dependency>")?,
            exclusions: re(r"(?s)<exclusions>(.*?)</exclusions>")?,
            exclusion: re(r"(?s)<exclusion>(.*?)</exclusion>")?,
            placeholder: re(r"\$\{([^}]+)\}")?,
        })
    }

    fn dependencies_in(&self, block: &str) -> Vec<PomDependency> {
        let mut dependencies = Vec::new();
        for caps in self.dependency.captures_iter(block) {
            let raw = &caps[1];
            let exclusions = self
                .exclusions
                .captures(raw)
                .map(|block| {
                    self.exclusion
                        .captures_iter(&block[1])
                        .filter_map(|e| {
                            Some(Exclusion::new(
                                tag(&e[1], "groupId")?,
                                tag(&e[1], "artifactId")?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let own = self.exclusions.replace(raw, "");

            let (Some(group_id), Some(artifact_id)) =
                (tag(&own, "groupId"), tag(&own, "artifactId"))
            else {
                continue;
            };
            dependencies.push(PomDependency {
                group_id,
                artifact_id,
                version: tag(&own, "version"),
                scope: tag(&own, "scope"),
                optional: tag(&own, "optional").is_some_and(|v| v == "true"),
                exclusions,
            });
        }
        dependencies
    }
}

fn tag(xml: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_owned())
}

fn substitute(patterns: &PomPatterns, value: &str, properties: &HashMap<String, String>) -> String {
    patterns
        .placeholder
        .replace_all(value, |caps: &regex::Captures<'_>| {
            properties
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}

/// Parse a single pom document, interpolating its own properties.
///
/// Inherited properties and managed versions are not applied; see
/// [`PomModel::inherit`].
pub fn parse_pom(xml: &str) -> ControlResult<PomModel> {
    let patterns = PomPatterns::new()?;
    let mut model = parse_with(&patterns, xml);
    model.interpolate(&patterns);
    model.apply_management();
    Ok(model)
}

fn parse_with(patterns: &PomPatterns, xml: &str) -> PomModel {
    let xml = patterns.comments.replace_all(xml, "");
    let stripped = patterns.sections.replace_all(&xml, "");

    let managed = patterns
        .management
        .captures(&stripped)
        .map(|c| patterns.dependencies_in(&c[1]))
        .unwrap_or_default();
    let body = patterns.management.replace_all(&stripped, "");

    let parent = patterns
        .parent
        .captures(&body)
        .map(|c| c[1].to_owned())
        .unwrap_or_default();
    let top = patterns.parent.replace(&body, "");
    let top = patterns.dependencies.replace_all(&top, "");
    let top = patterns.properties.replace_all(&top, "");

    let mut properties = HashMap::new();
    if let Some(block) = patterns.properties.captures(&body) {
        for caps in patterns.property.captures_iter(&block[1]) {
            properties.insert(caps[1].to_owned(), caps[2].to_owned());
        }
    }

    let group_id = tag(&top, "groupId").or_else(|| tag(&parent, "groupId"));
    let version = tag(&top, "version").or_else(|| tag(&parent, "version"));
    if let Some(group_id) = group_id {
        properties.insert("project.groupId".to_owned(), group_id);
    }
    if let Some(version) = version {
        properties.insert("project.version".to_owned(), version.clone());
        properties.insert("version".to_owned(), version);
    }
    if let Some(artifact_id) = tag(&top, "artifactId") {
        properties.insert("project.artifactId".to_owned(), artifact_id);
    }
    if let Some(parent_version) = tag(&parent, "version") {
        properties.insert("project.parent.version".to_owned(), parent_version);
    }

    let parent = match (
        tag(&parent, "groupId"),
        tag(&parent, "artifactId"),
        tag(&parent, "version"),
    ) {
        (Some(group_id), Some(artifact_id), Some(version)) => {
            Some(Coordinate::new(group_id, artifact_id, version))
        }
        _ => None,
    };

    let dependencies = patterns
        .dependencies
        .captures(&body)
        .map(|c| patterns.dependencies_in(&c[1]))
        .unwrap_or_default();

    PomModel {
        packaging: tag(&top, "packaging").unwrap_or_else(|| "jar".to_owned()),
        parent,
        properties,
        dependencies,
        managed,
    }
}

/// Repository-relative path of a coordinate's file with the given extension.
#[must_use]
pub fn relative_path(coordinate: &Coordinate, extension: &str) -> String {
    format!(
        "{}/{}/{}/{}-{}.{}",
        coordinate.group_id.replace('.', "/"),
        coordinate.artifact_id,
        coordinate.version,
        coordinate.artifact_id,
        coordinate.version,
        extension
    )
}

/// Check `content` against a published `.sha256` file body.
pub fn verify_checksum(path: &str, content: &[u8], published: &str) -> ControlResult<()> {
    let expected = published
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let actual = hex(&Sha256::digest(content));
    if expected == actual {
        Ok(())
    } else {
        Err(ControlError::resolution(format!(
            "checksum mismatch for {path}: expected {expected}, got {actual}"
        )))
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Maven repository client with a local file cache.
pub struct MavenRepository {
    client: Client,
    repositories: Vec<String>,
    local: PathBuf,
    patterns: PomPatterns,
}

impl MavenRepository {
    /// Create a repository client from configuration.
    pub fn new(config: &ResolverConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            repositories: config
                .repositories
                .iter()
                .map(|r| r.trim_end_matches('/').to_owned())
                .collect(),
            local: config.local_repository.clone(),
            patterns: PomPatterns::new()?,
        })
    }

    /// Try each repository in turn; a miss or an unreachable repository moves
    /// on to the next one.
    async fn download(&self, relative: &str) -> ControlResult<Option<(String, Bytes)>> {
        let mut failure = None;
        for repository in &self.repositories {
            let url = format!("{repository}/{relative}");
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, error = %e, "repository unreachable");
                    failure = Some(ControlError::Http(e));
                    continue;
                }
            };
            match response.status() {
                StatusCode::NOT_FOUND => {}
                status if status.is_success() => match response.bytes().await {
                    Ok(body) => return Ok(Some((url, body))),
                    Err(e) => {
                        warn!(url = %url, error = %e, "download interrupted");
                        failure = Some(ControlError::Http(e));
                    }
                },
                status => {
                    warn!(url = %url, status = %status, "repository error");
                    failure = Some(ControlError::resolution(format!("{url} returned {status}")));
                }
            }
        }
        failure.map_or(Ok(None), Err)
    }

    /// Return the cached file, downloading and verifying it if needed.
    async fn cached(&self, relative: &str, notes: &mut Vec<String>) -> ControlResult<Option<PathBuf>> {
        let path = self.local.join(relative);
        if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "cache hit");
            return Ok(Some(path));
        }

        let Some((url, body)) = self.download(relative).await? else {
            return Ok(None);
        };
        match self.download(&format!("{relative}.sha256")).await {
            Ok(Some((_, published))) => {
                verify_checksum(relative, &body, &String::from_utf8_lossy(&published))?;
            }
            Ok(None) => {}
            Err(e) => warn!(path = relative, error = %e, "checksum download failed"),
        }

        write_atomic(&path, &body).await?;
        notes.push(format!("downloaded {url} ({} bytes)", body.len()));
        Ok(Some(path))
    }

    /// A pom with its parents folded in, properties interpolated and imported
    /// boms applied.
    fn effective_model<'a>(
        &'a self,
        coordinate: &'a Coordinate,
        notes: &'a mut Vec<String>,
        depth: usize,
    ) -> BoxFuture<'a, ControlResult<PomModel>> {
        Box::pin(async move {
            let mut chain = Vec::new();
            let mut next = Some(coordinate.clone());
            while let Some(current) = next {
                if chain.len() + depth >= MAX_POM_DEPTH {
                    return Err(ControlError::resolution(format!(
                        "pom hierarchy of {coordinate} is nested too deeply"
                    )));
                }
                let path = self
                    .cached(&relative_path(&current, "pom"), notes)
                    .await?
                    .ok_or_else(|| {
                        if chain.is_empty() {
                            ControlError::resolution(format!(
                                "{current} not found in any repository"
                            ))
                        } else {
                            ControlError::resolution(format!(
                                "parent {current} of {coordinate} not found in any repository"
                            ))
                        }
                    })?;
                let model = parse_with(&self.patterns, &tokio::fs::read_to_string(&path).await?);
                next = model.parent.clone();
                chain.push(model);
            }

            let mut effective = chain.pop().unwrap_or_default();
            while let Some(child) = chain.pop() {
                effective = child.inherit(effective);
            }
            effective.interpolate(&self.patterns);

            let imports: Vec<Coordinate> = effective
                .managed
                .iter()
                .filter(|m| m.is_import())
                .filter_map(|m| {
                    Some(Coordinate::new(&m.group_id, &m.artifact_id, m.version.as_deref()?))
                })
                .collect();
            for bom in imports {
                let model = self.effective_model(&bom, notes, depth + 1).await?;
                effective.import(model);
            }

            effective.apply_management();
            Ok(effective)
        })
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> ControlResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = path.with_extension("part");
    tokio::fs::write(&partial, body).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}

#[async_trait]
impl ArtifactSource for MavenRepository {
    async fn fetch(&self, coordinate: &Coordinate) -> ControlResult<ResolvedArtifact> {
        let mut notes = Vec::new();
        let model = self.effective_model(coordinate, &mut notes, 0).await?;

        let path = if model.packaging == "pom" {
            None
        } else {
            Some(
                self.cached(&relative_path(coordinate, "jar"), &mut notes)
                    .await?
                    .ok_or_else(|| ControlError::resolution(format!("{coordinate} has no jar")))?,
            )
        };

        let mut dependencies = Vec::new();
        for dependency in model.dependencies.into_iter().filter(PomDependency::is_runtime) {
            let Some(version) = dependency.version.filter(|v| !v.contains("${")) else {
                return Err(ControlError::resolution(format!(
                    "{}:{} declared by {coordinate} has no resolvable version",
                    dependency.group_id, dependency.artifact_id
                )));
            };
            dependencies.push(Coordinate {
                group_id: dependency.group_id,
                artifact_id: dependency.artifact_id,
                version,
                exclusions: dependency.exclusions,
            });
        }

        Ok(ResolvedArtifact {
            coordinate: coordinate.clone(),
            path,
            dependencies,
            notes,
        })
    }
}
