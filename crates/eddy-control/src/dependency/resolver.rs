//! Transitive dependency resolution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

use super::{Coordinate, Exclusion, ExclusionSet};

/// A coordinate fetched from a source.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    /// The coordinate that was fetched.
    pub coordinate: Coordinate,
    /// Local jar path; `None` for pom-only artifacts.
    pub path: Option<PathBuf>,
    /// Direct dependencies declared by the artifact.
    pub dependencies: Vec<Coordinate>,
    /// Progress notes produced while fetching (downloads, skipped entries).
    pub notes: Vec<String>,
}

/// Somewhere coordinates can be fetched from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch a single coordinate and report its direct dependencies.
    async fn fetch(&self, coordinate: &Coordinate) -> ControlResult<ResolvedArtifact>;
}

/// Resolves coordinates breadth-first with nearest-wins conflict resolution.
pub struct DependencyResolver {
    source: Arc<dyn ArtifactSource>,
    global: ExclusionSet,
}

impl DependencyResolver {
    /// Create a resolver; `extra` is added to the built-in exclusions.
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        extra: impl IntoIterator<Item = Exclusion>,
    ) -> Self {
        Self {
            source,
            global: ExclusionSet::builtin().with(extra),
        }
    }

    /// Resolve `coordinates` and their transitive dependencies to local files.
    ///
    /// Every progress line is passed to `on_line`. The first failure aborts
    /// the whole resolution; no partial set is returned.
    pub async fn resolve<F>(
        &self,
        coordinates: &[Coordinate],
        mut on_line: F,
    ) -> ControlResult<Vec<PathBuf>>
    where
        F: FnMut(&str) + Send,
    {
        on_line(&format!("resolving {} coordinate(s)", coordinates.len()));

        let mut queue: VecDeque<(Coordinate, Arc<Vec<Exclusion>>)> = coordinates
            .iter()
            .cloned()
            .map(|c| (c, Arc::new(Vec::new())))
            .collect();
        let mut selected: HashMap<(String, String), String> = HashMap::new();
        let mut seen_paths: HashSet<PathBuf> = HashSet::new();
        let mut paths = Vec::new();

        while let Some((coordinate, inherited)) = queue.pop_front() {
            let (group, artifact) = (&coordinate.group_id, &coordinate.artifact_id);

            if self.global.excludes(group, artifact)
                || inherited.iter().any(|e| e.matches(group, artifact))
            {
                debug!(coordinate = %coordinate, "excluded");
                on_line(&format!("excluding {coordinate}"));
                continue;
            }

            if let Some(version) = selected.get(&coordinate.module()) {
                if *version != coordinate.version {
                    on_line(&format!(
                        "skipping {coordinate}, {group}:{artifact}:{version} already selected"
                    ));
                }
                continue;
            }
            selected.insert(coordinate.module(), coordinate.version.clone());

            let resolved = self.source.fetch(&coordinate).await.map_err(|e| {
                warn!(coordinate = %coordinate, error = %e, "failed to resolve coordinate");
                on_line(&format!("failed to resolve {coordinate}: {e}"));
                match e {
                    ControlError::Resolution(_) => e,
                    other => ControlError::resolution(format!("{coordinate}: {other}")),
                }
            })?;

            for note in &resolved.notes {
                on_line(note);
            }

            if let Some(path) = resolved.path {
                on_line(&format!("resolved {coordinate} -> {}", path.display()));
                if seen_paths.insert(path.clone()) {
                    paths.push(path);
                }
            }

            // Exclusions declared on this coordinate apply to its whole subtree.
            let scope = if coordinate.exclusions.is_empty() {
                inherited
            } else {
                let mut merged = (*inherited).clone();
                merged.extend(coordinate.exclusions.iter().cloned());
                Arc::new(merged)
            };
            for dependency in resolved.dependencies {
                queue.push_back((dependency, Arc::clone(&scope)));
            }
        }

        info!(artifacts = paths.len(), "dependency resolution finished");
        on_line(&format!("resolved {} artifact(s)", paths.len()));
        Ok(paths)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct MapSource(HashMap<String, Vec<Coordinate>>);

    #[async_trait]
    impl ArtifactSource for MapSource {
        async fn fetch(&self, coordinate: &Coordinate) -> ControlResult<ResolvedArtifact> {
            let key = coordinate.to_string();
            let dependencies = self
                .0
                .get(&key)
                .cloned()
                .ok_or_else(|| ControlError::resolution(format!("{key} not found")))?;
            Ok(ResolvedArtifact {
                coordinate: coordinate.clone(),
                path: Some(PathBuf::from(format!("/repo/{key}.jar"))),
                dependencies,
                notes: vec![format!("downloaded {key}")],
            })
        }
    }

    fn source(entries: &[(&str, &[&str])]) -> Arc<dyn ArtifactSource> {
        let map = entries
            .iter()
            .map(|(k, deps)| {
                (
                    (*k).to_owned(),
                    deps.iter().map(|d| d.parse().unwrap()).collect(),
                )
            })
            .collect();
        Arc::new(MapSource(map))
    }

    #[tokio::test]
    async fn resolves_transitively() {
        let resolver = DependencyResolver::new(
            source(&[("g:a:1", &["g:b:1"]), ("g:b:1", &["g:c:1"]), ("g:c:1", &[])]),
            [],
        );
        let paths = resolver
            .resolve(&["g:a:1".parse().unwrap()], |_| {})
            .await
            .unwrap();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[2], PathBuf::from("/repo/g:c:1.jar"));
    }

    #[tokio::test]
    async fn nearest_version_wins() {
        let resolver = DependencyResolver::new(
            source(&[
                ("g:a:1", &["g:b:1"]),
                ("g:b:1", &["g:c:2"]),
                ("g:c:1", &[]),
                ("g:c:2", &[]),
            ]),
            [],
        );
        let mut lines = Vec::new();
        let paths = resolver
            .resolve(
                &["g:a:1".parse().unwrap(), "g:c:1".parse().unwrap()],
                |l| lines.push(l.to_owned()),
            )
            .await
            .unwrap();
        assert!(paths.contains(&PathBuf::from("/repo/g:c:1.jar")));
        assert!(!paths.contains(&PathBuf::from("/repo/g:c:2.jar")));
        assert!(lines.iter().any(|l| l.starts_with("skipping g:c:2")));
    }

    #[tokio::test]
    async fn exclusions_apply_to_subtree_only() {
        let resolver = DependencyResolver::new(
            source(&[
                ("g:a:1", &["g:shared:1"]),
                ("g:b:1", &["g:shared:1"]),
                ("g:shared:1", &[]),
            ]),
            [],
        );
        let excluded = Coordinate::new("g", "a", "1").exclude(Exclusion::new("g", "shared"));
        let paths = resolver
            .resolve(&[excluded.clone()], |_| {})
            .await
            .unwrap();
        assert_eq!(paths, vec![PathBuf::from("/repo/g:a:1.jar")]);

        let paths = resolver
            .resolve(&[excluded, "g:b:1".parse().unwrap()], |_| {})
            .await
            .unwrap();
        assert!(paths.contains(&PathBuf::from("/repo/g:shared:1.jar")));
    }

    #[tokio::test]
    async fn builtin_exclusions_are_applied() {
        let resolver = DependencyResolver::new(
            source(&[("g:a:1", &["org.slf4j:slf4j-api:1.7"])]),
            [Exclusion::new("g", "extra")],
        );
        let paths = resolver
            .resolve(&["g:a:1".parse().unwrap(), "g:extra:1".parse().unwrap()], |_| {})
            .await
            .unwrap();
        assert_eq!(paths, vec![PathBuf::from("/repo/g:a:1.jar")]);
    }

    #[tokio::test]
    async fn failure_aborts_resolution() {
        let resolver = DependencyResolver::new(source(&[("g:a:1", &["g:missing:1"])]), []);
        let mut lines = Vec::new();
        let err = resolver
            .resolve(&["g:a:1".parse().unwrap()], |l| lines.push(l.to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Resolution(_)));
        assert!(lines.last().unwrap().starts_with("failed to resolve g:missing:1"));
    }
}
