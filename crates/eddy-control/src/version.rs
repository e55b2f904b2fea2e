//! Definition version diffing and `latest`/`effective` bookkeeping.
//!
//! A SQL update is compared three ways: against the *target* version the
//! editor started from, against the current *latest* candidate, and against
//! the *effective* version backing the live run. Dependency changes relative
//! to what is live need a redeploy; SQL-only changes need a restart.

use std::sync::Arc;

use tracing::{debug, info};

use crate::dependency::DependencyDescriptor;
use crate::error::{ControlError, ControlResult};
use crate::state::DeployMarker;
use crate::store::JobStore;
use crate::types::{
    ApplicationId, ConfigDefinition, DefinitionBody, DefinitionKind, DefinitionVersion,
    SqlDefinition, VersionId,
};

/// A submitted SQL definition.
#[derive(Debug, Clone)]
pub struct SqlCandidate {
    /// The version the editor started from.
    pub version_id: VersionId,
    /// Submitted SQL text.
    pub text: String,
    /// Submitted dependencies.
    pub dependency: DependencyDescriptor,
}

impl SqlCandidate {
    fn differs_from(&self, other: &SqlDefinition) -> bool {
        other.text_differs(&self.text) || other.dependency != self.dependency
    }

    fn to_body(&self) -> DefinitionBody {
        DefinitionBody::Sql(SqlDefinition {
            text: self.text.trim().to_owned(),
            dependency: self.dependency.clone(),
        })
    }
}

/// Outcome of comparing a candidate with the target and effective versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDiff {
    /// SQL text differs from the target.
    pub sql: bool,
    /// Dependencies differ from the target.
    pub deps: bool,
    /// Dependencies differ from the effective version.
    pub effective_deps: bool,
    /// The candidate was edited from a version other than the effective one.
    pub version_changed: bool,
}

impl SqlDiff {
    /// Compare a candidate with its target and the effective version.
    #[must_use]
    pub fn compute(
        candidate: &SqlCandidate,
        target: &SqlDefinition,
        effective_id: &VersionId,
        effective: &SqlDefinition,
    ) -> Self {
        Self {
            sql: target.text_differs(&candidate.text),
            deps: target.dependency != candidate.dependency,
            effective_deps: effective.dependency != candidate.dependency,
            version_changed: &candidate.version_id != effective_id,
        }
    }

    /// Whether content differs from the target at all.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.sql || self.deps
    }

    /// Placement of a new row when no candidate exists yet.
    #[must_use]
    pub const fn target_latest(&self, running: bool) -> bool {
        self.deps || running
    }

    /// Placement of a new row replacing an existing candidate, or of a relabel.
    #[must_use]
    pub const fn effective_latest(&self, running: bool) -> bool {
        self.effective_deps || running
    }

    /// Whether a changed configuration should wait as a candidate.
    #[must_use]
    pub const fn config_latest(&self, running: bool) -> bool {
        self.effective_deps || (self.sql && self.target_latest(running)) || (!self.sql && running)
    }

    /// Remediation the change requires, if any.
    #[must_use]
    pub const fn marker(&self) -> Option<DeployMarker> {
        if self.effective_deps {
            Some(DeployMarker::NeedDeployAfterDependencyUpdate)
        } else if self.sql {
            Some(DeployMarker::NeedRestartAfterSqlUpdate)
        } else {
            None
        }
    }
}

/// What to do with the version rows for a SQL update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionAction {
    /// Nothing to record.
    Unchanged,
    /// Insert a new row, as the latest candidate or directly as effective.
    Create {
        /// `true` for latest, `false` for effective.
        latest: bool,
    },
    /// Move flags onto an existing row.
    Relabel {
        /// Row to relabel.
        version_id: VersionId,
        /// `true` for latest, `false` for effective.
        latest: bool,
    },
}

/// Decide how a SQL update changes the version rows.
#[must_use]
pub fn plan_sql_update(
    diff: &SqlDiff,
    running: bool,
    candidate: &SqlCandidate,
    latest: Option<&SqlDefinition>,
) -> VersionAction {
    if diff.any() {
        match latest {
            None => VersionAction::Create {
                latest: diff.target_latest(running),
            },
            Some(latest) if candidate.differs_from(latest) => VersionAction::Create {
                latest: diff.effective_latest(running),
            },
            Some(_) => VersionAction::Unchanged,
        }
    } else if diff.version_changed {
        VersionAction::Relabel {
            version_id: candidate.version_id.clone(),
            latest: diff.effective_latest(running),
        }
    } else {
        VersionAction::Unchanged
    }
}

/// Result of applying a SQL update.
#[derive(Debug, Clone)]
pub struct SqlUpdate {
    /// The computed diff.
    pub diff: SqlDiff,
    /// The action taken on version rows.
    pub action: VersionAction,
}

/// Version bookkeeping on top of a [`JobStore`].
#[derive(Clone)]
pub struct VersionBook {
    store: Arc<dyn JobStore>,
}

impl VersionBook {
    /// Create a version book over a store.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// The current latest row of a kind.
    pub async fn latest(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Option<DefinitionVersion>> {
        Ok(self
            .store
            .list_versions(app_id, kind)
            .await?
            .into_iter()
            .find(|v| v.latest))
    }

    /// The current effective row of a kind.
    pub async fn effective(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Option<DefinitionVersion>> {
        Ok(self
            .store
            .list_versions(app_id, kind)
            .await?
            .into_iter()
            .find(|v| v.effective))
    }

    /// The effective row, falling back to the latest one before the first deploy.
    pub async fn effective_or_latest(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Option<DefinitionVersion>> {
        let versions = self.store.list_versions(app_id, kind).await?;
        let effective = versions.iter().position(|v| v.effective);
        let chosen = effective.or_else(|| versions.iter().position(|v| v.latest));
        Ok(chosen.and_then(|i| versions.into_iter().nth(i)))
    }

    /// Record a definition as the first candidate of its kind.
    pub async fn record_initial(
        &self,
        app_id: &ApplicationId,
        body: DefinitionBody,
    ) -> ControlResult<DefinitionVersion> {
        let mut version = DefinitionVersion::new(app_id.clone(), body);
        version.latest = true;
        self.store.insert_version(&version).await?;
        Ok(version)
    }

    async fn create(
        &self,
        app_id: &ApplicationId,
        body: DefinitionBody,
        latest: bool,
    ) -> ControlResult<VersionId> {
        let mut version = DefinitionVersion::new(app_id.clone(), body);
        version.latest = latest;
        version.effective = !latest;
        self.store.insert_version(&version).await?;
        debug!(app_id = %app_id, version = %version.id, latest, "created definition version");
        Ok(version.id)
    }

    async fn relabel(&self, app_id: &ApplicationId, id: &VersionId, latest: bool) -> ControlResult<()> {
        if latest {
            self.store.set_latest(app_id, id).await
        } else {
            self.store.set_effective(app_id, id).await
        }
    }

    /// Diff a SQL candidate and record the resulting version rows.
    pub async fn apply_sql_update(
        &self,
        app_id: &ApplicationId,
        running: bool,
        candidate: &SqlCandidate,
    ) -> ControlResult<SqlUpdate> {
        let target = self
            .store
            .get_version(&candidate.version_id)
            .await?
            .filter(|v| &v.app_id == app_id)
            .ok_or_else(|| ControlError::VersionNotFound(candidate.version_id.to_string()))?;
        let target_sql = target
            .as_sql()
            .ok_or_else(|| ControlError::VersionNotFound(candidate.version_id.to_string()))?;

        let effective = self
            .effective_or_latest(app_id, DefinitionKind::Sql)
            .await?
            .ok_or_else(|| ControlError::VersionNotFound(format!("no sql version for {app_id}")))?;
        let effective_sql = effective
            .as_sql()
            .ok_or_else(|| ControlError::internal("effective version is not sql"))?;

        let diff = SqlDiff::compute(candidate, target_sql, &effective.id, effective_sql);
        let latest = self.latest(app_id, DefinitionKind::Sql).await?;
        let action = plan_sql_update(
            &diff,
            running,
            candidate,
            latest.as_ref().and_then(DefinitionVersion::as_sql),
        );

        match &action {
            VersionAction::Unchanged => {}
            VersionAction::Create { latest } => {
                self.create(app_id, candidate.to_body(), *latest).await?;
            }
            VersionAction::Relabel { version_id, latest } => {
                self.relabel(app_id, version_id, *latest).await?;
            }
        }

        info!(
            app_id = %app_id,
            sql_diff = diff.sql,
            deps_diff = diff.deps,
            effective_deps_diff = diff.effective_deps,
            version_changed = diff.version_changed,
            action = ?action,
            "applied sql update"
        );
        Ok(SqlUpdate { diff, action })
    }

    /// Record a configuration document if it differs from the current one.
    ///
    /// The comparison is against the latest candidate, or the effective row
    /// when there is no candidate. Returns whether a row was created.
    pub async fn apply_config(
        &self,
        app_id: &ApplicationId,
        config: &ConfigDefinition,
        latest: bool,
    ) -> ControlResult<bool> {
        let current = match self.latest(app_id, DefinitionKind::Config).await? {
            Some(latest) => Some(latest),
            None => self.effective(app_id, DefinitionKind::Config).await?,
        };
        let normalised = ConfigDefinition {
            format: config.format,
            content: config.content.trim().to_owned(),
        };
        if current.as_ref().and_then(DefinitionVersion::as_config) == Some(&normalised) {
            return Ok(false);
        }
        self.create(app_id, DefinitionBody::Config(normalised), latest)
            .await?;
        Ok(true)
    }

    /// Promote the latest candidates of every kind to effective.
    ///
    /// Returns the number of kinds promoted.
    pub async fn promote(&self, app_id: &ApplicationId) -> ControlResult<usize> {
        let mut promoted = 0;
        for kind in [DefinitionKind::Sql, DefinitionKind::Config] {
            if let Some(latest) = self.latest(app_id, kind).await? {
                self.store.set_effective(app_id, &latest.id).await?;
                debug!(app_id = %app_id, version = %latest.id, ?kind, "promoted to effective");
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Versions of one kind, newest first.
    pub async fn history(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Vec<DefinitionVersion>> {
        self.store.list_versions(app_id, kind).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dependency::Coordinate;
    use crate::store::MemoryStore;
    use crate::types::ConfigFormat;

    fn deps(version: &str) -> DependencyDescriptor {
        DependencyDescriptor::from_coordinates(vec![Coordinate::new("grp", "art", version)])
    }

    fn sql(text: &str, version: &str) -> SqlDefinition {
        SqlDefinition {
            text: text.to_owned(),
            dependency: deps(version),
        }
    }

    fn candidate(id: &VersionId, text: &str, version: &str) -> SqlCandidate {
        SqlCandidate {
            version_id: id.clone(),
            text: text.to_owned(),
            dependency: deps(version),
        }
    }

    #[test]
    fn diff_flags() {
        let effective_id = VersionId::new("v1");
        let c = candidate(&effective_id, "SELECT 1", "2");
        let diff = SqlDiff::compute(&c, &sql("SELECT 1", "1"), &effective_id, &sql("SELECT 1", "1"));
        assert_eq!(
            diff,
            SqlDiff {
                sql: false,
                deps: true,
                effective_deps: true,
                version_changed: false
            }
        );
        assert_eq!(diff.marker(), Some(DeployMarker::NeedDeployAfterDependencyUpdate));
    }

    #[test]
    fn sql_only_change_needs_restart() {
        let id = VersionId::new("v1");
        let c = candidate(&id, "SELECT 2", "1");
        let diff = SqlDiff::compute(&c, &sql("SELECT 1", "1"), &id, &sql("SELECT 1", "1"));
        assert_eq!(diff.marker(), Some(DeployMarker::NeedRestartAfterSqlUpdate));
        assert!(!diff.target_latest(false));
        assert!(diff.target_latest(true));
    }

    #[test]
    fn plan_without_latest_row() {
        let id = VersionId::new("v1");
        let c = candidate(&id, "SELECT 2", "1");
        let diff = SqlDiff::compute(&c, &sql("SELECT 1", "1"), &id, &sql("SELECT 1", "1"));

        assert_eq!(
            plan_sql_update(&diff, false, &c, None),
            VersionAction::Create { latest: false }
        );
        assert_eq!(
            plan_sql_update(&diff, true, &c, None),
            VersionAction::Create { latest: true }
        );
    }

    #[test]
    fn plan_skips_row_identical_to_latest() {
        let id = VersionId::new("v1");
        let c = candidate(&id, "SELECT 2", "1");
        let diff = SqlDiff::compute(&c, &sql("SELECT 1", "1"), &id, &sql("SELECT 1", "1"));
        let latest = sql("  SELECT 2 ", "1");

        assert_eq!(
            plan_sql_update(&diff, false, &c, Some(&latest)),
            VersionAction::Unchanged
        );
    }

    #[test]
    fn plan_relabels_on_version_switch() {
        let effective_id = VersionId::new("v2");
        let older = VersionId::new("v1");
        let c = candidate(&older, "SELECT 1", "1");
        let diff = SqlDiff::compute(&c, &sql("SELECT 1", "1"), &effective_id, &sql("SELECT 2", "1"));

        assert_eq!(
            plan_sql_update(&diff, false, &c, None),
            VersionAction::Relabel {
                version_id: older.clone(),
                latest: false
            }
        );
        assert_eq!(
            plan_sql_update(&diff, true, &c, None),
            VersionAction::Relabel {
                version_id: older,
                latest: true
            }
        );
    }

    #[tokio::test]
    async fn dependency_change_creates_latest_candidate() {
        let store = Arc::new(MemoryStore::new());
        let book = VersionBook::new(store.clone());
        let app_id = ApplicationId::new("app");

        let first = book
            .record_initial(&app_id, DefinitionBody::Sql(sql("SELECT 1", "1")))
            .await
            .unwrap();
        book.promote(&app_id).await.unwrap();

        let update = book
            .apply_sql_update(&app_id, false, &candidate(&first.id, "SELECT 1", "2"))
            .await
            .unwrap();
        assert_eq!(update.action, VersionAction::Create { latest: true });

        let latest = book.latest(&app_id, DefinitionKind::Sql).await.unwrap().unwrap();
        assert_eq!(latest.as_sql().unwrap().dependency, deps("2"));
        let effective = book
            .effective(&app_id, DefinitionKind::Sql)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(effective.id, first.id);

        let again = book
            .apply_sql_update(&app_id, false, &candidate(&first.id, "SELECT 1", "2"))
            .await
            .unwrap();
        assert_eq!(again.action, VersionAction::Unchanged);
        assert_eq!(book.history(&app_id, DefinitionKind::Sql).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_target_version() {
        let store = Arc::new(MemoryStore::new());
        let book = VersionBook::new(store);
        let app_id = ApplicationId::new("app");
        book.record_initial(&app_id, DefinitionBody::Sql(sql("SELECT 1", "1")))
            .await
            .unwrap();

        let err = book
            .apply_sql_update(&app_id, false, &candidate(&VersionId::new("nope"), "x", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::VersionNotFound(_)));
    }

    #[tokio::test]
    async fn config_is_recorded_only_when_changed() {
        let store = Arc::new(MemoryStore::new());
        let book = VersionBook::new(store);
        let app_id = ApplicationId::new("app");
        let config = ConfigDefinition {
            format: ConfigFormat::Yaml,
            content: "parallelism: 2\n".to_owned(),
        };

        assert!(book.apply_config(&app_id, &config, false).await.unwrap());
        assert!(!book.apply_config(&app_id, &config, true).await.unwrap());

        let changed = ConfigDefinition {
            content: "parallelism: 4".to_owned(),
            ..config
        };
        assert!(book.apply_config(&app_id, &changed, true).await.unwrap());
        let latest = book
            .latest(&app_id, DefinitionKind::Config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.as_config().unwrap().content, "parallelism: 4");

        book.promote(&app_id).await.unwrap();
        let effective = book
            .effective(&app_id, DefinitionKind::Config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(effective.id, latest.id);
        assert!(book.latest(&app_id, DefinitionKind::Config).await.unwrap().is_none());
    }
}
