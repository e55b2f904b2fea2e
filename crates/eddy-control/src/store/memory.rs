//! In-memory job store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::state::OptionState;
use crate::types::{
    Application, ApplicationId, ApplicationLog, ApplicationPatch, DefinitionKind,
    DefinitionVersion, SavePoint, VersionId,
};

use super::{ApplicationFilter, JobStore};

/// In-memory job store.
///
/// Data is lost when the process exits. Rows that need ordering are kept in
/// insertion order so that "newest first" is stable even for equal timestamps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    applications: RwLock<HashMap<ApplicationId, Application>>,
    versions: RwLock<Vec<DefinitionVersion>>,
    savepoints: RwLock<Vec<SavePoint>>,
    logs: RwLock<Vec<ApplicationLog>>,
}

fn read<T>(lock: &RwLock<T>) -> ControlResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| ControlError::internal("lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> ControlResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ControlError::internal("lock poisoned"))
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn version_kind(
        versions: &[DefinitionVersion],
        app_id: &ApplicationId,
        id: &VersionId,
    ) -> ControlResult<DefinitionKind> {
        versions
            .iter()
            .find(|v| &v.id == id && &v.app_id == app_id)
            .map(DefinitionVersion::kind)
            .ok_or_else(|| ControlError::VersionNotFound(id.to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_application(&self, app: &Application) -> ControlResult<()> {
        let mut applications = write(&self.applications)?;
        if applications.contains_key(&app.id) {
            return Err(ControlError::store(format!(
                "application {} already exists",
                app.id
            )));
        }
        if applications.values().any(|a| a.job_name == app.job_name) {
            return Err(ControlError::store(format!(
                "job name {} already in use",
                app.job_name
            )));
        }
        applications.insert(app.id.clone(), app.clone());
        Ok(())
    }

    async fn get_application(&self, id: &ApplicationId) -> ControlResult<Option<Application>> {
        Ok(read(&self.applications)?.get(id).cloned())
    }

    async fn find_by_job_name(&self, job_name: &str) -> ControlResult<Option<Application>> {
        Ok(read(&self.applications)?
            .values()
            .find(|a| a.job_name == job_name)
            .cloned())
    }

    async fn update_application(
        &self,
        id: &ApplicationId,
        patch: ApplicationPatch,
    ) -> ControlResult<Application> {
        let mut applications = write(&self.applications)?;
        let app = applications
            .get_mut(id)
            .ok_or_else(|| ControlError::ApplicationNotFound(id.to_string()))?;
        patch.apply(app);
        Ok(app.clone())
    }

    async fn update_definition(&self, app: &Application) -> ControlResult<()> {
        let mut applications = write(&self.applications)?;
        let row = applications
            .get_mut(&app.id)
            .ok_or_else(|| ControlError::ApplicationNotFound(app.id.to_string()))?;
        row.job_name.clone_from(&app.job_name);
        row.application_type = app.application_type;
        row.execution_mode = app.execution_mode;
        row.resolve_order = app.resolve_order;
        row.module.clone_from(&app.module);
        row.jar.clone_from(&app.jar);
        row.main_class.clone_from(&app.main_class);
        row.local_base.clone_from(&app.local_base);
        row.options.clone_from(&app.options);
        row.dynamic_options.clone_from(&app.dynamic_options);
        row.args.clone_from(&app.args);
        row.description.clone_from(&app.description);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> ControlResult<Vec<Application>> {
        let applications = read(&self.applications)?;

        let mut results: Vec<_> = applications
            .values()
            .filter(|a| {
                if let Some(ref name) = filter.job_name {
                    if !a.job_name.contains(name.as_str()) {
                        return false;
                    }
                }
                if let Some(state) = filter.state {
                    if a.state != state {
                        return false;
                    }
                }
                if let Some(job_type) = filter.job_type {
                    if a.job_type != job_type {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        #[allow(clippy::as_conversions)]
        let offset = filter.offset.unwrap_or(0) as usize;
        let results = results.into_iter().skip(offset);

        if let Some(limit) = filter.limit {
            #[allow(clippy::as_conversions)]
            Ok(results.take(limit as usize).collect())
        } else {
            Ok(results.collect())
        }
    }

    async fn reset_option_states(&self) -> ControlResult<usize> {
        let mut applications = write(&self.applications)?;
        let mut touched = 0;
        for app in applications.values_mut() {
            let state = app.state.settled();
            if app.option_state != OptionState::None || app.state != state {
                app.option_state = OptionState::None;
                app.state = state;
                app.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn insert_version(&self, version: &DefinitionVersion) -> ControlResult<()> {
        let mut versions = write(&self.versions)?;
        if versions.iter().any(|v| v.id == version.id) {
            return Err(ControlError::store(format!(
                "version {} already exists",
                version.id
            )));
        }
        for sibling in versions
            .iter_mut()
            .filter(|v| v.app_id == version.app_id && v.kind() == version.kind())
        {
            if version.effective {
                sibling.effective = false;
                sibling.latest = false;
            } else if version.latest {
                sibling.latest = false;
            }
        }
        versions.push(version.clone());
        Ok(())
    }

    async fn get_version(&self, id: &VersionId) -> ControlResult<Option<DefinitionVersion>> {
        Ok(read(&self.versions)?.iter().find(|v| &v.id == id).cloned())
    }

    async fn list_versions(
        &self,
        app_id: &ApplicationId,
        kind: DefinitionKind,
    ) -> ControlResult<Vec<DefinitionVersion>> {
        Ok(read(&self.versions)?
            .iter()
            .rev()
            .filter(|v| &v.app_id == app_id && v.kind() == kind)
            .cloned()
            .collect())
    }

    async fn set_latest(&self, app_id: &ApplicationId, id: &VersionId) -> ControlResult<()> {
        let mut versions = write(&self.versions)?;
        let kind = Self::version_kind(&versions, app_id, id)?;
        for v in versions
            .iter_mut()
            .filter(|v| &v.app_id == app_id && v.kind() == kind)
        {
            v.latest = &v.id == id;
        }
        Ok(())
    }

    async fn set_effective(&self, app_id: &ApplicationId, id: &VersionId) -> ControlResult<()> {
        let mut versions = write(&self.versions)?;
        let kind = Self::version_kind(&versions, app_id, id)?;
        for v in versions
            .iter_mut()
            .filter(|v| &v.app_id == app_id && v.kind() == kind)
        {
            v.effective = &v.id == id;
            v.latest = false;
        }
        Ok(())
    }

    async fn insert_savepoint(&self, savepoint: &SavePoint) -> ControlResult<()> {
        let mut savepoints = write(&self.savepoints)?;
        if savepoint.latest {
            for sibling in savepoints
                .iter_mut()
                .filter(|s| s.app_id == savepoint.app_id)
            {
                sibling.latest = false;
            }
        }
        savepoints.push(savepoint.clone());
        Ok(())
    }

    async fn latest_savepoint(&self, app_id: &ApplicationId) -> ControlResult<Option<SavePoint>> {
        Ok(read(&self.savepoints)?
            .iter()
            .rev()
            .find(|s| &s.app_id == app_id && s.latest)
            .cloned())
    }

    async fn obsolete_savepoints(&self, app_id: &ApplicationId) -> ControlResult<()> {
        let mut savepoints = write(&self.savepoints)?;
        for s in savepoints.iter_mut().filter(|s| &s.app_id == app_id) {
            s.latest = false;
        }
        Ok(())
    }

    async fn list_savepoints(&self, app_id: &ApplicationId) -> ControlResult<Vec<SavePoint>> {
        Ok(read(&self.savepoints)?
            .iter()
            .rev()
            .filter(|s| &s.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn insert_log(&self, log: &ApplicationLog) -> ControlResult<()> {
        write(&self.logs)?.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, app_id: &ApplicationId) -> ControlResult<Vec<ApplicationLog>> {
        Ok(read(&self.logs)?
            .iter()
            .rev()
            .filter(|l| &l.app_id == app_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use crate::types::{DefinitionBody, ExecutionMode, JobType, SqlDefinition};

    fn sql(app_id: &ApplicationId, text: &str) -> DefinitionVersion {
        DefinitionVersion::new(
            app_id.clone(),
            DefinitionBody::Sql(SqlDefinition {
                text: text.to_owned(),
                dependency: Default::default(),
            }),
        )
    }

    async fn flags(store: &MemoryStore, app_id: &ApplicationId) -> Vec<(bool, bool)> {
        store
            .list_versions(app_id, DefinitionKind::Sql)
            .await
            .unwrap()
            .into_iter()
            .map(|v| (v.latest, v.effective))
            .collect()
    }

    #[tokio::test]
    async fn insert_and_get_application() {
        let store = MemoryStore::new();
        let app = Application::new("orders", JobType::Sql, ExecutionMode::Application);

        store.insert_application(&app).await.unwrap();
        let fetched = store.get_application(&app.id).await.unwrap().unwrap();
        assert_eq!(fetched.job_name, "orders");

        let by_name = store.find_by_job_name("orders").await.unwrap().unwrap();
        assert_eq!(by_name.id, app.id);
    }

    #[tokio::test]
    async fn duplicate_job_name_rejected() {
        let store = MemoryStore::new();
        let a = Application::new("orders", JobType::Sql, ExecutionMode::Application);
        let b = Application::new("orders", JobType::Sql, ExecutionMode::Application);

        store.insert_application(&a).await.unwrap();
        assert!(store.insert_application(&b).await.is_err());
    }

    #[tokio::test]
    async fn patch_and_reset_markers() {
        let store = MemoryStore::new();
        let app = Application::new("orders", JobType::Sql, ExecutionMode::Application);
        store.insert_application(&app).await.unwrap();

        let updated = store
            .update_application(
                &app.id,
                ApplicationPatch::new()
                    .with_state(AppState::Deploying)
                    .with_option_state(OptionState::Deploying),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, AppState::Deploying);

        let stopping = Application::new("payments", JobType::Sql, ExecutionMode::Application);
        store.insert_application(&stopping).await.unwrap();
        store
            .update_application(
                &stopping.id,
                ApplicationPatch::new().with_state(AppState::Cancelling),
            )
            .await
            .unwrap();

        assert_eq!(store.reset_option_states().await.unwrap(), 2);
        let fetched = store.get_application(&app.id).await.unwrap().unwrap();
        assert_eq!(fetched.option_state, OptionState::None);
        assert_eq!(fetched.state, AppState::Created);
        let fetched = store.get_application(&stopping.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, AppState::Running);

        assert_eq!(store.reset_option_states().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_missing_application() {
        let store = MemoryStore::new();
        let result = store
            .update_application(&ApplicationId::new("missing"), ApplicationPatch::new())
            .await;
        assert!(matches!(result, Err(ControlError::ApplicationNotFound(_))));
    }

    #[tokio::test]
    async fn version_flags_stay_exclusive() {
        let store = MemoryStore::new();
        let app_id = ApplicationId::new("app");

        let mut first = sql(&app_id, "SELECT 1");
        first.effective = true;
        store.insert_version(&first).await.unwrap();

        let mut second = sql(&app_id, "SELECT 2");
        second.latest = true;
        store.insert_version(&second).await.unwrap();
        assert_eq!(flags(&store, &app_id).await, [(true, false), (false, true)]);

        let mut third = sql(&app_id, "SELECT 3");
        third.latest = true;
        store.insert_version(&third).await.unwrap();
        assert_eq!(
            flags(&store, &app_id).await,
            [(true, false), (false, false), (false, true)]
        );

        store.set_effective(&app_id, &third.id).await.unwrap();
        assert_eq!(
            flags(&store, &app_id).await,
            [(false, true), (false, false), (false, false)]
        );

        store.set_latest(&app_id, &second.id).await.unwrap();
        assert_eq!(
            flags(&store, &app_id).await,
            [(false, true), (true, false), (false, false)]
        );
    }

    #[tokio::test]
    async fn effective_insert_clears_candidates() {
        let store = MemoryStore::new();
        let app_id = ApplicationId::new("app");

        let mut candidate = sql(&app_id, "SELECT 1");
        candidate.latest = true;
        store.insert_version(&candidate).await.unwrap();

        let mut live = sql(&app_id, "SELECT 2");
        live.effective = true;
        store.insert_version(&live).await.unwrap();

        assert_eq!(flags(&store, &app_id).await, [(false, true), (false, false)]);
    }

    #[tokio::test]
    async fn set_effective_unknown_version() {
        let store = MemoryStore::new();
        let result = store
            .set_effective(&ApplicationId::new("app"), &VersionId::new("nope"))
            .await;
        assert!(matches!(result, Err(ControlError::VersionNotFound(_))));
    }

    #[tokio::test]
    async fn savepoint_latest_is_unique() {
        let store = MemoryStore::new();
        let app_id = ApplicationId::new("app");

        store
            .insert_savepoint(&SavePoint::latest(app_id.clone(), "s3://sp/1"))
            .await
            .unwrap();
        store
            .insert_savepoint(&SavePoint::latest(app_id.clone(), "s3://sp/2"))
            .await
            .unwrap();

        let latest = store.latest_savepoint(&app_id).await.unwrap().unwrap();
        assert_eq!(latest.path, "s3://sp/2");
        let all = store.list_savepoints(&app_id).await.unwrap();
        assert_eq!(all.iter().filter(|s| s.latest).count(), 1);

        store.obsolete_savepoints(&app_id).await.unwrap();
        assert!(store.latest_savepoint(&app_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_with_filter_and_pagination() {
        let store = MemoryStore::new();
        for name in ["orders", "payments", "orders-eu"] {
            let app = Application::new(name, JobType::Sql, ExecutionMode::Application);
            store.insert_application(&app).await.unwrap();
        }

        let orders = store
            .list_applications(&ApplicationFilter::new().with_job_name("orders"))
            .await
            .unwrap();
        assert_eq!(orders.len(), 2);

        let page = store
            .list_applications(&ApplicationFilter::new().with_limit(2).with_offset(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }
}
