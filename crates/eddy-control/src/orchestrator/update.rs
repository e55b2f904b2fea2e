//! Creating applications and editing their definitions.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{ControlError, ControlResult};
use crate::hooks::CacheView;
use crate::state::{AppState, DeployMarker, OptionState};
use crate::types::{
    Application, ApplicationId, ApplicationPatch, ApplicationType, ConfigDefinition,
    DefinitionBody, ResolveOrder, SqlDefinition,
};
use crate::version::{SqlCandidate, SqlUpdate};

use super::JobOrchestrator;

/// A new application with its initial definitions.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// The application; lifecycle state and markers are reset.
    pub application: Application,
    /// Initial SQL, required for SQL jobs.
    pub sql: Option<SqlDefinition>,
    /// Initial configuration document.
    pub config: Option<ConfigDefinition>,
}

/// Edits to an application. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// New job name.
    pub job_name: Option<String>,
    /// New class loading order.
    pub resolve_order: Option<ResolveOrder>,
    /// New typed submission options.
    pub options: Option<BTreeMap<String, serde_json::Value>>,
    /// New dynamic options.
    pub dynamic_options: Option<String>,
    /// New program arguments.
    pub args: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New jar, native applications only.
    pub jar: Option<String>,
    /// New main class, native applications only.
    pub main_class: Option<String>,
    /// Edited SQL, SQL jobs only.
    pub sql: Option<SqlCandidate>,
    /// Edited configuration document.
    pub config: Option<ConfigDefinition>,
}

impl UpdateRequest {
    /// Apply plain field edits; returns whether the launched artifact changed.
    fn apply_settings(&self, app: &mut Application) -> bool {
        if let Some(name) = &self.job_name {
            app.job_name.clone_from(name);
        }
        if let Some(order) = self.resolve_order {
            app.resolve_order = order;
        }
        if let Some(options) = &self.options {
            app.options.clone_from(options);
        }
        if let Some(dynamic) = &self.dynamic_options {
            app.dynamic_options = Some(dynamic.clone()).filter(|d| !d.trim().is_empty());
        }
        if let Some(args) = &self.args {
            app.args = Some(args.clone()).filter(|a| !a.trim().is_empty());
        }
        if let Some(description) = &self.description {
            app.description = Some(description.clone());
        }

        let mut artifact_changed = false;
        if let Some(jar) = &self.jar {
            artifact_changed |= app.jar.as_ref() != Some(jar);
            app.jar = Some(jar.clone());
        }
        if let Some(main) = &self.main_class {
            artifact_changed |= app.main_class.as_ref() != Some(main);
            app.main_class = Some(main.clone());
        }
        artifact_changed
    }

    fn validate(&self, app: &Application) -> ControlResult<()> {
        if self.job_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ControlError::configuration("job name must not be empty"));
        }
        if self.sql.is_some() && !app.is_sql_job() {
            return Err(ControlError::configuration(format!(
                "{} is not a sql job",
                app.job_name
            )));
        }
        if (self.jar.is_some() || self.main_class.is_some())
            && (app.is_sql_job() || app.application_type != ApplicationType::Native)
        {
            return Err(ControlError::configuration(format!(
                "jar and main class only apply to native applications, not {}",
                app.job_name
            )));
        }
        if self.config.is_some()
            && !app.is_sql_job()
            && app.application_type == ApplicationType::Native
        {
            return Err(ControlError::configuration(format!(
                "{} is a native application and takes no configuration document",
                app.job_name
            )));
        }
        Ok(())
    }
}

/// What an update changed.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The application after the update.
    pub application: Application,
    /// SQL diff and version action, when SQL was submitted.
    pub sql: Option<SqlUpdate>,
    /// Whether a configuration version was recorded.
    pub config_changed: bool,
}

impl JobOrchestrator {
    /// Create an application and record its initial definitions as candidates.
    pub async fn create(&self, request: CreateRequest) -> ControlResult<Application> {
        let CreateRequest {
            mut application,
            sql,
            config,
        } = request;

        if application.job_name.trim().is_empty() {
            return Err(ControlError::configuration("job name must not be empty"));
        }
        if application.is_sql_job() && sql.is_none() {
            return Err(ControlError::configuration(format!(
                "{} is a sql job but has no sql",
                application.job_name
            )));
        }

        application.state = AppState::Created;
        application.option_state = OptionState::None;
        application.deploy = DeployMarker::None;
        application.cluster_app_id = None;
        application.cluster_job_id = None;
        if let Some(sql) = &sql {
            application.dependency = sql.dependency.clone();
        }
        self.store.insert_application(&application).await?;

        let app_id = &application.id;
        if let Some(sql) = sql {
            let sql = SqlDefinition {
                text: sql.text.trim().to_owned(),
                dependency: sql.dependency,
            };
            self.versions
                .record_initial(app_id, DefinitionBody::Sql(sql))
                .await?;
        }
        if let Some(config) = config {
            let config = ConfigDefinition {
                format: config.format,
                content: config.content.trim().to_owned(),
            };
            self.versions
                .record_initial(app_id, DefinitionBody::Config(config))
                .await?;
        }

        info!(
            app_id = %app_id,
            job_name = %application.job_name,
            job_type = ?application.job_type,
            "application created"
        );
        self.invalidate(app_id, &[CacheView::ApplicationList, CacheView::Dashboard]);
        Ok(application)
    }

    /// Edit an application's settings and definitions.
    ///
    /// SQL edits go through the version diff; a running job only gets a
    /// remediation marker, never an implicit redeploy.
    pub async fn update(
        &self,
        app_id: &ApplicationId,
        request: UpdateRequest,
    ) -> ControlResult<UpdateOutcome> {
        let _guard = self.lock(app_id).await;
        let mut app = self.application(app_id).await?;
        Self::ensure_idle(&app)?;
        request.validate(&app)?;

        if let Some(name) = &request.job_name {
            if let Some(other) = self.store.find_by_job_name(name).await? {
                if &other.id != app_id {
                    return Err(ControlError::configuration(format!(
                        "job name {name} already in use"
                    )));
                }
            }
        }

        let running = app.is_running();
        let artifact_changed = request.apply_settings(&mut app);
        self.store.update_definition(&app).await?;

        let mut marker = None;
        let mut sql_update = None;
        let mut config_changed = false;

        if let Some(candidate) = &request.sql {
            let update = self
                .versions
                .apply_sql_update(app_id, running, candidate)
                .await?;
            if let Some(config) = &request.config {
                config_changed = self
                    .versions
                    .apply_config(app_id, config, update.diff.config_latest(running))
                    .await?;
            }
            marker = update.diff.marker();
            sql_update = Some(update);
        } else {
            if let Some(config) = &request.config {
                config_changed = self.versions.apply_config(app_id, config, running).await?;
            }
            if running && (config_changed || artifact_changed) {
                marker = Some(DeployMarker::NeedRestartAfterConfUpdate);
            }
        }

        let application = match marker {
            Some(marker) => {
                self.store
                    .update_application(app_id, ApplicationPatch::new().with_deploy(marker))
                    .await?
            }
            None => self.application(app_id).await?,
        };

        info!(
            app_id = %app_id,
            running,
            config_changed,
            deploy = %application.deploy,
            "application updated"
        );
        self.invalidate(app_id, &[CacheView::Application, CacheView::ApplicationList]);
        Ok(UpdateOutcome {
            application,
            sql: sql_update,
            config_changed,
        })
    }
}
