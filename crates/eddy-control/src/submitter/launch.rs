//! Launch layout selection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::json;

use crate::config::{ProfilingConfig, WorkspaceConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{Application, ApplicationType, ConfigDefinition, ExecutionMode, SqlDefinition};

use super::LaunchSpec;

const MAIN_CLASS_KEY: &str = "$internal.application.main";

/// Find the single runner jar in `dir` whose file name matches `pattern`.
pub async fn find_runner_jar(dir: &Path, pattern: &str) -> ControlResult<String> {
    let pattern = Regex::new(pattern)
        .map_err(|e| ControlError::configuration(format!("invalid runner jar pattern: {e}")))?;

    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        ControlError::configuration(format!("cannot read {}: {e}", dir.display()))
    })?;
    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.is_match(&name) {
            matches.push(name);
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(ControlError::configuration(format!(
            "no runner jar matching {pattern} in {}",
            dir.display()
        ))),
        n => Err(ControlError::configuration(format!(
            "found {n} runner jars matching {pattern} in {}, expected exactly one",
            dir.display()
        ))),
    }
}

fn encoded_config(app: &Application, config: Option<&ConfigDefinition>) -> ControlResult<String> {
    match app.application_type {
        ApplicationType::Managed => {
            let config = config.ok_or_else(|| {
                ControlError::configuration(format!("{} has no effective configuration", app.job_name))
            })?;
            Ok(format!("{}://{}", config.format.scheme(), config.content))
        }
        ApplicationType::Native => {
            let main = app.main_class.as_deref().ok_or_else(|| {
                ControlError::configuration(format!("{} has no main class", app.job_name))
            })?;
            Ok(format!("json://{}", json!({ MAIN_CLASS_KEY: main })))
        }
    }
}

fn required<'a>(value: Option<&'a str>, what: &str, app: &Application) -> ControlResult<&'a str> {
    value.ok_or_else(|| ControlError::configuration(format!("{} has no {what}", app.job_name)))
}

/// Build the launch layout for an application.
///
/// `runner_jar` is the file name found by [`find_runner_jar`] and is only
/// consulted for SQL jobs.
pub fn launch_spec(
    app: &Application,
    config: Option<&ConfigDefinition>,
    sql: Option<&SqlDefinition>,
    runner_jar: Option<&str>,
    workspace: &WorkspaceConfig,
) -> ControlResult<LaunchSpec> {
    let client_submitted = match app.execution_mode {
        ExecutionMode::Application => false,
        ExecutionMode::PerJob => true,
        other => {
            return Err(ControlError::configuration(format!(
                "unsupported execution mode {other} for {}",
                app.job_name
            )));
        }
    };

    if app.is_sql_job() {
        let sql = sql.ok_or_else(|| {
            ControlError::configuration(format!("{} has no effective sql", app.job_name))
        })?;
        let runner = required(runner_jar, "runner jar", app)?;
        let jar = if client_submitted {
            workspace.local_plugins.join(runner).display().to_string()
        } else {
            format!("{}/{runner}", workspace.plugins)
        };
        return Ok(LaunchSpec::Sql {
            jar,
            config: config.map(|c| format!("yaml://{}", c.content)),
            sql: sql.text.clone(),
            application_id: app.id.clone(),
        });
    }

    let config = encoded_config(app, config)?;
    if client_submitted {
        let base = app.local_base.as_deref().ok_or_else(|| {
            ControlError::configuration(format!("{} has no local build output", app.job_name))
        })?;
        let module = required(app.module.as_deref(), "module", app)?;
        let jar: PathBuf = match app.application_type {
            ApplicationType::Managed => base.join(module).join("lib").join(format!("{module}.jar")),
            ApplicationType::Native => base.join(module).join(format!("{module}.jar")),
        };
        Ok(LaunchSpec::ClientSubmitted { jar, config })
    } else {
        let jar = match app.application_type {
            ApplicationType::Managed => {
                let module = required(app.module.as_deref(), "module", app)?;
                format!("{}/{}/lib/{module}.jar", workspace.remote, app.id)
            }
            ApplicationType::Native => {
                let jar = required(app.jar.as_deref(), "jar", app)?;
                format!("{}/{}/{jar}", workspace.remote, app.id)
            }
        };
        Ok(LaunchSpec::ClusterApplication { jar, config })
    }
}

/// Reporter settings passed to the job when profiling is requested.
#[must_use]
pub fn profiling_options(
    app: &Application,
    profiling: &ProfilingConfig,
) -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        ("reporter".to_owned(), json!("http")),
        ("type".to_owned(), json!(app.application_type.as_str())),
        ("id".to_owned(), json!(app.id.as_str())),
        (
            "url".to_owned(),
            json!(format!(
                "{}/metrics/report",
                profiling.callback_url.trim_end_matches('/')
            )),
        ),
        (
            "token".to_owned(),
            json!(ulid::Ulid::new().to_string().to_lowercase()),
        ),
        ("sampleInterval".to_owned(), json!(profiling.sample_interval_ms)),
        ("metricInterval".to_owned(), json!(profiling.metric_interval_ms)),
    ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{ConfigFormat, JobType};

    fn workspace() -> WorkspaceConfig {
        WorkspaceConfig {
            remote: "ws".to_owned(),
            plugins: "plugins".to_owned(),
            local_plugins: PathBuf::from("/opt/plugins"),
            ..WorkspaceConfig::default()
        }
    }

    fn managed(mode: ExecutionMode) -> Application {
        let mut app = Application::new("orders", JobType::CustomCode, mode);
        app.module = Some("orders-job".to_owned());
        app.local_base = Some(PathBuf::from("/build/orders"));
        app
    }

    fn yaml() -> ConfigDefinition {
        ConfigDefinition {
            format: ConfigFormat::Yaml,
            content: "parallelism: 2".to_owned(),
        }
    }

    #[test]
    fn managed_application_mode() {
        let app = managed(ExecutionMode::Application);
        let spec = launch_spec(&app, Some(&yaml()), None, None, &workspace()).unwrap();
        assert_eq!(
            spec,
            LaunchSpec::ClusterApplication {
                jar: format!("ws/{}/lib/orders-job.jar", app.id),
                config: "yaml://parallelism: 2".to_owned(),
            }
        );
    }

    #[test]
    fn managed_without_config_is_fatal() {
        let app = managed(ExecutionMode::Application);
        let err = launch_spec(&app, None, None, None, &workspace()).unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)));
    }

    #[test]
    fn native_application_mode() {
        let mut app = managed(ExecutionMode::Application);
        app.application_type = ApplicationType::Native;
        app.jar = Some("job.jar".to_owned());
        app.main_class = Some("com.example.Main".to_owned());

        let spec = launch_spec(&app, None, None, None, &workspace()).unwrap();
        assert_eq!(
            spec,
            LaunchSpec::ClusterApplication {
                jar: format!("ws/{}/job.jar", app.id),
                config: r#"json://{"$internal.application.main":"com.example.Main"}"#.to_owned(),
            }
        );
    }

    #[test]
    fn per_job_uses_local_build_output() {
        let app = managed(ExecutionMode::PerJob);
        let spec = launch_spec(&app, Some(&yaml()), None, None, &workspace()).unwrap();
        assert_eq!(
            spec,
            LaunchSpec::ClientSubmitted {
                jar: PathBuf::from("/build/orders/orders-job/lib/orders-job.jar"),
                config: "yaml://parallelism: 2".to_owned(),
            }
        );

        let mut native = managed(ExecutionMode::PerJob);
        native.application_type = ApplicationType::Native;
        native.main_class = Some("Main".to_owned());
        match launch_spec(&native, None, None, None, &workspace()).unwrap() {
            LaunchSpec::ClientSubmitted { jar, .. } => {
                assert_eq!(jar, PathBuf::from("/build/orders/orders-job/orders-job.jar"));
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn sql_layouts() {
        let app = Application::new("report", JobType::Sql, ExecutionMode::Application);
        let sql = SqlDefinition {
            text: "SELECT 1".to_owned(),
            dependency: Default::default(),
        };
        let spec = launch_spec(&app, None, Some(&sql), Some("runner-1.0.jar"), &workspace()).unwrap();
        assert_eq!(
            spec,
            LaunchSpec::Sql {
                jar: "plugins/runner-1.0.jar".to_owned(),
                config: None,
                sql: "SELECT 1".to_owned(),
                application_id: app.id.clone(),
            }
        );

        let per_job = Application::new("report", JobType::Sql, ExecutionMode::PerJob);
        match launch_spec(&per_job, Some(&yaml()), Some(&sql), Some("runner-1.0.jar"), &workspace())
            .unwrap()
        {
            LaunchSpec::Sql { jar, config, .. } => {
                assert_eq!(jar, "/opt/plugins/runner-1.0.jar");
                assert_eq!(config.as_deref(), Some("yaml://parallelism: 2"));
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn unsupported_mode_is_fatal() {
        let app = managed(ExecutionMode::Session);
        let err = launch_spec(&app, Some(&yaml()), None, None, &workspace()).unwrap_err();
        assert!(err.to_string().contains("unsupported execution mode session"));
    }

    #[tokio::test]
    async fn runner_jar_must_be_unique() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = r"^eddy-sqlclient-.*\.jar$";

        let err = find_runner_jar(dir.path(), pattern).await.unwrap_err();
        assert!(err.to_string().contains("no runner jar"));

        std::fs::write(dir.path().join("eddy-sqlclient-1.0.jar"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.jar"), b"").unwrap();
        assert_eq!(
            find_runner_jar(dir.path(), pattern).await.unwrap(),
            "eddy-sqlclient-1.0.jar"
        );

        std::fs::write(dir.path().join("eddy-sqlclient-1.1.jar"), b"").unwrap();
        let err = find_runner_jar(dir.path(), pattern).await.unwrap_err();
        assert!(err.to_string().contains("found 2 runner jars"));
    }

    #[test]
    fn profiling_map() {
        let app = managed(ExecutionMode::Application);
        let options = profiling_options(&app, &ProfilingConfig::default());
        assert_eq!(options["url"], "http://localhost:10000/metrics/report");
        assert_eq!(options["sampleInterval"], 120_000);
        assert_eq!(options["metricInterval"], 120_000);
        assert_eq!(options["id"], app.id.as_str());
        assert_eq!(options.len(), 7);
    }
}
