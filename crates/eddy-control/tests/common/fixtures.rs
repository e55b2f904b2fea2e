//! Test fixtures and builders.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use eddy_control::dependency::DependencyDescriptor;
use eddy_control::types::{
    Application, ApplicationType, ConfigDefinition, ConfigFormat, ExecutionMode, JobType,
    SqlDefinition, VersionId,
};
use eddy_control::version::SqlCandidate;
use eddy_control::CreateRequest;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const ORDERS_SQL: &str = "INSERT INTO sink SELECT * FROM orders";

/// Dependency descriptor over `group:artifact:version` strings.
pub fn deps(coordinates: &[&str]) -> DependencyDescriptor {
    DependencyDescriptor {
        pom: coordinates.iter().map(|c| c.parse().unwrap()).collect(),
        jar: Vec::new(),
    }
}

/// A SQL job in application mode.
pub fn sql_app(name: &str, coordinates: &[&str]) -> CreateRequest {
    CreateRequest {
        application: Application::new(name, JobType::Sql, ExecutionMode::Application),
        sql: Some(SqlDefinition {
            text: format!("  {ORDERS_SQL}\n"),
            dependency: deps(coordinates),
        }),
        config: None,
    }
}

/// A managed custom-code job whose build output lives under `base/orders`.
pub fn managed_app(name: &str, base: &Path) -> CreateRequest {
    let module = base.join("orders").join("lib");
    std::fs::create_dir_all(&module).unwrap();
    std::fs::write(module.join("orders.jar"), b"orders").unwrap();

    let mut application = Application::new(name, JobType::CustomCode, ExecutionMode::Application);
    application.application_type = ApplicationType::Managed;
    application.module = Some("orders".to_owned());
    application.local_base = Some(base.to_path_buf());

    CreateRequest {
        application,
        sql: None,
        config: Some(yaml("parallelism: 2")),
    }
}

/// A plain custom-code job whose jar under `base/orders` names its entry point.
pub fn native_app(name: &str, base: &Path) -> CreateRequest {
    let module = base.join("orders");
    std::fs::create_dir_all(&module).unwrap();
    let mut jar = ZipWriter::new(File::create(module.join("orders-1.0.jar")).unwrap());
    jar.start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
        .unwrap();
    jar.write_all(b"Manifest-Version: 1.0\r\nMain-Class: com.example.OrdersJob\r\n")
        .unwrap();
    jar.finish().unwrap();

    let mut application = Application::new(name, JobType::CustomCode, ExecutionMode::Application);
    application.application_type = ApplicationType::Native;
    application.module = Some("orders".to_owned());
    application.jar = Some("orders-1.0.jar".to_owned());
    application.local_base = Some(base.to_path_buf());

    CreateRequest {
        application,
        sql: None,
        config: None,
    }
}

pub fn yaml(content: &str) -> ConfigDefinition {
    ConfigDefinition {
        format: ConfigFormat::Yaml,
        content: content.to_owned(),
    }
}

/// A SQL edit starting from `version_id`.
pub fn candidate(version_id: &VersionId, text: &str, coordinates: &[&str]) -> SqlCandidate {
    SqlCandidate {
        version_id: version_id.clone(),
        text: text.to_owned(),
        dependency: deps(coordinates),
    }
}
