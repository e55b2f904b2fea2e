//! Entry point discovery from a jar manifest.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{ControlError, ControlResult};
use crate::types::Application;

const MANIFEST: &str = "META-INF/MANIFEST.MF";

/// `Main-Class` of a plain application's built jar at `{base}/{module}/{jar}`.
///
/// Returns `None` when the application does not name a local jar or the jar
/// has no manifest entry.
pub async fn manifest_main_class(app: &Application) -> ControlResult<Option<String>> {
    let (Some(base), Some(module), Some(jar)) = (
        app.local_base.as_deref(),
        app.module.as_deref(),
        app.jar.as_deref(),
    ) else {
        return Ok(None);
    };
    let path: PathBuf = base.join(module).join(jar);
    tokio::task::spawn_blocking(move || read_main_class(&path))
        .await
        .map_err(|e| ControlError::internal(format!("manifest reader panicked: {e}")))?
}

/// Read `Main-Class` from a jar file.
pub fn read_main_class(jar: &Path) -> ControlResult<Option<String>> {
    let file = File::open(jar).map_err(|e| {
        ControlError::configuration(format!("cannot open {}: {e}", jar.display()))
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| {
        ControlError::configuration(format!("{} is not a jar: {e}", jar.display()))
    })?;
    let mut entry = match archive.by_name(MANIFEST) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(ControlError::configuration(format!(
                "cannot read manifest of {}: {e}",
                jar.display()
            )));
        }
    };
    let mut manifest = String::new();
    entry.read_to_string(&mut manifest)?;
    Ok(main_class(&manifest))
}

/// The `Main-Class` attribute of a manifest, joining continuation lines.
fn main_class(manifest: &str) -> Option<String> {
    let mut headers: Vec<String> = Vec::new();
    for line in manifest.lines() {
        match (line.strip_prefix(' '), headers.last_mut()) {
            (Some(rest), Some(last)) => last.push_str(rest),
            _ => headers.push(line.to_owned()),
        }
    }
    headers.iter().find_map(|header| {
        let (name, value) = header.split_once(':')?;
        let value = value.trim();
        (name.trim().eq_ignore_ascii_case("Main-Class") && !value.is_empty())
            .then(|| value.to_owned())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;
    use crate::types::{ApplicationType, ExecutionMode, JobType};

    fn jar(path: &Path, manifest: Option<&str>) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        if let Some(manifest) = manifest {
            writer.start_file(MANIFEST, options).unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();
        }
        writer.start_file("com/example/Orders.class", options).unwrap();
        writer.write_all(b"class").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn parses_main_class_with_continuation() {
        let manifest = "Manifest-Version: 1.0\r\nMain-Class: com.example.orders.Orders\r\n Job\r\nCreated-By: maven\r\n";
        assert_eq!(
            main_class(manifest).as_deref(),
            Some("com.example.orders.OrdersJob")
        );
        assert!(main_class("Manifest-Version: 1.0\n").is_none());
    }

    #[test]
    fn reads_manifest_from_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jar");
        jar(&path, Some("Manifest-Version: 1.0\nMain-Class: com.example.Orders\n"));
        assert_eq!(
            read_main_class(&path).unwrap().as_deref(),
            Some("com.example.Orders")
        );

        let bare = dir.path().join("bare.jar");
        jar(&bare, None);
        assert!(read_main_class(&bare).unwrap().is_none());
    }

    #[test]
    fn rejects_non_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jar");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            read_main_class(&path),
            Err(ControlError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn locates_jar_from_application() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("orders")).unwrap();
        jar(
            &dir.path().join("orders").join("orders-1.0.jar"),
            Some("Main-Class: com.example.Orders\n"),
        );

        let mut app = Application::new("orders", JobType::CustomCode, ExecutionMode::Application);
        app.application_type = ApplicationType::Native;
        app.local_base = Some(dir.path().to_path_buf());
        app.module = Some("orders".to_owned());
        app.jar = Some("orders-1.0.jar".to_owned());
        assert_eq!(
            manifest_main_class(&app).await.unwrap().as_deref(),
            Some("com.example.Orders")
        );

        app.jar = None;
        assert!(manifest_main_class(&app).await.unwrap().is_none());
    }
}
