//! Rendering of the bundled manifest set.
//!
//! The operator image ships the platform manifests as multi-document YAML
//! files with `${...}` placeholders for the handful of values that vary
//! per installation. Rendering substitutes those and returns the parsed
//! documents ready for the apply engine.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ControllerError;

#[cfg(test)]
use mockall::automock;

/// Values substituted into the manifest set.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Namespace the platform installs into
    pub namespace: String,
    /// Platform version being installed or upgraded to
    pub target_version: String,
    /// External hostname for the platform route, when set
    pub route_hostname: Option<String>,
}

/// Produces the full resource set for one platform installation.
#[cfg_attr(test, automock)]
pub trait ManifestRenderer: Send + Sync {
    /// Render every manifest document with the given context.
    fn render(&self, ctx: &RenderContext) -> Result<Vec<Value>, ControllerError>;
}

/// Renderer over a directory of YAML files.
#[derive(Debug)]
pub struct DirRenderer {
    dir: PathBuf,
}

impl DirRenderer {
    /// Render manifests found under `dir` (non-recursive, `*.yaml`/`*.yml`).
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ManifestRenderer for DirRenderer {
    fn render(&self, ctx: &RenderContext) -> Result<Vec<Value>, ControllerError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| {
                ControllerError::Render(format!(
                    "cannot read manifest dir {}: {e}",
                    self.dir.display()
                ))
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|e| e == "yaml" || e == "yml")
            })
            .collect();
        // stable order so apply output is deterministic
        files.sort();

        let mut documents = Vec::new();
        for path in files {
            let raw = std::fs::read_to_string(&path)?;
            let substituted = substitute(&raw, ctx);

            for doc in serde_yaml::Deserializer::from_str(&substituted) {
                let value = Value::deserialize(doc).map_err(|e| {
                    ControllerError::Render(format!("{}: {e}", path.display()))
                })?;
                if value.is_null() {
                    continue;
                }
                if value.get("kind").and_then(Value::as_str).is_none() {
                    return Err(ControllerError::Render(format!(
                        "{}: document without kind",
                        path.display()
                    )));
                }
                documents.push(value);
            }
        }

        if documents.is_empty() {
            return Err(ControllerError::Render(format!(
                "no manifest documents under {}",
                self.dir.display()
            )));
        }

        Ok(documents)
    }
}

fn substitute(raw: &str, ctx: &RenderContext) -> String {
    raw.replace("${NAMESPACE}", &ctx.namespace)
        .replace("${TARGET_VERSION}", &ctx.target_version)
        .replace(
            "${ROUTE_HOSTNAME}",
            ctx.route_hostname.as_deref().unwrap_or(""),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RenderContext {
        RenderContext {
            namespace: "platform-test".to_string(),
            target_version: "1.9.0".to_string(),
            route_hostname: Some("platform.example.com".to_string()),
        }
    }

    #[test]
    fn renders_multi_document_files_with_substitution() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("10-core.yaml"),
            concat!(
                "apiVersion: v1\n",
                "kind: ConfigMap\n",
                "metadata:\n",
                "  name: platform-config\n",
                "  namespace: ${NAMESPACE}\n",
                "data:\n",
                "  version: \"${TARGET_VERSION}\"\n",
                "---\n",
                "apiVersion: v1\n",
                "kind: Service\n",
                "metadata:\n",
                "  name: platform-server\n",
            ),
        )
        .unwrap();

        let docs = DirRenderer::new(tmp.path().to_path_buf())
            .render(&ctx())
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["metadata"]["namespace"], "platform-test");
        assert_eq!(docs[0]["data"]["version"], "1.9.0");
        assert_eq!(docs[1]["kind"], "Service");
    }

    #[test]
    fn files_render_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("20-later.yaml"),
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("10-first.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n",
        )
        .unwrap();

        let docs = DirRenderer::new(tmp.path().to_path_buf())
            .render(&ctx())
            .unwrap();

        assert_eq!(docs[0]["kind"], "ConfigMap");
        assert_eq!(docs[1]["kind"], "Secret");
    }

    #[test]
    fn document_without_kind_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.yaml"), "metadata:\n  name: x\n").unwrap();

        assert!(matches!(
            DirRenderer::new(tmp.path().to_path_buf()).render(&ctx()),
            Err(ControllerError::Render(_))
        ));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(matches!(
            DirRenderer::new(tmp.path().to_path_buf()).render(&ctx()),
            Err(ControllerError::Render(_))
        ));
    }
}
