//! Exec-ing commands inside managed pods.
//!
//! Both the backup machinery (`pg_dump`, `psql` restore) and the database
//! migration step (version probe) run commands inside the database pod
//! over the Kubernetes exec subresource.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ControllerError;

/// Resolve the single pod matching `selector`. Zero or multiple matches
/// are errors: exec targets must be unambiguous.
pub async fn single_pod(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<String, ControllerError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods
        .list(&ListParams::default().labels(selector))
        .await?;

    match list.items.as_slice() {
        [] => Err(ControllerError::Exec(format!(
            "no pod with label `{selector}` found in namespace {namespace}"
        ))),
        [pod] => pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::Exec("pod has no name".to_string())),
        _ => Err(ControllerError::Exec(format!(
            "more than one pod with label `{selector}` found in namespace {namespace}"
        ))),
    }
}

/// Run `command` in `container` of `pod`, optionally feeding `stdin`,
/// and return the captured stdout.
pub async fn exec_capture(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: &str,
    command: Vec<String>,
    stdin: Option<Vec<u8>>,
) -> Result<Vec<u8>, ControllerError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let params = AttachParams::default()
        .container(container)
        .stdin(stdin.is_some())
        .stdout(true)
        .stderr(true);

    let mut attached = pods.exec(pod, command, &params).await?;

    if let (Some(bytes), Some(mut writer)) = (stdin, attached.stdin()) {
        writer.write_all(&bytes).await?;
        writer.shutdown().await?;
    }

    let mut output = Vec::new();
    if let Some(mut stdout) = attached.stdout() {
        stdout.read_to_end(&mut output).await?;
    }

    attached
        .join()
        .await
        .map_err(|e| ControllerError::Exec(e.to_string()))?;
    Ok(output)
}
