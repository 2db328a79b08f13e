//! Idempotent resource apply via deep merge.
//!
//! Makes a desired resource present in the cluster without clobbering
//! server-managed fields: the desired body is recursively merged into a
//! copy of the live object, fields only the server knows about are kept,
//! and the write is skipped entirely when the merge produces no diff.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{ControllerError, is_not_found};

/// Tuning knobs for the merge algorithm.
///
/// The path lists use dot-joined map keys; array elements inherit the path
/// of their parent field.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Paths never overwritten by the merge
    pub skip_paths: Vec<String>,
    /// Paths always kept from the live object (legitimately server-assigned
    /// after creation, e.g. an image reference rewritten by the platform)
    pub preserve_paths: Vec<String>,
    /// Map keys whose values are Kubernetes quantities and must be compared
    /// by parsed numeric value rather than string representation
    pub quantity_keys: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            skip_paths: vec![
                "kind".to_string(),
                "apiVersion".to_string(),
                "status".to_string(),
            ],
            preserve_paths: Vec::new(),
            quantity_keys: vec![
                "memory".to_string(),
                "cpu".to_string(),
                "storage".to_string(),
                "ephemeral-storage".to_string(),
            ],
        }
    }
}

impl MergeConfig {
    /// Add caller-specific paths that must never be overwritten.
    #[must_use]
    pub fn skip(mut self, paths: &[&str]) -> Self {
        self.skip_paths.extend(paths.iter().map(|p| (*p).to_string()));
        self
    }

    /// Add paths that are always kept from the live object.
    #[must_use]
    pub fn preserve(mut self, paths: &[&str]) -> Self {
        self.preserve_paths
            .extend(paths.iter().map(|p| (*p).to_string()));
        self
    }

    fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
    }

    fn is_preserved(&self, path: &str) -> bool {
        self.preserve_paths.iter().any(|p| p == path)
    }
}

/// Parse a Kubernetes quantity string (`1Gi`, `1024Mi`, `500m`, `2`) into
/// its numeric value. Returns `None` for strings that are not quantities.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num.parse().ok()?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => return None,
    };

    Some(value * multiplier)
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Scalar equivalence beyond plain equality: quantities compared by value,
/// secret data compared by decoded bytes against a plaintext desired form.
fn scalars_equivalent(
    key: &str,
    parent_path: &str,
    kind: &str,
    existing: &Value,
    desired: &Value,
    cfg: &MergeConfig,
) -> bool {
    if existing == desired {
        return true;
    }

    if cfg.quantity_keys.iter().any(|k| k == key) {
        if let (Some(e), Some(d)) = (existing.as_str(), desired.as_str()) {
            if let (Some(ev), Some(dv)) = (parse_quantity(e), parse_quantity(d)) {
                return (ev - dv).abs() < f64::EPSILON;
            }
        }
    }

    if kind == "Secret" && parent_path == "data" {
        if let (Some(e), Some(d)) = (existing.as_str(), desired.as_str()) {
            if let Ok(bytes) = BASE64.decode(e) {
                return bytes == d.as_bytes();
            }
        }
    }

    false
}

fn merge_into(
    existing: &mut Value,
    desired: &Value,
    path: &str,
    kind: &str,
    cfg: &MergeConfig,
) {
    match (existing, desired) {
        (Value::Object(eo), Value::Object(dobj)) => {
            for (key, dv) in dobj {
                let child = join_path(path, key);
                if cfg.is_skipped(&child) || cfg.is_preserved(&child) {
                    continue;
                }
                match eo.get_mut(key) {
                    Some(ev) => {
                        if scalars_equivalent(key, path, kind, ev, dv, cfg) {
                            continue;
                        }
                        let recursable = (ev.is_object() && dv.is_object())
                            || (ev.is_array() && dv.is_array());
                        if recursable {
                            merge_into(ev, dv, &child, kind, cfg);
                        } else {
                            *ev = dv.clone();
                        }
                    }
                    None => {
                        eo.insert(key.clone(), dv.clone());
                    }
                }
            }
        }
        (Value::Array(ea), Value::Array(da)) => {
            // element-by-element by index, extra desired elements appended
            for (i, dv) in da.iter().enumerate() {
                match ea.get_mut(i) {
                    Some(ev) => {
                        let recursable = (ev.is_object() && dv.is_object())
                            || (ev.is_array() && dv.is_array());
                        if recursable {
                            merge_into(ev, dv, path, kind, cfg);
                        } else if ev != dv {
                            *ev = dv.clone();
                        }
                    }
                    None => ea.push(dv.clone()),
                }
            }
        }
        (slot, dv) => {
            if slot != dv {
                *slot = dv.clone();
            }
        }
    }
}

/// Merge `desired` into a copy of `existing` and return the result.
///
/// Keys present only in `existing` are preserved so server-populated fields
/// survive the apply. The operation is idempotent: merging the same desired
/// body into its own merge result yields an identical value.
pub fn merge_resource(existing: &Value, desired: &Value, cfg: &MergeConfig) -> Value {
    let kind = existing
        .get("kind")
        .or_else(|| desired.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut merged = existing.clone();

    // Secrets: a desired plaintext stringData entry that decodes equal to the
    // live base64 data entry must not churn the object.
    let desired = if kind == "Secret" {
        strip_equivalent_string_data(existing, desired)
    } else {
        desired.clone()
    };

    merge_into(&mut merged, &desired, "", &kind, cfg);
    merged
}

fn strip_equivalent_string_data(existing: &Value, desired: &Value) -> Value {
    let mut desired = desired.clone();
    let live_data = existing.get("data").and_then(Value::as_object).cloned();

    if let (Some(live), Some(Value::Object(string_data))) =
        (live_data, desired.get_mut("stringData"))
    {
        string_data.retain(|key, plain| {
            let same = live
                .get(key)
                .and_then(Value::as_str)
                .and_then(|b64| BASE64.decode(b64).ok())
                .is_some_and(|bytes| Some(bytes.as_slice()) == plain.as_str().map(str::as_bytes));
            !same
        });
        if string_data.is_empty() {
            if let Some(obj) = desired.as_object_mut() {
                obj.remove("stringData");
            }
        }
    }

    desired
}

/// Deep-merge apply engine over dynamic objects.
pub struct ResourceApplier {
    client: Client,
    cfg: MergeConfig,
}

impl std::fmt::Debug for ResourceApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceApplier")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl ResourceApplier {
    /// Create an applier with the given merge configuration.
    pub fn new(client: Client, cfg: MergeConfig) -> Self {
        Self { client, cfg }
    }

    /// Merge configuration in effect.
    pub fn config(&self) -> &MergeConfig {
        &self.cfg
    }

    /// Make `desired` present in `namespace`.
    ///
    /// Creates the object verbatim when absent; otherwise deep-merges the
    /// desired body into the live object and only writes when the merge
    /// changed something. Returns the observed object and whether a write
    /// happened.
    pub async fn apply(
        &self,
        namespace: &str,
        desired: &Value,
    ) -> Result<(DynamicObject, bool), ControllerError> {
        let gvk = gvk_of(desired)?;
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &ar);

        let name = desired
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ControllerError::InvalidConfig("desired resource has no metadata.name".to_string())
            })?
            .to_string();

        match api.get(&name).await {
            Err(e) if is_not_found(&e) => {
                let obj: DynamicObject = serde_json::from_value(desired.clone())?;
                let created = api.create(&PostParams::default(), &obj).await?;
                debug!(kind = %gvk.kind, name = %name, "resource created");
                Ok((created, true))
            }
            Err(e) => Err(ControllerError::Kube(e)),
            Ok(existing) => {
                let live = serde_json::to_value(&existing)?;
                let merged = merge_resource(&live, desired, &self.cfg);
                if merged == live {
                    Ok((existing, false))
                } else {
                    let obj: DynamicObject = serde_json::from_value(merged)?;
                    let updated = api.replace(&name, &PostParams::default(), &obj).await?;
                    debug!(kind = %gvk.kind, name = %name, "resource updated");
                    Ok((updated, true))
                }
            }
        }
    }
}

/// Extract the group/version/kind of a manifest body.
pub fn gvk_of(resource: &Value) -> Result<GroupVersionKind, ControllerError> {
    let api_version = resource
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| ControllerError::InvalidConfig("resource has no apiVersion".to_string()))?;
    let kind = resource
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ControllerError::InvalidConfig("resource has no kind".to_string()))?;

    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };

    Ok(GroupVersionKind::gvk(group, version, kind))
}
