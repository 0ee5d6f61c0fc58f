//! Secret references inside component specs, their resolution against the store, and change detection.
//!
//! A reference is any object of the form `{ valueFromSecret: { name, key } }`. Secrets themselves are
//! ordinary `Secret` resources with a `data` map.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use emesh_core::{secret_name_for, set_path, MeshError, MeshResult, Resource, CONTEXT_LABEL, SECRET_KIND};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const REF_FIELD: &str = "valueFromSecret";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

/// One spec field bound to a secret value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Spec path of the field, outermost first.
    pub path: Vec<String>,
    pub secret: String,
    pub key: String,
}

impl SecretRef {
    /// Environment variable the adapter reads the value from: `auth.accessKeyID` -> `AUTH_ACCESS_KEY_ID`.
    pub fn env_name(&self) -> String {
        env_name(&self.path)
    }
}

/// Environment variable name for a spec path, e.g. `["auth", "accessKeyID"]` -> `AUTH_ACCESS_KEY_ID`.
pub fn env_name(path: &[String]) -> String {
    path.iter().map(|p| upper_snake(p)).collect::<Vec<_>>().join("_")
}

fn upper_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for ch in s.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out
}

/// Every secret reference in `spec`, in document order.
pub fn extract_refs(spec: &Value) -> Vec<SecretRef> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    walk(spec, &mut path, &mut out);
    out
}

fn walk(v: &Value, path: &mut Vec<String>, out: &mut Vec<SecretRef>) {
    match v {
        Value::Object(map) => {
            if let Some(sel) = map.get(REF_FIELD) {
                if let Ok(sel) = serde_json::from_value::<SecretKeySelector>(sel.clone()) {
                    if !path.is_empty() {
                        out.push(SecretRef { path: path.clone(), secret: sel.name, key: sel.key });
                    }
                    return;
                }
            }
            for (k, child) in map {
                path.push(k.clone());
                walk(child, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                walk(child, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Look every reference up among `objects`. Fails on the first missing secret or key.
pub fn resolve(refs: &[SecretRef], objects: &[Resource]) -> MeshResult<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for r in refs {
        let value = objects
            .iter()
            .filter(|o| o.is_secret() && o.name() == r.secret)
            .find_map(|o| o.data.get(&r.key))
            .ok_or_else(|| MeshError::SecretNotFound { secret: r.secret.clone(), key: r.key.clone() })?;
        env.insert(r.env_name(), value.clone());
    }
    debug!(refs = refs.len(), "secrets resolved");
    Ok(env)
}

/// Content hash of a resolved environment; stable across key order.
pub fn hash(env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in env {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Whether the environment differs from the one recorded as `previous`.
/// No record and no secrets is not a change.
pub fn changed(previous: Option<&str>, env: &BTreeMap<String, String>) -> bool {
    match previous {
        None => !env.is_empty(),
        Some(h) => h != hash(env),
    }
}

pub fn secret_ref_value(secret: &str, key: &str) -> Value {
    serde_json::json!({ REF_FIELD: { "name": secret, "key": key } })
}

/// Move plain values out of the spec: each `field` becomes a reference into
/// `<component>-secret`, whose resource is returned. `None` when `values` is empty.
pub fn bind(
    component: &str,
    context: &str,
    spec: &mut Value,
    values: &BTreeMap<String, String>,
) -> MeshResult<Option<Resource>> {
    if values.is_empty() {
        return Ok(None);
    }
    let secret = secret_name_for(component);
    let mut data = BTreeMap::new();
    for (field, value) in values {
        let key = field.replace('.', "-");
        set_path(spec, field, secret_ref_value(&secret, &key))?;
        data.insert(key, value.clone());
    }
    Ok(Some(secret_resource(&secret, context, data)))
}

pub fn secret_resource(name: &str, context: &str, data: BTreeMap<String, String>) -> Resource {
    let mut r = Resource::new("v1", SECRET_KIND, name).with_label(CONTEXT_LABEL, context);
    r.data = data;
    r
}

/// Whether any resource other than `except` still references `secret`.
pub fn is_referenced(secret: &str, objects: &[Resource], except: &str) -> bool {
    objects
        .iter()
        .filter(|o| !o.is_secret() && o.name() != except)
        .any(|o| extract_refs(&o.spec).iter().any(|r| r.secret == secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str, pairs: &[(&str, &str)]) -> Resource {
        secret_resource(name, "local", pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn finds_nested_refs_and_names_env() {
        let spec = serde_json::json!({
            "endpoint": "http://x",
            "auth": {
                "accessKeyID": { "valueFromSecret": { "name": "s", "key": "id" } },
                "token": { "valueFromSecret": { "name": "s", "key": "tok" } }
            },
            "headers": [ { "value": { "valueFromSecret": { "name": "t", "key": "h" } } } ]
        });
        let refs = extract_refs(&spec);
        let names: Vec<_> = refs.iter().map(SecretRef::env_name).collect();
        assert_eq!(names, vec!["AUTH_ACCESS_KEY_ID", "AUTH_TOKEN", "HEADERS_0_VALUE"]);
        assert_eq!(refs[2].secret, "t");
    }

    #[test]
    fn malformed_ref_is_plain_data() {
        let spec = serde_json::json!({ "x": { "valueFromSecret": "nope" } });
        assert!(extract_refs(&spec).is_empty());
    }

    #[test]
    fn resolves_or_reports_missing() {
        let spec = serde_json::json!({ "token": { "valueFromSecret": { "name": "s", "key": "tok" } } });
        let refs = extract_refs(&spec);
        let store = vec![secret("s", &[("tok", "abc")])];
        let env = resolve(&refs, &store).unwrap();
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("abc"));

        let err = resolve(&refs, &[secret("s", &[("other", "x")])]).unwrap_err();
        assert!(matches!(err, MeshError::SecretNotFound { ref key, .. } if key == "tok"));
        assert!(resolve(&refs, &[]).is_err());
    }

    #[test]
    fn change_detection_is_content_based() {
        let mut env = BTreeMap::new();
        assert!(!changed(None, &env));
        env.insert("A".to_string(), "1".to_string());
        assert!(changed(None, &env));
        let h = hash(&env);
        assert!(!changed(Some(&h), &env));
        env.insert("A".to_string(), "2".to_string());
        assert!(changed(Some(&h), &env));
        assert_eq!(hash(&BTreeMap::new()).len(), 64);
    }

    #[test]
    fn bind_moves_values_into_component_secret() {
        let mut spec = serde_json::json!({ "endpoint": "http://x" });
        let values: BTreeMap<_, _> = [("auth.token".to_string(), "abc".to_string())].into_iter().collect();
        let s = bind("sink", "local", &mut spec, &values).unwrap().unwrap();
        assert_eq!(s.name(), "sink-secret");
        assert_eq!(s.data.get("auth-token").map(String::as_str), Some("abc"));
        let refs = extract_refs(&spec);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].env_name(), "AUTH_TOKEN");
        assert_eq!(resolve(&refs, &[s]).unwrap()["AUTH_TOKEN"], "abc");
        assert!(bind("sink", "local", &mut spec, &BTreeMap::new()).unwrap().is_none());
    }

    #[test]
    fn reference_scan_ignores_owner() {
        let mut a = Resource::new("targets.triggermesh.io/v1alpha1", "HTTPTarget", "a");
        a.spec = serde_json::json!({ "t": secret_ref_value("a-secret", "k") });
        let mut b = Resource::new("targets.triggermesh.io/v1alpha1", "HTTPTarget", "b");
        b.spec = serde_json::json!({ "t": secret_ref_value("a-secret", "k") });
        let objects = vec![a, b, secret("a-secret", &[("k", "v")])];
        assert!(is_referenced("a-secret", &objects, "a"));
        assert!(!is_referenced("a-secret", &objects[..1], "a"));
    }
}
