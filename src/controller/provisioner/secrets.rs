//! # Secret References
//!
//! Resolves the secret coordinates a storage class asks for.
//!
//! A storage class names a secret with a pair of parameters, for example
//! `csiProvisionerSecretName` and `csiProvisionerSecretNamespace`. Both values
//! are templates that may contain `${token}` placeholders:
//!
//! | template  | tokens |
//! |-----------|--------|
//! | namespace | `${pv.name}`, `${pvc.namespace}` |
//! | name      | `${pv.name}`, `${pvc.name}`, `${pvc.namespace}`, `${pvc.annotations['KEY']}` |
//!
//! Claim tokens are only available when a claim is in scope.
//!
//! Resolution does no I/O. Fetching the secret contents is the object store's job.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, SecretReference};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// The two storage class parameters naming one secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretParams {
    pub name_key: &'static str,
    pub namespace_key: &'static str,
}

/// Credentials for create and delete
pub const PROVISIONER_SECRET: SecretParams = SecretParams {
    name_key: "csiProvisionerSecretName",
    namespace_key: "csiProvisionerSecretNamespace",
};

/// Credentials for attach and detach
pub const CONTROLLER_PUBLISH_SECRET: SecretParams = SecretParams {
    name_key: "csiControllerPublishSecretName",
    namespace_key: "csiControllerPublishSecretNamespace",
};

pub const NODE_STAGE_SECRET: SecretParams = SecretParams {
    name_key: "csiNodeStageSecretName",
    namespace_key: "csiNodeStageSecretNamespace",
};

pub const NODE_PUBLISH_SECRET: SecretParams = SecretParams {
    name_key: "csiNodePublishSecretName",
    namespace_key: "csiNodePublishSecretNamespace",
};

// RFC 1123 label: [a-z0-9]([-a-z0-9]*[a-z0-9])?
static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("DNS label regex is valid")
});

// RFC 1123 subdomain: dot separated labels
static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS subdomain regex is valid")
});

/// Valid namespace name (at most 63 characters)
#[must_use]
pub fn is_dns1123_label(value: &str) -> bool {
    value.len() <= 63 && DNS_LABEL.is_match(value)
}

/// Valid object name (at most 253 characters)
#[must_use]
pub fn is_dns1123_subdomain(value: &str) -> bool {
    value.len() <= 253 && DNS_SUBDOMAIN.is_match(value)
}

/// Resolve the secret named by `params` in the storage class `parameters`
///
/// Returns `Ok(None)` when the class does not ask for that secret.
pub fn resolve_secret_reference(
    params: SecretParams,
    parameters: &BTreeMap<String, String>,
    volume_name: &str,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<Option<SecretReference>> {
    let name_template = parameters.get(params.name_key);
    let namespace_template = parameters.get(params.namespace_key);

    let (name_template, namespace_template) = match (name_template, namespace_template) {
        (None, None) => return Ok(None),
        (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
            (name, namespace)
        }
        _ => {
            return Err(Error::Configuration(format!(
                "either {} and {} parameters must be specified together",
                params.name_key, params.namespace_key
            )))
        }
    };

    let namespace = resolve_namespace(params.namespace_key, namespace_template, volume_name, claim)?;
    let name = resolve_name(params.name_key, name_template, volume_name, claim)?;

    Ok(Some(SecretReference {
        name: Some(name),
        namespace: Some(namespace),
    }))
}

fn resolve_namespace(
    key: &str,
    template: &str,
    volume_name: &str,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<String> {
    let mut tokens = BTreeMap::from([("pv.name".to_string(), volume_name.to_string())]);
    if let Some(claim) = claim {
        tokens.insert(
            "pvc.namespace".to_string(),
            claim.metadata.namespace.clone().unwrap_or_default(),
        );
    }

    let resolved = substitute(key, template, &tokens)?;
    if !is_dns1123_label(&resolved) {
        return Err(invalid_resolution(key, template, &resolved, "namespace name"));
    }
    Ok(resolved)
}

fn resolve_name(
    key: &str,
    template: &str,
    volume_name: &str,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<String> {
    let mut tokens = BTreeMap::from([("pv.name".to_string(), volume_name.to_string())]);
    if let Some(claim) = claim {
        tokens.insert(
            "pvc.name".to_string(),
            claim.metadata.name.clone().unwrap_or_default(),
        );
        tokens.insert(
            "pvc.namespace".to_string(),
            claim.metadata.namespace.clone().unwrap_or_default(),
        );
        for (key, value) in claim.metadata.annotations.iter().flatten() {
            tokens.insert(format!("pvc.annotations['{key}']"), value.clone());
        }
    }

    let resolved = substitute(key, template, &tokens)?;
    if !is_dns1123_subdomain(&resolved) {
        return Err(invalid_resolution(key, template, &resolved, "secret name"));
    }
    Ok(resolved)
}

fn invalid_resolution(key: &str, template: &str, resolved: &str, what: &str) -> Error {
    if template == resolved {
        Error::Configuration(format!("{key} parameter {template:?} is not a valid {what}"))
    } else {
        Error::Configuration(format!(
            "{key} parameter {template:?} resolved to {resolved:?} which is not a valid {what}"
        ))
    }
}

/// Replace every `${token}` in `template`, collecting every unknown token
fn substitute(key: &str, template: &str, tokens: &BTreeMap<String, String>) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut missing = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // unterminated placeholder is kept literally
            resolved.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after[..end];
        match tokens.get(token) {
            Some(value) => resolved.push_str(value),
            None => {
                missing.insert(token.to_string());
            }
        }
        rest = &after[end + 1..];
    }
    resolved.push_str(rest);

    if missing.is_empty() {
        Ok(resolved)
    } else {
        let list: Vec<_> = missing.into_iter().collect();
        Err(Error::Configuration(format!(
            "error resolving value {template:?} of parameter {key}: invalid tokens: {list:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                namespace: Some("team-a".to_string()),
                annotations: Some(BTreeMap::from([(
                    "example.com/secret".to_string(),
                    "custom-creds".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_no_templates_means_no_secret() {
        let result =
            resolve_secret_reference(PROVISIONER_SECRET, &BTreeMap::new(), "pvc-1", None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_templates_must_come_in_pairs() {
        for pairs in [
            &[("csiProvisionerSecretName", "creds")][..],
            &[("csiProvisionerSecretNamespace", "kube-system")][..],
            &[
                ("csiProvisionerSecretName", ""),
                ("csiProvisionerSecretNamespace", "kube-system"),
            ][..],
        ] {
            let err = resolve_secret_reference(PROVISIONER_SECRET, &params(pairs), "pvc-1", None)
                .unwrap_err();
            assert!(
                matches!(err, Error::Configuration(ref m) if m.contains("must be specified together")),
                "unexpected error for {pairs:?}: {err}"
            );
        }
    }

    #[test]
    fn test_literal_values_pass_through() {
        let reference = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "creds"),
                ("csiProvisionerSecretNamespace", "kube-system"),
            ]),
            "pvc-1",
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.name.as_deref(), Some("creds"));
        assert_eq!(reference.namespace.as_deref(), Some("kube-system"));
    }

    #[test]
    fn test_claim_tokens_resolve() {
        let claim = claim();
        let reference = resolve_secret_reference(
            NODE_PUBLISH_SECRET,
            &params(&[
                (
                    "csiNodePublishSecretName",
                    "${pvc.annotations['example.com/secret']}",
                ),
                ("csiNodePublishSecretNamespace", "${pvc.namespace}"),
            ]),
            "pvc-1",
            Some(&claim),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.name.as_deref(), Some("custom-creds"));
        assert_eq!(reference.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_volume_name_token_resolves_without_claim() {
        let reference = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "${pv.name}-creds"),
                ("csiProvisionerSecretNamespace", "${pv.name}"),
            ]),
            "pvc-1234",
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(reference.name.as_deref(), Some("pvc-1234-creds"));
        assert_eq!(reference.namespace.as_deref(), Some("pvc-1234"));
    }

    #[test]
    fn test_every_missing_token_is_listed() {
        let err = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "${pvc.name}-${foo}-${pv.name}"),
                ("csiProvisionerSecretNamespace", "default"),
            ]),
            "pvc-1",
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("\"foo\""), "{message}");
        assert!(message.contains("\"pvc.name\""), "{message}");
        assert!(!message.contains("\"pv.name\""), "{message}");
    }

    #[test]
    fn test_claim_name_not_allowed_in_namespace_template() {
        let claim = claim();
        let err = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "creds"),
                ("csiProvisionerSecretNamespace", "${pvc.name}"),
            ]),
            "pvc-1",
            Some(&claim),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid tokens"));
    }

    #[test]
    fn test_invalid_resolution_names_template_and_result() {
        let claim = claim();
        let err = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "creds"),
                ("csiProvisionerSecretNamespace", "${pvc.namespace}.x"),
            ]),
            "pvc-1",
            Some(&claim),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("${pvc.namespace}.x"), "{message}");
        assert!(message.contains("team-a.x"), "{message}");
    }

    #[test]
    fn test_invalid_literal_reports_template_only() {
        let err = resolve_secret_reference(
            PROVISIONER_SECRET,
            &params(&[
                ("csiProvisionerSecretName", "Not_Valid"),
                ("csiProvisionerSecretNamespace", "default"),
            ]),
            "pvc-1",
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "csiProvisionerSecretName parameter \"Not_Valid\" is not a valid secret name"
        );
    }

    #[test]
    fn test_dns_validation() {
        assert!(is_dns1123_label("kube-system"));
        assert!(!is_dns1123_label("kube.system"));
        assert!(!is_dns1123_label("-leading"));
        assert!(!is_dns1123_label(&"a".repeat(64)));
        assert!(is_dns1123_subdomain("my.secret-1"));
        assert!(!is_dns1123_subdomain("UPPER"));
        assert!(!is_dns1123_subdomain(""));
    }
}
