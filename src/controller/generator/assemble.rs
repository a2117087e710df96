//! # Manifest Assembly
//!
//! Turns a cached generator plus the component's value and substitution
//! configuration into the final object list: value documents are
//! deep-merged in declared order (inline values last), the generator
//! renders, and `${VAR}` / `$VAR` placeholders are substituted into the
//! rendered objects (inline variables win over secret-sourced ones, later
//! secrets win over earlier ones).

use super::{Generator, ValueMap};
use crate::controller::error::ReconcileError;
use crate::crd::DISABLE_SUBSTITUTION_ANNOTATION;
use anyhow::Context;
use kube::core::DynamicObject;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Recursively merge `from` into `target`: map-valued keys merge
/// recursively, everything else (scalars, arrays, type mismatches) is
/// last-writer-wins.
pub fn deep_merge(target: &mut ValueMap, from: ValueMap) {
    for (key, value) in from {
        match (target.get_mut(&key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Merge `from` into `target`, later writers winning per key.
pub fn shallow_merge(target: &mut BTreeMap<String, String>, from: BTreeMap<String, String>) {
    for (key, value) in from {
        target.insert(key, value);
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // $$ escapes a literal dollar sign
        Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("placeholder pattern must compile")
    })
}

/// Replace `${VAR}` / `$VAR` placeholders. Undefined variables become the
/// empty string; `$$` yields a literal `$`.
pub fn substitute_variables(text: &str, variables: &BTreeMap<String, String>) -> String {
    placeholder_pattern()
        .replace_all(text, |caps: &Captures<'_>| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }
            let name = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            variables.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Assemble the final object list for one component.
pub async fn assemble(
    generator: &dyn Generator,
    value_docs: &[Vec<u8>],
    inline_values: Option<&ValueMap>,
    substitution_sources: Vec<BTreeMap<String, String>>,
    inline_substitutions: Option<&BTreeMap<String, String>>,
    namespace: &str,
    name: &str,
) -> Result<Vec<DynamicObject>, ReconcileError> {
    let mut values = ValueMap::new();
    for doc in value_docs {
        let parsed: serde_json::Value = serde_yaml::from_slice(doc)
            .context("failed to parse value document")
            .map_err(ReconcileError::Fatal)?;
        match parsed {
            serde_json::Value::Object(map) => deep_merge(&mut values, map),
            serde_json::Value::Null => {}
            _ => {
                return Err(ReconcileError::fatal(
                    "value document must be a mapping".to_string(),
                ))
            }
        }
    }
    if let Some(inline) = inline_values {
        deep_merge(&mut values, inline.clone());
    }

    let objects = generator.generate(namespace, name, &values).await?;

    let mut substitutions = BTreeMap::new();
    for source in substitution_sources {
        shallow_merge(&mut substitutions, source);
    }
    if let Some(inline) = inline_substitutions {
        shallow_merge(&mut substitutions, inline.clone());
    }
    if substitutions.is_empty() {
        return Ok(objects);
    }
    debug!("substituting {} variable(s) into {} object(s)", substitutions.len(), objects.len());

    let mut substituted = Vec::with_capacity(objects.len());
    for object in objects {
        if substitution_disabled(&object) {
            substituted.push(object);
            continue;
        }
        let raw = serde_yaml::to_string(&object)
            .context("failed to serialize rendered object")
            .map_err(ReconcileError::Fatal)?;
        let replaced = substitute_variables(&raw, &substitutions);
        let object: DynamicObject = serde_yaml::from_str(&replaced)
            .context("object is malformed after variable substitution")
            .map_err(ReconcileError::Fatal)?;
        substituted.push(object);
    }
    Ok(substituted)
}

fn substitution_disabled(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DISABLE_SUBSTITUTION_ANNOTATION))
        .is_some_and(|value| value == "true")
}
