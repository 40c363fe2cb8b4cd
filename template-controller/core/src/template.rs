use crate::k8s::{self, ObjectReference};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::{borrow::Cow, collections::BTreeMap, sync::LazyLock};

/// Raw parameter values keyed by parameter name, as stored in a secret.
pub type Parameters = BTreeMap<String, Vec<u8>>;

/// An object from a template with every parameter reference resolved.
///
/// Manifests are never persisted; they live for a single reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedManifest(Value);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("parameter {0} is required and must be specified")]
    Missing(String),

    #[error("parameter {0} is declared more than once")]
    Duplicate(String),

    #[error("value of parameter {0} is not valid UTF-8")]
    NotUtf8(String),
}

static PARAMETER_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z0-9_]+)\}").expect("parameter reference pattern must compile")
});

/// Resolves the template's parameters against `bindings` and substitutes
/// them into every object.
///
/// The returned manifests are in the template's declaration order. Objects
/// without a namespace are placed in `namespace`. No manifest is returned
/// unless every required parameter has a value.
pub fn process(
    template: &k8s::Template,
    bindings: &Parameters,
    namespace: &str,
) -> Result<Vec<ProcessedManifest>, ParameterError> {
    let values = resolve_values(&template.parameters, bindings)?;

    let labels = template
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), substitute_str(v, &values).into_owned()))
        .collect::<BTreeMap<_, _>>();

    let manifests = template
        .objects
        .iter()
        .map(|object| {
            let mut object = object.clone();
            substitute(&mut object, &values);
            set_metadata(&mut object, namespace, &labels);
            ProcessedManifest(object)
        })
        .collect();
    Ok(manifests)
}

fn resolve_values(
    parameters: &[k8s::Parameter],
    bindings: &Parameters,
) -> Result<BTreeMap<String, String>, ParameterError> {
    let mut values = BTreeMap::new();
    for param in parameters {
        if values.contains_key(&param.name) {
            return Err(ParameterError::Duplicate(param.name.clone()));
        }

        let value = match bindings.get(&param.name) {
            Some(raw) => String::from_utf8(raw.clone())
                .map_err(|_| ParameterError::NotUtf8(param.name.clone()))?,
            None => param.value.clone().unwrap_or_default(),
        };
        if param.required && value.is_empty() {
            return Err(ParameterError::Missing(param.name.clone()));
        }

        values.insert(param.name.clone(), value);
    }
    Ok(values)
}

fn substitute(value: &mut Value, values: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => {
            if PARAMETER_REF.is_match(s) {
                let replaced = substitute_str(s, values).into_owned();
                *s = replaced;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, values)),
        Value::Object(fields) => fields.values_mut().for_each(|v| substitute(v, values)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

// References to undeclared parameters are left as written.
fn substitute_str<'s>(s: &'s str, values: &BTreeMap<String, String>) -> Cow<'s, str> {
    PARAMETER_REF.replace_all(s, |caps: &Captures<'_>| match values.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
}

fn set_metadata(object: &mut Value, namespace: &str, labels: &BTreeMap<String, String>) {
    let Some(fields) = object.as_object_mut() else {
        return;
    };
    let Some(metadata) = fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    else {
        return;
    };

    let has_namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .is_some_and(|ns| !ns.is_empty());
    if !has_namespace {
        metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    if labels.is_empty() {
        return;
    }
    if let Some(object_labels) = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    {
        for (k, v) in labels {
            object_labels
                .entry(k.clone())
                .or_insert_with(|| Value::String(v.clone()));
        }
    }
}

// === impl ProcessedManifest ===

impl ProcessedManifest {
    pub fn object(&self) -> &Value {
        &self.0
    }

    pub fn into_object(self) -> Value {
        self.0
    }

    /// Identifies the manifest by whatever type and name it declares. Fields
    /// the manifest does not set are left empty.
    pub fn object_ref(&self) -> ObjectReference {
        let field = |ptr: &str| self.0.pointer(ptr).and_then(Value::as_str);
        ObjectReference {
            api_version: field("/apiVersion").unwrap_or_default().to_string(),
            kind: field("/kind").unwrap_or_default().to_string(),
            namespace: field("/metadata/namespace")
                .filter(|ns| !ns.is_empty())
                .map(str::to_string),
            name: field("/metadata/name").unwrap_or_default().to_string(),
            uid: None,
        }
    }
}

impl From<Value> for ProcessedManifest {
    fn from(object: Value) -> Self {
        Self(object)
    }
}
