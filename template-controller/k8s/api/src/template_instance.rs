use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Requests that a template be instantiated on behalf of the user who
/// created it.
///
/// The spec is fixed at creation: the admission webhook stamps the
/// requester and rejects later changes to the spec.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "template.openshift.io",
    version = "v1",
    kind = "TemplateInstance",
    status = "TemplateInstanceStatus",
    shortname = "ti",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstanceSpec {
    pub template: Template,

    /// Names a secret in the instance's namespace holding parameter values,
    /// keyed by parameter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretReference>,

    /// The identity that created the instance. Objects are created while
    /// impersonating this identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Requester>,
}

/// A parameterized list of objects.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    #[schemars(schema_with = "embedded_objects")]
    pub objects: Vec<serde_json::Value>,

    #[serde(default)]
    pub parameters: Vec<Parameter>,

    /// Labels applied to every object created from the template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Used when the secret carries no value for this parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TemplateInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<TemplateInstanceCondition>,

    /// Objects created by the instantiation, in creation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<TemplateInstanceObject>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstanceCondition {
    /// Either `Ready` or `InstantiateFailure`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Always `True` once written.
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<crate::Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TemplateInstanceObject {
    #[serde(rename = "ref")]
    pub object_ref: ObjectReference,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_INSTANTIATE_FAILURE: &str = "InstantiateFailure";

// === impl TemplateInstance ===

impl TemplateInstance {
    /// Returns the condition that ended this instance's reconciliation, if any.
    pub fn terminal_condition(&self) -> Option<&TemplateInstanceCondition> {
        self.status
            .iter()
            .flat_map(|status| status.conditions.iter())
            .find(|c| c.is_terminal())
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_condition().is_some()
    }
}

// === impl TemplateInstanceCondition ===

impl TemplateInstanceCondition {
    pub fn is_terminal(&self) -> bool {
        self.status == "True"
            && (self.type_ == CONDITION_READY || self.type_ == CONDITION_INSTANTIATE_FAILURE)
    }
}

// === impl ObjectReference ===

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Template objects are arbitrary resources, so the schema keeps every field.
fn embedded_objects(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        },
    }))
    .expect("embedded object schema must be valid")
}
