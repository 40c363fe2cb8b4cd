#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod condition;
pub mod identity;
pub mod instantiate;
pub mod template;


pub use self::{
    condition::{ConditionType, TerminalCondition},
    identity::{Identity, IdentityError},
    instantiate::{
        create_all, CreateError, InstantiationResult, Instantiator, ObjectStore, Outcome,
        ParameterSource, Rejection, SecretError,
    },
    template::{ParameterError, Parameters, ProcessedManifest},
};
pub use template_controller_k8s_api::ObjectReference;

use template_controller_k8s_api as k8s;
