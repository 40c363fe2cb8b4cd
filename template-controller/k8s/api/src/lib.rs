#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod template_instance;

pub use self::template_instance::{
    ObjectReference, Parameter, Requester, SecretReference, Template, TemplateInstance,
    TemplateInstanceCondition, TemplateInstanceObject, TemplateInstanceSpec,
    TemplateInstanceStatus,
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        core::v1::{Namespace, Secret, Service},
        rbac::v1::{ClusterRoleBinding, RoleBinding},
    },
    apimachinery::{self, pkg::apis::meta::v1::Time},
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    Client, Error, Resource,
};

/// The API group served by the controller.
pub const API_GROUP: &str = "template.openshift.io";
