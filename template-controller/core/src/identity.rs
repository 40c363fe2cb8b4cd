use crate::k8s::TemplateInstance;
use std::fmt;

/// The user and groups that template objects are created as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("template instance has no requester")]
    MissingRequester,
}

/// Returns the identity captured on the instance when it was created.
///
/// This never considers who is reconciling or reading the instance now.
pub fn resolve(instance: &TemplateInstance) -> Result<Identity, IdentityError> {
    let requester = instance
        .spec
        .requester
        .as_ref()
        .filter(|r| !r.username.is_empty())
        .ok_or(IdentityError::MissingRequester)?;

    Ok(Identity {
        user: requester.username.clone(),
        groups: requester.groups.clone(),
    })
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.user, f)
    }
}
