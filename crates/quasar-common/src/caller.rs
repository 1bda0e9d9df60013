use std::collections::BTreeSet;
use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::QuasarError;
use crate::model::ModelRecord;

pub const USER_HEADER: &str = "x-quasar-user";
pub const GROUPS_HEADER: &str = "x-quasar-groups";
pub const SUPERUSER_HEADER: &str = "x-quasar-superuser";

/// Identity of whoever issued a request.
///
/// Authentication happens upstream; the control plane only reads the
/// resolved identity from headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub user: Option<String>,
    pub groups: BTreeSet<String>,
    pub is_superuser: bool,
}

impl Caller {
    pub fn superuser() -> Self {
        Self {
            user: Some("admin".into()),
            groups: BTreeSet::new(),
            is_superuser: true,
        }
    }

    pub fn user(name: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            user: Some(name.into()),
            groups: groups.into_iter().map(Into::into).collect(),
            is_superuser: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }

    /// Hidden models are visible to superusers only; grouped models to
    /// members of the group.
    pub fn check_model_access(&self, record: &ModelRecord) -> Result<(), QuasarError> {
        if self.is_superuser {
            return Ok(());
        }
        if record.is_hidden {
            return Err(QuasarError::AccessDenied(format!(
                "user {} is not allowed to operate on hidden model {}",
                self.display_name(),
                record.model_id
            )));
        }
        match &record.model_group_id {
            Some(group) if !self.groups.contains(group) => Err(QuasarError::AccessDenied(format!(
                "user {} has no access to model group {group}",
                self.display_name()
            ))),
            _ => Ok(()),
        }
    }

    pub fn from_parts(parts: &Parts) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let groups = header(GROUPS_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let is_superuser = header(SUPERUSER_HEADER)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        Self {
            user: header(USER_HEADER).map(str::to_string),
            groups,
            is_superuser,
        }
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_parts(parts))
    }
}
