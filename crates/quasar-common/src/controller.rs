use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::QuasarError;
use crate::rate_limiter::RateLimiterConfig;

/// Lookup result for one user's limiter.
///
/// A user mapped to JSON `null` is distinct from a user that is not in the
/// map at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterSlot<'a> {
    Missing,
    ExplicitNull,
    Present(&'a RateLimiterConfig),
}

/// Per-user rate limiter overrides for one model.
///
/// Stored under the `controllers` index keyed by model id and mirrored into
/// the model record so workers receive it with every deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawController")]
pub struct AccessController {
    pub model_id: String,
    pub user_rate_limiter: BTreeMap<String, Option<RateLimiterConfig>>,
}

#[derive(Deserialize)]
struct RawController {
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    user_rate_limiter: Option<BTreeMap<String, Option<RateLimiterConfig>>>,
}

impl TryFrom<RawController> for AccessController {
    type Error = QuasarError;

    fn try_from(raw: RawController) -> Result<Self, Self::Error> {
        let model_id = raw
            .model_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| QuasarError::Validation("controller model_id is required".into()))?;

        // an empty `{}` limiter carries nothing; explicit nulls are kept
        let user_rate_limiter = raw
            .user_rate_limiter
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, limiter)| !matches!(limiter, Some(l) if l.is_empty()))
            .collect();

        Ok(Self {
            model_id,
            user_rate_limiter,
        })
    }
}

impl AccessController {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            user_rate_limiter: BTreeMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>, limiter: Option<RateLimiterConfig>) -> Self {
        self.user_rate_limiter.insert(user.into(), limiter);
        self
    }

    pub fn parse(input: &str) -> Result<Self, QuasarError> {
        serde_json::from_str(input).map_err(|e| QuasarError::Validation(e.to_string()))
    }

    pub fn slot(&self, user: &str) -> LimiterSlot<'_> {
        match self.user_rate_limiter.get(user) {
            None => LimiterSlot::Missing,
            Some(None) => LimiterSlot::ExplicitNull,
            Some(Some(limiter)) => LimiterSlot::Present(limiter),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_rate_limiter.is_empty()
    }

    /// Merge `incoming` into this controller.
    ///
    /// New users are copied as given. For users already present, the entry is
    /// merged field by field only when the incoming limiter passes
    /// [`RateLimiterConfig::update_validity_pre_check`]; an incoming `null`
    /// never clears an existing entry. Users only present here are kept.
    pub fn update(&mut self, incoming: Option<&AccessController>) {
        let Some(incoming) = incoming else {
            return;
        };
        for (user, candidate) in &incoming.user_rate_limiter {
            match self.user_rate_limiter.get_mut(user) {
                None => {
                    self.user_rate_limiter.insert(user.clone(), candidate.clone());
                }
                Some(current) => {
                    if RateLimiterConfig::update_validity_pre_check(
                        current.as_ref(),
                        candidate.as_ref(),
                    ) {
                        *current = RateLimiterConfig::merged(current.as_ref(), candidate.as_ref());
                    }
                }
            }
        }
    }

    /// Whether merging `incoming` changes the admission behaviour of any user
    /// enough that serving nodes must rebuild their limiters.
    pub fn is_deploy_required_after_update(&self, incoming: Option<&AccessController>) -> bool {
        let Some(incoming) = incoming else {
            return false;
        };
        incoming.user_rate_limiter.iter().any(|(user, candidate)| {
            let current = self.user_rate_limiter.get(user).and_then(Option::as_ref);
            RateLimiterConfig::is_deploy_required_after_update(current, candidate.as_ref())
        })
    }

    /// Whether merging `incoming` changes anything at all.
    pub fn is_update_meaningful(&self, incoming: &AccessController) -> bool {
        incoming.user_rate_limiter.iter().any(|(user, candidate)| {
            match self.user_rate_limiter.get(user) {
                None => true,
                Some(current) => {
                    RateLimiterConfig::update_validity_pre_check(current.as_ref(), candidate.as_ref())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::TimeUnit;

    const FULL: &str = r#"{"model_id":"testModelId","user_rate_limiter":{"testUser":{"limit":"1","unit":"MILLISECONDS"}}}"#;

    fn ms_limiter() -> RateLimiterConfig {
        RateLimiterConfig::new("1", TimeUnit::Milliseconds)
    }

    fn limit_only() -> RateLimiterConfig {
        RateLimiterConfig {
            limit: Some("1".into()),
            unit: None,
        }
    }

    fn controller(user: &str, limiter: RateLimiterConfig) -> AccessController {
        AccessController::new("testModelId").with_user(user, Some(limiter))
    }

    #[test]
    fn test_serialize() {
        let c = controller("testUser", ms_limiter());
        assert_eq!(serde_json::to_string(&c).unwrap(), FULL);
    }

    #[test]
    fn test_parse_skips_unknown_fields() {
        let input = r#"{"model_id":"testModelId","illegal_field":"skip me","user_rate_limiter":{"testUser":{"limit":"1","unit":"MILLISECONDS"}}}"#;
        let c = AccessController::parse(input).unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), FULL);
    }

    #[test]
    fn test_parse_missing_or_null_map_is_empty() {
        for input in [
            r#"{"model_id":"testModelId"}"#,
            r#"{"model_id":"testModelId","user_rate_limiter":null}"#,
            r#"{"model_id":"testModelId","user_rate_limiter":{"testUser":{}}}"#,
        ] {
            let c = AccessController::parse(input).unwrap();
            assert_eq!(
                serde_json::to_string(&c).unwrap(),
                r#"{"model_id":"testModelId","user_rate_limiter":{}}"#
            );
        }
    }

    #[test]
    fn test_parse_requires_model_id() {
        let err = AccessController::parse(
            r#"{"model_id":null,"user_rate_limiter":{"testUser":{"limit":"1","unit":"MILLISECONDS"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, QuasarError::Validation(_)));
    }

    #[test]
    fn test_parse_rejects_illegal_limiter() {
        assert!(AccessController::parse(
            r#"{"model_id":"m","user_rate_limiter":{"testUser":"not a limiter"}}"#
        )
        .is_err());
        assert!(AccessController::parse(
            r#"{"model_id":"m","user_rate_limiter":{"testUser":{"limit":"-1"}}}"#
        )
        .is_err());
    }

    #[test]
    fn test_explicit_null_round_trip() {
        let input = r#"{"model_id":"testModelId","user_rate_limiter":{"testUser":null}}"#;
        let c = AccessController::parse(input).unwrap();
        assert_eq!(c.slot("testUser"), LimiterSlot::ExplicitNull);
        assert_eq!(c.slot("other"), LimiterSlot::Missing);
        assert_eq!(serde_json::to_string(&c).unwrap(), input);
    }

    #[test]
    fn test_update() {
        let mut base = AccessController::new("testModelId");

        base.update(None);
        base.update(Some(&AccessController::new("testModelId")));
        assert!(base.is_empty());

        base.update(Some(&controller("testUser", limit_only())));
        let LimiterSlot::Present(l) = base.slot("testUser") else {
            panic!("testUser should be present");
        };
        assert_eq!(l.limit.as_deref(), Some("1"));
        assert_eq!(l.unit, None);

        base.update(Some(&controller("testUser", ms_limiter())));
        assert_eq!(base.slot("testUser"), LimiterSlot::Present(&ms_limiter()));

        base.update(Some(&controller("newUser", RateLimiterConfig::default())));
        let LimiterSlot::Present(l) = base.slot("newUser") else {
            panic!("newUser should be present");
        };
        assert!(l.is_empty());
    }

    #[test]
    fn test_update_keeps_base_only_users() {
        let mut base = controller("alice", ms_limiter()).with_user("bob", None);
        base.update(Some(&controller("carol", ms_limiter())));
        assert_eq!(base.slot("alice"), LimiterSlot::Present(&ms_limiter()));
        assert_eq!(base.slot("bob"), LimiterSlot::ExplicitNull);
        assert!(matches!(base.slot("carol"), LimiterSlot::Present(_)));
    }

    #[test]
    fn test_update_with_null_keeps_existing_limiter() {
        let mut base = controller("testUser", ms_limiter());
        base.update(Some(&AccessController::new("testModelId").with_user("testUser", None)));
        assert_eq!(base.slot("testUser"), LimiterSlot::Present(&ms_limiter()));
    }

    #[test]
    fn test_update_fills_explicit_null() {
        let mut base = AccessController::new("testModelId").with_user("testUser", None);
        base.update(Some(&controller("testUser", ms_limiter())));
        assert_eq!(base.slot("testUser"), LimiterSlot::Present(&ms_limiter()));
    }

    #[test]
    fn test_is_deploy_required_after_update() {
        let empty = AccessController::new("testModelId");
        let test_user_number = controller("testUser", limit_only());
        let new_user_empty = controller("newUser", RateLimiterConfig::default());
        let new_user_number = controller("newUser", limit_only());
        let new_user_full = controller("newUser", ms_limiter());
        let full = controller("testUser", ms_limiter());

        assert!(!empty.is_deploy_required_after_update(None));
        assert!(!empty.is_deploy_required_after_update(Some(&AccessController::new("testModelId"))));
        assert!(!empty.is_deploy_required_after_update(Some(&empty)));
        assert!(!empty.is_deploy_required_after_update(Some(&new_user_empty)));

        assert!(!empty.is_deploy_required_after_update(Some(&test_user_number)));
        assert!(!test_user_number.is_deploy_required_after_update(Some(&test_user_number)));
        assert!(empty.is_deploy_required_after_update(Some(&full)));
        assert!(test_user_number.is_deploy_required_after_update(Some(&full)));

        assert!(!test_user_number.is_deploy_required_after_update(Some(&new_user_number)));
        assert!(test_user_number.is_deploy_required_after_update(Some(&new_user_full)));
    }

    #[test]
    fn test_limit_only_change_does_not_require_deploy() {
        let base = controller("testUser", ms_limiter());
        let incoming = controller("testUser", RateLimiterConfig::new("20", TimeUnit::Milliseconds));
        assert!(!base.is_deploy_required_after_update(Some(&incoming)));
        assert!(base.is_update_meaningful(&incoming));
        assert!(!base.is_update_meaningful(&base.clone()));
    }
}
