use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use quasar_common::{
    AccessController, Admission, InferenceStats, LimiterSlot, ModelRecord, ModelState,
    NodeModelProfile, RateLimiterConfig, RefreshLimitersRequest, ThrottleScope,
};

use crate::token_bucket::TokenBucket;

const STATS_WINDOW: usize = 1_000;

/// One model loaded on this node.
#[derive(Debug)]
pub struct CachedModel {
    pub record: ModelRecord,
    pub deployed_at_ms: u64,
    model_bucket: Option<Arc<TokenBucket>>,
    user_buckets: HashMap<String, Arc<TokenBucket>>,
    durations_ms: Mutex<VecDeque<f64>>,
    inference_count: AtomicU64,
    last_access_ms: AtomicU64,
}

impl CachedModel {
    pub fn new(mut record: ModelRecord, now_ms: u64) -> Self {
        record.state = ModelState::Deployed;
        let mut model = Self {
            record,
            deployed_at_ms: now_ms,
            model_bucket: None,
            user_buckets: HashMap::new(),
            durations_ms: Mutex::new(VecDeque::new()),
            inference_count: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(0),
        };
        let limiter = model.record.rate_limiter.clone();
        let controller = model.record.controller.clone();
        model.apply_limiters(&limiter, controller.as_ref());
        model
    }

    /// Sync buckets with the given limiters. Existing buckets are resized
    /// in place; buckets whose limiter is gone or invalid are dropped.
    fn apply_limiters(&mut self, global: &RateLimiterConfig, controller: Option<&AccessController>) {
        self.model_bucket = sync_bucket(self.model_bucket.take(), global);

        let mut next = HashMap::new();
        if let Some(controller) = controller {
            for user in controller.user_rate_limiter.keys() {
                if let LimiterSlot::Present(limiter) = controller.slot(user) {
                    if let Some(bucket) = sync_bucket(self.user_buckets.remove(user), limiter) {
                        next.insert(user.clone(), bucket);
                    }
                }
            }
        }
        self.user_buckets = next;
        self.record.rate_limiter = global.clone();
        self.record.controller = controller.cloned();
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }

    fn last_access(&self) -> Option<u64> {
        match self.last_access_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    fn stats(&self) -> Option<InferenceStats> {
        let window = self.durations_ms.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let p90_idx = ((n as f64 * 0.9).ceil() as usize).clamp(1, n) - 1;
        Some(InferenceStats {
            count: self.inference_count.load(Ordering::Relaxed),
            mean_ms: sorted.iter().sum::<f64>() / n as f64,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            p90_ms: sorted[p90_idx],
        })
    }
}

fn sync_bucket(existing: Option<Arc<TokenBucket>>, limiter: &RateLimiterConfig) -> Option<Arc<TokenBucket>> {
    let spec = limiter.token_bucket_spec()?;
    match existing {
        Some(bucket) => {
            bucket.reconfigure(spec);
            Some(bucket)
        }
        None => Some(Arc::new(TokenBucket::new(spec))),
    }
}

/// Models loaded in this process. Owned by the worker and shared by
/// reference with the executor and the HTTP layer.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: DashMap<String, CachedModel>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model: CachedModel) {
        self.models.insert(model.record.model_id.clone(), model);
    }

    pub fn remove(&self, model_id: &str) -> Option<CachedModel> {
        self.models.remove(model_id).map(|(_, m)| m)
    }

    pub fn is_model_deployed(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn deployed_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get_model_info(&self, model_id: &str) -> Option<ModelRecord> {
        self.models.get(model_id).map(|m| m.record.clone())
    }

    pub fn get_content_hash(&self, model_id: &str) -> Option<Option<String>> {
        self.models.get(model_id).map(|m| m.record.content_hash.clone())
    }

    pub fn get_rate_limiter(&self, model_id: &str) -> Option<Arc<TokenBucket>> {
        self.models.get(model_id)?.model_bucket.clone()
    }

    pub fn get_user_rate_limiter(&self, model_id: &str, user: &str) -> Option<Arc<TokenBucket>> {
        self.models.get(model_id)?.user_buckets.get(user).cloned()
    }

    pub fn get_is_model_enabled(&self, model_id: &str) -> Option<bool> {
        self.models.get(model_id).map(|m| m.record.is_enabled)
    }

    /// Returns false when the model is not loaded here.
    pub fn refresh_limiters(&self, request: &RefreshLimitersRequest) -> bool {
        let Some(mut model) = self.models.get_mut(&request.model_id) else {
            return false;
        };
        model.apply_limiters(&request.rate_limiter, request.controller.as_ref());
        model.record.is_enabled = request.is_enabled;
        true
    }

    /// Admission for one inference request. The model bucket is consulted
    /// first; the user bucket only when the model bucket allowed.
    pub fn admit(&self, model_id: &str, user: Option<&str>, now_ms: u64) -> Admission {
        let Some(model) = self.models.get(model_id) else {
            return Admission::NotDeployed;
        };
        if !model.record.is_enabled {
            return Admission::Disabled;
        }
        model.touch(now_ms);
        if let Some(bucket) = &model.model_bucket {
            if !bucket.request() {
                return Admission::Throttled {
                    scope: ThrottleScope::Model,
                };
            }
        }
        if let Some(bucket) = user.and_then(|u| model.user_buckets.get(u)) {
            if !bucket.request() {
                return Admission::Throttled {
                    scope: ThrottleScope::User,
                };
            }
        }
        Admission::Allow
    }

    pub fn add_inference_duration(&self, model_id: &str, duration_ms: f64) {
        let Some(model) = self.models.get(model_id) else {
            return;
        };
        model.inference_count.fetch_add(1, Ordering::Relaxed);
        let mut window = model.durations_ms.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == STATS_WINDOW {
            window.pop_front();
        }
        window.push_back(duration_ms);
    }

    pub fn model_profile(&self, model_id: &str) -> Option<NodeModelProfile> {
        let model = self.models.get(model_id)?;
        Some(NodeModelProfile {
            model_id: model_id.to_string(),
            state: model.record.state,
            content_hash: model.record.content_hash.clone(),
            is_enabled: model.record.is_enabled,
            deployed_at_ms: model.deployed_at_ms,
            last_access_ms: model.last_access(),
            inference_stats: model.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasar_common::{FunctionType, TimeUnit};

    fn record(id: &str) -> ModelRecord {
        ModelRecord::new(id, id, FunctionType::TextEmbedding, 0)
    }

    fn limiter(limit: &str) -> RateLimiterConfig {
        RateLimiterConfig::new(limit, TimeUnit::Hours)
    }

    #[test]
    fn test_not_deployed_and_disabled() {
        let cache = ModelCache::new();
        assert_eq!(cache.admit("m", None, 1), Admission::NotDeployed);

        let mut r = record("m");
        r.is_enabled = false;
        cache.insert(CachedModel::new(r, 1));
        assert_eq!(cache.admit("m", None, 1), Admission::Disabled);
        assert_eq!(cache.get_is_model_enabled("m"), Some(false));
    }

    #[test]
    fn test_model_bucket_checked_before_user_bucket() {
        let cache = ModelCache::new();
        let mut r = record("m");
        r.rate_limiter = limiter("1");
        r.controller = Some(AccessController::new("m").with_user("alice", Some(limiter("5"))));
        cache.insert(CachedModel::new(r, 1));

        assert_eq!(cache.admit("m", Some("alice"), 2), Admission::Allow);
        assert_eq!(
            cache.admit("m", Some("alice"), 3),
            Admission::Throttled {
                scope: ThrottleScope::Model
            }
        );
        // the rejected request never reached alice's bucket
        let alice = cache.get_user_rate_limiter("m", "alice").unwrap();
        assert!(alice.available() >= 3.9);
    }

    #[test]
    fn test_user_bucket_throttles() {
        let cache = ModelCache::new();
        let mut r = record("m");
        r.controller = Some(
            AccessController::new("m")
                .with_user("alice", Some(limiter("1")))
                .with_user("bob", None),
        );
        cache.insert(CachedModel::new(r, 1));

        assert!(cache.get_rate_limiter("m").is_none());
        assert!(cache.get_user_rate_limiter("m", "bob").is_none());
        assert_eq!(cache.admit("m", Some("alice"), 2), Admission::Allow);
        assert_eq!(
            cache.admit("m", Some("alice"), 2),
            Admission::Throttled {
                scope: ThrottleScope::User
            }
        );
        assert_eq!(cache.admit("m", Some("bob"), 2), Admission::Allow);
        assert_eq!(cache.admit("m", None, 2), Admission::Allow);
    }

    #[test]
    fn test_refresh_resizes_in_place() {
        let cache = ModelCache::new();
        let mut r = record("m");
        r.rate_limiter = limiter("1");
        cache.insert(CachedModel::new(r, 1));
        let before = cache.get_rate_limiter("m").unwrap();

        let applied = cache.refresh_limiters(&RefreshLimitersRequest {
            model_id: "m".into(),
            rate_limiter: limiter("20"),
            controller: None,
            is_enabled: true,
        });
        assert!(applied);

        let after = cache.get_rate_limiter("m").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.spec().capacity, 20.0);
        assert_eq!(
            cache.get_model_info("m").unwrap().rate_limiter.limit.as_deref(),
            Some("20")
        );

        assert!(!cache.refresh_limiters(&RefreshLimitersRequest {
            model_id: "other".into(),
            rate_limiter: RateLimiterConfig::default(),
            controller: None,
            is_enabled: true,
        }));
    }

    #[test]
    fn test_profile_stats() {
        let cache = ModelCache::new();
        cache.insert(CachedModel::new(record("m"), 10));
        assert!(cache.model_profile("m").unwrap().inference_stats.is_none());

        for ms in 1..=10 {
            cache.add_inference_duration("m", ms as f64);
        }
        cache.admit("m", None, 42);

        let profile = cache.model_profile("m").unwrap();
        assert_eq!(profile.state, ModelState::Deployed);
        assert_eq!(profile.deployed_at_ms, 10);
        assert_eq!(profile.last_access_ms, Some(42));
        let stats = profile.inference_stats.unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 10.0);
        assert_eq!(stats.mean_ms, 5.5);
        assert_eq!(stats.p90_ms, 9.0);
        assert!(cache.model_profile("missing").is_none());
    }
}
