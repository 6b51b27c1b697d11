//! Identity-scoped permissions: consent grants and the permission
//! predicate.
//!
//! The predicate is a pure function of the grant table, the registered
//! evaluators and the clock; decisions are cached for a short TTL keyed by
//! `(requesting, target identity, scope)` and invalidated by revokes and
//! key rotation.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::constants::DEFAULT_PERMISSION_TTL;
use crate::identity::IbeIdentity;
use crate::types::UserAddress;

/// Closed scope set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    ReadMemories,
    WriteMemories,
}

impl Scope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ReadMemories => "read:memories",
            Scope::WriteMemories => "write:memories",
        }
    }

    /// Parse a scope string; unknown scopes yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read:memories" => Some(Scope::ReadMemories),
            "write:memories" => Some(Scope::WriteMemories),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A consent grant from `target` (the data owner) to `requesting` (the
/// consuming app). Two grants agree iff they share requesting, target and
/// scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub requesting: UserAddress,
    pub target: UserAddress,
    pub scope: Scope,
    pub granted_at: i64,
    pub expires_at: Option<i64>,
}

impl ConsentGrant {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }
}

/// Evaluator for `role:` identities, keyed by role id.
pub trait RoleEvaluator: Send + Sync {
    fn allows(&self, user: &UserAddress, requesting: &UserAddress) -> bool;
}

/// Evaluator for `cond:` identities, keyed by the truncated condition hash.
pub trait ConditionEvaluator: Send + Sync {
    fn allows(&self, user: &UserAddress, requesting: &UserAddress) -> bool;
}

struct CachedDecision {
    allowed: bool,
    cached_at_ms: i64,
    target_user: UserAddress,
}

/// The permission predicate with its consent store.
pub struct PermissionPredicate {
    clock: SharedClock,
    grants: RwLock<HashMap<(String, String, Scope), ConsentGrant>>,
    role_evaluators: RwLock<HashMap<String, Arc<dyn RoleEvaluator>>>,
    cond_evaluators: RwLock<HashMap<String, Arc<dyn ConditionEvaluator>>>,
    cache: Mutex<HashMap<(String, String, Scope), CachedDecision>>,
    cache_ttl: Duration,
}

impl PermissionPredicate {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_cache_ttl(clock, DEFAULT_PERMISSION_TTL)
    }

    #[must_use]
    pub fn with_cache_ttl(clock: SharedClock, cache_ttl: Duration) -> Self {
        Self {
            clock,
            grants: RwLock::new(HashMap::new()),
            role_evaluators: RwLock::new(HashMap::new()),
            cond_evaluators: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Record a grant; an agreeing grant (same requester, target, scope)
    /// is replaced.
    pub fn grant(&self, grant: ConsentGrant) {
        let key = (
            grant.requesting.as_str().to_string(),
            grant.target.as_str().to_string(),
            grant.scope,
        );
        self.grants.write().insert(key, grant.clone());
        // New consent can only widen access; cached denials must go.
        self.invalidate_user(&grant.target);
    }

    /// Remove a grant; returns whether one existed.
    pub fn revoke(&self, requesting: &UserAddress, target: &UserAddress, scope: Scope) -> bool {
        let key = (
            requesting.as_str().to_string(),
            target.as_str().to_string(),
            scope,
        );
        let removed = self.grants.write().remove(&key).is_some();
        if removed {
            self.invalidate_user(target);
        }
        removed
    }

    /// All grants issued by a target user (for inspection surfaces).
    #[must_use]
    pub fn grants_for(&self, target: &UserAddress) -> Vec<ConsentGrant> {
        let mut grants: Vec<ConsentGrant> = self
            .grants
            .read()
            .values()
            .filter(|g| &g.target == target)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.granted_at.cmp(&b.granted_at));
        grants
    }

    pub fn register_role_evaluator(&self, role_id: &str, evaluator: Arc<dyn RoleEvaluator>) {
        self.role_evaluators
            .write()
            .insert(role_id.to_string(), evaluator);
    }

    pub fn register_condition_evaluator(
        &self,
        condition_h16: &str,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) {
        self.cond_evaluators
            .write()
            .insert(condition_h16.to_string(), evaluator);
    }

    /// Drop cached decisions about a target user (revoke, rotation).
    pub fn invalidate_user(&self, user: &UserAddress) {
        self.cache
            .lock()
            .retain(|_, decision| &decision.target_user != user);
    }

    /// May `requesting` act on content sealed under `target` at `scope`?
    #[must_use]
    pub fn allows(&self, requesting: &UserAddress, target: &IbeIdentity, scope: Scope) -> bool {
        let now = self.clock.now_ms();
        let key = (
            requesting.as_str().to_string(),
            target.to_identity_string(),
            scope,
        );
        if let Some(decision) = self.cache.lock().get(&key) {
            if now - decision.cached_at_ms < self.cache_ttl.as_millis() as i64 {
                return decision.allowed;
            }
        }

        let allowed = self.evaluate(requesting, target, scope, now);
        self.cache.lock().insert(
            key,
            CachedDecision {
                allowed,
                cached_at_ms: now,
                target_user: target.user().clone(),
            },
        );
        allowed
    }

    /// Current number of cached decisions.
    #[must_use]
    pub fn cached_decisions(&self) -> usize {
        self.cache.lock().len()
    }

    fn has_grant(&self, requesting: &UserAddress, target: &UserAddress, scope: Scope, now: i64) -> bool {
        let key = (
            requesting.as_str().to_string(),
            target.as_str().to_string(),
            scope,
        );
        self.grants
            .read()
            .get(&key)
            .is_some_and(|grant| !grant.is_expired(now))
    }

    /// Owner access or an explicit non-expired grant.
    fn base_rule(&self, requesting: &UserAddress, user: &UserAddress, scope: Scope, now: i64) -> bool {
        requesting == user || self.has_grant(requesting, user, scope, now)
    }

    fn evaluate(
        &self,
        requesting: &UserAddress,
        target: &IbeIdentity,
        scope: Scope,
        now: i64,
    ) -> bool {
        match target {
            IbeIdentity::Owner { user } => requesting == user,
            IbeIdentity::App { user, app } => {
                // The owner always may; the named app needs a live grant.
                requesting == user
                    || (requesting == app && self.has_grant(requesting, user, scope, now))
            }
            IbeIdentity::Time { user, unlock_ms } => {
                now >= *unlock_ms && self.base_rule(requesting, user, scope, now)
            }
            IbeIdentity::Role { user, role_id } => self
                .role_evaluators
                .read()
                .get(role_id)
                .is_some_and(|evaluator| evaluator.allows(user, requesting)),
            IbeIdentity::Cond {
                user,
                condition_h16,
            } => self
                .cond_evaluators
                .read()
                .get(condition_h16)
                .is_some_and(|evaluator| evaluator.allows(user, requesting)),
        }
    }
}
