//! Authentication/authorization service.
//!
//! Resolves an opaque credential to identity fields plus the expanded
//! permission set (direct grants ∪ scope-inherited grants). Expansion is
//! cached process-locally per credential with a 5-minute TTL backstop and a
//! generation counter: mutators that change scope assignments call
//! `invalidate_credential`, which bumps the counter and makes every cached
//! entry for that credential stale immediately rather than after the TTL.

pub mod permissions;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::Store;

use permissions::PermissionSet;

const KEY_PREFIX: &str = "vk_";
const KEY_LENGTH: usize = 35;
const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Identity fields the auth stage writes into the execution context.
#[derive(Debug, Clone)]
pub struct AuthFragment {
    pub credential_id: Uuid,
    pub user_id: Uuid,
    pub scope_id: Option<Uuid>,
    pub permissions: PermissionSet,
    pub rate_limit: Option<i64>,
}

/// Cheap structural check before any store lookup: `vk_` prefix, fixed
/// length, alphanumeric body.
pub fn valid_key_shape(credential: &str) -> bool {
    credential.len() == KEY_LENGTH
        && credential.starts_with(KEY_PREFIX)
        && credential[KEY_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
}

struct CachedGrant {
    permissions: PermissionSet,
    cached_at: Instant,
    generation: u64,
}

/// Process-local expanded-permission cache. Best-effort: empty after a
/// restart, never shared across instances.
#[derive(Default)]
struct PermissionCache {
    entries: RwLock<HashMap<Uuid, CachedGrant>>,
    generations: RwLock<HashMap<Uuid, u64>>,
}

impl PermissionCache {
    fn current_generation(&self, credential_id: Uuid) -> u64 {
        self.generations
            .read()
            .map(|g| g.get(&credential_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn get(&self, credential_id: Uuid) -> Option<PermissionSet> {
        let generation = self.current_generation(credential_id);
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&credential_id)?;
        if entry.generation != generation || entry.cached_at.elapsed() > PERMISSION_CACHE_TTL {
            return None;
        }
        Some(entry.permissions.clone())
    }

    fn put(&self, credential_id: Uuid, permissions: PermissionSet) {
        let generation = self.current_generation(credential_id);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                credential_id,
                CachedGrant {
                    permissions,
                    cached_at: Instant::now(),
                    generation,
                },
            );
        }
    }

    fn invalidate(&self, credential_id: Uuid) {
        if let Ok(mut generations) = self.generations.write() {
            *generations.entry(credential_id).or_insert(0) += 1;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&credential_id);
        }
    }

    #[cfg(test)]
    fn put_aged(&self, credential_id: Uuid, permissions: PermissionSet, age: Duration) {
        let generation = self.current_generation(credential_id);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                credential_id,
                CachedGrant {
                    permissions,
                    cached_at: Instant::now() - age,
                    generation,
                },
            );
        }
    }
}

/// Resolves credentials against the store and answers permission queries.
pub struct AuthService {
    store: Store,
    cache: PermissionCache,
    #[cfg(test)]
    fixtures: RwLock<HashMap<String, AuthFragment>>,
}

impl AuthService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: PermissionCache::default(),
            #[cfg(test)]
            fixtures: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a canned credential resolution, bypassing the store.
    #[cfg(test)]
    pub fn install_fixture(&self, credential: &str, fragment: AuthFragment) {
        if let Ok(mut fixtures) = self.fixtures.write() {
            fixtures.insert(credential.to_string(), fragment);
        }
    }

    /// Resolves an opaque credential to an execution-context fragment.
    /// Malformed input fails before any store lookup.
    pub async fn authenticate(&self, credential: &str) -> Result<AuthFragment, AppError> {
        if !valid_key_shape(credential) {
            return Err(AppError::Unauthorized);
        }

        #[cfg(test)]
        if let Some(fragment) = self
            .fixtures
            .read()
            .ok()
            .and_then(|f| f.get(credential).cloned())
        {
            return Ok(fragment);
        }

        let key = self
            .store
            .find_api_key(credential)
            .await?
            .ok_or(AppError::InvalidCredential)?;

        if key.revoked {
            return Err(AppError::InvalidCredential);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at <= chrono::Utc::now() {
                return Err(AppError::InvalidCredential);
            }
        }

        let permissions = match self.cache.get(key.id) {
            Some(cached) => cached,
            None => {
                let inherited = self.store.scope_patterns(&key.scopes).await?;
                let expanded = expand_permissions(&key.permissions, inherited);
                self.cache.put(key.id, expanded.clone());
                expanded
            }
        };

        Ok(AuthFragment {
            credential_id: key.id,
            user_id: key.user_id,
            scope_id: key.resume_id,
            permissions,
            rate_limit: key.rate_limit,
        })
    }

    /// Must be called by any workflow that mutates a credential's direct
    /// grants or scope assignments; otherwise readers may observe stale
    /// authorization for up to the TTL window.
    pub fn invalidate_credential(&self, credential_id: Uuid) {
        self.cache.invalidate(credential_id);
    }
}

/// Union of direct and scope-inherited grants, order-preserving, deduped.
fn expand_permissions(direct: &[String], inherited: Vec<String>) -> PermissionSet {
    let mut grants: Vec<String> = Vec::with_capacity(direct.len() + inherited.len());
    for grant in direct.iter().cloned().chain(inherited) {
        if !grants.contains(&grant) {
            grants.push(grant);
        }
    }
    PermissionSet::new(grants)
}
