//! Resolves an opaque bearer token to a [`Role`], caching the result for a
//! bounded time so every frame doesn't re-hit the identity provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::role::Role;

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Looks up account information for a bearer token against the identity provider.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Returns `None` if the token does not resolve to any account (treated as anon).
    async fn whoami(&self, token: &str) -> Option<AccountInfo>;
}

pub struct AccountInfo {
    pub username: String,
    pub is_pro: bool,
}

#[derive(Clone)]
struct CacheEntry {
    role: Role,
    cached_at: Instant,
}

/// Token-keyed, TTL'd, single-flight cache in front of an [`IdentityBackend`].
///
/// A token with no concurrent lookup in flight resolves directly from cache;
/// concurrent lookups for the *same* token serialize on a per-token lock so
/// only one request ever reaches the backend.
pub struct IdentityCache<B> {
    backend: B,
    admin_accounts: Vec<String>,
    cache: std::sync::Mutex<HashMap<String, CacheEntry>>,
    in_flight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<B: IdentityBackend> IdentityCache<B> {
    pub fn new(backend: B, admin_accounts: Vec<String>) -> Self {
        IdentityCache {
            backend,
            admin_accounts,
            cache: std::sync::Mutex::new(HashMap::new()),
            in_flight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Resolve a bearer token to a role. An empty token is always `Role::Anon`
    /// without touching the backend or the cache.
    pub async fn resolve(&self, token: &str) -> Role {
        if token.is_empty() {
            return Role::Anon;
        }

        if let Some(role) = self.cached(token) {
            return role;
        }

        let lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(token.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        // Another caller may have populated the cache while we waited for the lock.
        if let Some(role) = self.cached(token) {
            self.in_flight.lock().await.remove(token);
            return role;
        }

        let role = match self.backend.whoami(token).await {
            Some(account) => {
                tracing::info!(username = account.username, "token validated");
                if self.admin_accounts.iter().any(|a| a == &account.username) {
                    Role::Admin
                } else if account.is_pro {
                    Role::Pro
                } else {
                    Role::Normal
                }
            }
            None => Role::Anon,
        };

        self.cache.lock().unwrap().insert(
            token.to_string(),
            CacheEntry { role, cached_at: Instant::now() },
        );
        self.in_flight.lock().await.remove(token);

        role
    }

    fn cached(&self, token: &str) -> Option<Role> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(token)?;
        if entry.cached_at.elapsed() < CACHE_TTL {
            Some(entry.role)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        calls: AtomicU32,
        admin_username: &'static str,
    }

    #[async_trait]
    impl IdentityBackend for CountingBackend {
        async fn whoami(&self, token: &str) -> Option<AccountInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            match token {
                "admin-token" => Some(AccountInfo { username: self.admin_username.to_string(), is_pro: false }),
                "pro-token" => Some(AccountInfo { username: "someone".into(), is_pro: true }),
                "normal-token" => Some(AccountInfo { username: "someone".into(), is_pro: false }),
                "bad-token" => None,
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn empty_token_is_anon_without_a_backend_call() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = IdentityCache::new(backend, vec!["root".into()]);
        assert_eq!(cache.resolve("").await, Role::Anon);
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn admin_account_resolves_to_admin_role() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = IdentityCache::new(backend, vec!["root".into()]);
        assert_eq!(cache.resolve("admin-token").await, Role::Admin);
    }

    #[tokio::test]
    async fn pro_account_resolves_to_pro_role() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = IdentityCache::new(backend, vec!["root".into()]);
        assert_eq!(cache.resolve("pro-token").await, Role::Pro);
    }

    #[tokio::test]
    async fn invalid_token_resolves_to_anon() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = IdentityCache::new(backend, vec!["root".into()]);
        assert_eq!(cache.resolve("bad-token").await, Role::Anon);
    }

    #[tokio::test]
    async fn repeated_resolves_hit_the_cache_not_the_backend() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = IdentityCache::new(backend, vec!["root".into()]);
        cache.resolve("normal-token").await;
        cache.resolve("normal-token").await;
        cache.resolve("normal-token").await;
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_of_the_same_token_single_flight() {
        let backend = CountingBackend { calls: AtomicU32::new(0), admin_username: "root" };
        let cache = Arc::new(IdentityCache::new(backend, vec!["root".into()]));

        let a = cache.clone();
        let b = cache.clone();
        let (ra, rb) = tokio::join!(a.resolve("normal-token"), b.resolve("normal-token"));

        assert_eq!(ra, Role::Normal);
        assert_eq!(rb, Role::Normal);
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 1);
    }
}
