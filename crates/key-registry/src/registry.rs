//! Alias-keyed credential store with quota accounting and in-use tracking

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use common::Secret;
use tracing::{debug, info, warn};

/// One backend credential: endpoint, secret, model, and quota state.
///
/// `limit < 0` means unbounded; otherwise `used <= limit` holds after every
/// successful acquisition. Snapshots returned by the registry are copies —
/// mutable state lives only inside the registry.
#[derive(Debug, Clone)]
pub struct Credential {
    pub alias: String,
    pub url: String,
    pub secret: Secret<String>,
    pub model: String,
    pub limit: i64,
    pub used: u64,
}

impl Credential {
    /// Whether the quota still admits another call.
    fn has_quota(&self) -> bool {
        self.limit < 0 || self.used < self.limit as u64
    }
}

#[derive(Default)]
struct Inner {
    credentials: HashMap<String, Credential>,
    /// Reverse index used to dedupe re-registration: a secret never maps to
    /// two live aliases at once.
    secret_to_alias: HashMap<Secret<String>, String>,
    /// Aliases currently held by an in-flight call.
    in_use: HashSet<String>,
    /// Monotonic counter for generated `key_<n>` aliases.
    next_alias: u64,
}

/// Single-instance, in-memory credential registry.
///
/// Constructed once at startup and passed by reference (`Arc`) to every pool
/// and to the dispatch pipeline — no ambient/static access. Registry
/// mutation never errors: unknown aliases yield `None`/`false`.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential, replacing any prior registration of the same
    /// secret. Returns the alias the credential was installed under.
    ///
    /// When `alias` is omitted a `key_<n>` name is generated. Replacement
    /// evicts the previous alias mapping first, which instantly invalidates
    /// any pool still referencing it — subsequent acquisitions for that
    /// alias fail rather than error.
    pub fn register(
        &self,
        url: impl Into<String>,
        secret: Secret<String>,
        model: impl Into<String>,
        limit: i64,
        alias: Option<String>,
    ) -> String {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if let Some(prior) = inner.secret_to_alias.remove(&secret) {
            warn!(alias = %prior, "evicting prior alias for re-registered secret");
            inner.credentials.remove(&prior);
        }

        let alias = alias.unwrap_or_else(|| {
            inner.next_alias += 1;
            format!("key_{}", inner.next_alias)
        });

        inner.secret_to_alias.insert(secret.clone(), alias.clone());
        let credential = Credential {
            alias: alias.clone(),
            url: url.into(),
            secret,
            model: model.into(),
            limit,
            used: 0,
        };
        debug!(alias = %alias, model = %credential.model, limit, "registered credential");
        inner.credentials.insert(alias.clone(), credential);
        alias
    }

    /// Read-only snapshot of a credential. Never mutates `used` or the
    /// in-use set.
    pub fn peek(&self, alias: &str) -> Option<Credential> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.credentials.get(alias).cloned()
    }

    /// Acquire a credential for one call: fails when the alias is unknown,
    /// already in use, or quota-bound. On success the alias joins the
    /// in-use set and `used` is incremented, all under a single lock guard.
    pub fn acquire(&self, alias: &str) -> Option<Credential> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.in_use.contains(alias) {
            return None;
        }
        let credential = inner.credentials.get_mut(alias)?;
        if !credential.has_quota() {
            return None;
        }
        credential.used += 1;
        let snapshot = credential.clone();
        inner.in_use.insert(alias.to_string());
        debug!(alias = %alias, used = snapshot.used, limit = snapshot.limit, "acquired credential");
        Some(snapshot)
    }

    /// Release a previously acquired alias. Idempotent: returns whether the
    /// alias was actually held.
    pub fn release(&self, alias: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.in_use.remove(alias)
    }

    /// Whether an alias is currently held by an in-flight call.
    pub fn is_in_use(&self, alias: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.in_use.contains(alias)
    }

    /// Zero every credential's usage counter. Leaves the in-use set alone.
    ///
    /// Invoked by the host's periodic reset task (daily, local midnight).
    pub fn reset_all_usage(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for credential in inner.credentials.values_mut() {
            credential.used = 0;
        }
        info!(credentials = inner.credentials.len(), "reset usage counters");
    }

    /// Number of registered credentials.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alias→credential snapshots for diagnostics. Not on the request hot
    /// path.
    pub fn list(&self) -> HashMap<String, Credential> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.credentials.clone()
    }

    /// Per-alias inventory for the health endpoint. Secrets are not
    /// included.
    pub fn inventory(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut aliases: Vec<&String> = inner.credentials.keys().collect();
        aliases.sort();
        let entries: Vec<serde_json::Value> = aliases
            .iter()
            .map(|alias| {
                let c = &inner.credentials[*alias];
                serde_json::json!({
                    "alias": c.alias,
                    "model": c.model,
                    "limit": c.limit,
                    "used": c.used,
                    "in_use": inner.in_use.contains(*alias),
                })
            })
            .collect();
        serde_json::json!(entries)
    }
}
