//! Two-tier round-robin credential rotation

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use key_registry::{Credential, Registry};
use provider::{
    BackendTarget, ChatBackend, ChatCompletion, ChatRequest, Handler, HandlerError,
};
use tracing::{debug, info, warn};

/// Cursor state for both tiers. Owned solely by the pool's own call logic;
/// the lock is released before the backend await, so overlapping calls may
/// observe a "stolen" cursor — only mutual exclusion is guaranteed.
struct Tiers {
    limited: Vec<String>,
    limited_cursor: usize,
    unlimited: Vec<String>,
    unlimited_cursor: usize,
}

/// Round-robin selector over a fixed subset of registry aliases.
pub struct RotationPool {
    name: String,
    registry: Arc<Registry>,
    backend: Arc<dyn ChatBackend>,
    tiers: Mutex<Tiers>,
}

/// Holds one acquired alias and releases it on drop, so the credential
/// returns to rotation on success, on backend error, and on panic alike.
struct Lease {
    registry: Arc<Registry>,
    alias: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.alias);
    }
}

impl RotationPool {
    /// Build a pool from a list of aliases, consulting the registry once:
    /// unbounded credentials join the unlimited tier, metered ones the
    /// limited tier. Aliases unknown to the registry are silently dropped,
    /// so pools can be built from a superset of possibly-revoked aliases.
    pub fn new(
        name: impl Into<String>,
        aliases: &[String],
        registry: Arc<Registry>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let name = name.into();
        let mut limited = Vec::new();
        let mut unlimited = Vec::new();
        for alias in aliases {
            match registry.peek(alias) {
                Some(credential) if credential.limit < 0 => unlimited.push(alias.clone()),
                Some(_) => limited.push(alias.clone()),
                None => {
                    debug!(pool = %name, alias = %alias, "dropping unknown alias");
                }
            }
        }
        info!(
            pool = %name,
            limited = limited.len(),
            unlimited = unlimited.len(),
            "rotation pool initialized"
        );
        Self {
            name,
            registry,
            backend,
            tiers: Mutex::new(Tiers {
                limited,
                limited_cursor: 0,
                unlimited,
                unlimited_cursor: 0,
            }),
        }
    }

    /// Scan one tier from its cursor, advancing the cursor on every scanned
    /// entry regardless of outcome, for at most one full lap.
    fn scan(registry: &Registry, aliases: &[String], cursor: &mut usize) -> Option<Credential> {
        let n = aliases.len();
        for _ in 0..n {
            let alias = &aliases[*cursor];
            *cursor = (*cursor + 1) % n;
            if let Some(credential) = registry.acquire(alias) {
                return Some(credential);
            }
        }
        None
    }

    /// Acquire one credential: limited tier first, then unlimited.
    ///
    /// The cursor lock is held only across the scan — registry calls inside
    /// are synchronous, so the whole acquisition is one non-blocking step.
    fn acquire(&self) -> Option<Credential> {
        let mut tiers = self.tiers.lock().expect("pool cursor lock poisoned");
        let Tiers {
            limited,
            limited_cursor,
            unlimited,
            unlimited_cursor,
        } = &mut *tiers;
        Self::scan(&self.registry, limited, limited_cursor)
            .or_else(|| Self::scan(&self.registry, unlimited, unlimited_cursor))
    }

    fn exhausted_message(&self) -> String {
        let tiers = self.tiers.lock().expect("pool cursor lock poisoned");
        format!(
            "pool {} exhausted ({} limited, {} unlimited aliases)",
            self.name,
            tiers.limited.len(),
            tiers.unlimited.len()
        )
    }

    /// Total number of aliases across both tiers.
    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock().expect("pool cursor lock poisoned");
        tiers.limited.len() + tiers.unlimited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Handler for RotationPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = provider::Result<ChatCompletion>> + Send + '_>> {
        Box::pin(async move {
            let credential = match self.acquire() {
                Some(c) => c,
                None => {
                    warn!(pool = %self.name, "no available credential");
                    metrics::counter!("pool_exhausted_total", "pool" => self.name.clone())
                        .increment(1);
                    return Err(HandlerError::NoAvailableCredential(self.exhausted_message()));
                }
            };
            let _lease = Lease {
                registry: self.registry.clone(),
                alias: credential.alias.clone(),
            };
            info!(pool = %self.name, alias = %credential.alias, "dispatching");
            metrics::counter!("pool_acquires_total", "pool" => self.name.clone()).increment(1);

            let target = BackendTarget {
                url: credential.url.clone(),
                secret: credential.secret.clone(),
                model: credential.model.clone(),
            };
            // Lease drops on both arms — release is unconditional.
            let completion = self.backend.complete(target, request).await?;
            Ok(completion)
        })
    }
}
