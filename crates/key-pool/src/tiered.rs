//! Round-robin composite over several rotation pools

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use provider::{ChatCompletion, ChatRequest, Handler, HandlerError};
use tracing::{debug, info};

/// Groups rotation pools under one logical name, each sub-pool carrying its
/// own generation temperature.
///
/// `call` picks the next sub-pool round-robin (its own cursor, independent
/// of the sub-pools' internal cursors) and delegates. When the chosen
/// sub-pool is exhausted the call fails — there is deliberately no fallback
/// to a sibling sub-pool; the next inbound request advances the cursor
/// regardless.
pub struct TieredPool {
    name: String,
    tiers: Vec<(Arc<dyn Handler>, f64)>,
    next: AtomicUsize,
}

impl TieredPool {
    pub fn new(name: impl Into<String>, tiers: Vec<(Arc<dyn Handler>, f64)>) -> Self {
        let name = name.into();
        info!(pool = %name, tiers = tiers.len(), "tiered pool initialized");
        Self {
            name,
            tiers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl Handler for TieredPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        mut request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = provider::Result<ChatCompletion>> + Send + '_>> {
        Box::pin(async move {
            if self.tiers.is_empty() {
                return Err(HandlerError::NoAvailableCredential(format!(
                    "tiered pool {} has no sub-pools",
                    self.name
                )));
            }
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.tiers.len();
            let (sub_pool, temperature) = &self.tiers[idx];

            // The sub-pool's temperature applies unless the caller set one.
            if request.temperature.is_none() {
                request.temperature = Some(*temperature);
            }
            debug!(pool = %self.name, tier = idx, sub_pool = sub_pool.name(), "delegating");
            sub_pool.call(request).await
        })
    }
}
