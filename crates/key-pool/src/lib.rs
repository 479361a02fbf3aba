//! Credential pools and canned responders
//!
//! Three interchangeable `provider::Handler` implementations:
//!
//! 1. `RotationPool` — fair round-robin over a fixed alias set, split into a
//!    quota-limited tier (scanned first, so metered quota is spent before
//!    unmetered credentials) and an unlimited tier. Cursors persist across
//!    calls; the registry stays the single source of truth and is
//!    re-resolved on every acquisition.
//! 2. `TieredPool` — round-robin over several rotation pools, each tagged
//!    with a generation temperature; shards a very large credential set into
//!    independently rotating groups. No cross-tier fallback when the chosen
//!    sub-pool is exhausted.
//! 3. `CannedResponder` — cycles a fixed reply list without touching the
//!    registry or the network; used to soft-disable a feature.

mod canned;
mod rotation;
mod tiered;

pub use canned::CannedResponder;
pub use rotation::RotationPool;
pub use tiered::TieredPool;
