//! Credential registry for the keypool gateway
//!
//! Process-wide store of API credentials keyed by alias. Owns the quota
//! counters and the in-use set that gives each credential mutual exclusion
//! across in-flight calls. Pools hold only alias references and re-resolve
//! through the registry on every acquisition.
//!
//! Every operation runs under one `std::sync::Mutex` guard, so the
//! check-and-increment in `acquire` and the membership removal in `release`
//! are single critical sections even on a multi-threaded runtime. The lock
//! is never held across an await point (the registry does no I/O).

mod registry;

pub use registry::{Credential, Registry};
