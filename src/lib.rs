//! Runtime coordination layer for a multi-tenant LLM gateway.
//!
//! Many stateless gateway replicas coordinate through a shared
//! Redis-compatible store: which conversation is pinned to which upstream
//! provider, how many requests each scope has in flight, which providers are
//! currently unhealthy, how much spend accrued in the trailing window, and
//! which replica runs the singleton health prober. Every race-sensitive
//! decision is a single atomic round trip; everything fails open when the
//! store is away.

pub mod circuit;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod cost;
pub mod deferred;
mod error;
pub mod lock;
pub mod prober;
mod scripts;
pub mod session;
pub mod store;
mod util;

pub use circuit::{
    CircuitAlerts, CircuitRecord, CircuitState, CircuitStore, CircuitTransition, NoopAlerts,
    VendorCircuitRecord,
};
pub use clock::{Clock, SystemClock, system_clock};
pub use concurrency::{Admission, BatchAdmission, ConcurrencyTracker, Scope};
pub use config::{
    CircuitConfig, ConcurrencyConfig, CoordinationConfig, ProberConfig, SessionConfig,
    VendorCircuitConfig,
};
pub use cost::{CostTracker, CostWindow};
pub use deferred::{MetadataWriter, UsageRecord};
pub use error::{CoordError, Result};
pub use lock::{LeaderLock, Lease, LeaseMode, MemoryLocks};
pub use prober::{
    ProbeEndpoint, ProbeErrorKind, ProbeHistoryEntry, ProbeResult, ProbeScheduler,
    SchedulerStatus, probe_endpoint, run_probe_pool,
};
pub use session::{
    BindingOutcome, BindingReason, IdentitySource, ProviderDirectory, ProviderRecord,
    RequestSignals, SessionBinder, SessionHandle, SessionInfo, SessionStatus,
};
pub use store::CoordStore;
