//! Session orchestration modules.
//!
//! Covers target exclusivity, agent process supervision, the session
//! lifecycle state machine, per-session watchers, crash reconciliation,
//! and resume lookup.

pub mod child_monitor;
pub mod conductor;
pub mod guard;
pub mod provider;
pub mod recovery;
pub mod resume;
pub mod session_manager;
pub mod spawner;
pub mod supervisor;

pub use conductor::Orchestrator;
pub use guard::ConcurrencyGuard;
pub use provider::{ProviderRegistry, SpawnSpec};
pub use recovery::ReconcileReport;
pub use session_manager::LifecycleManager;
pub use spawner::LaunchRequest;
pub use supervisor::ProcessSupervisor;
