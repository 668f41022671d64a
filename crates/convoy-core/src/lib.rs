//! # Convoy Core
//!
//! Coordination logic for the Convoy sync daemon.
//!
//! ```text
//! convoy-core/src/
//! ├── store/            # LeaseStore + EntityStore traits, Postgres + memory impls
//! ├── election.rs       # Lease-based leader election with fencing terms
//! ├── state.rs          # Cache-aside state manager with fenced writes
//! ├── conflict.rs       # Deterministic conflict resolution
//! ├── coordinator.rs    # Leader-gated sync job loop
//! ├── metrics.rs        # Prometheus metrics endpoint
//! └── config.rs         # Immutable startup configuration
//! ```
//!
//! Every container runs the election heartbeat loop; only the container
//! currently holding the lease runs the sync loop. The authoritative store's
//! conditional writes (lease CAS, entity version CAS) are the only
//! cross-process synchronization points.

pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod election;
pub mod metrics;
pub mod state;
pub mod store;


pub use config::CoordinatorConfig;
pub use conflict::{ConflictResolver, Resolution};
pub use coordinator::SyncCoordinator;
pub use election::{ElectionHandle, LeaderElector};
pub use state::{StateManager, WriteOutcome};
pub use store::{EntityStore, LeaseStore, PutResult};
