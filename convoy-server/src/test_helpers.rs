//! Shared fixtures for handler tests: a full coordinator wired against
//! in-memory stores.

use std::sync::Arc;

use convoy_core::config::CoordinatorConfig;
use convoy_core::conflict::ConflictResolver;
use convoy_core::coordinator::SyncCoordinator;
use convoy_core::election::LeaderElector;
use convoy_core::state::StateManager;
use convoy_core::store::{LeaseStore, MemoryEntityStore, MemoryLeaseStore};

use crate::state::AppState;

pub struct TestApp {
    pub state: AppState,
    pub elector: Arc<LeaderElector>,
    pub store: Arc<MemoryEntityStore>,
}

impl TestApp {
    /// Drive one heartbeat so the node becomes leader.
    pub async fn become_leader(&self) {
        assert_eq!(
            self.elector.tick().await,
            convoy_types::Role::Leader,
            "test node failed to take the lease"
        );
    }
}

pub async fn test_app() -> TestApp {
    let config = CoordinatorConfig {
        node_id: "test-node".to_string(),
        ..CoordinatorConfig::default()
    };
    let lease_store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let elector = Arc::new(LeaderElector::new(lease_store.clone(), config.clone()));
    let store = Arc::new(MemoryEntityStore::new());
    let manager = Arc::new(StateManager::new(
        store.clone(),
        elector.handle(),
        ConflictResolver::new(config.conflict_strategy),
        config.clone(),
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        manager.clone(),
        elector.handle(),
        config.clone(),
    ));
    let state = AppState::new(
        config,
        elector.handle(),
        manager,
        coordinator,
        store.clone(),
        lease_store,
    );
    TestApp {
        state,
        elector,
        store,
    }
}
