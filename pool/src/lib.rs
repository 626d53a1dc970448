// Copyright 2023 Oxide Computer Company
//! Persistent memory pools as the unsafe shutdown tests see them: poolset
//! descriptions, the scenario catalog built on top of them and the pool
//! library interface with its backends.
use std::sync::Arc;

use ras_common::{PoolLibraryKind, ToolsConfig};
use ras_dimm::DimmCollection;
use slog::Logger;

mod external;
mod library;
mod poolset;
mod scenario;
mod sim;

pub use external::ExternalPoolLibrary;
pub use library::{
    test_pattern, write_test_pattern, PoolData, PoolError, PoolHandle,
    PoolKind, PoolLibrary, LOG_CHUNKS, LOG_TEXT, TEST_VALUES,
};
pub use poolset::{
    descriptor_path, part_line, remote_descriptor, PartLayout, Poolset,
    PoolsetBuilder, PoolsetError, PoolsetLayout, ReplicaLayout,
};
pub use scenario::{
    move_scenarios_with_us, move_scenarios_without_us,
    sync_local_replica_scenarios, sync_remote_replica_scenarios,
    transform_scenario, DeviceInventory, MoveScenario, RemoteInventory,
    RemotePoolset, SyncRemoteScenario, SyncScenario, TransformScenario,
    BIG_PART_SIZE, PART_SIZE,
};
pub use sim::SimPoolLibrary;

/// Pick the pool library the configuration asks for.
pub fn library_from_config(
    tools: &ToolsConfig,
    colls: &[DimmCollection],
    log: &Logger,
) -> Arc<dyn PoolLibrary> {
    match tools.library {
        PoolLibraryKind::External => Arc::new(ExternalPoolLibrary::new(
            &tools.pmempool,
            &tools.pool_io,
            log.clone(),
        )),
        PoolLibraryKind::Simulated => {
            Arc::new(SimPoolLibrary::new(colls.to_vec(), log.clone()))
        }
    }
}
