//! The pipeline subsystem: definitions, per-batch data, loading, step
//! execution and the automatic scheduler.

pub mod batch;
pub mod cells;
pub mod data;
pub mod definition;
pub mod exec;
pub mod loader;
pub mod runner;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::persist::Persistence;
use crate::rpc::RpcBridge;
use crate::store::StateStore;
use cells::CoreCells;
use definition::PipelineDefinition;
use std::sync::Arc;

/// Everything a pipeline component needs: the store and its cells, the
/// bus, the worker bridge, the loaded definition and persistence. Cloning
/// shares all of it.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<StateStore>,
    pub cells: CoreCells,
    pub bus: Arc<EventBus>,
    pub bridge: Arc<RpcBridge>,
    pub definition: Arc<PipelineDefinition>,
    pub persistence: Arc<dyn Persistence>,
    pub config: CoreConfig,
}

impl CoreContext {
    /// Validates the definition and assembles a context around it.
    pub fn new(
        store: Arc<StateStore>,
        cells: CoreCells,
        bus: Arc<EventBus>,
        bridge: Arc<RpcBridge>,
        definition: Arc<PipelineDefinition>,
        persistence: Arc<dyn Persistence>,
        config: CoreConfig,
    ) -> Result<Self> {
        definition.validate()?;
        Ok(Self {
            store,
            cells,
            bus,
            bridge,
            definition,
            persistence,
            config,
        })
    }

    pub(crate) fn log(
        &self,
        message: impl Into<String>,
        kind: crate::types::LogKind,
        duration: Option<std::time::Duration>,
    ) {
        cells::append_log(
            &self.store,
            &self.cells,
            message,
            kind,
            duration,
            self.config.log_limit,
        );
    }
}
