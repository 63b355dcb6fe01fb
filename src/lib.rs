//! labflow: pipeline execution and state coordination for batch
//! image-analysis clients.
//!
//! The crate is the headless core of a desktop client whose algorithms run
//! on a remote worker process. It owns:
//!
//! - a typed state store whose cells a host UI mirrors ([`store`]),
//! - the pipeline model: definitions, per-batch data with downstream
//!   invalidation, sparse batch lists ([`pipeline`]),
//! - an RPC bridge that turns the worker's out-of-band completion signals
//!   into awaitable calls ([`rpc`]),
//! - an event bus decoupling the scheduler from step, export and
//!   aggregate handlers ([`events`]),
//! - the scheduler that plays a pipeline batch by batch ([`pipeline::exec`]),
//! - persistence of parameters, batches and settings ([`persist`]).
//!
//! A host assembles a [`pipeline::CoreContext`] from these pieces, attaches
//! a [`pipeline::runner::StepRunner`] plus its own export handlers, and
//! drives everything through the [`events::EventBus`] and the
//! [`pipeline::exec::ExecutionScheduler`].
//!
//! ```ignore
//! let store = Arc::new(StateStore::new());
//! let cells = CoreCells::declare(&store);
//! let bridge = Arc::new(RpcBridge::new(transport, store.clone(), cells.overlay.clone()));
//! let ctx = CoreContext::new(store, cells, bus, bridge, definition, persistence, config)?;
//! loader::load_pipeline(&ctx).await?;
//! StepRunner::new(ctx.clone()).attach();
//! ExecutionScheduler::new(ctx).start(0).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod params;
pub mod persist;
pub mod pipeline;
pub mod rpc;
pub mod store;
pub mod types;

pub use config::CoreConfig;
pub use error::{CoreError, Result, ResultExt};
pub use events::{EventBus, EventKind, EventPayload, EventResult, StepOutcome};
pub use pipeline::cells::CoreCells;
pub use pipeline::definition::PipelineDefinition;
pub use pipeline::exec::ExecutionScheduler;
pub use pipeline::runner::StepRunner;
pub use pipeline::CoreContext;
pub use rpc::{RpcBridge, WorkerTransport};
pub use store::{CellHandle, StateStore};
