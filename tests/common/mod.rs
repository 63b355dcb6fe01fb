//! Shared harness for integration tests.
#![allow(dead_code)]

use labflow::config::CoreConfig;
use labflow::events::EventBus;
use labflow::persist::MemoryStore;
use labflow::pipeline::batch::BatchList;
use labflow::pipeline::batch::SingleDataBatch;
use labflow::pipeline::cells::CoreCells;
use labflow::pipeline::definition::{InputDef, LoaderSpec, PipelineDefinition, StepDef};
use labflow::pipeline::exec::ExecutionScheduler;
use labflow::pipeline::runner::StepRunner;
use labflow::pipeline::CoreContext;
use labflow::rpc::mock::{MockOutcome, MockWorker};
use labflow::rpc::{Endpoint, RpcBridge, WorkerTransport};
use labflow::store::StateStore;
use labflow::types::{LoadedInput, LocalFile};
use serde_json::json;
use std::sync::Arc;

pub struct Harness {
    pub ctx: CoreContext,
    pub worker: Arc<MockWorker>,
    pub scheduler: ExecutionScheduler,
    pub runner: Arc<StepRunner>,
}

/// A linear pipeline `raw -> d0 -> d1 -> ...`, one step per module name,
/// with a png loader on its single input.
pub fn chain_definition(name: &str, modules: &[&str]) -> PipelineDefinition {
    let mut steps = Vec::new();
    let mut prev = "raw".to_string();
    for (i, module) in modules.iter().enumerate() {
        let out = format!("d{i}");
        steps.push(
            StepDef::new(*module, format!("Step {module}"))
                .with_input("in", prev.clone())
                .with_output("out", out.clone()),
        );
        prev = out;
    }
    PipelineDefinition::new(
        name,
        steps,
        vec![InputDef::new(
            "raw",
            "Image",
            vec![LoaderSpec::new("imgload", &["png"])],
        )],
    )
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn harness(definition: PipelineDefinition) -> Harness {
    init_tracing();
    let store = Arc::new(StateStore::new());
    let cells = CoreCells::declare(&store);
    let (worker, signal_rx) = MockWorker::new();
    let bridge = Arc::new(RpcBridge::new(
        Arc::clone(&worker) as Arc<dyn WorkerTransport>,
        Arc::clone(&store),
        cells.overlay.clone(),
    ));
    bridge.spawn_signal_pump(signal_rx);
    let ctx = CoreContext::new(
        store,
        cells,
        Arc::new(EventBus::new()),
        bridge,
        Arc::new(definition),
        Arc::new(MemoryStore::new()),
        CoreConfig::default(),
    )
    .expect("definition must validate");
    ctx.store.set(&ctx.cells.pipeline_name, ctx.definition.name.clone());
    ctx.store
        .set(&ctx.cells.parameters, ctx.definition.default_parameters());
    let runner = StepRunner::new(ctx.clone());
    runner.attach();
    let scheduler = ExecutionScheduler::new(ctx.clone());
    Harness {
        ctx,
        worker,
        scheduler,
        runner,
    }
}

/// Seeds one batch per path, each with the single input assigned.
pub fn seed_batches(ctx: &CoreContext, paths: &[&str]) {
    let batches: BatchList = paths
        .iter()
        .map(|p| {
            let mut batch = SingleDataBatch::blank(&ctx.definition, None);
            batch.inputs.insert(
                "raw".into(),
                Some(LoadedInput {
                    file: LocalFile::new(*p, *p),
                    meta: json!(*p),
                }),
            );
            Some(batch)
        })
        .collect();
    ctx.store.set(&ctx.cells.batches, batches);
}

/// Queues a successful step run whose single output is `value`.
pub fn script_step_ok(worker: &MockWorker, value: serde_json::Value) {
    worker.script(Endpoint::RunStepAsync, MockOutcome::Ok(json!({ "out": value })));
}

/// Makes every input file load return a distinct payload derived from its
/// path, so step snapshots differ between batches.
pub fn script_distinct_loads(worker: &MockWorker, paths: &[&str]) {
    for path in paths {
        worker.script(
            Endpoint::LoadInputFile,
            MockOutcome::Ok(json!({ "path": path })),
        );
    }
}
