//! Loading pipelines and batches: worker round trips plus the cell writes
//! that make the result the current state.

use crate::error::{CoreError, Result, ResultExt};
use crate::events::ToastSeverity;
use crate::persist::{load_parameters, KEY_BATCHES, KEY_GLOBAL_SETTINGS, KEY_LOADED_PIPELINE};
use crate::pipeline::batch::{BatchList, SingleDataBatch};
use crate::pipeline::cells::GlobalSettings;
use crate::pipeline::data::{update_pipeline_data, DataMap};
use crate::pipeline::definition::LoaderSpec;
use crate::pipeline::CoreContext;
use crate::types::{ExecutionState, LoadedInput, LocalFile, OverlayState, Screen};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Announces the pipeline to the worker and initializes every cell from
/// persisted state. Previously stored batches are re-loaded through the
/// worker; files that no longer load are dropped, batches left with no
/// files disappear. At least one (possibly blank) batch always remains.
pub async fn load_pipeline(ctx: &CoreContext) -> Result<()> {
    let name = ctx.definition.name.clone();
    ctx.bridge
        .pipeline_loaded(&ctx.definition)
        .await
        .context(format!("announcing pipeline '{name}' to worker"))?;
    ctx.persistence.save_global(KEY_LOADED_PIPELINE, &json!(name))?;

    let cells = &ctx.cells;
    ctx.store.set(&cells.pipeline_name, name.clone());
    ctx.store.set(&cells.data, DataMap::new());
    ctx.store.set(&cells.inputs, BTreeMap::new());
    ctx.store.set(&cells.cur_step, 0);
    ctx.store.set(&cells.cur_batch, None);
    ctx.store.set(&cells.screen, Screen::Input);
    ctx.store.set(&cells.execution_state, ExecutionState::Manual);
    ctx.store.set(&cells.log, Vec::new());

    let defaults = ctx.definition.default_parameters();
    let parameters = load_parameters(
        ctx.persistence.as_ref(),
        &name,
        &defaults,
        crate::persist::PARAM_SET_CURRENT,
    );
    ctx.store.set(&cells.parameters, parameters);

    let settings = ctx
        .persistence
        .load_for_pipeline(&name, KEY_GLOBAL_SETTINGS)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_else(|| {
            GlobalSettings::defaults_for(&ctx.definition, ctx.config.pause_to_see_results_ms)
        });
    ctx.store.set(&cells.global_settings, settings);

    let stored: BatchList = ctx
        .persistence
        .load_for_pipeline(&name, KEY_BATCHES)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let mut restored = restore_batches(ctx, stored).await;
    if !restored.iter().any(|b| b.is_some()) {
        restored = vec![Some(SingleDataBatch::blank(&ctx.definition, None))];
    }
    ctx.store.set(&cells.batches, restored);
    tracing::info!(pipeline = %name, "pipeline loaded");
    Ok(())
}

/// Re-loads every stored batch's files through the worker. All loads run
/// concurrently; each failure removes only the affected file.
async fn restore_batches(ctx: &CoreContext, stored: BatchList) -> BatchList {
    let mut jobs = Vec::new();
    for (index, batch) in stored.iter().enumerate() {
        let Some(batch) = batch else { continue };
        for input in &ctx.definition.inputs {
            let Some(Some(loaded)) = batch.inputs.get(&input.key) else {
                continue;
            };
            let Some(loader) = input.loader_for(&loaded.file.name) else {
                continue;
            };
            jobs.push((index, input.key.clone(), loaded.file.clone(), loader.clone()));
        }
    }
    let results = join_all(jobs.iter().map(|(index, key, file, loader)| {
        ctx.bridge
            .load_input_file(key, &file.path, loader, *index as i64)
    }))
    .await;

    let mut restored: BatchList = stored
        .into_iter()
        .map(|b| {
            b.map(|mut b| {
                for slot in b.inputs.values_mut() {
                    *slot = None;
                }
                b
            })
        })
        .collect();
    for ((index, key, file, _), result) in jobs.into_iter().zip(results) {
        match result {
            Ok(meta) => {
                if let Some(Some(batch)) = restored.get_mut(index) {
                    batch.inputs.insert(key, Some(LoadedInput { file, meta }));
                }
            }
            Err(e) => {
                tracing::warn!(batch = index, key = %key, error = %e, "stored file no longer loads");
            }
        }
    }
    for slot in restored.iter_mut() {
        if slot.as_ref().is_some_and(|b| b.loaded_paths().is_empty()) {
            *slot = None;
        }
    }
    restored
}

/// Resets every cell to its unloaded state. The worker is not contacted.
pub fn unload_pipeline(ctx: &CoreContext) {
    let cells = &ctx.cells;
    ctx.store.set(&cells.pipeline_name, String::new());
    ctx.store.set(&cells.data, DataMap::new());
    ctx.store.set(&cells.inputs, BTreeMap::new());
    ctx.store.set(&cells.batches, BatchList::new());
    ctx.store.set(&cells.cur_batch, None);
    ctx.store.set(&cells.cur_step, 0);
    ctx.store.set(&cells.parameters, Vec::new());
    ctx.store.set(&cells.screen, Screen::Input);
    ctx.store.set(&cells.execution_state, ExecutionState::Manual);
}

/// Loads the batch at `index` into the pipeline: every input file goes
/// through its loader concurrently. One failed input discards the whole
/// load and leaves the current batch untouched.
pub async fn load_batch(ctx: &CoreContext, index: usize, reload_parameters: bool) -> Result<()> {
    let batches = ctx.store.get(&ctx.cells.batches);
    let batch = batches
        .get(index)
        .cloned()
        .flatten()
        .ok_or_else(|| CoreError::config(format!("no batch at index {index}")))?;

    let mut jobs: Vec<(String, LocalFile, LoaderSpec)> = Vec::new();
    for input in &ctx.definition.inputs {
        let file = batch
            .inputs
            .get(&input.key)
            .and_then(|f| f.as_ref())
            .map(|l| l.file.clone())
            .ok_or_else(|| {
                CoreError::config(format!("batch {index} has no file for input '{}'", input.key))
            })?;
        let loader = input.loader_for(&file.name).ok_or_else(|| {
            CoreError::config(format!("no loader accepts '{}' for input '{}'", file.name, input.key))
        })?;
        jobs.push((input.key.clone(), file, loader.clone()));
    }

    let results = join_all(jobs.iter().map(|(key, file, loader)| {
        ctx.bridge
            .load_input_file(key, &file.path, loader, index as i64)
    }))
    .await;

    let mut loaded: Vec<(String, LocalFile, serde_json::Value)> = Vec::new();
    for ((key, file, _), result) in jobs.into_iter().zip(results) {
        let meta = result.context(format!("loading '{}' for input '{key}'", file.path))?;
        loaded.push((key, file, meta));
    }

    // all loads succeeded; commit
    let inputs_map: BTreeMap<_, _> = loaded
        .iter()
        .map(|(key, file, meta)| {
            (
                key.clone(),
                LoadedInput {
                    file: file.clone(),
                    meta: meta.clone(),
                },
            )
        })
        .collect();
    ctx.store.set(&ctx.cells.inputs, inputs_map);
    for (key, _, meta) in loaded {
        update_pipeline_data(&ctx.store, &ctx.cells.data, &ctx.definition, &key, Some(meta));
    }

    if reload_parameters {
        load_stored_parameters(ctx, &batch.settings_set_name);
    }
    ctx.store.set(&ctx.cells.cur_batch, Some(index));
    ctx.store
        .set(&ctx.cells.batch_timestamp, chrono::Utc::now().timestamp_millis());
    Ok(())
}

/// Replaces the working parameters with the stored set `set_key`, merged
/// over the definition's defaults.
pub fn load_stored_parameters(ctx: &CoreContext, set_key: &str) {
    let name = ctx.store.get(&ctx.cells.pipeline_name);
    let defaults = ctx.definition.default_parameters();
    let parameters = load_parameters(ctx.persistence.as_ref(), &name, &defaults, set_key);
    ctx.store.set(&ctx.cells.parameters, parameters);
}

/// Appends (or, with `replace`, substitutes) batches built from file rows,
/// one file slot per pipeline input in definition order. Every file loads
/// through the worker for validation; files that fail are reported and
/// skipped, rows left with no loadable file are dropped. Returns the
/// number of batches added.
pub async fn add_batches(
    ctx: &CoreContext,
    rows: Vec<Vec<Option<LocalFile>>>,
    replace: bool,
    settings_set_name: &str,
) -> Result<usize> {
    ctx.store.set(
        &ctx.cells.overlay,
        Some(OverlayState::with_progress("Adding new batches...", 0.0)),
    );

    let existing = if replace {
        BatchList::new()
    } else {
        ctx.store.get(&ctx.cells.batches)
    };
    let offset = existing.len();

    let mut jobs = Vec::new();
    for (row_idx, row) in rows.iter().enumerate() {
        for (input, file) in ctx.definition.inputs.iter().zip(row) {
            let Some(file) = file else { continue };
            match input.loader_for(&file.name) {
                Some(loader) => {
                    jobs.push((row_idx, input.key.clone(), file.clone(), loader.clone()))
                }
                None => ctx.bus.toast(
                    format!("No loader accepts '{}' for input '{}'", file.name, input.title),
                    ToastSeverity::Error,
                ),
            }
        }
    }

    let total = jobs.len().max(1);
    let done = Arc::new(AtomicUsize::new(0));
    let results = join_all(jobs.iter().map(|(row_idx, key, file, loader)| {
        let done = Arc::clone(&done);
        async move {
            let result = ctx
                .bridge
                .load_input_file(key, &file.path, loader, (offset + row_idx) as i64)
                .await;
            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.store.set(
                &ctx.cells.overlay,
                Some(OverlayState::with_progress(
                    "Adding new batches...",
                    finished as f64 / total as f64,
                )),
            );
            result
        }
    }))
    .await;

    let mut assembled: Vec<SingleDataBatch> = rows
        .iter()
        .map(|_| SingleDataBatch::blank(&ctx.definition, Some(settings_set_name)))
        .collect();
    for ((row_idx, key, file, _), result) in jobs.into_iter().zip(results) {
        match result {
            Ok(meta) => {
                assembled[row_idx]
                    .inputs
                    .insert(key, Some(LoadedInput { file, meta }));
            }
            Err(e) => {
                tracing::warn!(key = %key, file = %file.path, error = %e, "file did not load");
                ctx.bus.toast(
                    format!("Could not load '{}': {e}", file.name),
                    ToastSeverity::Error,
                );
            }
        }
    }

    let mut list = existing;
    let mut added = 0;
    for batch in assembled {
        if batch.loaded_paths().is_empty() {
            continue;
        }
        list.push(Some(batch));
        added += 1;
    }
    ctx.store.set(&ctx.cells.batches, list.clone());
    persist_batches(ctx, &list);
    ctx.store.set(&ctx.cells.overlay, None);
    Ok(added)
}

/// Deletes the batch at `index`, leaving a hole so other indices stay
/// stable.
pub fn remove_batch(ctx: &CoreContext, index: usize) {
    let mut batches = ctx.store.get(&ctx.cells.batches);
    crate::pipeline::batch::delete_batch(&mut batches, index);
    if ctx.store.get(&ctx.cells.cur_batch) == Some(index) {
        ctx.store.set(&ctx.cells.cur_batch, None);
    }
    ctx.store.set(&ctx.cells.batches, batches.clone());
    persist_batches(ctx, &batches);
}

fn persist_batches(ctx: &CoreContext, batches: &BatchList) {
    let name = ctx.store.get(&ctx.cells.pipeline_name);
    match serde_json::to_value(batches) {
        Ok(value) => {
            if let Err(e) = ctx
                .persistence
                .save_for_pipeline(&name, KEY_BATCHES, &value)
            {
                tracing::warn!(error = %e, "could not persist batches");
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not serialize batches"),
    }
}
