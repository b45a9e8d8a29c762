// pipeline.rs — Lowering state and stage orchestration
//
// Holds the module and all per-segment artifacts, and runs the lowering
// stages in dependency order. Each segment gets its own device; a fatal
// stage failure discards that segment's device so no partially-lowered,
// inconsistently-allocated output escapes.
//
// Preconditions: the module was built by the driver; options name a
//   known target device.
// Postconditions: one device per segment, a metadata table over all
//   segments, or has_error set with the failing stage reported.
// Failure modes: unknown device (E0100); mixed transfer styles in one
//   segment (E0101); any stage emitting error-level diagnostics.
// Side effects: calls on_stage_complete after each stage; verbose mode
//   prints stage timing to stderr.

use std::time::Instant;

use crate::alloc::{ShimDmaAllocator, ShimTileAllocator};
use crate::channel;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::execute;
use crate::fabric::Device;
use crate::id::NodeId;
use crate::ir::{BlockRef, Module, NodeKind};
use crate::metadata::{herd_allocations, HerdMetadata, ModuleMetadata, SegmentMetadata};
use crate::outline::{self, OutlineOptions, OutlinedHerd};
use crate::pass::{descriptor, StageCert, StageId};
use crate::schedule;
use crate::target::TargetModel;

// ── Options ────────────────────────────────────────────────────────────────

/// The driver-facing configuration surface of the lowering.
#[derive(Debug, Clone)]
pub struct LowerOptions {
    /// Target device model name (see `target::ALL_MODELS`).
    pub device: String,
    /// Column offset for herds without a placement attribute.
    pub col_offset: i64,
    /// Row offset for herds without a placement attribute.
    pub row_offset: i64,
    /// Emit free-running cores (loop forever instead of terminating).
    pub emit_while: bool,
    /// Guard each core body with a per-herd entry lock.
    pub emit_herd_lock: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            device: "tf100".to_string(),
            col_offset: 0,
            row_offset: 0,
            emit_while: false,
            emit_herd_lock: false,
        }
    }
}

// ── State ──────────────────────────────────────────────────────────────────

/// Holds all lowering artifacts and accumulated diagnostics.
pub struct LowerState {
    pub module: Module,
    pub devices: Vec<Device>,
    /// Placement records per segment, in segment order.
    pub herds: Vec<(String, Vec<OutlinedHerd>)>,
    pub metadata: Option<ModuleMetadata>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl LowerState {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            devices: Vec::new(),
            herds: Vec::new(),
            metadata: None,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Lowering failed due to error-level diagnostics in a stage. The
/// specific diagnostics are available in `LowerState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The stage that produced the error.
    pub failing_stage: StageId,
}

// ── Helper: per-stage post-processing ──────────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-stage post-processing: callback, accumulate, verbose, error check.
fn finish_stage(
    all_diags: &mut Vec<Diagnostic>,
    has_error: &mut bool,
    stage: StageId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_stage_complete: &mut impl FnMut(StageId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_stage_complete(stage, &diags);
    let is_err = has_error_diags(&diags);
    all_diags.extend(diags);
    if verbose {
        eprintln!(
            "flc: {} complete, {:.1}ms",
            descriptor(stage).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        *has_error = true;
        return Err(PipelineError {
            failing_stage: stage,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the full lowering over every segment of the module.
///
/// Per-stage sequence: execute -> on_stage_complete -> verbose -> error
/// check. A failing segment contributes no device and no metadata.
pub fn run_lowering(
    state: &mut LowerState,
    options: &LowerOptions,
    verbose: bool,
    mut on_stage_complete: impl FnMut(StageId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let Some(model) = TargetModel::by_name(&options.device) else {
        state.diagnostics.push(
            Diagnostic::new(
                DiagLevel::Error,
                format!("unknown target device \"{}\"", options.device),
            )
            .with_code(codes::E0100)
            .with_hint("known devices: tf100, tf200"),
        );
        state.has_error = true;
        return Err(PipelineError {
            failing_stage: StageId::Outline,
        });
    };

    let mut segments_meta = Vec::new();

    for seg in state.module.segments.clone() {
        if state.module.is_erased(seg) {
            continue;
        }
        let seg_name = match state.module.kind(seg) {
            NodeKind::Segment { name, .. } => name.clone(),
            _ => continue,
        };
        let mut device = Device::new(&seg_name, model);

        // ── Outline ────────────────────────────────────────────────
        let outline_opts = OutlineOptions {
            col_offset: options.col_offset,
            row_offset: options.row_offset,
            emit_while: options.emit_while,
            emit_herd_lock: options.emit_herd_lock,
        };
        let t = Instant::now();
        let outline_result =
            outline::outline_herds(&mut state.module, seg, &mut device, &outline_opts);
        let herds = outline_result.herds;
        let mut diags = outline_result.diagnostics;
        let cert = outline::verify_outline(&state.module, &device, &herds);
        if !cert.all_pass() {
            let failed: Vec<_> = cert
                .obligations()
                .iter()
                .filter(|(_, ok)| !ok)
                .map(|(name, _)| *name)
                .collect();
            diags.push(
                Diagnostic::new(
                    DiagLevel::Error,
                    format!("outline verification failed: {}", failed.join(", ")),
                )
                .with_code(codes::E0600),
            );
        }
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::Outline,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Conditional specialization ─────────────────────────────
        let t = Instant::now();
        let diags = outline::specialize_conditionals(&mut state.module, &device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::SpecializeIf,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Execute and token lowering ─────────────────────────────
        let t = Instant::now();
        execute::lower_executes(&mut state.module, &device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::LowerExecute,
            Vec::new(),
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        let t = Instant::now();
        execute::strip_loop_tokens(&mut state.module, &device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::StripTokens,
            Vec::new(),
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Buffer placement ───────────────────────────────────────
        let t = Instant::now();
        outline::place_l1_buffers(&mut state.module, &mut device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::PlaceBuffers,
            Vec::new(),
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // The shim pools are not unified between the memory-copy and
        // named-channel styles, so a segment must commit to one.
        let (has_dma, has_chan) = transfer_styles(&state.module, seg, &device);
        if has_dma && has_chan {
            let diag = Diagnostic::new(
                DiagLevel::Error,
                format!(
                    "segment @{seg_name} mixes memory-copy and named-channel transfer styles"
                ),
            )
            .with_code(codes::E0101)
            .with_node(seg);
            finish_stage(
                &mut state.diagnostics,
                &mut state.has_error,
                StageId::LowerDma,
                vec![diag],
                std::time::Duration::ZERO,
                verbose,
                &mut on_stage_complete,
            )?;
        }

        // ── DMA schedules ──────────────────────────────────────────
        let mut shim_dma = ShimDmaAllocator::new(&device);
        let t = Instant::now();
        let diags = schedule::build_dma_schedules(&mut state.module, &mut device, &mut shim_dma);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::LowerDma,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Pipeline handoffs ──────────────────────────────────────
        let t = Instant::now();
        let diags = channel::lower_pipeline_handoffs(&mut state.module, &mut device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::LowerPipeline,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Channel lowering ───────────────────────────────────────
        let t = Instant::now();
        let diags = channel::specialize_bundles(&mut state.module, seg, &device);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::SpecializeBundles,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        let t = Instant::now();
        channel::propagate_ping_pong(&mut state.module, seg, &device);
        let mut shim_tiles = ShimTileAllocator::new(&device);
        let diags =
            channel::lower_channels(&mut state.module, seg, &mut device, &mut shim_tiles);
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::LowerChannels,
            diags,
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        // ── Metadata ───────────────────────────────────────────────
        let t = Instant::now();
        let herd_meta: Vec<HerdMetadata> = herds
            .iter()
            .map(|h| HerdMetadata {
                herd: h.name.clone(),
                allocations: herd_allocations(&device, &shim_dma, h),
            })
            .filter(|hm| !hm.allocations.is_empty())
            .collect();
        segments_meta.push(SegmentMetadata {
            segment: seg_name.clone(),
            herds: herd_meta,
        });
        finish_stage(
            &mut state.diagnostics,
            &mut state.has_error,
            StageId::EmitMetadata,
            Vec::new(),
            t.elapsed(),
            verbose,
            &mut on_stage_complete,
        )?;

        state.herds.push((seg_name, herds));
        state.devices.push(device);
    }

    state.metadata = Some(ModuleMetadata {
        segments: segments_meta,
    });
    Ok(())
}

/// Which transfer styles a segment uses after outlining: memory copies,
/// named channel operations, or both.
fn transfer_styles(module: &Module, segment: NodeId, device: &Device) -> (bool, bool) {
    let mut has_dma = false;
    let mut has_chan = false;
    let mut scan = |block: &[NodeId]| {
        module.visit(block, &mut |_, kind| match kind {
            NodeKind::Memcpy { .. } => has_dma = true,
            NodeKind::ChannelPut { .. } | NodeKind::ChannelGet { .. } => has_chan = true,
            _ => {}
        });
    };
    scan(&module.block(BlockRef::body(segment)).clone());
    for &core in &device.cores {
        scan(&module.block(BlockRef::body(core)).clone());
    }
    (has_dma, has_chan)
}

/// Convenience wrapper: build state, run all stages, return both.
pub fn lower_module(
    module: Module,
    options: &LowerOptions,
) -> (LowerState, Result<(), PipelineError>) {
    let mut state = LowerState::new(module);
    let result = run_lowering(&mut state, options, false, |_, _| {});
    (state, result)
}

// ── Tests ──────────────────────────────────────────────────────────────────
