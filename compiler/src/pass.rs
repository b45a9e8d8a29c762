// pass.rs — Stage descriptor module: metadata, dependency resolution
//
// Declares the ten lowering stages, their dependency edges, and the
// artifacts they produce. The pipeline runner executes stages in
// dependency order; `required_stages` computes the minimal ordered
// subset needed to produce a given terminal stage.

use std::collections::HashSet;

// ── Stage and Artifact identifiers ─────────────────────────────────────────

/// Identifies each lowering stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Outline,
    SpecializeIf,
    LowerExecute,
    StripTokens,
    PlaceBuffers,
    LowerDma,
    LowerPipeline,
    SpecializeBundles,
    LowerChannels,
    EmitMetadata,
}

/// Machine-readable artifact identifiers; each maps to a concrete part
/// of the lowering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Cores,       // per-tile Core nodes + OutlinedHerd placements
    Buffers,     // tile-owned buffers for L1 allocs
    DmaPrograms, // per-tile descriptor programs + flows
    Handoffs,    // shared-buffer pipeline handoffs
    Queues,      // queue objects replacing channels
    Metadata,    // per-segment runtime table
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable postcondition evidence produced by a stage verifier.
pub trait StageCert {
    /// True if all obligations pass.
    fn all_pass(&self) -> bool;
    /// Named obligations with their outcomes.
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Stage descriptor ───────────────────────────────────────────────────────

/// Static metadata about a lowering stage.
pub struct StageDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Stages whose outputs this stage consumes.
    pub inputs: &'static [StageId],
    /// Artifacts this stage produces.
    pub outputs: &'static [ArtifactId],
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given stage.
pub fn descriptor(id: StageId) -> StageDescriptor {
    match id {
        StageId::Outline => StageDescriptor {
            name: "outline",
            inputs: &[],
            outputs: &[ArtifactId::Cores],
            invariants: "one core per herd coordinate, id symbols bound to constants",
        },
        StageId::SpecializeIf => StageDescriptor {
            name: "specialize_if",
            inputs: &[StageId::Outline],
            outputs: &[],
            invariants: "every constant-guarded conditional spliced",
        },
        StageId::LowerExecute => StageDescriptor {
            name: "lower_execute",
            inputs: &[StageId::SpecializeIf],
            outputs: &[],
            invariants: "no execute regions remain; tokens forwarded through joins",
        },
        StageId::StripTokens => StageDescriptor {
            name: "strip_tokens",
            inputs: &[StageId::LowerExecute],
            outputs: &[],
            invariants: "no token-typed loop-carried values; real values preserved",
        },
        StageId::PlaceBuffers => StageDescriptor {
            name: "place_buffers",
            inputs: &[StageId::StripTokens],
            outputs: &[ArtifactId::Buffers],
            invariants: "L1 allocs in cores replaced by tile buffers",
        },
        StageId::LowerDma => StageDescriptor {
            name: "lower_dma",
            inputs: &[StageId::PlaceBuffers],
            outputs: &[ArtifactId::DmaPrograms],
            invariants: "every L3<->L1 copy has a channel, flow, and descriptor",
        },
        StageId::LowerPipeline => StageDescriptor {
            name: "lower_pipeline",
            inputs: &[StageId::LowerDma],
            outputs: &[ArtifactId::Handoffs],
            invariants: "put/get pairs share a locked single buffer",
        },
        StageId::SpecializeBundles => StageDescriptor {
            name: "specialize_bundles",
            inputs: &[StageId::LowerPipeline],
            outputs: &[],
            invariants: "no bundled channel declarations remain",
        },
        StageId::LowerChannels => StageDescriptor {
            name: "lower_channels",
            inputs: &[StageId::SpecializeBundles],
            outputs: &[ArtifactId::Queues],
            invariants: "every lowerable channel replaced by a queue object",
        },
        StageId::EmitMetadata => StageDescriptor {
            name: "emit_metadata",
            inputs: &[StageId::LowerDma, StageId::LowerChannels],
            outputs: &[ArtifactId::Metadata],
            invariants: "table reflects final allocator state",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All stage IDs in declaration order.
pub const ALL_STAGES: [StageId; 10] = [
    StageId::Outline,
    StageId::SpecializeIf,
    StageId::LowerExecute,
    StageId::StripTokens,
    StageId::PlaceBuffers,
    StageId::LowerDma,
    StageId::LowerPipeline,
    StageId::SpecializeBundles,
    StageId::LowerChannels,
    StageId::EmitMetadata,
];

/// Compute the minimal ordered set of stages needed to produce
/// `terminal`, in topological (execution) order.
pub fn required_stages(terminal: StageId) -> Vec<StageId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: StageId, visited: &mut HashSet<StageId>, order: &mut Vec<StageId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
