// outline.rs — Core outlining and per-tile specialization
//
// Replicates each herd body once per virtual tile coordinate: creates the
// physical tile and its compute core, binds the herd's id and size symbols
// to constants, binds memref kernel arguments to tile-scoped globals, and
// clones the body with those substitutions. Conditionals guarded by the
// now-constant coordinates are resolved in a fixpoint rewrite; L1 allocs
// inside cores become tile-owned buffers.
//
// Preconditions: segment body contains the herds to outline.
// Postconditions: one core per (x, y) in [0,X)x[0,Y) per herd; herd nodes
//   are tombstoned; every resolvable coordinate conditional is spliced.
// Failure modes: lock exhaustion for the herd entry lock; unresolvable
//   guards are left intact with a W0301 diagnostic (never guessed).
// Side effects: mutates the module arena and the device.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::fabric::Device;
use crate::id::NodeId;
use crate::ir::{BlockRef, LockAction, MemorySpace, Module, NodeKind, Region};
use crate::pass::StageCert;

// ── Options ──────────────────────────────────────────────────────────────

/// Outlining configuration, taken from the driver's option surface.
#[derive(Debug, Clone)]
pub struct OutlineOptions {
    /// Column offset for herds without a placement attribute.
    pub col_offset: i64,
    /// Row offset for herds without a placement attribute.
    pub row_offset: i64,
    /// Loop core bodies indefinitely instead of terminating.
    pub emit_while: bool,
    /// Guard each core body with a per-herd entry lock.
    pub emit_herd_lock: bool,
}

// ── Results ──────────────────────────────────────────────────────────────

/// Placement record of one outlined herd, kept after the herd node is
/// tombstoned; the metadata emitter reads it.
#[derive(Debug, Clone)]
pub struct OutlinedHerd {
    pub herd: NodeId,
    pub name: String,
    pub size_x: i64,
    pub size_y: i64,
    pub col_offset: i64,
    pub row_offset: i64,
    /// Transfer ids of every memory copy the herd body contained.
    pub transfer_ids: BTreeSet<i32>,
}

pub struct OutlineResult {
    pub herds: Vec<OutlinedHerd>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Outlining ────────────────────────────────────────────────────────────

/// Outline every herd of `segment` onto `device`.
pub fn outline_herds(
    module: &mut Module,
    segment: NodeId,
    device: &mut Device,
    options: &OutlineOptions,
) -> OutlineResult {
    let mut diagnostics = Vec::new();
    let mut outlined = Vec::new();

    let seg_body = module.block(BlockRef::body(segment)).clone();
    let herds: Vec<NodeId> = seg_body
        .iter()
        .copied()
        .filter(|&n| !module.is_erased(n) && matches!(module.kind(n), NodeKind::Herd { .. }))
        .collect();

    for herd in herds {
        match outline_one(module, herd, device, options) {
            Ok(info) => outlined.push(info),
            Err(d) => diagnostics.push(d),
        }
    }

    // The abstract herd nodes are consumed: tombstone and unlink.
    for info in &outlined {
        module.erase(info.herd);
    }
    let keep: Vec<NodeId> = module
        .block(BlockRef::body(segment))
        .iter()
        .copied()
        .filter(|&n| !module.is_erased(n))
        .collect();
    *module.block_mut(BlockRef::body(segment)) = keep;

    OutlineResult {
        herds: outlined,
        diagnostics,
    }
}

fn outline_one(
    module: &mut Module,
    herd: NodeId,
    device: &mut Device,
    options: &OutlineOptions,
) -> Result<OutlinedHerd, Diagnostic> {
    let (name, size_x, size_y, ids, sizes, kernel_args, body, col_attr, row_attr) =
        match module.kind(herd) {
            NodeKind::Herd {
                name,
                size_x,
                size_y,
                ids,
                sizes,
                kernel_args,
                body,
                col_offset,
                row_offset,
            } => (
                name.clone(),
                *size_x,
                *size_y,
                *ids,
                *sizes,
                kernel_args.clone(),
                body.clone(),
                *col_offset,
                *row_offset,
            ),
            _ => unreachable!("outline_one called on a non-herd node"),
        };

    // The configured offsets apply unless the herd carries its own; the
    // chosen placement is written back so later stages observe it.
    let col_offset = col_attr.unwrap_or(options.col_offset);
    let row_offset = row_attr.unwrap_or(options.row_offset);
    if let NodeKind::Herd {
        col_offset: c,
        row_offset: r,
        ..
    } = module.kind_mut(herd)
    {
        *c = Some(col_offset);
        *r = Some(row_offset);
    }

    let mut transfer_ids = BTreeSet::new();
    module.visit(&body, &mut |_, kind| {
        if let NodeKind::Memcpy { id, .. } = kind {
            transfer_ids.insert(*id);
        }
    });

    for y in 0..size_y {
        for x in 0..size_x {
            let phys_x = col_offset + x;
            let phys_y = row_offset + y;
            let tile = device.get_or_create_tile(phys_x, phys_y);

            let core = match device.core_on(module, tile) {
                Some(c) => c,
                None => {
                    let elf = format!("{}_core_{}_{}", device.name, phys_x, phys_y);
                    device.add_core(module, tile, elf, options.emit_while, Some(herd))
                }
            };
            let at = BlockRef::body(core);

            let herd_lock = if options.emit_herd_lock {
                Some(
                    device
                        .allocate_lock(tile, 0, Some(0))
                        .map_err(|e| e.into_diagnostic())?,
                )
            } else {
                None
            };

            // Bind the id and size symbols to this tile's constants.
            let mut remap = HashMap::new();
            let cx = module.build_const_index(at, x);
            let cy = module.build_const_index(at, y);
            let sx = module.build_const_index(at, size_x);
            let sy = module.build_const_index(at, size_y);
            remap.insert(ids[0], cx);
            remap.insert(ids[1], cy);
            remap.insert(sizes[0], sx);
            remap.insert(sizes[1], sy);

            // Memref kernel arguments become tile-scoped globals.
            for &arg in &kernel_args {
                let Some(ty) = module.memref_type(arg).cloned() else {
                    continue;
                };
                let sym = device.add_global("herd_arg", ty.clone());
                let node = module.add_node(NodeKind::HerdTerminator);
                let result = module.new_value(
                    crate::ir::Type::MemRef(ty),
                    crate::ir::ValueDef::Node(node, 0),
                );
                *module.kind_mut(node) = NodeKind::GetGlobal { sym, result };
                module.append(at, node);
                remap.insert(arg, result);
            }

            if let Some(lock) = herd_lock {
                let n = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 0,
                    action: LockAction::Acquire,
                });
                module.append(at, n);
            }

            let cloned = module.clone_block(&body, &mut remap);
            let mut terminators = Vec::new();
            let mut callees = Vec::new();
            module.visit(&cloned, &mut |id, kind| match kind {
                NodeKind::HerdTerminator => terminators.push(id),
                NodeKind::KernelCall { callee, .. } => callees.push(callee.clone()),
                _ => {}
            });
            for c in &callees {
                device.register_kernel(c);
            }
            for t in terminators {
                module.erase(t);
            }
            for n in &cloned {
                module.append(at, *n);
            }

            if let Some(lock) = herd_lock {
                let n = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 0,
                    action: LockAction::Release,
                });
                module.append(at, n);
            }
        }
    }

    Ok(OutlinedHerd {
        herd,
        name,
        size_x,
        size_y,
        col_offset,
        row_offset,
        transfer_ids,
    })
}

// ── Outline verification ─────────────────────────────────────────────────

/// Machine-checkable evidence for the outlining postconditions (O1-O2).
#[derive(Debug, Clone)]
pub struct OutlineCert {
    /// O1: Each herd produced exactly X*Y core bodies.
    pub o1_core_count: bool,
    /// O2: Core id constants cover each (x, y) exactly once per herd.
    pub o2_distinct_ids: bool,
}

impl StageCert for OutlineCert {
    fn all_pass(&self) -> bool {
        self.o1_core_count && self.o2_distinct_ids
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("O1_core_count", self.o1_core_count),
            ("O2_distinct_ids", self.o2_distinct_ids),
        ]
    }
}

pub fn verify_outline(module: &Module, device: &Device, herds: &[OutlinedHerd]) -> OutlineCert {
    let mut o1 = true;
    let mut o2 = true;
    for info in herds {
        let mut seen = HashSet::new();
        let mut count = 0i64;
        for &core in &device.cores {
            let NodeKind::Core { herd, body, .. } = module.kind(core) else {
                continue;
            };
            if *herd != Some(info.herd) {
                continue;
            }
            count += 1;
            // The first two constants of a core body are its bound (x, y).
            let consts: Vec<i64> = body
                .iter()
                .filter_map(|&n| match module.kind(n) {
                    NodeKind::ConstantIndex { value, .. } => Some(*value),
                    _ => None,
                })
                .take(2)
                .collect();
            if consts.len() != 2
                || consts[0] < 0
                || consts[0] >= info.size_x
                || consts[1] < 0
                || consts[1] >= info.size_y
                || !seen.insert((consts[0], consts[1]))
            {
                o2 = false;
            }
        }
        if count != info.size_x * info.size_y {
            o1 = false;
        }
    }
    OutlineCert {
        o1_core_count: o1,
        o2_distinct_ids: o2,
    }
}

// ── Conditional specialization ───────────────────────────────────────────

struct SpecCtx {
    diagnostics: Vec<Diagnostic>,
    reported: HashSet<NodeId>,
}

/// Resolve every conditional whose guard tests only constant operands,
/// splicing the chosen branch in place. Runs to fixpoint so conditionals
/// exposed by an outer splice are resolved too. Guards that cannot be
/// evaluated are left intact.
pub fn specialize_conditionals(module: &mut Module, device: &Device) -> Vec<Diagnostic> {
    let mut ctx = SpecCtx {
        diagnostics: Vec::new(),
        reported: HashSet::new(),
    };
    loop {
        let mut changed = false;
        for core in device.cores.clone() {
            changed |= specialize_block(module, BlockRef::body(core), &mut ctx);
        }
        if !changed {
            break;
        }
    }
    ctx.diagnostics
}

fn specialize_block(module: &mut Module, at: BlockRef, ctx: &mut SpecCtx) -> bool {
    let mut changed = false;
    let mut body = module.block(at).clone();
    let mut i = 0;
    while i < body.len() {
        let id = body[i];
        if module.is_erased(id) {
            body.remove(i);
            changed = true;
            continue;
        }
        if matches!(module.kind(id), NodeKind::CondIf { .. }) {
            match try_specialize_if(module, id, ctx) {
                Some(replacement) => {
                    body.splice(i..=i, replacement);
                    changed = true;
                    // Re-examine from the splice point; nested conditionals
                    // surface here.
                    continue;
                }
                None => {
                    changed |= specialize_block(
                        module,
                        BlockRef {
                            node: id,
                            region: Region::Then,
                        },
                        ctx,
                    );
                    changed |= specialize_block(
                        module,
                        BlockRef {
                            node: id,
                            region: Region::Else,
                        },
                        ctx,
                    );
                }
            }
        } else {
            for child in module.child_block_refs(id) {
                changed |= specialize_block(module, child, ctx);
            }
        }
        i += 1;
    }
    *module.block_mut(at) = body;
    changed
}

/// Returns the replacement node list when the conditional resolves, or
/// None when the guard must stay (non-constant operands).
fn try_specialize_if(module: &mut Module, id: NodeId, ctx: &mut SpecCtx) -> Option<Vec<NodeId>> {
    let (guard, operands, results, then_body, else_body) = match module.kind(id) {
        NodeKind::CondIf {
            guard,
            operands,
            results,
            then_body,
            else_body,
        } => (
            guard.clone(),
            operands.clone(),
            results.clone(),
            then_body.clone(),
            else_body.clone(),
        ),
        _ => unreachable!(),
    };

    let mut dims = Vec::with_capacity(operands.len());
    for &o in &operands {
        match module.const_index(o) {
            Some(v) => dims.push(v),
            None => {
                report_unresolved(module, id, ctx);
                return None;
            }
        }
    }
    let Some(in_set) = guard.eval(&dims) else {
        report_unresolved(module, id, ctx);
        return None;
    };

    let (chosen, discarded) = if in_set {
        (then_body, else_body)
    } else {
        (else_body, then_body)
    };

    // Forward the chosen branch's yielded values, then splice its body.
    let mut replacement = Vec::new();
    let mut yield_ops: Vec<crate::id::ValueId> = Vec::new();
    for &n in &chosen {
        if module.is_erased(n) {
            continue;
        }
        if let NodeKind::Yield { operands } = module.kind(n) {
            yield_ops = operands.clone();
            module.erase(n);
            continue;
        }
        replacement.push(n);
    }
    for (i, &res) in results.iter().enumerate() {
        if let Some(&op) = yield_ops.get(i) {
            module.replace_all_uses(res, op);
        }
    }
    for &n in &discarded {
        module.erase_tree(n);
    }
    module.erase(id);
    Some(replacement)
}

fn report_unresolved(module: &Module, id: NodeId, ctx: &mut SpecCtx) {
    let _ = module;
    if ctx.reported.insert(id) {
        ctx.diagnostics.push(
            Diagnostic::new(
                DiagLevel::Warning,
                "conditional guard does not resolve to a constant for this tile; left intact",
            )
            .with_code(codes::W0301)
            .with_node(id),
        );
    }
}

// ── L1 buffer placement ──────────────────────────────────────────────────

/// Convert L1 allocs inside outlined cores into tile-owned buffers.
/// Named allocs become `<sym>_<x>_<y>` with herd-relative coordinates;
/// anonymous ones draw from the device's buffer counter.
pub fn place_l1_buffers(module: &mut Module, device: &mut Device) {
    for core in device.cores.clone() {
        let NodeKind::Core { tile, herd, body, .. } = module.kind(core) else {
            continue;
        };
        let tile = *tile;
        let herd = *herd;
        let body = body.clone();

        let t = device.tile(tile);
        let (col_offset, row_offset) = herd
            .and_then(|h| match module.kind(h) {
                NodeKind::Herd {
                    col_offset,
                    row_offset,
                    ..
                } => Some((col_offset.unwrap_or(0), row_offset.unwrap_or(0))),
                _ => None,
            })
            .unwrap_or((0, 0));

        let allocs = module.collect(&body, |k| matches!(k, NodeKind::Alloc { .. }));
        for alloc in allocs {
            let NodeKind::Alloc { sym, result } = module.kind(alloc) else {
                continue;
            };
            let sym = sym.clone();
            let result = *result;
            let Some(ty) = module.memref_type(result).cloned() else {
                continue;
            };
            if ty.space != MemorySpace::L1 {
                continue;
            }
            let coords = sym
                .as_deref()
                .map(|_| (t.col - col_offset, t.row - row_offset));
            let buffer = device.allocate_buffer(module, tile, ty, sym.as_deref(), coords);
            let value = device.buffer(buffer).value;
            module.replace_all_uses(result, value);
            module.erase(alloc);
        }
        // Drop tombstoned allocs from the core body.
        let kept: Vec<NodeId> = module
            .block(BlockRef::body(core))
            .iter()
            .copied()
            .filter(|&n| !module.is_erased(n))
            .collect();
        *module.block_mut(BlockRef::body(core)) = kept;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemType, Guard, MemRefType, Type};
    use crate::target::TargetModel;

    fn options() -> OutlineOptions {
        OutlineOptions {
            col_offset: 0,
            row_offset: 0,
            emit_while: false,
            emit_herd_lock: false,
        }
    }

    fn l1(shape: &[i64]) -> MemRefType {
        MemRefType::new(shape, ElemType::F32, MemorySpace::L1)
    }

    fn device() -> Device {
        Device::new("seg0", TargetModel::by_name("tf100").unwrap())
    }

    #[test]
    fn herd_2x2_at_offset_produces_four_cores() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (2, 2), Some((7, 2)), &[]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        let result = outline_herds(&mut m, seg, &mut d, &options());
        assert!(result.diagnostics.is_empty());
        assert_eq!(d.cores.len(), 4);

        let coords: Vec<(i64, i64)> = d
            .cores
            .iter()
            .map(|&c| match m.kind(c) {
                NodeKind::Core { tile, .. } => {
                    let t = d.tile(*tile);
                    (t.col, t.row)
                }
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(coords, vec![(7, 2), (8, 2), (7, 3), (8, 3)]);

        let cert = verify_outline(&m, &d, &result.herds);
        assert!(cert.all_pass(), "{:?}", cert.obligations());

        // The herd node is consumed.
        assert!(m.is_erased(h.node));
    }

    #[test]
    fn id_constants_bound_per_tile() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (2, 2), None, &[]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        let result = outline_herds(&mut m, seg, &mut d, &options());
        let mut pairs = Vec::new();
        for &core in &d.cores {
            if let NodeKind::Core { body, .. } = m.kind(core) {
                let consts: Vec<i64> = body
                    .iter()
                    .filter_map(|&n| match m.kind(n) {
                        NodeKind::ConstantIndex { value, .. } => Some(*value),
                        _ => None,
                    })
                    .collect();
                // x, y, size_x, size_y
                assert_eq!(&consts[2..4], &[2, 2]);
                pairs.push((consts[0], consts[1]));
            }
        }
        pairs.sort();
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert!(verify_outline(&m, &d, &result.herds).all_pass());
    }

    #[test]
    fn kernel_args_become_globals() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[l1(&[32])]);
        // The body stores through the kernel argument.
        m.build_dealloc(BlockRef::body(h.node), h.kernel_args[0]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        assert_eq!(d.globals.len(), 1);
        assert_eq!(d.globals[0].sym, "herd_arg_0");

        let core = d.cores[0];
        let body = m.block(BlockRef::body(core)).clone();
        let globals = m.collect(&body, |k| matches!(k, NodeKind::GetGlobal { .. }));
        assert_eq!(globals.len(), 1);
        // The cloned use now reads the global, not the herd argument.
        let deallocs = m.collect(&body, |k| matches!(k, NodeKind::Dealloc { .. }));
        match m.kind(deallocs[0]) {
            NodeKind::Dealloc { memref } => {
                assert_ne!(*memref, h.kernel_args[0]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn herd_lock_wraps_core_body() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        let mut opts = options();
        opts.emit_herd_lock = true;
        outline_herds(&mut m, seg, &mut d, &opts);
        assert_eq!(d.locks.len(), 1);
        assert_eq!(d.lock(crate::id::LockId(0)).lock_id, 0);

        let body = m.block(BlockRef::body(d.cores[0])).clone();
        let locks = m.collect(&body, |k| matches!(k, NodeKind::UseLock { .. }));
        assert_eq!(locks.len(), 2);
        assert!(matches!(
            m.kind(locks[0]),
            NodeKind::UseLock {
                action: LockAction::Acquire,
                ..
            }
        ));
        assert!(matches!(
            m.kind(locks[1]),
            NodeKind::UseLock {
                action: LockAction::Release,
                ..
            }
        ));
    }

    #[test]
    fn free_running_core_flag() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        let mut opts = options();
        opts.emit_while = true;
        outline_herds(&mut m, seg, &mut d, &opts);
        assert!(matches!(
            m.kind(d.cores[0]),
            NodeKind::Core {
                free_running: true,
                ..
            }
        ));
    }

    #[test]
    fn transfer_ids_recorded_per_herd() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let at = BlockRef::body(h.node);
        let size = m.build_const_index(at, 16);
        let src = m.build_alloc(
            at,
            MemRefType::new(&[16], ElemType::F32, MemorySpace::L3),
            None,
        );
        let dst = m.build_alloc(at, l1(&[16]), None);
        m.build_memcpy(at, 5, &[], src, dst, &[size], &[size], false);
        m.build_memcpy(at, 9, &[], src, dst, &[size], &[size], false);
        m.build_herd_terminator(h.node);

        let mut d = device();
        let result = outline_herds(&mut m, seg, &mut d, &options());
        let ids: Vec<i32> = result.herds[0].transfer_ids.iter().copied().collect();
        assert_eq!(ids, vec![5, 9]);
    }

    #[test]
    fn conditional_resolved_per_tile() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (2, 1), None, &[]);
        let at = BlockRef::body(h.node);
        // if (x, y) == (0, 0) call @a else call @b
        let parts = m.build_cond_if(at, Guard::at(0, 0), &[h.ids[0], h.ids[1]], &[]);
        m.build_kernel_call(
            BlockRef {
                node: parts.node,
                region: Region::Then,
            },
            "a",
            &[],
        );
        m.build_kernel_call(
            BlockRef {
                node: parts.node,
                region: Region::Else,
            },
            "b",
            &[],
        );
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        let diags = specialize_conditionals(&mut m, &d);
        assert!(diags.is_empty(), "{diags:?}");

        let mut callees_per_core = Vec::new();
        for &core in &d.cores {
            let body = m.block(BlockRef::body(core)).clone();
            assert!(
                m.collect(&body, |k| matches!(k, NodeKind::CondIf { .. }))
                    .is_empty(),
                "conditional should be resolved"
            );
            let calls = m.collect(&body, |k| matches!(k, NodeKind::KernelCall { .. }));
            let names: Vec<String> = calls
                .iter()
                .map(|&c| match m.kind(c) {
                    NodeKind::KernelCall { callee, .. } => callee.clone(),
                    _ => unreachable!(),
                })
                .collect();
            callees_per_core.push(names);
        }
        assert_eq!(callees_per_core, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }

    #[test]
    fn conditional_forwards_yielded_values() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let at = BlockRef::body(h.node);
        let parts = m.build_cond_if(at, Guard::at(0, 0), &[h.ids[0], h.ids[1]], &[Type::Index]);
        let then_at = BlockRef {
            node: parts.node,
            region: Region::Then,
        };
        let c1 = m.build_const_index(then_at, 11);
        m.build_yield(then_at, &[c1]);
        let else_at = BlockRef {
            node: parts.node,
            region: Region::Else,
        };
        let c2 = m.build_const_index(else_at, 22);
        m.build_yield(else_at, &[c2]);
        // A use of the conditional's result.
        m.build_kernel_call(at, "use", &[parts.results[0]]);
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        specialize_conditionals(&mut m, &d);

        let body = m.block(BlockRef::body(d.cores[0])).clone();
        let calls = m.collect(&body, |k| matches!(k, NodeKind::KernelCall { .. }));
        match m.kind(calls[0]) {
            NodeKind::KernelCall { operands, .. } => {
                assert_eq!(m.const_index(operands[0]), Some(11), "then branch chosen");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unresolvable_guard_left_intact() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let at = BlockRef::body(h.node);
        // Guard over a value that never becomes constant.
        let opaque = m.build_alloc(at, l1(&[1]), None);
        let parts = m.build_cond_if(at, Guard::at(0, 0), &[opaque, h.ids[1]], &[]);
        m.build_kernel_call(
            BlockRef {
                node: parts.node,
                region: Region::Then,
            },
            "a",
            &[],
        );
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        let diags = specialize_conditionals(&mut m, &d);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::W0301));

        let body = m.block(BlockRef::body(d.cores[0])).clone();
        assert_eq!(
            m.collect(&body, |k| matches!(k, NodeKind::CondIf { .. })).len(),
            1,
            "unresolvable conditional must stay"
        );
    }

    #[test]
    fn l1_allocs_become_tile_buffers() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), Some((3, 2)), &[]);
        let at = BlockRef::body(h.node);
        let a = m.build_alloc(at, l1(&[64]), Some("acc"));
        m.build_dealloc(at, a);
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        place_l1_buffers(&mut m, &mut d);

        assert_eq!(d.buffers.len(), 1);
        assert_eq!(d.buffer(crate::id::BufferId(0)).sym, "acc_0_0");
        let body = m.block(BlockRef::body(d.cores[0])).clone();
        assert!(m
            .collect(&body, |k| matches!(k, NodeKind::Alloc { .. }))
            .is_empty());
        // The dealloc now references the buffer value.
        let deallocs = m.collect(&body, |k| matches!(k, NodeKind::Dealloc { .. }));
        match m.kind(deallocs[0]) {
            NodeKind::Dealloc { memref } => {
                assert!(d.buffer_of_value(&m, *memref).is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn non_l1_allocs_untouched() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let at = BlockRef::body(h.node);
        m.build_alloc(
            at,
            MemRefType::new(&[64], ElemType::F32, MemorySpace::L3),
            None,
        );
        m.build_herd_terminator(h.node);

        let mut d = device();
        outline_herds(&mut m, seg, &mut d, &options());
        place_l1_buffers(&mut m, &mut d);
        assert!(d.buffers.is_empty());
    }
}
