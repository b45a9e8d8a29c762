// schedule.rs — DMA schedule builder
//
// For each physical tile, groups the memory copies assigned to it by
// hardware channel and builds the tile's DMA engine program: per channel,
// a circular chain of descriptor blocks, each acquiring the transfer
// buffer's lock, moving a statically sized transfer, and releasing the
// paired lock. Channel chains are threaded into the tile's dispatch
// chain in group order. Core bodies get the matching acquire/release
// pair around each transfer's buffer use, and the lowered copies are
// erased with their tokens forwarded through joins.
//
// Preconditions: outlining, execute lowering, and buffer placement done;
//   transfer endpoints are buffer-backed memrefs.
// Postconditions: every L3<->L1 copy has a channel, a flow, and a
//   descriptor block; L2-adjacent copies are deleted; no Memcpy nodes
//   remain in lowered cores.
// Failure modes: shim pool exhaustion (E0401), non-constant transfer
//   lengths (E0402), lock exhaustion (E0403) — all fatal.
// Side effects: mutates the module arena and the device.

use std::collections::BTreeMap;

use crate::alloc::{LockTable, ShimDmaAllocator, TileDmaAllocator};
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::fabric::{Descriptor, Device, DmaChannel, DmaDir, DmaStart, LockUse};
use crate::id::{NodeId, ValueId};
use crate::ir::{BlockRef, LockAction, MemorySpace, Module, NodeKind, Type, ValueDef};

// ── Entry point ──────────────────────────────────────────────────────────

/// Build the DMA programs for every core of `device`.
pub fn build_dma_schedules(
    module: &mut Module,
    device: &mut Device,
    shim_dma: &mut ShimDmaAllocator,
) -> Vec<Diagnostic> {
    let mut ctx = ScheduleCtx {
        diagnostics: Vec::new(),
        tile_dma: TileDmaAllocator::new(device),
    };
    for core in device.cores.clone() {
        ctx.schedule_core(module, device, shim_dma, core);
    }
    ctx.diagnostics
}

// ── Internal context ─────────────────────────────────────────────────────

struct ScheduleCtx {
    diagnostics: Vec<Diagnostic>,
    tile_dma: TileDmaAllocator,
}

/// Endpoint spaces of a memory copy.
struct CopyInfo {
    id: i32,
    src: ValueId,
    dst: ValueId,
    src_space: MemorySpace,
    dst_space: MemorySpace,
}

impl ScheduleCtx {
    fn error(&mut self, code: crate::diag::DiagCode, node: NodeId, message: String) {
        self.diagnostics
            .push(Diagnostic::new(DiagLevel::Error, message).with_code(code).with_node(node));
    }

    fn copy_info(&mut self, module: &Module, op: NodeId) -> Option<CopyInfo> {
        let NodeKind::Memcpy { id, src, dst, .. } = module.kind(op) else {
            return None;
        };
        let (id, src, dst) = (*id, *src, *dst);
        let (Some(src_space), Some(dst_space)) =
            (module.memory_space(src), module.memory_space(dst))
        else {
            self.error(
                codes::E0402,
                op,
                "memory copy endpoint is not memref-typed".to_string(),
            );
            return None;
        };
        Some(CopyInfo {
            id,
            src,
            dst,
            src_space,
            dst_space,
        })
    }

    fn schedule_core(
        &mut self,
        module: &mut Module,
        device: &mut Device,
        shim_dma: &mut ShimDmaAllocator,
        core: NodeId,
    ) {
        let NodeKind::Core { tile, body, .. } = module.kind(core) else {
            return;
        };
        let tile = *tile;
        let body = body.clone();
        let t = device.tile(tile);
        let (x, y) = (t.col, t.row);

        let copies = module.collect(&body, |k| matches!(k, NodeKind::Memcpy { .. }));
        let mut groups: BTreeMap<DmaChannel, Vec<NodeId>> = BTreeMap::new();

        for op in copies {
            let Some(info) = self.copy_info(module, op) else {
                continue;
            };
            let levels = (info.src_space.level(), info.dst_space.level());

            // L2-adjacent hops are handled at a coarser granularity
            // outside this lowering; delete them from the schedule.
            let adjacent_l2 = matches!(levels, (1, 0) | (0, 1) | (2, 1) | (1, 2));
            if adjacent_l2 {
                erase_copy(module, op);
                continue;
            }
            if levels != (0, 2) && levels != (2, 0) {
                self.error(
                    codes::E0402,
                    op,
                    format!(
                        "unsupported memory hop {:?} -> {:?}",
                        info.src_space, info.dst_space
                    ),
                );
                continue;
            }

            // L1 <-> external memory: route through a shim DMA engine.
            let tile_channel =
                self.tile_dma
                    .channel_for(info.id, info.src_space, info.dst_space, x, y);
            let (shim_tile, shim_channel) = match shim_dma.get_or_create(
                device,
                info.id,
                info.src_space,
                info.dst_space,
                tile_channel.index,
                x,
                y,
            ) {
                Ok(r) => r,
                Err(e) => {
                    self.diagnostics.push(e.into_diagnostic().with_node(op));
                    continue;
                }
            };
            let shim_chans = shim_dma.shim_channel_count();
            if shim_channel.dir == DmaDir::S2MM {
                device.get_or_create_flow(
                    tile,
                    tile_channel.index,
                    shim_tile,
                    shim_channel.index % shim_chans,
                );
            } else {
                device.get_or_create_flow(
                    shim_tile,
                    shim_channel.index % shim_chans,
                    tile,
                    tile_channel.index,
                );
            }

            groups.entry(tile_channel).or_default().push(op);
        }

        // Locks guard each transfer buffer on the core side and inside
        // the descriptor program.
        let mut locks = LockTable::new();
        let counting = device.model.counting_locks();

        for (&channel, ops) in &groups {
            for &op in ops {
                let Some(info) = self.copy_info(module, op) else {
                    continue;
                };
                let endpoint = if channel.dir == DmaDir::MM2S {
                    info.src
                } else {
                    info.dst
                };
                let Some(buffer) = device.buffer_of_value(module, endpoint) else {
                    self.error(
                        codes::E0402,
                        op,
                        "transfer endpoint is not a placed buffer".to_string(),
                    );
                    continue;
                };
                let (rlock, wlock) = match locks.lock_pair(device, buffer, channel) {
                    Ok(p) => p,
                    Err(e) => {
                        self.diagnostics.push(e.into_diagnostic().with_node(op));
                        continue;
                    }
                };

                // Core side: a consumer acquires full and releases empty;
                // a producer acquires empty and releases full.
                let (acq_lock, rel_lock, acq_value, rel_value) = if channel.dir == DmaDir::S2MM {
                    (rlock, wlock, 1, if counting { 1 } else { 0 })
                } else {
                    (wlock, rlock, if counting { 1 } else { 0 }, 1)
                };
                let acq_action = if counting {
                    LockAction::AcquireGreaterEqual
                } else {
                    LockAction::Acquire
                };

                let acq = module.add_node(NodeKind::UseLock {
                    lock: acq_lock,
                    value: acq_value,
                    action: acq_action,
                });
                let rel = module.add_node(NodeKind::UseLock {
                    lock: rel_lock,
                    value: rel_value,
                    action: LockAction::Release,
                });

                // Acquire at the head of the block holding the copy.
                let roots = [BlockRef::body(core)];
                if let Some((at, _)) = module.locate(&roots, op) {
                    module.block_mut(at).insert(0, acq);
                    // Release at the paired deallocation when present,
                    // otherwise at the end of the block.
                    let block = module.block(at).clone();
                    let buffer_value = device.buffer(buffer).value;
                    let dealloc = module
                        .collect(&block, |k| {
                            matches!(k, NodeKind::Dealloc { memref } if *memref == buffer_value)
                        })
                        .into_iter()
                        .next();
                    match dealloc {
                        Some(dn) => {
                            if let Some((dat, di)) = module.locate(&roots, dn) {
                                module.block_mut(dat).insert(di, rel);
                                module.erase(dn);
                            }
                        }
                        None => module.block_mut(at).push(rel),
                    }
                }
            }
        }

        // The descriptor program: one circular chain per channel group,
        // threaded into the tile's dispatch chain.
        for (&channel, ops) in &groups {
            let mut chain: Vec<Descriptor> = Vec::new();
            for (i, &op) in ops.iter().enumerate() {
                let Some(info) = self.copy_info(module, op) else {
                    continue;
                };
                let endpoint = if channel.dir == DmaDir::MM2S {
                    info.src
                } else {
                    info.dst
                };
                let Some(buffer) = device.buffer_of_value(module, endpoint) else {
                    continue;
                };
                let (rlock, wlock) = match locks.lock_pair(device, buffer, channel) {
                    Ok(p) => p,
                    Err(e) => {
                        self.diagnostics.push(e.into_diagnostic().with_node(op));
                        continue;
                    }
                };
                // Engine side mirrors the core side: the inbound engine
                // acquires empty (write) and releases full (read).
                let (acq_lock, rel_lock, acq_value, rel_value) = if channel.dir == DmaDir::S2MM {
                    (wlock, rlock, if counting { 1 } else { 0 }, 1)
                } else {
                    (rlock, wlock, 1, if counting { 1 } else { 0 })
                };
                let acq_action = if counting {
                    LockAction::AcquireGreaterEqual
                } else {
                    LockAction::Acquire
                };

                let Some(len) = self.transfer_length(module, op, &info) else {
                    continue;
                };

                chain.push(Descriptor {
                    acquire: LockUse {
                        lock: acq_lock,
                        value: acq_value,
                        action: acq_action,
                    },
                    buffer,
                    len,
                    release: LockUse {
                        lock: rel_lock,
                        value: rel_value,
                        action: LockAction::Release,
                    },
                    next: if i + 1 == ops.len() { 0 } else { i + 1 },
                });
            }
            if chain.is_empty() {
                continue;
            }
            let prog = device.dma_program_mut(tile);
            let chain_index = prog.chains.len();
            prog.chains.push(chain);
            prog.starts.push(DmaStart {
                channel,
                chain: chain_index,
            });
        }

        // The copies are lowered; erase them and forward their tokens.
        for ops in groups.values() {
            for &op in ops {
                erase_copy(module, op);
            }
        }
    }

    /// Statically computed transfer length: the product of the constant
    /// per-dimension sizes on the side further from the tile, falling
    /// back to that side's memref shape when no sizes were given.
    fn transfer_length(&mut self, module: &Module, op: NodeId, info: &CopyInfo) -> Option<i64> {
        let NodeKind::Memcpy {
            src_sizes,
            dst_sizes,
            ..
        } = module.kind(op)
        else {
            return None;
        };
        let (sizes, side) = if info.src_space.level() > info.dst_space.level() {
            (dst_sizes.clone(), info.dst)
        } else {
            (src_sizes.clone(), info.src)
        };
        let len = if sizes.is_empty() {
            module.memref_type(side).and_then(|m| m.element_count())
        } else {
            module.const_size_product(&sizes)
        };
        if len.is_none() {
            self.error(
                codes::E0402,
                op,
                "transfer length does not resolve to a constant".to_string(),
            );
        }
        len
    }
}

/// Erase a lowered (or elided) copy, forwarding its token through a join
/// over its dependencies.
fn erase_copy(module: &mut Module, op: NodeId) {
    let NodeKind::Memcpy { deps, token, .. } = module.kind(op) else {
        return;
    };
    let deps = deps.clone();
    let token = *token;
    if let Some(t) = token {
        let join = module.add_node(NodeKind::HerdTerminator);
        let new_token = module.new_value(Type::Token, ValueDef::Node(join, 0));
        *module.kind_mut(join) = NodeKind::WaitAll {
            deps,
            token: Some(new_token),
        };
        // The join takes the copy's place in its block.
        let mut placed = false;
        for seg in module.segments.clone() {
            if let Some((at, i)) = module.locate(&[BlockRef::body(seg)], op) {
                module.block_mut(at).insert(i, join);
                placed = true;
                break;
            }
        }
        if !placed {
            // The copy lives in a core body, outside any segment.
            // Find it through the whole arena by scanning core nodes.
            for n in 0..module.node_count() {
                let id = crate::id::NodeId(n as u32);
                if module.is_erased(id) {
                    continue;
                }
                if matches!(module.kind(id), NodeKind::Core { .. }) {
                    if let Some((at, i)) = module.locate(&[BlockRef::body(id)], op) {
                        module.block_mut(at).insert(i, join);
                        break;
                    }
                }
            }
        }
        module.replace_all_uses(t, new_token);
    }
    module.erase(op);
}

// ── Tests ────────────────────────────────────────────────────────────────
