// channel.rs — Channel lowering
//
// Three rewrites over a segment and its outlined cores:
//   bundle specialization — a channel declared with bundle shape
//     (d1,...,dk) expands into K = prod(di) independent 1x1 channels,
//     each put/get rebound to the channel matching its multi-index;
//   queue lowering — each unbundled channel becomes a queue object bound
//     to its producer and consumer tiles (shim tiles for external
//     endpoints), and its puts/gets become acquire/access/release
//     sequences on the matching port;
//   pipeline handoff — a put/get pair between two resident cores becomes
//     one shared buffer on the producing tile guarded by a lock pair
//     (single-buffered, producer and consumer strictly alternate).
//
// Preconditions: outlining done; cores carry the puts/gets.
// Postconditions: no bundled declarations remain; every lowered channel's
//   declaration and ops are tombstoned; unsupported shapes are left
//   intact with a W0302 diagnostic.
// Failure modes: broadcast or multi-endpoint channels (skipped), shim
//   exhaustion (fatal E0401), non-memref handoff payloads (fatal E0300).
// Side effects: mutates the module arena and the device.

use crate::alloc::ShimTileAllocator;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::fabric::Device;
use crate::id::{NodeId, TileId};
use crate::ir::{
    BlockRef, FifoPort, LockAction, MemorySpace, Module, NodeKind, Type, ValueDef,
};

// ── Search roots ─────────────────────────────────────────────────────────

fn roots(segment: NodeId, device: &Device) -> Vec<BlockRef> {
    let mut out = vec![BlockRef::body(segment)];
    out.extend(device.cores.iter().map(|&c| BlockRef::body(c)));
    out
}

fn collect_in_roots(
    module: &Module,
    roots: &[BlockRef],
    pred: impl Fn(&NodeKind) -> bool + Copy,
) -> Vec<NodeId> {
    let mut out = Vec::new();
    for &at in roots {
        let block = module.block(at).clone();
        out.extend(module.collect(&block, pred));
    }
    out
}

fn insert_before(module: &mut Module, roots: &[BlockRef], target: NodeId, nodes: &[NodeId]) {
    if let Some((at, i)) = module.locate(roots, target) {
        let block = module.block_mut(at);
        for (k, &n) in nodes.iter().enumerate() {
            block.insert(i + k, n);
        }
    }
}

fn channel_decl(module: &Module, segment: NodeId, name: &str) -> Option<NodeId> {
    module
        .block(BlockRef::body(segment))
        .iter()
        .copied()
        .find(|&n| {
            !module.is_erased(n)
                && matches!(module.kind(n), NodeKind::ChannelDecl { name: d, .. } if d == name)
        })
}

// ── Ping-pong depth propagation ──────────────────────────────────────────

/// Loops annotated for K-deep ping-pong mark the channels used inside
/// them with a buffer-resource count of K, consumed as queue depth.
pub fn propagate_ping_pong(module: &mut Module, segment: NodeId, device: &Device) {
    let rs = roots(segment, device);
    let fors = collect_in_roots(module, &rs, |k| {
        matches!(
            k,
            NodeKind::For {
                ping_pong_depth: Some(_),
                ..
            }
        )
    });
    for f in fors {
        let (depth, body) = match module.kind(f) {
            NodeKind::For {
                ping_pong_depth: Some(d),
                body,
                ..
            } => (*d, body.clone()),
            _ => continue,
        };
        let mut channels = Vec::new();
        module.visit(&body, &mut |_, kind| match kind {
            NodeKind::ChannelPut { channel, .. } | NodeKind::ChannelGet { channel, .. } => {
                channels.push(channel.clone());
            }
            _ => {}
        });
        for ch in channels {
            if let Some(decl) = channel_decl(module, segment, &ch) {
                if let NodeKind::ChannelDecl {
                    buffer_resources, ..
                } = module.kind_mut(decl)
                {
                    *buffer_resources = Some(depth);
                }
            }
        }
        if let NodeKind::For {
            ping_pong_depth, ..
        } = module.kind_mut(f)
        {
            *ping_pong_depth = None;
        }
    }
}

// ── Bundle specialization ────────────────────────────────────────────────

/// Multi-index of `i` over `dims`, last dimension varying fastest.
fn md_index(dims: &[i64], mut i: i64) -> Vec<i64> {
    let mut pos = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        pos[d] = i % dims[d];
        i /= dims[d];
    }
    pos
}

fn fresh_channel_name(module: &Module, segment: NodeId) -> String {
    let taken: Vec<String> = module
        .block(BlockRef::body(segment))
        .iter()
        .filter_map(|&n| match module.kind(n) {
            NodeKind::ChannelDecl { name, .. } if !module.is_erased(n) => Some(name.clone()),
            _ => None,
        })
        .collect();
    let mut i = 0;
    loop {
        let candidate = format!("channel_{i}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

/// Expand every bundled channel declaration into K independent channels.
pub fn specialize_bundles(
    module: &mut Module,
    segment: NodeId,
    device: &Device,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let rs = roots(segment, device);

    let decls: Vec<NodeId> = module
        .block(BlockRef::body(segment))
        .clone()
        .into_iter()
        .filter(|&n| {
            !module.is_erased(n)
                && matches!(
                    module.kind(n),
                    NodeKind::ChannelDecl { bundle, .. }
                        if bundle.iter().product::<i64>() > 1
                )
        })
        .collect();

    for decl in decls {
        let (name, bundle) = match module.kind(decl) {
            NodeKind::ChannelDecl { name, bundle, .. } => (name.clone(), bundle.clone()),
            _ => unreachable!(),
        };
        let total: i64 = bundle.iter().product();

        let puts = collect_in_roots(module, &rs, |k| {
            matches!(k, NodeKind::ChannelPut { channel, .. } if *channel == name)
        });
        let gets = collect_in_roots(module, &rs, |k| {
            matches!(k, NodeKind::ChannelGet { channel, .. } if *channel == name)
        });

        // Every referencing op must carry constant indices; a symbolic
        // index cannot be matched to a bundle element.
        let indices_of = |module: &Module, n: NodeId| -> Option<Vec<i64>> {
            let indices = match module.kind(n) {
                NodeKind::ChannelPut { indices, .. } | NodeKind::ChannelGet { indices, .. } => {
                    indices.clone()
                }
                _ => unreachable!(),
            };
            indices.iter().map(|&v| module.const_index(v)).collect()
        };
        let all_const = puts
            .iter()
            .chain(gets.iter())
            .all(|&n| indices_of(module, n).is_some());
        if !all_const {
            diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Warning,
                    format!("channel @{name}: bundle index not constant; bundle left intact"),
                )
                .with_code(codes::W0302)
                .with_node(decl),
            );
            continue;
        }

        for iter in 0..total {
            let position = md_index(&bundle, iter);
            let new_name = fresh_channel_name(module, segment);
            let new_decl = module.add_node(NodeKind::ChannelDecl {
                name: new_name.clone(),
                bundle: vec![1],
                buffer_resources: None,
                broadcast: false,
            });
            module.append(BlockRef::body(segment), new_decl);

            for &op in puts.iter().chain(gets.iter()) {
                if indices_of(module, op).as_deref() == Some(&position[..]) {
                    match module.kind_mut(op) {
                        NodeKind::ChannelPut {
                            channel, indices, ..
                        }
                        | NodeKind::ChannelGet {
                            channel, indices, ..
                        } => {
                            *channel = new_name.clone();
                            indices.clear();
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }

        module.erase(decl);
        let keep: Vec<NodeId> = module
            .block(BlockRef::body(segment))
            .iter()
            .copied()
            .filter(|&n| !module.is_erased(n))
            .collect();
        *module.block_mut(BlockRef::body(segment)) = keep;
    }

    diagnostics
}

// ── Queue lowering ───────────────────────────────────────────────────────

enum Endpoint {
    /// Op node and the tile of the core containing it.
    Resident(NodeId, TileId),
    External(TileId),
}

/// Lower every unbundled channel to a queue object.
pub fn lower_channels(
    module: &mut Module,
    segment: NodeId,
    device: &mut Device,
    shim: &mut ShimTileAllocator,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let rs = roots(segment, device);

    let decls: Vec<NodeId> = module
        .block(BlockRef::body(segment))
        .clone()
        .into_iter()
        .filter(|&n| !module.is_erased(n) && matches!(module.kind(n), NodeKind::ChannelDecl { .. }))
        .collect();

    'decls: for decl in decls {
        let (name, bundle, depth, broadcast) = match module.kind(decl) {
            NodeKind::ChannelDecl {
                name,
                bundle,
                buffer_resources,
                broadcast,
            } => (
                name.clone(),
                bundle.clone(),
                buffer_resources.unwrap_or(1),
                *broadcast,
            ),
            _ => unreachable!(),
        };

        let skip = |diagnostics: &mut Vec<Diagnostic>, why: &str| {
            diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Warning,
                    format!("channel @{name}: {why}; left unlowered"),
                )
                .with_code(codes::W0302)
                .with_node(decl),
            );
        };

        if broadcast {
            skip(&mut diagnostics, "broadcast fan-out is unsupported");
            continue;
        }
        if bundle.iter().product::<i64>() > 1 {
            skip(&mut diagnostics, "bundle was not specialized");
            continue;
        }

        let puts = collect_in_roots(module, &rs, |k| {
            matches!(k, NodeKind::ChannelPut { channel, .. } if *channel == name)
        });
        let gets = collect_in_roots(module, &rs, |k| {
            matches!(k, NodeKind::ChannelGet { channel, .. } if *channel == name)
        });
        if puts.len() > 1 || gets.len() > 1 {
            skip(&mut diagnostics, "more than one endpoint per port");
            continue;
        }
        if puts.is_empty() && gets.is_empty() {
            skip(&mut diagnostics, "no endpoints");
            continue;
        }

        // Classify endpoints: resident (inside a core, L1) or external.
        let containing_core = |module: &Module, device: &Device, op: NodeId| -> Option<TileId> {
            for &core in &device.cores {
                if module.locate(&[BlockRef::body(core)], op).is_some() {
                    if let NodeKind::Core { tile, .. } = module.kind(core) {
                        return Some(*tile);
                    }
                }
            }
            None
        };

        let mut elem = None;
        let producer = if let Some(&put) = puts.first() {
            let src = match module.kind(put) {
                NodeKind::ChannelPut { src, .. } => *src,
                _ => unreachable!(),
            };
            if module.memory_space(src) != Some(MemorySpace::L1) {
                skip(&mut diagnostics, "put endpoint is not tile-resident L1");
                continue 'decls;
            }
            let Some(tile) = containing_core(module, device, put) else {
                skip(&mut diagnostics, "put endpoint is outside any core");
                continue 'decls;
            };
            elem = module.memref_type(src).cloned();
            Endpoint::Resident(put, tile)
        } else {
            match shim.shim_tile(device, MemorySpace::L3, MemorySpace::L1) {
                Ok(t) => Endpoint::External(t),
                Err(e) => {
                    diagnostics.push(e.into_diagnostic().with_node(decl));
                    continue 'decls;
                }
            }
        };

        let consumer = if let Some(&get) = gets.first() {
            let dst = match module.kind(get) {
                NodeKind::ChannelGet { dst, .. } => *dst,
                _ => unreachable!(),
            };
            if module.memory_space(dst) != Some(MemorySpace::L1) {
                skip(&mut diagnostics, "get endpoint is not tile-resident L1");
                continue 'decls;
            }
            let Some(tile) = containing_core(module, device, get) else {
                skip(&mut diagnostics, "get endpoint is outside any core");
                continue 'decls;
            };
            if elem.is_none() {
                elem = module.memref_type(dst).cloned();
            }
            Endpoint::Resident(get, tile)
        } else {
            match shim.shim_tile(device, MemorySpace::L1, MemorySpace::L3) {
                Ok(t) => Endpoint::External(t),
                Err(e) => {
                    diagnostics.push(e.into_diagnostic().with_node(decl));
                    continue 'decls;
                }
            }
        };

        let elem = elem.expect("at least one resident endpoint supplies the element type");
        let producer_tile = match producer {
            Endpoint::Resident(_, t) | Endpoint::External(t) => t,
        };
        let consumer_tile = match consumer {
            Endpoint::Resident(_, t) | Endpoint::External(t) => t,
        };

        let fifo = device.add_fifo(name.clone(), producer_tile, vec![consumer_tile], depth, elem);

        if let Endpoint::Resident(put, _) = producer {
            rewrite_port(module, &rs, put, fifo, FifoPort::Produce);
        }
        if let Endpoint::Resident(get, _) = consumer {
            rewrite_port(module, &rs, get, fifo, FifoPort::Consume);
        }

        module.erase(decl);
    }

    // Unlink tombstoned declarations.
    let keep: Vec<NodeId> = module
        .block(BlockRef::body(segment))
        .iter()
        .copied()
        .filter(|&n| !module.is_erased(n))
        .collect();
    *module.block_mut(BlockRef::body(segment)) = keep;

    diagnostics
}

/// Replace one put/get with acquire + access on the queue port, rebind
/// the transfer's memref to the accessed element, and turn its paired
/// deallocations into releases.
fn rewrite_port(
    module: &mut Module,
    rs: &[BlockRef],
    op: NodeId,
    fifo: crate::id::FifoId,
    port: FifoPort,
) {
    let (memref, token) = match module.kind(op) {
        NodeKind::ChannelPut { src, token, .. } => (*src, *token),
        NodeKind::ChannelGet { dst, token, .. } => (*dst, *token),
        _ => unreachable!(),
    };
    let elem_ty = module
        .memref_type(memref)
        .cloned()
        .expect("channel endpoint is memref-typed");

    // Acquire the port, then access the element behind the subview.
    let acq = module.add_node(NodeKind::HerdTerminator);
    let subview = module.new_value(Type::MemRef(elem_ty.clone()), ValueDef::Node(acq, 0));
    *module.kind_mut(acq) = NodeKind::FifoAcquire {
        fifo,
        port,
        result: subview,
    };
    let access = module.add_node(NodeKind::HerdTerminator);
    let element = module.new_value(Type::MemRef(elem_ty), ValueDef::Node(access, 0));
    *module.kind_mut(access) = NodeKind::FifoAccess {
        subview,
        result: element,
    };
    insert_before(module, rs, op, &[acq, access]);

    // Paired deallocations become releases on the same port.
    let deallocs = collect_in_roots(module, rs, |k| {
        matches!(k, NodeKind::Dealloc { memref: m, .. } if *m == memref)
    });
    for dealloc in deallocs {
        let rel = module.add_node(NodeKind::FifoRelease { fifo, port });
        insert_before(module, rs, dealloc, &[rel]);
        module.erase(dealloc);
    }

    // Rebind every remaining use of the transfer memref to the element,
    // and erase its allocation: the queue owns the storage now.
    let def = module.value(memref).def;
    module.replace_all_uses(memref, element);
    if let ValueDef::Node(alloc, _) = def {
        if matches!(module.kind(alloc), NodeKind::Alloc { .. }) {
            module.erase(alloc);
        }
    }

    if let Some(t) = token {
        module.remove_dep(t);
    }
    module.erase(op);
}

// ── Pipeline stage handoff ───────────────────────────────────────────────

/// Lower pipeline put/get pairs between resident cores to a shared
/// single buffer on the producing tile, guarded by one lock: the producer
/// acquires empty and releases full, the consumer the reverse.
pub fn lower_pipeline_handoffs(module: &mut Module, device: &mut Device) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for core in device.cores.clone() {
        let (tile, herd) = match module.kind(core) {
            NodeKind::Core { tile, herd, .. } => (*tile, *herd),
            _ => continue,
        };
        let body = module.block(BlockRef::body(core)).clone();
        let puts = module.collect(&body, |k| matches!(k, NodeKind::PipelinePut { .. }));

        'puts: for put in puts {
            let (dst_x, dst_y, operands) = match module.kind(put) {
                NodeKind::PipelinePut {
                    dst_x,
                    dst_y,
                    operands,
                } => (*dst_x, *dst_y, operands.clone()),
                _ => unreachable!(),
            };
            let (Some(x), Some(y)) = (module.const_index(dst_x), module.const_index(dst_y))
            else {
                diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        "pipeline handoff target is not constant; left unlowered",
                    )
                    .with_code(codes::W0302)
                    .with_node(put),
                );
                continue;
            };

            // Herd-relative target coordinates; the herd node is
            // tombstoned but its placement attributes remain readable.
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
            let other_tile = device.get_or_create_tile(x + col_offset, y + row_offset);
            let Some(other_core) = device.core_on(module, other_tile) else {
                diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        "pipeline handoff target tile has no core; left unlowered",
                    )
                    .with_code(codes::W0302)
                    .with_node(put),
                );
                continue;
            };
            let other_body = module.block(BlockRef::body(other_core)).clone();
            let gets = module.collect(&other_body, |k| matches!(k, NodeKind::PipelineGet { .. }));
            let Some(&get) = gets.first() else {
                diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        "pipeline handoff has no matching get; left unlowered",
                    )
                    .with_code(codes::W0302)
                    .with_node(put),
                );
                continue;
            };
            let results = match module.kind(get) {
                NodeKind::PipelineGet { results } => results.clone(),
                _ => unreachable!(),
            };

            let put_roots = [BlockRef::body(core)];
            let get_roots = [BlockRef::body(other_core)];
            for (op, res) in operands.iter().zip(results.iter()) {
                let Some(ty) = module.memref_type(*op).cloned() else {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            "pipeline handoff payload cannot be placed in device memory",
                        )
                        .with_code(codes::E0300)
                        .with_node(put),
                    );
                    continue 'puts;
                };
                let buffer = device.allocate_buffer(
                    module,
                    tile,
                    ty.with_space(MemorySpace::L1),
                    Some("pipebuf"),
                    None,
                );
                let lock = match device.allocate_lock(tile, 0, None) {
                    Ok(l) => l,
                    Err(e) => {
                        diagnostics.push(e.into_diagnostic().with_node(put));
                        continue 'puts;
                    }
                };

                // Producer side: acquire empty, store, release full.
                let acq = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 0,
                    action: LockAction::Acquire,
                });
                let store = module.add_node(NodeKind::StoreBuffer { src: *op, buffer });
                let rel = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 1,
                    action: LockAction::Release,
                });
                insert_before(module, &put_roots, put, &[acq, store, rel]);

                // Consumer side: acquire full, load, release empty.
                let acq = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 1,
                    action: LockAction::Acquire,
                });
                let load = module.add_node(NodeKind::HerdTerminator);
                let loaded = module.new_value(
                    Type::MemRef(ty.with_space(MemorySpace::L1)),
                    ValueDef::Node(load, 0),
                );
                *module.kind_mut(load) = NodeKind::LoadBuffer {
                    buffer,
                    result: loaded,
                };
                let rel = module.add_node(NodeKind::UseLock {
                    lock,
                    value: 0,
                    action: LockAction::Release,
                });
                insert_before(module, &get_roots, get, &[acq, load, rel]);
                module.replace_all_uses(*res, loaded);
            }

            module.erase(put);
            module.erase(get);
        }
    }

    diagnostics
}

// ── Tests ────────────────────────────────────────────────────────────────
