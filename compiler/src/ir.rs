// ir.rs — Arena-based program representation
//
// The module arena owns every IR node and SSA value, addressed by stable
// integer handles. Rewrites build replacement nodes and swap handle
// bindings; erased nodes become tombstones and are never reused, so no
// rewrite can invalidate another stage's handles.
//
// The abstract (input) node kinds describe hierarchical tile-dataflow
// programs: herds, channels, memory copies, async dependency tokens.
// The physical (output) node kinds appear only inside outlined core
// bodies: lock operations, queue-port operations, buffer loads/stores.
//
// Preconditions: none.
// Postconditions: handle stability — a NodeId/ValueId handed out once
//   refers to the same (possibly tombstoned) object forever.
// Failure modes: none; malformed programs surface in the lowering stages.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::id::{BufferId, FifoId, LockId, NodeId, ValueId};

// ── Types ────────────────────────────────────────────────────────────────

/// Memory hierarchy level of a memref. Levels are ordered by distance
/// from the compute tile: L3 external, L2 shared, L1 tile-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemorySpace {
    L3,
    L2,
    L1,
}

impl MemorySpace {
    /// Numeric level used for direction comparisons (L3=0, L2=1, L1=2).
    pub fn level(self) -> u32 {
        match self {
            MemorySpace::L3 => 0,
            MemorySpace::L2 => 1,
            MemorySpace::L1 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    I8,
    I32,
    F32,
    F64,
}

impl ElemType {
    pub fn byte_width(self) -> usize {
        match self {
            ElemType::I8 => 1,
            ElemType::I32 | ElemType::F32 => 4,
            ElemType::F64 => 8,
        }
    }
}

/// Shaped memory reference type, tagged with its hierarchy level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRefType {
    pub shape: Vec<i64>,
    pub elem: ElemType,
    pub space: MemorySpace,
}

impl MemRefType {
    pub fn new(shape: &[i64], elem: ElemType, space: MemorySpace) -> Self {
        Self {
            shape: shape.to_vec(),
            elem,
            space,
        }
    }

    /// Total element count; None when any dimension is dynamic (< 0).
    pub fn element_count(&self) -> Option<i64> {
        let mut n = 1i64;
        for &d in &self.shape {
            if d < 0 {
                return None;
            }
            n *= d;
        }
        Some(n)
    }

    /// Same shape and element type at a different hierarchy level.
    pub fn with_space(&self, space: MemorySpace) -> Self {
        Self {
            shape: self.shape.clone(),
            elem: self.elem,
            space,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Index,
    Token,
    MemRef(MemRefType),
}

impl Type {
    pub fn is_token(&self) -> bool {
        matches!(self, Type::Token)
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// Result `index` of a node.
    Node(NodeId, u32),
    /// Region argument `index` of a node (herd ids/sizes/kernel args,
    /// loop induction and iteration arguments).
    Arg(NodeId, u32),
    /// A physical buffer owned by a device.
    Buffer(BufferId),
}

#[derive(Debug, Clone)]
pub struct Value {
    pub ty: Type,
    pub def: ValueDef,
}

// ── Affine guards ────────────────────────────────────────────────────────

/// One constraint of an affine guard: `c0*d0 + c1*d1 + constant`,
/// compared `== 0` when `eq`, else `>= 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub coeffs: [i64; 2],
    pub constant: i64,
    pub eq: bool,
}

/// Conjunction of affine constraints over up to two dimension operands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Guard {
    pub constraints: Vec<Constraint>,
}

impl Guard {
    /// Guard selecting exactly tile (x, y).
    pub fn at(x: i64, y: i64) -> Self {
        Guard {
            constraints: vec![
                Constraint {
                    coeffs: [1, 0],
                    constant: -x,
                    eq: true,
                },
                Constraint {
                    coeffs: [0, 1],
                    constant: -y,
                    eq: true,
                },
            ],
        }
    }

    /// Evaluate with the given dimension values. None when a constraint
    /// references a dimension that is not supplied.
    pub fn eval(&self, dims: &[i64]) -> Option<bool> {
        for c in &self.constraints {
            let mut v = c.constant;
            for (i, &coef) in c.coeffs.iter().enumerate() {
                if coef != 0 {
                    v += coef * dims.get(i)?;
                }
            }
            let holds = if c.eq { v == 0 } else { v >= 0 };
            if !holds {
                return Some(false);
            }
        }
        Some(true)
    }
}

// ── Physical operation payloads ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Acquire,
    AcquireGreaterEqual,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoPort {
    Produce,
    Consume,
}

// ── Node kinds ───────────────────────────────────────────────────────────

/// Closed set of IR node kinds. Rewrites dispatch on this tag; there is
/// no dynamic downcasting anywhere in the lowering.
#[derive(Debug, Clone)]
pub enum NodeKind {
    // Structure
    Segment {
        name: String,
        body: Vec<NodeId>,
    },
    Herd {
        name: String,
        size_x: i64,
        size_y: i64,
        col_offset: Option<i64>,
        row_offset: Option<i64>,
        ids: [ValueId; 2],
        sizes: [ValueId; 2],
        kernel_args: Vec<ValueId>,
        body: Vec<NodeId>,
    },
    HerdTerminator,
    /// Outlined per-tile compute core. Created by the outliner; the body
    /// is the specialized clone of the herd body.
    Core {
        tile: crate::id::TileId,
        elf: String,
        free_running: bool,
        /// Herd this core was outlined from (placement offsets live there).
        herd: Option<NodeId>,
        body: Vec<NodeId>,
    },

    // Channels
    ChannelDecl {
        name: String,
        bundle: Vec<i64>,
        buffer_resources: Option<u32>,
        broadcast: bool,
    },
    ChannelPut {
        channel: String,
        indices: Vec<ValueId>,
        deps: Vec<ValueId>,
        src: ValueId,
        src_sizes: Vec<ValueId>,
        token: Option<ValueId>,
    },
    ChannelGet {
        channel: String,
        indices: Vec<ValueId>,
        deps: Vec<ValueId>,
        dst: ValueId,
        dst_sizes: Vec<ValueId>,
        token: Option<ValueId>,
    },

    // Memory
    Memcpy {
        id: i32,
        deps: Vec<ValueId>,
        src: ValueId,
        dst: ValueId,
        src_sizes: Vec<ValueId>,
        dst_sizes: Vec<ValueId>,
        token: Option<ValueId>,
    },
    Alloc {
        sym: Option<String>,
        result: ValueId,
    },
    Dealloc {
        memref: ValueId,
    },
    ConstantIndex {
        value: i64,
        result: ValueId,
    },

    // Async structure
    Execute {
        deps: Vec<ValueId>,
        token: ValueId,
        results: Vec<ValueId>,
        body: Vec<NodeId>,
    },
    ExecuteTerminator {
        operands: Vec<ValueId>,
    },
    WaitAll {
        deps: Vec<ValueId>,
        token: Option<ValueId>,
    },
    For {
        lower: i64,
        upper: i64,
        step: i64,
        iter_inits: Vec<ValueId>,
        induction: ValueId,
        iter_args: Vec<ValueId>,
        results: Vec<ValueId>,
        /// Ping-pong annotation: buffer depth to propagate onto channels
        /// used inside the loop.
        ping_pong_depth: Option<u32>,
        body: Vec<NodeId>,
    },
    Yield {
        operands: Vec<ValueId>,
    },
    CondIf {
        guard: Guard,
        operands: Vec<ValueId>,
        results: Vec<ValueId>,
        then_body: Vec<NodeId>,
        else_body: Vec<NodeId>,
    },

    // Pipeline stage handoff
    PipelinePut {
        dst_x: ValueId,
        dst_y: ValueId,
        operands: Vec<ValueId>,
    },
    PipelineGet {
        results: Vec<ValueId>,
    },

    // Opaque compute in core bodies
    KernelCall {
        callee: String,
        operands: Vec<ValueId>,
    },

    // Physical operations (created by the lowering stages)
    UseLock {
        lock: LockId,
        value: i64,
        action: LockAction,
    },
    FifoAcquire {
        fifo: FifoId,
        port: FifoPort,
        result: ValueId,
    },
    FifoAccess {
        subview: ValueId,
        result: ValueId,
    },
    FifoRelease {
        fifo: FifoId,
        port: FifoPort,
    },
    GetGlobal {
        sym: String,
        result: ValueId,
    },
    StoreBuffer {
        src: ValueId,
        buffer: BufferId,
    },
    LoadBuffer {
        buffer: BufferId,
        result: ValueId,
    },
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub erased: bool,
}

// ── Block references ─────────────────────────────────────────────────────

/// Which region of a node a block reference points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Body,
    Then,
    Else,
}

/// Reference to one block (node list) inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub node: NodeId,
    pub region: Region,
}

impl BlockRef {
    pub fn body(node: NodeId) -> Self {
        BlockRef {
            node,
            region: Region::Body,
        }
    }
}

// ── Builder result bundles ───────────────────────────────────────────────

pub struct HerdParts {
    pub node: NodeId,
    pub ids: [ValueId; 2],
    pub sizes: [ValueId; 2],
    pub kernel_args: Vec<ValueId>,
}

pub struct ExecuteParts {
    pub node: NodeId,
    pub token: ValueId,
    pub results: Vec<ValueId>,
}

pub struct ForParts {
    pub node: NodeId,
    pub induction: ValueId,
    pub iter_args: Vec<ValueId>,
    pub results: Vec<ValueId>,
}

pub struct IfParts {
    pub node: NodeId,
    pub results: Vec<ValueId>,
}

// ── Module arena ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Module {
    nodes: Vec<Node>,
    values: Vec<Value>,
    pub segments: Vec<NodeId>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Arena primitives ────────────────────────────────────────────

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            erased: false,
        });
        id
    }

    pub fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value { ty, def });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0 as usize].kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.nodes[id.0 as usize].kind
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.0 as usize].ty
    }

    /// Tombstone a node. The handle stays valid but walkers skip it.
    pub fn erase(&mut self, id: NodeId) {
        self.nodes[id.0 as usize].erased = true;
    }

    pub fn is_erased(&self, id: NodeId) -> bool {
        self.nodes[id.0 as usize].erased
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ── Block access ────────────────────────────────────────────────

    pub fn block(&self, at: BlockRef) -> &Vec<NodeId> {
        match (&self.nodes[at.node.0 as usize].kind, at.region) {
            (NodeKind::Segment { body, .. }, Region::Body) => body,
            (NodeKind::Herd { body, .. }, Region::Body) => body,
            (NodeKind::Core { body, .. }, Region::Body) => body,
            (NodeKind::Execute { body, .. }, Region::Body) => body,
            (NodeKind::For { body, .. }, Region::Body) => body,
            (NodeKind::CondIf { then_body, .. }, Region::Then) => then_body,
            (NodeKind::CondIf { else_body, .. }, Region::Else) => else_body,
            (k, r) => panic!("node {:?} has no {:?} region", std::mem::discriminant(k), r),
        }
    }

    pub fn block_mut(&mut self, at: BlockRef) -> &mut Vec<NodeId> {
        match (&mut self.nodes[at.node.0 as usize].kind, at.region) {
            (NodeKind::Segment { body, .. }, Region::Body) => body,
            (NodeKind::Herd { body, .. }, Region::Body) => body,
            (NodeKind::Core { body, .. }, Region::Body) => body,
            (NodeKind::Execute { body, .. }, Region::Body) => body,
            (NodeKind::For { body, .. }, Region::Body) => body,
            (NodeKind::CondIf { then_body, .. }, Region::Then) => then_body,
            (NodeKind::CondIf { else_body, .. }, Region::Else) => else_body,
            (k, r) => panic!("node {:?} has no {:?} region", std::mem::discriminant(k), r),
        }
    }

    pub fn append(&mut self, at: BlockRef, node: NodeId) {
        self.block_mut(at).push(node);
    }

    // ── Program builders (driver-facing) ────────────────────────────

    pub fn add_segment(&mut self, name: &str) -> NodeId {
        let id = self.add_node(NodeKind::Segment {
            name: name.to_string(),
            body: Vec::new(),
        });
        self.segments.push(id);
        id
    }

    pub fn add_herd(
        &mut self,
        segment: NodeId,
        name: &str,
        size: (i64, i64),
        offset: Option<(i64, i64)>,
        kernel_arg_types: &[MemRefType],
    ) -> HerdParts {
        // Placeholder kind so the node id exists before its region args.
        let node = self.add_node(NodeKind::HerdTerminator);
        let ids = [
            self.new_value(Type::Index, ValueDef::Arg(node, 0)),
            self.new_value(Type::Index, ValueDef::Arg(node, 1)),
        ];
        let sizes = [
            self.new_value(Type::Index, ValueDef::Arg(node, 2)),
            self.new_value(Type::Index, ValueDef::Arg(node, 3)),
        ];
        let kernel_args: Vec<ValueId> = kernel_arg_types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                self.new_value(
                    Type::MemRef(ty.clone()),
                    ValueDef::Arg(node, 4 + i as u32),
                )
            })
            .collect();
        self.nodes[node.0 as usize].kind = NodeKind::Herd {
            name: name.to_string(),
            size_x: size.0,
            size_y: size.1,
            col_offset: offset.map(|o| o.0),
            row_offset: offset.map(|o| o.1),
            ids,
            sizes,
            kernel_args: kernel_args.clone(),
            body: Vec::new(),
        };
        self.append(BlockRef::body(segment), node);
        HerdParts {
            node,
            ids,
            sizes,
            kernel_args,
        }
    }

    pub fn add_channel(&mut self, segment: NodeId, name: &str, bundle: &[i64]) -> NodeId {
        let node = self.add_node(NodeKind::ChannelDecl {
            name: name.to_string(),
            bundle: bundle.to_vec(),
            buffer_resources: None,
            broadcast: false,
        });
        self.append(BlockRef::body(segment), node);
        node
    }

    pub fn mark_broadcast(&mut self, channel: NodeId) {
        if let NodeKind::ChannelDecl { broadcast, .. } = self.kind_mut(channel) {
            *broadcast = true;
        }
    }

    pub fn set_buffer_resources(&mut self, channel: NodeId, depth: u32) {
        if let NodeKind::ChannelDecl {
            buffer_resources, ..
        } = self.kind_mut(channel)
        {
            *buffer_resources = Some(depth);
        }
    }

    pub fn build_const_index(&mut self, at: BlockRef, value: i64) -> ValueId {
        let node = self.add_node(NodeKind::HerdTerminator);
        let result = self.new_value(Type::Index, ValueDef::Node(node, 0));
        self.nodes[node.0 as usize].kind = NodeKind::ConstantIndex { value, result };
        self.append(at, node);
        result
    }

    pub fn build_alloc(&mut self, at: BlockRef, ty: MemRefType, sym: Option<&str>) -> ValueId {
        let node = self.add_node(NodeKind::HerdTerminator);
        let result = self.new_value(Type::MemRef(ty), ValueDef::Node(node, 0));
        self.nodes[node.0 as usize].kind = NodeKind::Alloc {
            sym: sym.map(|s| s.to_string()),
            result,
        };
        self.append(at, node);
        result
    }

    pub fn build_dealloc(&mut self, at: BlockRef, memref: ValueId) -> NodeId {
        let node = self.add_node(NodeKind::Dealloc { memref });
        self.append(at, node);
        node
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_memcpy(
        &mut self,
        at: BlockRef,
        id: i32,
        deps: &[ValueId],
        src: ValueId,
        dst: ValueId,
        src_sizes: &[ValueId],
        dst_sizes: &[ValueId],
        produce_token: bool,
    ) -> (NodeId, Option<ValueId>) {
        let node = self.add_node(NodeKind::HerdTerminator);
        let token = produce_token.then(|| self.new_value(Type::Token, ValueDef::Node(node, 0)));
        self.nodes[node.0 as usize].kind = NodeKind::Memcpy {
            id,
            deps: deps.to_vec(),
            src,
            dst,
            src_sizes: src_sizes.to_vec(),
            dst_sizes: dst_sizes.to_vec(),
            token,
        };
        self.append(at, node);
        (node, token)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_channel_put(
        &mut self,
        at: BlockRef,
        channel: &str,
        indices: &[ValueId],
        deps: &[ValueId],
        src: ValueId,
        src_sizes: &[ValueId],
        produce_token: bool,
    ) -> (NodeId, Option<ValueId>) {
        let node = self.add_node(NodeKind::HerdTerminator);
        let token = produce_token.then(|| self.new_value(Type::Token, ValueDef::Node(node, 0)));
        self.nodes[node.0 as usize].kind = NodeKind::ChannelPut {
            channel: channel.to_string(),
            indices: indices.to_vec(),
            deps: deps.to_vec(),
            src,
            src_sizes: src_sizes.to_vec(),
            token,
        };
        self.append(at, node);
        (node, token)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_channel_get(
        &mut self,
        at: BlockRef,
        channel: &str,
        indices: &[ValueId],
        deps: &[ValueId],
        dst: ValueId,
        dst_sizes: &[ValueId],
        produce_token: bool,
    ) -> (NodeId, Option<ValueId>) {
        let node = self.add_node(NodeKind::HerdTerminator);
        let token = produce_token.then(|| self.new_value(Type::Token, ValueDef::Node(node, 0)));
        self.nodes[node.0 as usize].kind = NodeKind::ChannelGet {
            channel: channel.to_string(),
            indices: indices.to_vec(),
            deps: deps.to_vec(),
            dst,
            dst_sizes: dst_sizes.to_vec(),
            token,
        };
        self.append(at, node);
        (node, token)
    }

    pub fn build_wait_all(
        &mut self,
        at: BlockRef,
        deps: &[ValueId],
        produce_token: bool,
    ) -> (NodeId, Option<ValueId>) {
        let node = self.add_node(NodeKind::HerdTerminator);
        let token = produce_token.then(|| self.new_value(Type::Token, ValueDef::Node(node, 0)));
        self.nodes[node.0 as usize].kind = NodeKind::WaitAll {
            deps: deps.to_vec(),
            token,
        };
        self.append(at, node);
        (node, token)
    }

    pub fn build_execute(
        &mut self,
        at: BlockRef,
        deps: &[ValueId],
        result_types: &[Type],
    ) -> ExecuteParts {
        let node = self.add_node(NodeKind::HerdTerminator);
        let token = self.new_value(Type::Token, ValueDef::Node(node, 0));
        let results: Vec<ValueId> = result_types
            .iter()
            .enumerate()
            .map(|(i, ty)| self.new_value(ty.clone(), ValueDef::Node(node, 1 + i as u32)))
            .collect();
        self.nodes[node.0 as usize].kind = NodeKind::Execute {
            deps: deps.to_vec(),
            token,
            results: results.clone(),
            body: Vec::new(),
        };
        self.append(at, node);
        ExecuteParts {
            node,
            token,
            results,
        }
    }

    pub fn build_execute_yield(&mut self, execute: NodeId, operands: &[ValueId]) -> NodeId {
        let node = self.add_node(NodeKind::ExecuteTerminator {
            operands: operands.to_vec(),
        });
        self.append(BlockRef::body(execute), node);
        node
    }

    pub fn build_for(
        &mut self,
        at: BlockRef,
        lower: i64,
        upper: i64,
        step: i64,
        iter_inits: &[ValueId],
    ) -> ForParts {
        let node = self.add_node(NodeKind::HerdTerminator);
        let induction = self.new_value(Type::Index, ValueDef::Arg(node, 0));
        let iter_args: Vec<ValueId> = iter_inits
            .iter()
            .enumerate()
            .map(|(i, &init)| {
                let ty = self.value_type(init).clone();
                self.new_value(ty, ValueDef::Arg(node, 1 + i as u32))
            })
            .collect();
        let results: Vec<ValueId> = iter_inits
            .iter()
            .enumerate()
            .map(|(i, &init)| {
                let ty = self.value_type(init).clone();
                self.new_value(ty, ValueDef::Node(node, i as u32))
            })
            .collect();
        self.nodes[node.0 as usize].kind = NodeKind::For {
            lower,
            upper,
            step,
            iter_inits: iter_inits.to_vec(),
            induction,
            iter_args: iter_args.clone(),
            results: results.clone(),
            ping_pong_depth: None,
            body: Vec::new(),
        };
        self.append(at, node);
        ForParts {
            node,
            induction,
            iter_args,
            results,
        }
    }

    pub fn build_yield(&mut self, at: BlockRef, operands: &[ValueId]) -> NodeId {
        let node = self.add_node(NodeKind::Yield {
            operands: operands.to_vec(),
        });
        self.append(at, node);
        node
    }

    pub fn build_cond_if(
        &mut self,
        at: BlockRef,
        guard: Guard,
        operands: &[ValueId],
        result_types: &[Type],
    ) -> IfParts {
        let node = self.add_node(NodeKind::HerdTerminator);
        let results: Vec<ValueId> = result_types
            .iter()
            .enumerate()
            .map(|(i, ty)| self.new_value(ty.clone(), ValueDef::Node(node, i as u32)))
            .collect();
        self.nodes[node.0 as usize].kind = NodeKind::CondIf {
            guard,
            operands: operands.to_vec(),
            results: results.clone(),
            then_body: Vec::new(),
            else_body: Vec::new(),
        };
        self.append(at, node);
        IfParts { node, results }
    }

    pub fn build_pipeline_put(
        &mut self,
        at: BlockRef,
        dst_x: ValueId,
        dst_y: ValueId,
        operands: &[ValueId],
    ) -> NodeId {
        let node = self.add_node(NodeKind::PipelinePut {
            dst_x,
            dst_y,
            operands: operands.to_vec(),
        });
        self.append(at, node);
        node
    }

    pub fn build_pipeline_get(&mut self, at: BlockRef, result_types: &[Type]) -> (NodeId, Vec<ValueId>) {
        let node = self.add_node(NodeKind::HerdTerminator);
        let results: Vec<ValueId> = result_types
            .iter()
            .enumerate()
            .map(|(i, ty)| self.new_value(ty.clone(), ValueDef::Node(node, i as u32)))
            .collect();
        self.nodes[node.0 as usize].kind = NodeKind::PipelineGet {
            results: results.clone(),
        };
        self.append(at, node);
        (node, results)
    }

    pub fn build_kernel_call(&mut self, at: BlockRef, callee: &str, operands: &[ValueId]) -> NodeId {
        let node = self.add_node(NodeKind::KernelCall {
            callee: callee.to_string(),
            operands: operands.to_vec(),
        });
        self.append(at, node);
        node
    }

    pub fn build_herd_terminator(&mut self, herd: NodeId) -> NodeId {
        let node = self.add_node(NodeKind::HerdTerminator);
        self.append(BlockRef::body(herd), node);
        node
    }

    // ── Constant queries ────────────────────────────────────────────

    /// Constant value of an index-typed SSA value, if its defining node
    /// is a constant.
    pub fn const_index(&self, v: ValueId) -> Option<i64> {
        match self.value(v).def {
            ValueDef::Node(n, 0) => match self.kind(n) {
                NodeKind::ConstantIndex { value, .. } => Some(*value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Product of constant sizes; None when any entry is non-constant.
    pub fn const_size_product(&self, sizes: &[ValueId]) -> Option<i64> {
        let mut n = 1i64;
        for &s in sizes {
            n *= self.const_index(s)?;
        }
        Some(n)
    }

    pub fn memref_type(&self, v: ValueId) -> Option<&MemRefType> {
        self.value_type(v).as_memref()
    }

    pub fn memory_space(&self, v: ValueId) -> Option<MemorySpace> {
        self.memref_type(v).map(|m| m.space)
    }

    // ── Use replacement and traversal ───────────────────────────────

    /// Apply `f` to every operand slot of a node kind. Results and
    /// region arguments are definitions, not uses, and are not visited.
    pub fn for_each_operand_mut(kind: &mut NodeKind, mut f: impl FnMut(&mut ValueId)) {
        let vec = |vs: &mut Vec<ValueId>, f: &mut dyn FnMut(&mut ValueId)| {
            for v in vs {
                f(v);
            }
        };
        let f = &mut f as &mut dyn FnMut(&mut ValueId);
        match kind {
            NodeKind::Segment { .. }
            | NodeKind::Herd { .. }
            | NodeKind::HerdTerminator
            | NodeKind::Core { .. }
            | NodeKind::ChannelDecl { .. }
            | NodeKind::ConstantIndex { .. }
            | NodeKind::Alloc { .. }
            | NodeKind::UseLock { .. }
            | NodeKind::FifoRelease { .. }
            | NodeKind::GetGlobal { .. }
            | NodeKind::LoadBuffer { .. }
            | NodeKind::PipelineGet { .. }
            | NodeKind::FifoAcquire { .. } => {}
            NodeKind::ChannelPut {
                indices,
                deps,
                src,
                src_sizes,
                ..
            } => {
                vec(indices, f);
                vec(deps, f);
                f(src);
                vec(src_sizes, f);
            }
            NodeKind::ChannelGet {
                indices,
                deps,
                dst,
                dst_sizes,
                ..
            } => {
                vec(indices, f);
                vec(deps, f);
                f(dst);
                vec(dst_sizes, f);
            }
            NodeKind::Memcpy {
                deps,
                src,
                dst,
                src_sizes,
                dst_sizes,
                ..
            } => {
                vec(deps, f);
                f(src);
                f(dst);
                vec(src_sizes, f);
                vec(dst_sizes, f);
            }
            NodeKind::Dealloc { memref } => f(memref),
            NodeKind::Execute { deps, .. } => vec(deps, f),
            NodeKind::ExecuteTerminator { operands } => vec(operands, f),
            NodeKind::WaitAll { deps, .. } => vec(deps, f),
            NodeKind::For { iter_inits, .. } => vec(iter_inits, f),
            NodeKind::Yield { operands } => vec(operands, f),
            NodeKind::CondIf { operands, .. } => vec(operands, f),
            NodeKind::PipelinePut {
                dst_x,
                dst_y,
                operands,
            } => {
                f(dst_x);
                f(dst_y);
                vec(operands, f);
            }
            NodeKind::KernelCall { operands, .. } => vec(operands, f),
            NodeKind::FifoAccess { subview, .. } => f(subview),
            NodeKind::StoreBuffer { src, .. } => f(src),
        }
    }

    /// Rewrite every use of `old` to `new` across the whole arena.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for node in &mut self.nodes {
            if node.erased {
                continue;
            }
            Self::for_each_operand_mut(&mut node.kind, |v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }

    /// Remove a token from every dependency list in the arena.
    pub fn remove_dep(&mut self, token: ValueId) {
        for node in &mut self.nodes {
            if node.erased {
                continue;
            }
            match &mut node.kind {
                NodeKind::ChannelPut { deps, .. }
                | NodeKind::ChannelGet { deps, .. }
                | NodeKind::Memcpy { deps, .. }
                | NodeKind::Execute { deps, .. }
                | NodeKind::WaitAll { deps, .. } => deps.retain(|&d| d != token),
                _ => {}
            }
        }
    }

    /// Child blocks of a node kind, in declaration order.
    pub fn child_regions(kind: &NodeKind) -> Vec<&Vec<NodeId>> {
        match kind {
            NodeKind::Segment { body, .. }
            | NodeKind::Herd { body, .. }
            | NodeKind::Core { body, .. }
            | NodeKind::Execute { body, .. }
            | NodeKind::For { body, .. } => vec![body],
            NodeKind::CondIf {
                then_body,
                else_body,
                ..
            } => vec![then_body, else_body],
            _ => Vec::new(),
        }
    }

    /// Child blocks of a node as addressable references.
    pub fn child_block_refs(&self, id: NodeId) -> Vec<BlockRef> {
        match self.kind(id) {
            NodeKind::Segment { .. }
            | NodeKind::Herd { .. }
            | NodeKind::Core { .. }
            | NodeKind::Execute { .. }
            | NodeKind::For { .. } => vec![BlockRef::body(id)],
            NodeKind::CondIf { .. } => vec![
                BlockRef {
                    node: id,
                    region: Region::Then,
                },
                BlockRef {
                    node: id,
                    region: Region::Else,
                },
            ],
            _ => Vec::new(),
        }
    }

    /// Find the block and index holding `target`, searching the given
    /// roots and every nested region beneath them.
    pub fn locate(&self, roots: &[BlockRef], target: NodeId) -> Option<(BlockRef, usize)> {
        for &at in roots {
            if let Some(hit) = self.locate_in(at, target) {
                return Some(hit);
            }
        }
        None
    }

    fn locate_in(&self, at: BlockRef, target: NodeId) -> Option<(BlockRef, usize)> {
        let block = self.block(at);
        for (i, &id) in block.iter().enumerate() {
            if id == target {
                return Some((at, i));
            }
            if self.is_erased(id) {
                continue;
            }
            for child in self.child_block_refs(id) {
                if let Some(hit) = self.locate_in(child, target) {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Tombstone a node and everything inside its regions.
    pub fn erase_tree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = Self::child_regions(self.kind(id))
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for c in children {
            self.erase_tree(c);
        }
        self.erase(id);
    }

    /// Depth-first visit of every non-erased node in a block, including
    /// nested regions.
    pub fn visit(&self, block: &[NodeId], f: &mut impl FnMut(NodeId, &NodeKind)) {
        for &id in block {
            if self.is_erased(id) {
                continue;
            }
            let kind = self.kind(id);
            f(id, kind);
            for region in Self::child_regions(kind) {
                self.visit(region, f);
            }
        }
    }

    /// Collect nodes matching a predicate, in encounter order.
    pub fn collect(&self, block: &[NodeId], pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.visit(block, &mut |id, kind| {
            if pred(kind) {
                out.push(id);
            }
        });
        out
    }

    // ── Cloning ─────────────────────────────────────────────────────

    /// Deep-clone a block. Operands are remapped through `remap`
    /// (falling back to the original value for out-of-block references);
    /// every definition gets a fresh value recorded into `remap`.
    pub fn clone_block(
        &mut self,
        block: &[NodeId],
        remap: &mut HashMap<ValueId, ValueId>,
    ) -> Vec<NodeId> {
        let block = block.to_vec();
        let mut out = Vec::with_capacity(block.len());
        for id in block {
            if self.is_erased(id) {
                continue;
            }
            out.push(self.clone_node(id, remap));
        }
        out
    }

    fn clone_value(&mut self, v: ValueId, node: NodeId, remap: &mut HashMap<ValueId, ValueId>) -> ValueId {
        let ty = self.value_type(v).clone();
        let def = match self.value(v).def {
            ValueDef::Node(_, i) => ValueDef::Node(node, i),
            ValueDef::Arg(_, i) => ValueDef::Arg(node, i),
            ValueDef::Buffer(b) => ValueDef::Buffer(b),
        };
        let nv = self.new_value(ty, def);
        remap.insert(v, nv);
        nv
    }

    fn clone_node(&mut self, id: NodeId, remap: &mut HashMap<ValueId, ValueId>) -> NodeId {
        let new_id = self.add_node(NodeKind::HerdTerminator);
        let mut kind = self.kind(id).clone();

        // Clone child regions first so nested definitions are in `remap`
        // before operand rewriting touches sibling uses.
        match &mut kind {
            NodeKind::Segment { body, .. }
            | NodeKind::Herd { body, .. }
            | NodeKind::Core { body, .. } => {
                let b = body.clone();
                *body = self.clone_block(&b, remap);
            }
            NodeKind::Execute {
                body,
                token,
                results,
                ..
            } => {
                *token = self.clone_value(*token, new_id, remap);
                let rs = results.clone();
                *results = rs
                    .into_iter()
                    .map(|r| self.clone_value(r, new_id, remap))
                    .collect();
                let b = body.clone();
                *body = self.clone_block(&b, remap);
            }
            NodeKind::For {
                body,
                induction,
                iter_args,
                results,
                ..
            } => {
                *induction = self.clone_value(*induction, new_id, remap);
                let ia = iter_args.clone();
                *iter_args = ia
                    .into_iter()
                    .map(|a| self.clone_value(a, new_id, remap))
                    .collect();
                let rs = results.clone();
                *results = rs
                    .into_iter()
                    .map(|r| self.clone_value(r, new_id, remap))
                    .collect();
                let b = body.clone();
                *body = self.clone_block(&b, remap);
            }
            NodeKind::CondIf {
                then_body,
                else_body,
                results,
                ..
            } => {
                let rs = results.clone();
                *results = rs
                    .into_iter()
                    .map(|r| self.clone_value(r, new_id, remap))
                    .collect();
                let t = then_body.clone();
                *then_body = self.clone_block(&t, remap);
                let e = else_body.clone();
                *else_body = self.clone_block(&e, remap);
            }
            NodeKind::ConstantIndex { result, .. }
            | NodeKind::Alloc { result, .. }
            | NodeKind::GetGlobal { result, .. }
            | NodeKind::LoadBuffer { result, .. }
            | NodeKind::FifoAcquire { result, .. } => {
                *result = self.clone_value(*result, new_id, remap);
            }
            NodeKind::FifoAccess { result, .. } => {
                *result = self.clone_value(*result, new_id, remap);
            }
            NodeKind::ChannelPut { token, .. }
            | NodeKind::ChannelGet { token, .. }
            | NodeKind::Memcpy { token, .. }
            | NodeKind::WaitAll { token, .. } => {
                if let Some(t) = token {
                    *t = self.clone_value(*t, new_id, remap);
                }
            }
            NodeKind::PipelineGet { results } => {
                let rs = results.clone();
                *results = rs
                    .into_iter()
                    .map(|r| self.clone_value(r, new_id, remap))
                    .collect();
            }
            _ => {}
        }

        Self::for_each_operand_mut(&mut kind, |v| {
            if let Some(&nv) = remap.get(v) {
                *v = nv;
            }
        });

        self.nodes[new_id.0 as usize].kind = kind;
        new_id
    }
}

// ── Display ──────────────────────────────────────────────────────────────

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &seg in &self.segments {
            if self.is_erased(seg) {
                continue;
            }
            if let NodeKind::Segment { name, body } = self.kind(seg) {
                writeln!(f, "segment @{} {{", name)?;
                self.fmt_block(f, body, 1)?;
                writeln!(f, "}}")?;
            }
        }
        Ok(())
    }
}

impl Module {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: &[NodeId], depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for &id in block {
            if self.is_erased(id) {
                continue;
            }
            match self.kind(id) {
                NodeKind::Herd {
                    name,
                    size_x,
                    size_y,
                    body,
                    ..
                } => {
                    writeln!(f, "{pad}herd @{} [{}, {}] {{", name, size_x, size_y)?;
                    self.fmt_block(f, body, depth + 1)?;
                    writeln!(f, "{pad}}}")?;
                }
                NodeKind::Core {
                    elf,
                    free_running,
                    body,
                    ..
                } => {
                    let fr = if *free_running { " free_running" } else { "" };
                    writeln!(f, "{pad}core \"{}\"{} {{", elf, fr)?;
                    self.fmt_block(f, body, depth + 1)?;
                    writeln!(f, "{pad}}}")?;
                }
                NodeKind::ChannelDecl { name, bundle, .. } => {
                    writeln!(f, "{pad}channel @{} {:?}", name, bundle)?;
                }
                NodeKind::ChannelPut { channel, src, .. } => {
                    writeln!(f, "{pad}channel.put @{} {}", channel, src)?;
                }
                NodeKind::ChannelGet { channel, dst, .. } => {
                    writeln!(f, "{pad}channel.get @{} {}", channel, dst)?;
                }
                NodeKind::Memcpy { id: tid, src, dst, .. } => {
                    writeln!(f, "{pad}memcpy id={} {} -> {}", tid, src, dst)?;
                }
                NodeKind::ConstantIndex { value, result } => {
                    writeln!(f, "{pad}{} = const {}", result, value)?;
                }
                NodeKind::Alloc { result, .. } => {
                    writeln!(f, "{pad}{} = alloc", result)?;
                }
                NodeKind::Dealloc { memref } => writeln!(f, "{pad}dealloc {}", memref)?,
                NodeKind::Execute { body, token, .. } => {
                    writeln!(f, "{pad}{} = execute {{", token)?;
                    self.fmt_block(f, body, depth + 1)?;
                    writeln!(f, "{pad}}}")?;
                }
                NodeKind::ExecuteTerminator { .. } => writeln!(f, "{pad}execute.yield")?,
                NodeKind::WaitAll { deps, .. } => writeln!(f, "{pad}wait_all ({})", deps.len())?,
                NodeKind::For {
                    lower,
                    upper,
                    step,
                    body,
                    ..
                } => {
                    writeln!(f, "{pad}for {}..{} step {} {{", lower, upper, step)?;
                    self.fmt_block(f, body, depth + 1)?;
                    writeln!(f, "{pad}}}")?;
                }
                NodeKind::Yield { .. } => writeln!(f, "{pad}yield")?,
                NodeKind::CondIf {
                    then_body,
                    else_body,
                    ..
                } => {
                    writeln!(f, "{pad}if {{")?;
                    self.fmt_block(f, then_body, depth + 1)?;
                    if !else_body.is_empty() {
                        writeln!(f, "{pad}}} else {{")?;
                        self.fmt_block(f, else_body, depth + 1)?;
                    }
                    writeln!(f, "{pad}}}")?;
                }
                NodeKind::UseLock {
                    lock,
                    value,
                    action,
                } => {
                    let a = match action {
                        LockAction::Acquire => "acquire",
                        LockAction::AcquireGreaterEqual => "acquire_ge",
                        LockAction::Release => "release",
                    };
                    writeln!(f, "{pad}use_lock l{} {} {}", lock.0, a, value)?;
                }
                NodeKind::FifoAcquire { fifo, port, result } => {
                    let p = match port {
                        FifoPort::Produce => "produce",
                        FifoPort::Consume => "consume",
                    };
                    writeln!(f, "{pad}{} = fifo.acquire q{} {}", result, fifo.0, p)?;
                }
                NodeKind::FifoAccess { subview, result } => {
                    writeln!(f, "{pad}{} = fifo.access {}", result, subview)?;
                }
                NodeKind::FifoRelease { fifo, port } => {
                    let p = match port {
                        FifoPort::Produce => "produce",
                        FifoPort::Consume => "consume",
                    };
                    writeln!(f, "{pad}fifo.release q{} {}", fifo.0, p)?;
                }
                NodeKind::GetGlobal { sym, result } => {
                    writeln!(f, "{pad}{} = get_global @{}", result, sym)?;
                }
                NodeKind::StoreBuffer { src, buffer } => {
                    writeln!(f, "{pad}store {} -> b{}", src, buffer.0)?;
                }
                NodeKind::LoadBuffer { buffer, result } => {
                    writeln!(f, "{pad}{} = load b{}", result, buffer.0)?;
                }
                NodeKind::PipelinePut { .. } => writeln!(f, "{pad}pipeline.put")?,
                NodeKind::PipelineGet { .. } => writeln!(f, "{pad}pipeline.get")?,
                NodeKind::KernelCall { callee, .. } => {
                    writeln!(f, "{pad}call @{}", callee)?;
                }
                NodeKind::HerdTerminator => writeln!(f, "{pad}herd.terminator")?,
                NodeKind::Segment { .. } => {}
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn l1(shape: &[i64]) -> MemRefType {
        MemRefType::new(shape, ElemType::F32, MemorySpace::L1)
    }

    #[test]
    fn memory_space_ordering() {
        assert!(MemorySpace::L3.level() < MemorySpace::L2.level());
        assert!(MemorySpace::L2.level() < MemorySpace::L1.level());
    }

    #[test]
    fn herd_builder_binds_region_args() {
        let mut m = Module::new();
        let seg = m.add_segment("seg0");
        let h = m.add_herd(seg, "h", (2, 3), Some((7, 2)), &[l1(&[16])]);
        match m.kind(h.node) {
            NodeKind::Herd {
                size_x,
                size_y,
                col_offset,
                row_offset,
                kernel_args,
                ..
            } => {
                assert_eq!((*size_x, *size_y), (2, 3));
                assert_eq!((*col_offset, *row_offset), (Some(7), Some(2)));
                assert_eq!(kernel_args.len(), 1);
            }
            _ => panic!("expected herd"),
        }
        assert!(matches!(m.value(h.ids[0]).def, ValueDef::Arg(n, 0) if n == h.node));
        assert_eq!(m.value_type(h.kernel_args[0]).as_memref().unwrap(), &l1(&[16]));
    }

    #[test]
    fn const_index_query() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let v = m.build_const_index(BlockRef::body(seg), 42);
        assert_eq!(m.const_index(v), Some(42));
        let a = m.build_alloc(BlockRef::body(seg), l1(&[4]), None);
        assert_eq!(m.const_index(a), None);
    }

    #[test]
    fn const_size_product() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let at = BlockRef::body(seg);
        let a = m.build_const_index(at, 4);
        let b = m.build_const_index(at, 8);
        assert_eq!(m.const_size_product(&[a, b]), Some(32));
        let alloc = m.build_alloc(at, l1(&[4]), None);
        assert_eq!(m.const_size_product(&[a, alloc]), None);
    }

    #[test]
    fn replace_all_uses_rewrites_operands() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let at = BlockRef::body(seg);
        let a = m.build_alloc(at, l1(&[4]), None);
        let b = m.build_alloc(at, l1(&[4]), None);
        let d = m.build_dealloc(at, a);
        m.replace_all_uses(a, b);
        match m.kind(d) {
            NodeKind::Dealloc { memref } => assert_eq!(*memref, b),
            _ => unreachable!(),
        }
    }

    #[test]
    fn erased_nodes_skipped_by_walkers() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let at = BlockRef::body(seg);
        let _ = m.build_const_index(at, 1);
        let v = m.build_const_index(at, 2);
        if let ValueDef::Node(n, _) = m.value(v).def {
            m.erase(n);
        }
        let body = m.block(at).clone();
        let consts = m.collect(&body, |k| matches!(k, NodeKind::ConstantIndex { .. }));
        assert_eq!(consts.len(), 1);
    }

    #[test]
    fn clone_block_remaps_operands_and_defs() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let at = BlockRef::body(h.node);
        let c = m.build_const_index(at, 9);
        let a = m.build_alloc(at, l1(&[4]), None);
        let (_, _) = m.build_memcpy(at, 1, &[], a, a, &[c], &[c], false);

        let mut remap = HashMap::new();
        let body = m.block(at).clone();
        let cloned = m.clone_block(&body, &mut remap);
        assert_eq!(cloned.len(), 3);
        // The cloned memcpy must reference the cloned alloc, not the original.
        match m.kind(cloned[2]) {
            NodeKind::Memcpy { src, src_sizes, .. } => {
                assert_eq!(*src, remap[&a]);
                assert_eq!(src_sizes[0], remap[&c]);
                assert_ne!(*src, a);
            }
            _ => panic!("expected memcpy"),
        }
    }

    #[test]
    fn clone_preserves_out_of_block_references() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let at = BlockRef::body(seg);
        let outer = m.build_const_index(at, 3);
        let h = m.add_herd(seg, "h", (1, 1), None, &[]);
        let hat = BlockRef::body(h.node);
        let a = m.build_alloc(hat, l1(&[4]), None);
        m.build_memcpy(hat, 1, &[], a, a, &[outer], &[outer], false);

        let mut remap = HashMap::new();
        let body = m.block(hat).clone();
        let cloned = m.clone_block(&body, &mut remap);
        match m.kind(cloned[1]) {
            NodeKind::Memcpy { src_sizes, .. } => assert_eq!(src_sizes[0], outer),
            _ => panic!("expected memcpy"),
        }
    }

    #[test]
    fn guard_eval() {
        let g = Guard::at(1, 2);
        assert_eq!(g.eval(&[1, 2]), Some(true));
        assert_eq!(g.eval(&[0, 2]), Some(false));
        assert_eq!(g.eval(&[1]), None);
        assert_eq!(Guard::default().eval(&[]), Some(true));
    }

    #[test]
    fn guard_inequality() {
        // d0 - 1 >= 0, i.e. x >= 1
        let g = Guard {
            constraints: vec![Constraint {
                coeffs: [1, 0],
                constant: -1,
                eq: false,
            }],
        };
        assert_eq!(g.eval(&[0, 0]), Some(false));
        assert_eq!(g.eval(&[1, 0]), Some(true));
        assert_eq!(g.eval(&[5, 0]), Some(true));
    }

    #[test]
    fn remove_dep_filters_all_lists() {
        let mut m = Module::new();
        let seg = m.add_segment("s");
        let at = BlockRef::body(seg);
        let (_, t) = m.build_wait_all(at, &[], true);
        let t = t.unwrap();
        let (w2, _) = m.build_wait_all(at, &[t], false);
        m.remove_dep(t);
        match m.kind(w2) {
            NodeKind::WaitAll { deps, .. } => assert!(deps.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn display_smoke() {
        let mut m = Module::new();
        let seg = m.add_segment("s0");
        let h = m.add_herd(seg, "h0", (2, 2), None, &[]);
        m.build_herd_terminator(h.node);
        let text = format!("{m}");
        assert!(text.contains("segment @s0"));
        assert!(text.contains("herd @h0 [2, 2]"));
    }
}
