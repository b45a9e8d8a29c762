// fabric.rs — Physical fabric model
//
// One `Device` per segment: the addressable hardware objects the lowering
// creates (tiles, compute cores, locks, buffers, queue objects, routed
// flows, DMA programs) plus get-or-create lookups keyed by coordinate.
// The device owns every next-id counter, so two lowering runs over the
// same input produce identical object numbering.
//
// Preconditions: a valid target model.
// Postconditions: tiles are unique per (col, row); locks unique per
//   (tile, lock id); flows unique per endpoint pair.
// Failure modes: lock id space exhaustion (AllocError::LocksExhausted).
// Side effects: none.

use std::fmt;

use crate::alloc::AllocError;
use crate::id::{BufferId, FifoId, LockId, NodeId, TileId, ValueId};
use crate::ir::{MemRefType, Module, NodeKind, Type, ValueDef};
use crate::target::TargetModel;

// ── Hardware objects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub col: i64,
    pub row: i64,
}

#[derive(Debug, Clone)]
pub struct Lock {
    pub tile: TileId,
    pub lock_id: u32,
    pub init: i64,
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub tile: TileId,
    pub sym: String,
    pub ty: MemRefType,
    /// Memref value through which core code references this buffer.
    pub value: ValueId,
}

/// Lowered hardware representation of a channel.
#[derive(Debug, Clone)]
pub struct ObjectFifo {
    pub name: String,
    pub producer: TileId,
    pub consumers: Vec<TileId>,
    pub depth: u32,
    pub elem: MemRefType,
}

/// A routed data flow between two DMA endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub src: TileId,
    pub src_channel: u32,
    pub dst: TileId,
    pub dst_channel: u32,
}

/// Tile-scoped global storage cell backing a herd kernel argument.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub sym: String,
    pub ty: MemRefType,
}

// ── DMA programs ─────────────────────────────────────────────────────────

/// Transfer direction of a DMA channel. Outbound (`MM2S`) pushes from the
/// owning tile's memory onto the stream; inbound (`S2MM`) pulls from the
/// stream into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DmaDir {
    MM2S,
    S2MM,
}

impl fmt::Display for DmaDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaDir::MM2S => write!(f, "MM2S"),
            DmaDir::S2MM => write!(f, "S2MM"),
        }
    }
}

/// A (direction, index) DMA channel assignment on some tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaChannel {
    pub dir: DmaDir,
    pub index: u32,
}

/// One lock operation embedded in a descriptor block.
#[derive(Debug, Clone, Copy)]
pub struct LockUse {
    pub lock: LockId,
    pub value: i64,
    pub action: crate::ir::LockAction,
}

/// One descriptor block: acquire, transfer, release, branch to next.
/// `next` indexes into the owning chain; the last block wraps to 0.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub acquire: LockUse,
    pub buffer: BufferId,
    pub len: i64,
    pub release: LockUse,
    pub next: usize,
}

/// Channel-start entry in a tile's dispatch chain.
#[derive(Debug, Clone, Copy)]
pub struct DmaStart {
    pub channel: DmaChannel,
    /// Index of the descriptor chain this channel executes.
    pub chain: usize,
}

/// The DMA engine program of one tile: a dispatch chain of channel
/// starts, each pointing at a circular descriptor chain.
#[derive(Debug, Clone)]
pub struct DmaProgram {
    pub tile: TileId,
    pub starts: Vec<DmaStart>,
    pub chains: Vec<Vec<Descriptor>>,
}

// ── Device ───────────────────────────────────────────────────────────────

/// The physical device instance a segment lowers onto.
#[derive(Debug)]
pub struct Device {
    pub name: String,
    pub model: &'static TargetModel,
    pub tiles: Vec<Tile>,
    /// `NodeKind::Core` nodes, one per compute tile with a body.
    pub cores: Vec<NodeId>,
    pub locks: Vec<Lock>,
    pub buffers: Vec<Buffer>,
    pub fifos: Vec<ObjectFifo>,
    pub flows: Vec<Flow>,
    pub dma_programs: Vec<DmaProgram>,
    pub globals: Vec<GlobalDef>,
    /// External kernel symbols referenced by core bodies.
    pub extern_kernels: Vec<String>,
    next_anon_buffer: u32,
}

impl Device {
    pub fn new(name: &str, model: &'static TargetModel) -> Self {
        Self {
            name: name.to_string(),
            model,
            tiles: Vec::new(),
            cores: Vec::new(),
            locks: Vec::new(),
            buffers: Vec::new(),
            fifos: Vec::new(),
            flows: Vec::new(),
            dma_programs: Vec::new(),
            globals: Vec::new(),
            extern_kernels: Vec::new(),
            next_anon_buffer: 0,
        }
    }

    // ── Tiles and cores ─────────────────────────────────────────────

    /// Idempotent tile lookup by physical coordinate.
    pub fn get_or_create_tile(&mut self, col: i64, row: i64) -> TileId {
        for (i, t) in self.tiles.iter().enumerate() {
            if t.col == col && t.row == row {
                return TileId(i as u32);
            }
        }
        self.tiles.push(Tile { col, row });
        TileId((self.tiles.len() - 1) as u32)
    }

    pub fn tile(&self, id: TileId) -> Tile {
        self.tiles[id.0 as usize]
    }

    /// The core outlined onto a tile, if any.
    pub fn core_on(&self, module: &Module, tile: TileId) -> Option<NodeId> {
        self.cores.iter().copied().find(|&c| match module.kind(c) {
            NodeKind::Core { tile: t, .. } => *t == tile,
            _ => false,
        })
    }

    pub fn add_core(
        &mut self,
        module: &mut Module,
        tile: TileId,
        elf: String,
        free_running: bool,
        herd: Option<NodeId>,
    ) -> NodeId {
        let core = module.add_node(NodeKind::Core {
            tile,
            elf,
            free_running,
            herd,
            body: Vec::new(),
        });
        self.cores.push(core);
        core
    }

    // ── Locks ───────────────────────────────────────────────────────

    /// Return the lock with the requested id on `tile` if it exists,
    /// otherwise create one with the requested id (or the smallest unused
    /// id when `id` is None). Exhausting the tile's id space is a fatal
    /// allocation error, not an index past the end of a table.
    pub fn allocate_lock(
        &mut self,
        tile: TileId,
        init: i64,
        id: Option<u32>,
    ) -> Result<LockId, AllocError> {
        let mut used = Vec::new();
        for (i, l) in self.locks.iter().enumerate() {
            if l.tile == tile {
                if Some(l.lock_id) == id {
                    return Ok(LockId(i as u32));
                }
                used.push(l.lock_id);
            }
        }
        let new_id = match id {
            Some(i) => i,
            None => {
                let mut candidate = 0u32;
                while used.contains(&candidate) {
                    candidate += 1;
                }
                candidate
            }
        };
        if new_id >= self.model.locks_per_tile {
            let t = self.tile(tile);
            return Err(AllocError::LocksExhausted {
                col: t.col,
                row: t.row,
                capacity: self.model.locks_per_tile,
            });
        }
        self.locks.push(Lock {
            tile,
            lock_id: new_id,
            init,
        });
        Ok(LockId((self.locks.len() - 1) as u32))
    }

    pub fn lock(&self, id: LockId) -> &Lock {
        &self.locks[id.0 as usize]
    }

    // ── Buffers ─────────────────────────────────────────────────────

    /// Allocate a buffer on a tile. Named buffers with herd-relative
    /// coordinates become `<sym>_<x>_<y>`; anonymous ones `buf<N>`.
    pub fn allocate_buffer(
        &mut self,
        module: &mut Module,
        tile: TileId,
        ty: MemRefType,
        sym: Option<&str>,
        coords: Option<(i64, i64)>,
    ) -> BufferId {
        let name = match (sym, coords) {
            (Some(s), Some((x, y))) => format!("{s}_{x}_{y}"),
            (Some(s), None) => {
                let n = self.next_anon_buffer;
                self.next_anon_buffer += 1;
                format!("{s}{n}")
            }
            (None, _) => {
                let n = self.next_anon_buffer;
                self.next_anon_buffer += 1;
                format!("buf{n}")
            }
        };
        let id = BufferId(self.buffers.len() as u32);
        let value = module.new_value(Type::MemRef(ty.clone()), ValueDef::Buffer(id));
        self.buffers.push(Buffer {
            tile,
            sym: name,
            ty,
            value,
        });
        id
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    /// The buffer behind a memref value, if the value is buffer-backed.
    pub fn buffer_of_value(&self, module: &Module, v: ValueId) -> Option<BufferId> {
        match module.value(v).def {
            ValueDef::Buffer(b) => Some(b),
            _ => None,
        }
    }

    // ── Queue objects and flows ─────────────────────────────────────

    pub fn add_fifo(
        &mut self,
        name: String,
        producer: TileId,
        consumers: Vec<TileId>,
        depth: u32,
        elem: MemRefType,
    ) -> FifoId {
        self.fifos.push(ObjectFifo {
            name,
            producer,
            consumers,
            depth,
            elem,
        });
        FifoId((self.fifos.len() - 1) as u32)
    }

    pub fn fifo(&self, id: FifoId) -> &ObjectFifo {
        &self.fifos[id.0 as usize]
    }

    /// Idempotent flow creation keyed by the full endpoint pair.
    pub fn get_or_create_flow(
        &mut self,
        src: TileId,
        src_channel: u32,
        dst: TileId,
        dst_channel: u32,
    ) {
        let flow = Flow {
            src,
            src_channel,
            dst,
            dst_channel,
        };
        if !self.flows.contains(&flow) {
            self.flows.push(flow);
        }
    }

    // ── Globals and kernels ─────────────────────────────────────────

    /// Create a device global with an unused symbol derived from `base`.
    pub fn add_global(&mut self, base: &str, ty: MemRefType) -> String {
        let mut n = 0;
        let mut sym = format!("{base}_0");
        while self.globals.iter().any(|g| g.sym == sym) {
            n += 1;
            sym = format!("{base}_{n}");
        }
        self.globals.push(GlobalDef {
            sym: sym.clone(),
            ty,
        });
        sym
    }

    pub fn register_kernel(&mut self, callee: &str) {
        if !self.extern_kernels.iter().any(|k| k == callee) {
            self.extern_kernels.push(callee.to_string());
        }
    }

    // ── DMA programs ────────────────────────────────────────────────

    pub fn dma_program_mut(&mut self, tile: TileId) -> &mut DmaProgram {
        if let Some(i) = self.dma_programs.iter().position(|p| p.tile == tile) {
            return &mut self.dma_programs[i];
        }
        self.dma_programs.push(DmaProgram {
            tile,
            starts: Vec::new(),
            chains: Vec::new(),
        });
        self.dma_programs.last_mut().unwrap()
    }

    pub fn dma_program(&self, tile: TileId) -> Option<&DmaProgram> {
        self.dma_programs.iter().find(|p| p.tile == tile)
    }

    /// Render the device state for debugging and tests.
    pub fn display<'a>(&'a self, module: &'a Module) -> DeviceDisplay<'a> {
        DeviceDisplay {
            device: self,
            module,
        }
    }
}

// ── Display ──────────────────────────────────────────────────────────────

pub struct DeviceDisplay<'a> {
    device: &'a Device,
    module: &'a Module,
}

impl fmt::Display for DeviceDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.device;
        writeln!(f, "device \"{}\" ({})", d.name, d.model.name)?;
        for t in &d.tiles {
            writeln!(f, "  tile ({}, {})", t.col, t.row)?;
        }
        for l in &d.locks {
            let t = d.tile(l.tile);
            writeln!(
                f,
                "  lock ({}, {}) id={} init={}",
                t.col, t.row, l.lock_id, l.init
            )?;
        }
        for b in &d.buffers {
            let t = d.tile(b.tile);
            writeln!(f, "  buffer \"{}\" at ({}, {})", b.sym, t.col, t.row)?;
        }
        for q in &d.fifos {
            let p = d.tile(q.producer);
            let consumers: Vec<String> = q
                .consumers
                .iter()
                .map(|&c| {
                    let t = d.tile(c);
                    format!("({}, {})", t.col, t.row)
                })
                .collect();
            writeln!(
                f,
                "  fifo \"{}\" depth={} producer=({}, {}) consumers=[{}]",
                q.name,
                q.depth,
                p.col,
                p.row,
                consumers.join(", ")
            )?;
        }
        for fl in &d.flows {
            let s = d.tile(fl.src);
            let t = d.tile(fl.dst);
            writeln!(
                f,
                "  flow ({}, {}) ch{} -> ({}, {}) ch{}",
                s.col, s.row, fl.src_channel, t.col, t.row, fl.dst_channel
            )?;
        }
        for p in &d.dma_programs {
            let t = d.tile(p.tile);
            writeln!(f, "  dma ({}, {})", t.col, t.row)?;
            for s in &p.starts {
                writeln!(
                    f,
                    "    start {} ch{} -> chain {}",
                    s.channel.dir, s.channel.index, s.chain
                )?;
            }
            for (i, chain) in p.chains.iter().enumerate() {
                for (j, bd) in chain.iter().enumerate() {
                    writeln!(
                        f,
                        "    chain {i} bd {j}: buffer \"{}\" len={} next={}",
                        d.buffer(bd.buffer).sym,
                        bd.len,
                        bd.next
                    )?;
                }
            }
        }
        for c in &d.cores {
            if let NodeKind::Core { tile, elf, .. } = self.module.kind(*c) {
                let t = d.tile(*tile);
                writeln!(f, "  core ({}, {}) \"{}\"", t.col, t.row, elf)?;
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
