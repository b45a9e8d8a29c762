// alloc.rs — Resource allocators
//
// Four allocators sit between the abstract program and the device:
//   ShimTileAllocator  — shim tiles for channel endpoints in external memory
//   ShimDmaAllocator   — shim DMA engine/channel per logical transfer
//   TileDmaAllocator   — per-tile DMA channel per logical transfer
//   LockTable          — reader/writer lock pair per (buffer, channel)
//
// Each allocator is a pure function of the ordered sequence of requests it
// receives; identical request sequences produce identical assignments.
// Pools are allocated once and never released during a lowering run.
//
// Preconditions: a device with a valid target model.
// Postconditions: repeated requests for the same key return the same
//   assignment; fresh requests consume capacity in request order.
// Failure modes: pool exhaustion returns AllocError instead of indexing
//   past the end of an allocation table.
// Side effects: creates tiles and locks on the device.

use std::fmt;

use crate::fabric::{Device, DmaChannel, DmaDir};
use crate::id::{BufferId, LockId, TileId};
use crate::ir::MemorySpace;

// ── Errors ───────────────────────────────────────────────────────────────

/// A resource pool ran out during allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    ShimExhausted {
        direction: DmaDir,
        columns: usize,
        channels: u32,
    },
    LocksExhausted {
        col: i64,
        row: i64,
        capacity: u32,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ShimExhausted {
                direction,
                columns,
                channels,
            } => write!(
                f,
                "shim columns exhausted: {} pool has {} columns x {} channels",
                direction, columns, channels
            ),
            AllocError::LocksExhausted { col, row, capacity } => write!(
                f,
                "lock id space exhausted on tile ({}, {}): capacity {}",
                col, row, capacity
            ),
        }
    }
}

impl std::error::Error for AllocError {}

impl AllocError {
    /// Stable diagnostic code for this error family.
    pub fn code(&self) -> crate::diag::DiagCode {
        match self {
            AllocError::ShimExhausted { .. } => crate::diag::codes::E0401,
            AllocError::LocksExhausted { .. } => crate::diag::codes::E0403,
        }
    }

    pub fn into_diagnostic(self) -> crate::diag::Diagnostic {
        let code = self.code();
        crate::diag::Diagnostic::new(crate::diag::DiagLevel::Error, self.to_string()).with_code(code)
    }
}

/// Outbound when reading from a smaller-numbered level into a larger one
/// (the engine pulls from memory onto the stream).
fn is_outbound(src: MemorySpace, dst: MemorySpace) -> bool {
    src.level() < dst.level()
}

// ── Shim tile allocator ──────────────────────────────────────────────────

struct ShimSlot {
    tile: TileId,
    available: u32,
}

/// Assigns shim tiles to channel endpoints that live in external memory.
/// Two independent pools, one per transfer direction; each request is
/// satisfied by the first tile with remaining channel capacity, and a new
/// column is drawn from the target model when every tile is full.
pub struct ShimTileAllocator {
    channels_per_tile: u32,
    mm2s: Vec<ShimSlot>,
    s2mm: Vec<ShimSlot>,
}

impl ShimTileAllocator {
    pub fn new(device: &Device) -> Self {
        Self {
            channels_per_tile: device.model.shim_dma_channels,
            mm2s: Vec::new(),
            s2mm: Vec::new(),
        }
    }

    pub fn shim_tile(
        &mut self,
        device: &mut Device,
        src: MemorySpace,
        dst: MemorySpace,
    ) -> Result<TileId, AllocError> {
        let outbound = is_outbound(src, dst);
        let pool = if outbound { &mut self.mm2s } else { &mut self.s2mm };

        for slot in pool.iter_mut() {
            if slot.available > 0 {
                slot.available -= 1;
                return Ok(slot.tile);
            }
        }

        let shim_cols = device.model.shim_columns();
        let Some(&col) = shim_cols.get(pool.len()) else {
            return Err(AllocError::ShimExhausted {
                direction: if outbound { DmaDir::MM2S } else { DmaDir::S2MM },
                columns: shim_cols.len(),
                channels: self.channels_per_tile,
            });
        };
        let tile = device.get_or_create_tile(col as i64, 0);
        pool.push(ShimSlot {
            tile,
            available: self.channels_per_tile - 1,
        });
        Ok(tile)
    }
}

// ── Shim DMA allocator ───────────────────────────────────────────────────

/// One shim engine assignment: which shim tile and channel carry the
/// transfers issued by compute tile (col, row) over `tile_channel`.
#[derive(Debug, Clone)]
pub struct ShimDmaSlot {
    pub tile: TileId,
    pub col: i64,
    pub row: i64,
    pub dma_channel: u32,
    pub tile_channel: u32,
    pub transfer_ids: Vec<i32>,
}

/// Binds logical transfers to shim DMA engines. A transfer id already
/// seen at the same (col, row) re-returns its original binding; a fresh
/// transfer on an already-bound tile channel joins that binding. The Nth
/// distinct binding maps to shim column N / channels, channel N % channels.
pub struct ShimDmaAllocator {
    channels_per_tile: u32,
    pub mm2s: Vec<ShimDmaSlot>,
    pub s2mm: Vec<ShimDmaSlot>,
}

impl ShimDmaAllocator {
    pub fn new(device: &Device) -> Self {
        Self {
            channels_per_tile: device.model.shim_dma_channels,
            mm2s: Vec::new(),
            s2mm: Vec::new(),
        }
    }

    pub fn shim_channel_count(&self) -> u32 {
        self.channels_per_tile
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self,
        device: &mut Device,
        transfer_id: i32,
        src: MemorySpace,
        dst: MemorySpace,
        tile_channel: u32,
        col: i64,
        row: i64,
    ) -> Result<(TileId, DmaChannel), AllocError> {
        let outbound = is_outbound(src, dst);
        let dir = if outbound { DmaDir::MM2S } else { DmaDir::S2MM };
        let pool = if outbound { &mut self.mm2s } else { &mut self.s2mm };

        for slot in pool.iter_mut() {
            if slot.col == col && slot.row == row {
                if slot.transfer_ids.contains(&transfer_id) {
                    return Ok((
                        slot.tile,
                        DmaChannel {
                            dir,
                            index: slot.dma_channel,
                        },
                    ));
                }
                if slot.tile_channel == tile_channel {
                    slot.transfer_ids.push(transfer_id);
                    return Ok((
                        slot.tile,
                        DmaChannel {
                            dir,
                            index: slot.dma_channel,
                        },
                    ));
                }
            }
        }

        let n = pool.len();
        let shim_cols = device.model.shim_columns();
        let Some(&shim_col) = shim_cols.get(n / self.channels_per_tile as usize) else {
            return Err(AllocError::ShimExhausted {
                direction: dir,
                columns: shim_cols.len(),
                channels: self.channels_per_tile,
            });
        };
        let dma_channel = n as u32 % self.channels_per_tile;
        let tile = device.get_or_create_tile(shim_col as i64, 0);
        pool.push(ShimDmaSlot {
            tile,
            col,
            row,
            dma_channel,
            tile_channel,
            transfer_ids: vec![transfer_id],
        });
        Ok((
            tile,
            DmaChannel {
                dir,
                index: dma_channel,
            },
        ))
    }
}

// ── Tile DMA allocator ───────────────────────────────────────────────────

struct TileDmaSlot {
    transfer_id: i32,
    col: i64,
    row: i64,
    channel: u32,
}

/// Assigns per-tile DMA channels to logical transfers. The direction is
/// seen from the tile: pushing from its own (larger-level) memory onto
/// the stream is outbound. Channels on one tile are assigned round-robin
/// in request order; a repeated transfer id keeps its channel.
pub struct TileDmaAllocator {
    channels_per_tile: u32,
    mm2s: Vec<TileDmaSlot>,
    s2mm: Vec<TileDmaSlot>,
}

impl TileDmaAllocator {
    pub fn new(device: &Device) -> Self {
        Self {
            channels_per_tile: device.model.tile_dma_channels,
            mm2s: Vec::new(),
            s2mm: Vec::new(),
        }
    }

    pub fn channel_for(
        &mut self,
        transfer_id: i32,
        src: MemorySpace,
        dst: MemorySpace,
        col: i64,
        row: i64,
    ) -> DmaChannel {
        let outbound = src.level() > dst.level();
        let dir = if outbound { DmaDir::MM2S } else { DmaDir::S2MM };
        let pool = if outbound { &mut self.mm2s } else { &mut self.s2mm };

        let mut existing = None;
        let mut allocated_here = 0u32;
        for slot in pool.iter() {
            if slot.col == col && slot.row == row {
                if slot.transfer_id == transfer_id {
                    existing = Some(slot.channel);
                }
                allocated_here += 1;
            }
        }
        let index = match existing {
            Some(c) => c,
            None => {
                let c = allocated_here % self.channels_per_tile;
                pool.push(TileDmaSlot {
                    transfer_id,
                    col,
                    row,
                    channel: c,
                });
                c
            }
        };
        DmaChannel { dir, index }
    }
}

// ── Lock table ───────────────────────────────────────────────────────────

struct LockPairEntry {
    buffer: BufferId,
    channel: DmaChannel,
    read: LockId,
    write: LockId,
}

/// Memoizes the reader/writer lock pair guarding each (buffer, channel).
/// On single-semaphore targets the pair is one shared lock; on counting
/// targets the writer lock starts at 1 so the first write is unblocked.
#[derive(Default)]
pub struct LockTable {
    entries: Vec<LockPairEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (read lock, write lock).
    pub fn lock_pair(
        &mut self,
        device: &mut Device,
        buffer: BufferId,
        channel: DmaChannel,
    ) -> Result<(LockId, LockId), AllocError> {
        for e in &self.entries {
            if e.buffer == buffer && e.channel == channel {
                return Ok((e.read, e.write));
            }
        }
        let tile = device.buffer(buffer).tile;
        let read = device.allocate_lock(tile, 0, None)?;
        let write = if device.model.counting_locks() {
            device.allocate_lock(tile, 1, None)?
        } else {
            read
        };
        self.entries.push(LockPairEntry {
            buffer,
            channel,
            read,
            write,
        });
        Ok((read, write))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemType, MemRefType, Module};
    use crate::target::TargetModel;

    fn device(name: &str) -> Device {
        Device::new("seg0", TargetModel::by_name(name).unwrap())
    }

    #[test]
    fn shim_tiles_fill_column_before_advancing() {
        let mut d = device("tf100");
        let mut a = ShimTileAllocator::new(&d);
        let t0 = a
            .shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
            .unwrap();
        let t1 = a
            .shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
            .unwrap();
        let t2 = a
            .shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
            .unwrap();
        assert_eq!(t0, t1, "two channels on the first shim tile");
        assert_ne!(t0, t2, "third request advances to the next column");
        assert_eq!(d.tile(t0).col, 0);
        assert_eq!(d.tile(t2).col, 1);
    }

    #[test]
    fn shim_tile_pools_are_direction_independent() {
        let mut d = device("tf100");
        let mut a = ShimTileAllocator::new(&d);
        let out = a
            .shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
            .unwrap();
        let inb = a
            .shim_tile(&mut d, MemorySpace::L1, MemorySpace::L3)
            .unwrap();
        // Both directions start from the first shim column.
        assert_eq!(out, inb);
        assert_eq!(d.tile(out).col, 0);
    }

    #[test]
    fn shim_tile_exhaustion() {
        let mut d = device("tf200"); // 4 shim columns x 2 channels
        let mut a = ShimTileAllocator::new(&d);
        for _ in 0..8 {
            a.shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
                .unwrap();
        }
        let err = a
            .shim_tile(&mut d, MemorySpace::L3, MemorySpace::L1)
            .unwrap_err();
        assert!(matches!(
            err,
            AllocError::ShimExhausted {
                direction: DmaDir::MM2S,
                columns: 4,
                channels: 2,
            }
        ));
    }

    #[test]
    fn shim_dma_round_robin() {
        let mut d = device("tf100");
        let mut a = ShimDmaAllocator::new(&d);
        // Three distinct (col, row, tile_channel) triples: the first two
        // fill shim column 0, the third advances to column 1.
        let (t0, c0) = a
            .get_or_create(&mut d, 1, MemorySpace::L3, MemorySpace::L1, 0, 5, 3)
            .unwrap();
        let (t1, c1) = a
            .get_or_create(&mut d, 2, MemorySpace::L3, MemorySpace::L1, 1, 5, 3)
            .unwrap();
        let (t2, c2) = a
            .get_or_create(&mut d, 3, MemorySpace::L3, MemorySpace::L1, 0, 5, 4)
            .unwrap();
        assert_eq!(d.tile(t0).col, 0);
        assert_eq!(c0.index, 0);
        assert_eq!(t0, t1);
        assert_eq!(c1.index, 1);
        assert_eq!(d.tile(t2).col, 1, "third binding advances to column 1");
        assert_eq!(c2.index, 0);
        assert_eq!(c0.dir, DmaDir::MM2S);
    }

    #[test]
    fn shim_dma_repeated_transfer_id_is_stable() {
        let mut d = device("tf100");
        let mut a = ShimDmaAllocator::new(&d);
        let first = a
            .get_or_create(&mut d, 7, MemorySpace::L3, MemorySpace::L1, 0, 5, 3)
            .unwrap();
        let _ = a
            .get_or_create(&mut d, 8, MemorySpace::L3, MemorySpace::L1, 1, 5, 3)
            .unwrap();
        let again = a
            .get_or_create(&mut d, 7, MemorySpace::L3, MemorySpace::L1, 0, 5, 3)
            .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn shim_dma_same_tile_channel_shares_engine() {
        let mut d = device("tf100");
        let mut a = ShimDmaAllocator::new(&d);
        let (t0, c0) = a
            .get_or_create(&mut d, 1, MemorySpace::L3, MemorySpace::L1, 0, 5, 3)
            .unwrap();
        // Different transfer id, same (col,row,tile_channel) triple.
        let (t1, c1) = a
            .get_or_create(&mut d, 2, MemorySpace::L3, MemorySpace::L1, 0, 5, 3)
            .unwrap();
        assert_eq!((t0, c0), (t1, c1));
        assert_eq!(a.mm2s.len(), 1);
        assert_eq!(a.mm2s[0].transfer_ids, vec![1, 2]);
    }

    #[test]
    fn tile_dma_channels_round_robin_per_tile() {
        let d = device("tf100");
        let mut a = TileDmaAllocator::new(&d);
        let c0 = a.channel_for(1, MemorySpace::L3, MemorySpace::L1, 2, 2);
        let c1 = a.channel_for(2, MemorySpace::L3, MemorySpace::L1, 2, 2);
        let c2 = a.channel_for(3, MemorySpace::L3, MemorySpace::L1, 2, 2);
        assert_eq!(c0.dir, DmaDir::S2MM, "receiving into L1 is inbound");
        assert_eq!((c0.index, c1.index, c2.index), (0, 1, 0));
        // A repeated id keeps its channel.
        let again = a.channel_for(1, MemorySpace::L3, MemorySpace::L1, 2, 2);
        assert_eq!(again, c0);
        // Another tile starts over.
        let other = a.channel_for(4, MemorySpace::L3, MemorySpace::L1, 3, 2);
        assert_eq!(other.index, 0);
    }

    #[test]
    fn tile_dma_direction_is_tile_relative() {
        let d = device("tf100");
        let mut a = TileDmaAllocator::new(&d);
        let out = a.channel_for(1, MemorySpace::L1, MemorySpace::L3, 2, 2);
        assert_eq!(out.dir, DmaDir::MM2S, "pushing from L1 is outbound");
    }

    #[test]
    fn lock_pair_shared_on_gen1() {
        let mut d = device("tf100");
        let mut m = Module::new();
        let t = d.get_or_create_tile(2, 2);
        let ty = MemRefType::new(&[16], ElemType::F32, crate::ir::MemorySpace::L1);
        let b = d.allocate_buffer(&mut m, t, ty, None, None);
        let mut table = LockTable::new();
        let ch = DmaChannel {
            dir: DmaDir::S2MM,
            index: 0,
        };
        let (r, w) = table.lock_pair(&mut d, b, ch).unwrap();
        assert_eq!(r, w, "single-semaphore target shares the pair");
        assert_eq!(d.lock(r).init, 0);
    }

    #[test]
    fn lock_pair_distinct_on_gen2() {
        let mut d = device("tf200");
        let mut m = Module::new();
        let t = d.get_or_create_tile(2, 2);
        let ty = MemRefType::new(&[16], ElemType::F32, crate::ir::MemorySpace::L1);
        let b = d.allocate_buffer(&mut m, t, ty, None, None);
        let mut table = LockTable::new();
        let ch = DmaChannel {
            dir: DmaDir::S2MM,
            index: 0,
        };
        let (r, w) = table.lock_pair(&mut d, b, ch).unwrap();
        assert_ne!(r, w);
        assert_eq!(d.lock(r).init, 0);
        assert_eq!(d.lock(w).init, 1, "writer starts released");
    }

    #[test]
    fn lock_pair_memoized_by_buffer_and_channel() {
        let mut d = device("tf200");
        let mut m = Module::new();
        let t = d.get_or_create_tile(2, 2);
        let ty = MemRefType::new(&[16], ElemType::F32, crate::ir::MemorySpace::L1);
        let b = d.allocate_buffer(&mut m, t, ty, None, None);
        let mut table = LockTable::new();
        let ch0 = DmaChannel {
            dir: DmaDir::S2MM,
            index: 0,
        };
        let ch1 = DmaChannel {
            dir: DmaDir::MM2S,
            index: 0,
        };
        let p0 = table.lock_pair(&mut d, b, ch0).unwrap();
        let p0_again = table.lock_pair(&mut d, b, ch0).unwrap();
        let p1 = table.lock_pair(&mut d, b, ch1).unwrap();
        assert_eq!(p0, p0_again);
        assert_ne!(p0, p1, "distinct channel gets a distinct pair");
    }
}
