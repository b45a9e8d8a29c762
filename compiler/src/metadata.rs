// metadata.rs — Runtime metadata emission
//
// After allocation is final, each herd gets a table of its off-tile
// transfer bindings: {id, herd-relative row/col of the issuing tile,
// shim channel index, physical shim column}. The runtime consumer uses
// the table to start transfers; a herd absent from the table used no
// off-tile transfers. Inbound and outbound channel indices share one
// index space: outbound entries are offset by the per-tile channel
// capacity so the two directions cannot collide.
//
// The table serializes to JSON via serde; the canonical compact form is
// hashed with SHA-256 for the determinism checks.
//
// Preconditions: the shim DMA allocator holds the final allocation state.
// Postconditions: records appear in allocation order, inbound before
//   outbound; canonical JSON is byte-identical for identical allocations.
// Failure modes: none.
// Side effects: none.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::alloc::ShimDmaAllocator;
use crate::fabric::Device;
use crate::outline::OutlinedHerd;

// ── Record types ─────────────────────────────────────────────────────────

/// One transfer binding: logical id -> physical shim DMA channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmaAllocation {
    pub id: i32,
    /// Herd-relative row of the compute tile issuing the transfer.
    pub row: i64,
    /// Herd-relative column of the compute tile issuing the transfer.
    pub col: i64,
    /// Shim channel index; outbound entries are offset past the inbound
    /// capacity.
    pub channel: u32,
    /// Physical column of the shim tile carrying the transfer.
    pub location: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HerdMetadata {
    pub herd: String,
    pub allocations: Vec<DmaAllocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentMetadata {
    pub segment: String,
    pub herds: Vec<HerdMetadata>,
}

/// Per-module table, keyed segment -> herd.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleMetadata {
    pub segments: Vec<SegmentMetadata>,
}

impl ModuleMetadata {
    /// Pretty JSON for human consumption.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("metadata serialization cannot fail")
    }

    /// Compact canonical JSON; field and record order are fixed by
    /// construction, so this is stable across runs.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("metadata serialization cannot fail")
    }

    /// SHA-256 over the canonical JSON.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint().iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ── Emission ─────────────────────────────────────────────────────────────

/// Collect the allocation records of one herd from the final shim DMA
/// state. Only transfer ids the herd actually issued are recorded.
pub fn herd_allocations(
    device: &Device,
    shim: &ShimDmaAllocator,
    herd: &OutlinedHerd,
) -> Vec<DmaAllocation> {
    let mut out = Vec::new();
    for slot in &shim.s2mm {
        for &id in &slot.transfer_ids {
            if !herd.transfer_ids.contains(&id) {
                continue;
            }
            out.push(DmaAllocation {
                id,
                row: slot.row - herd.row_offset,
                col: slot.col - herd.col_offset,
                channel: slot.dma_channel,
                location: device.tile(slot.tile).col,
            });
        }
    }
    for slot in &shim.mm2s {
        for &id in &slot.transfer_ids {
            if !herd.transfer_ids.contains(&id) {
                continue;
            }
            out.push(DmaAllocation {
                id,
                row: slot.row - herd.row_offset,
                col: slot.col - herd.col_offset,
                channel: slot.dma_channel + shim.shim_channel_count(),
                location: device.tile(slot.tile).col,
            });
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────────────
