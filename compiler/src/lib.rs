// flc — Fabric Lowering Compiler
//
// Library root. Lowers hierarchical tile-dataflow programs (herds of
// virtual compute tiles communicating through typed memory copies and
// named channels across an L1/L2/L3 hierarchy) onto fixed arrays of
// physical tiles with per-tile DMA, lock, and buffer budgets.

pub mod alloc;
pub mod channel;
pub mod diag;
pub mod execute;
pub mod fabric;
pub mod id;
pub mod ir;
pub mod metadata;
pub mod outline;
pub mod pass;
pub mod pipeline;
pub mod schedule;
pub mod target;
