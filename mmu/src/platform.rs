//! The seam between the update engine and the machine.
//!
//! The engine never touches hardware. Frame contents are reached through a
//! per-CPU mapping window and TLB maintenance is requested through this
//! trait; the embedding kernel implements both with whatever mechanism the
//! machine provides.

use crate::address::{PhysAddr, VirtAddr};
use crate::entry::{L2Entry, ENTRIES_PER_L1_PAGETABLE, HYPERVISOR_ENTRIES_PER_L2_PAGETABLE};

/// One page frame viewed as page-table entry slots.
pub type PageWords = [u32; ENTRIES_PER_L1_PAGETABLE];

/// Machine services consumed by the update engine.
pub trait Platform {
    /// Maps the frame at `base` (page-aligned) into the per-CPU window.
    ///
    /// The window is a single slot: the returned view is clobbered by the
    /// next `map_frame` call on this CPU. The `&mut self` receiver makes
    /// that a compile-time rule — any nested operation that needs the
    /// platform again forces the caller to re-map.
    fn map_frame(&mut self, base: PhysAddr) -> &mut PageWords;

    /// Invalidates the local TLB entry for one virtual address.
    fn invlpg(&mut self, va: VirtAddr);

    /// Flushes the entire local TLB. On x86 this is a reload of the root
    /// directory register.
    fn flush_local_tlb(&mut self);
}

// ── Boot-time layout ────────────────────────────────────────────

/// The hypervisor half of the idle reference directory.
///
/// Captured once at boot and spliced over the high portion of every
/// directory a guest commits, so hypervisor text, the frame table, and the
/// mapping window stay reachable in every address space.
#[derive(Clone)]
pub struct HypervisorLayout {
    idle_entries: [L2Entry; HYPERVISOR_ENTRIES_PER_L2_PAGETABLE],
}

impl HypervisorLayout {
    pub fn new(idle_entries: [L2Entry; HYPERVISOR_ENTRIES_PER_L2_PAGETABLE]) -> HypervisorLayout {
        HypervisorLayout { idle_entries }
    }

    pub fn idle_entries(&self) -> &[L2Entry; HYPERVISOR_ENTRIES_PER_L2_PAGETABLE] {
        &self.idle_entries
    }
}

impl Default for HypervisorLayout {
    fn default() -> Self {
        HypervisorLayout {
            idle_entries: [L2Entry::EMPTY; HYPERVISOR_ENTRIES_PER_L2_PAGETABLE],
        }
    }
}
