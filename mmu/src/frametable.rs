//! The frame table: per-frame ownership, type, and reference accounting.
//!
//! Every physical frame carries two counts. `tot_count` counts all uses of
//! the frame by its owning domain — as a directory, a table, or a plain
//! mapping — and keeps the frame out of the free pool while referenced.
//! `type_count` counts only the uses consistent with the frame's current
//! type, which is one of three mutually exclusive incarnations (level-1
//! table, level-2 directory, writeable mapping). A frame changes type only
//! when its type count is zero; that single rule is what keeps a guest from
//! ever holding a writeable mapping of a live page-table frame.
//!
//! Pinning reserves the high bit of both counts: a pinned frame never reads
//! as unreferenced, so its type cannot be demoted until unpinned.

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

use log::{info, warn};
use static_assertions::const_assert;

use crate::address::{Pfn, PAGE_SHIFT, PAGE_SIZE};
use crate::err::UpdateError;

/// Reserved pin marker in `type_count` and `tot_count`. A pin adds exactly
/// one high-bit "reference" to each count.
pub const REFCNT_PIN_BIT: u32 = 1 << 31;

const_assert!(REFCNT_PIN_BIT > (u32::MAX >> 1));

// ── Identity ────────────────────────────────────────────────────

/// Identifier of a guest domain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The privileged control domain, the only one allowed unchecked
    /// updates.
    pub const PRIVILEGED: DomainId = DomainId(0);
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// Who a frame currently belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Owner {
    /// On the free pool, available to the allocator.
    Free,
    /// Part of the hypervisor image or the frame table itself.
    Hypervisor,
    /// Allocated to a guest domain.
    Domain(DomainId),
}

impl Default for Owner {
    fn default() -> Self {
        Owner::Hypervisor
    }
}

/// The mutually exclusive incarnations of a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FrameType {
    /// No committed use; the type is free to be set on the next reference.
    #[default]
    None,
    /// A level-1 page table.
    L1Table,
    /// A level-2 page directory.
    L2Table,
    /// Mapped writeable by at least one PTE.
    Writeable,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameType::None => "none",
            FrameType::L1Table => "l1-table",
            FrameType::L2Table => "l2-table",
            FrameType::Writeable => "writeable",
        })
    }
}

// ── Per-frame record ────────────────────────────────────────────

/// Per-frame metadata. One of these exists for every physical frame.
///
/// Both counts are raw values carrying [`REFCNT_PIN_BIT`]; every zero /
/// nonzero decision inside the engine is made on the raw value, so a pinned
/// frame never looks unreferenced. The public accessors mask the pin bit
/// back out.
#[derive(Clone, Debug, Default)]
pub struct FrameInfo {
    pub(crate) owner: Owner,
    pub(crate) ftype: FrameType,
    pub(crate) type_count: u32,
    pub(crate) tot_count: u32,
    next_free: Option<Pfn>,
}

impl FrameInfo {
    #[inline]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.ftype
    }

    /// References consistent with the current type, pin excluded.
    #[inline]
    pub fn type_count(&self) -> u32 {
        self.type_count & !REFCNT_PIN_BIT
    }

    /// All references, pin excluded.
    #[inline]
    pub fn tot_count(&self) -> u32 {
        self.tot_count & !REFCNT_PIN_BIT
    }

    #[inline]
    pub fn pinned(&self) -> bool {
        self.type_count & REFCNT_PIN_BIT != 0
    }

    pub(crate) fn set_pinned(&mut self) {
        self.type_count |= REFCNT_PIN_BIT;
        self.tot_count |= REFCNT_PIN_BIT;
    }

    pub(crate) fn clear_pinned(&mut self) {
        self.type_count &= !REFCNT_PIN_BIT;
        self.tot_count &= !REFCNT_PIN_BIT;
    }
}

// ── The table ───────────────────────────────────────────────────

/// Snapshot of frame-pool statistics, for boot reporting and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct FrameTableStats {
    /// Number of frames tracked (`max_page`).
    pub total_frames: usize,
    /// Frames currently on the free pool.
    pub free_frames: usize,
    /// Frames reserved for the hypervisor image and this table.
    pub reserved_frames: usize,
}

/// The dense per-frame table, plus the free pool threaded through it.
///
/// This is process-wide state with hypervisor lifetime. It is carried
/// explicitly into every operation; callers that share it across CPUs wrap
/// it in a `spin::Mutex` (see `process_page_updates`).
pub struct FrameTable {
    frames: Vec<FrameInfo>,
    free_head: Option<Pfn>,
    free_tail: Option<Pfn>,
    free_count: usize,
    reserved: usize,
}

impl FrameTable {
    /// Builds the table for `nr_pages` physical frames.
    ///
    /// The table itself notionally sits directly after the reserved
    /// hypervisor image of `reserved_bytes`; every frame below that point
    /// is marked hypervisor-owned, and every frame above it is linked onto
    /// the free pool in ascending order.
    pub fn new(nr_pages: usize, reserved_bytes: usize) -> FrameTable {
        let table_bytes =
            (nr_pages * size_of::<FrameInfo>() + PAGE_SIZE as usize - 1) & !(PAGE_SIZE as usize - 1);
        let first_free = ((reserved_bytes + table_bytes) >> PAGE_SHIFT).min(nr_pages);

        let mut table = FrameTable {
            frames: alloc::vec![FrameInfo::default(); nr_pages],
            free_head: None,
            free_tail: None,
            free_count: 0,
            reserved: first_free,
        };

        for idx in first_free..nr_pages {
            let pfn = Pfn::new(idx as u32);
            table.frames[idx].owner = Owner::Free;
            table.link_free(pfn);
        }

        info!(
            "frame table: {} frames, {} reserved, {} free",
            nr_pages, first_free, table.free_count
        );
        table
    }

    /// Number of frames tracked; PFNs at or above this are out of range.
    #[inline]
    pub fn max_page(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> FrameTableStats {
        FrameTableStats {
            total_frames: self.frames.len(),
            free_frames: self.free_count,
            reserved_frames: self.reserved,
        }
    }

    /// Looks up a frame record, failing on out-of-range PFNs.
    pub fn frame(&self, pfn: Pfn) -> Result<&FrameInfo, UpdateError> {
        self.frames.get(pfn.as_usize()).ok_or_else(|| {
            warn!("frame {} out of range (max {:#x})", pfn, self.frames.len());
            UpdateError::OutOfRange
        })
    }

    pub(crate) fn frame_mut(&mut self, pfn: Pfn) -> Result<&mut FrameInfo, UpdateError> {
        let max = self.frames.len();
        self.frames.get_mut(pfn.as_usize()).ok_or_else(|| {
            warn!("frame {} out of range (max {:#x})", pfn, max);
            UpdateError::OutOfRange
        })
    }

    /// Iterates all frame records in PFN order.
    pub fn iter(&self) -> impl Iterator<Item = (Pfn, &FrameInfo)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, f)| (Pfn::new(i as u32), f))
    }

    // ── Reference accounting primitives ─────────────────────────

    /// Takes a typed reference to `pfn` on behalf of `dom`.
    ///
    /// Commits the frame to `ftype` if this is the first reference of the
    /// incarnation; a frame already referenced under a different type is a
    /// conflict. Returns the pre-increment raw type count — zero tells the
    /// caller it must perform the deep validation walk.
    pub fn acquire(
        &mut self,
        pfn: Pfn,
        ftype: FrameType,
        dom: DomainId,
    ) -> Result<u32, UpdateError> {
        let frame = self.frame_mut(pfn)?;

        if frame.owner != Owner::Domain(dom) {
            warn!("{}: frame {} owned by {:?}", dom, pfn, frame.owner);
            return Err(UpdateError::WrongDomain);
        }
        if frame.ftype != ftype {
            if frame.type_count != 0 {
                warn!(
                    "{}: frame {} is {} (cnt={}), wanted {}",
                    dom,
                    pfn,
                    frame.ftype,
                    frame.type_count(),
                    ftype
                );
                return Err(UpdateError::TypeConflict);
            }
            frame.ftype = ftype;
        }

        let prior = frame.type_count;
        frame.type_count += 1;
        frame.tot_count += 1;
        Ok(prior)
    }

    /// Drops a typed reference to `pfn`.
    ///
    /// The caller holds a reference, so failure here indicates a broken
    /// invariant; the checks are retained defensively. Clears the type back
    /// to `None` when the raw count reaches zero (a pinned frame never
    /// does). Returns the new raw type count.
    pub fn release(
        &mut self,
        pfn: Pfn,
        ftype: FrameType,
        dom: DomainId,
    ) -> Result<u32, UpdateError> {
        let frame = self.frame_mut(pfn)?;

        if frame.owner != Owner::Domain(dom) {
            warn!("{}: release of frame {} owned by {:?}", dom, pfn, frame.owner);
            return Err(UpdateError::WrongDomain);
        }
        if frame.ftype != ftype {
            warn!(
                "{}: release of frame {} as {}, but frame is {}",
                dom, pfn, ftype, frame.ftype
            );
            return Err(UpdateError::WrongType);
        }
        if frame.type_count == 0 {
            debug_assert!(false, "release of frame {pfn} with zero type count");
            return Err(UpdateError::WrongType);
        }

        frame.type_count -= 1;
        if frame.type_count == 0 {
            frame.ftype = FrameType::None;
        }
        frame.tot_count -= 1;
        Ok(frame.type_count)
    }

    // ── Allocator seam ──────────────────────────────────────────

    /// Unlinks the lowest free frame and hands it to `owner` with zero
    /// counts and no committed type.
    pub fn alloc_domain_frame(&mut self, owner: DomainId) -> Option<Pfn> {
        let pfn = self.free_head?;
        let frame = &mut self.frames[pfn.as_usize()];
        self.free_head = frame.next_free.take();
        if self.free_head.is_none() {
            self.free_tail = None;
        }
        self.free_count -= 1;

        frame.owner = Owner::Domain(owner);
        frame.ftype = FrameType::None;
        frame.type_count = 0;
        frame.tot_count = 0;
        Some(pfn)
    }

    /// Returns a frame to the free pool.
    ///
    /// The frame must be entirely unreferenced; a pinned frame still holds
    /// its pin reference and is refused.
    pub fn free_domain_frame(&mut self, pfn: Pfn) -> Result<(), UpdateError> {
        let frame = self.frame_mut(pfn)?;
        if frame.tot_count != 0 {
            warn!(
                "cannot free frame {}: tot_count={}, pinned={}",
                pfn,
                frame.tot_count(),
                frame.pinned()
            );
            return Err(UpdateError::TypeConflict);
        }
        frame.owner = Owner::Free;
        frame.ftype = FrameType::None;
        self.link_free(pfn);
        Ok(())
    }

    fn link_free(&mut self, pfn: Pfn) {
        self.frames[pfn.as_usize()].next_free = None;
        match self.free_tail {
            Some(tail) => self.frames[tail.as_usize()].next_free = Some(pfn),
            None => self.free_head = Some(pfn),
        }
        self.free_tail = Some(pfn);
        self.free_count += 1;
    }

    /// The free pool in link order, for audit.
    pub fn free_list(&self) -> impl Iterator<Item = Pfn> + '_ {
        let mut next = self.free_head;
        core::iter::from_fn(move || {
            let pfn = next?;
            next = self.frames[pfn.as_usize()].next_free;
            Some(pfn)
        })
    }
}
