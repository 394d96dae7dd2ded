//! The guest page-table update protocol.
//!
//! Domains trap in with a batch of `(ptr, val)` requests, where the
//! requested operation is `*ptr = val` against their own page-table frames.
//! Every request funnels through the reference-accounting walks below
//! before any entry is allowed to take effect:
//!
//! - `get_l2_table` / `get_l1_table` validate and account a whole directory
//!   or table the first time it is referenced under that type. The type is
//!   committed before the children are walked, so a second reference to the
//!   same frame (from another slot of the same directory, or mid-walk)
//!   short-circuits instead of re-validating.
//! - `put_l2_table` / `put_l1_table` drop a reference, unwinding the
//!   per-entry references when the last one goes away.
//! - `mod_l1_entry` / `mod_l2_entry` apply one entry change
//!   transactionally: release the outgoing referent, acquire the incoming
//!   one, and restore the old entry if the acquire is refused.
//!
//! The dispatcher treats any per-request failure as fatal to the domain:
//! it logs the request and reports a [`DomainFault`] for the embedder to
//! act on. Deferred TLB flushes accumulate in a batch-local flag and are
//! discharged once at batch end.

use log::{error, warn};
use spin::Mutex;

use crate::address::{PhysAddr, Pfn, VirtAddr};
use crate::domain::Domain;
use crate::entry::{
    EntryFlags, L1Entry, L2Entry, DOMAIN_ENTRIES_PER_L2_PAGETABLE, ENTRIES_PER_L1_PAGETABLE,
    L1_ENTRY_CHANGE_MASK, L2_ENTRY_CHANGE_MASK, PERDOMAIN_SLOT,
};
use crate::err::{DomainFault, UpdateError};
use crate::frametable::{DomainId, FrameTable, FrameType, Owner};
use crate::platform::{HypervisorLayout, Platform};

// ── Request encoding ────────────────────────────────────────────

/// Low bits of `ptr` demux the request kind.
pub const PGREQ_NORMAL: u32 = 0;
/// Privileged raw write into a level-1 entry, no accounting.
pub const PGREQ_UNCHECKED_UPDATE: u32 = 1;
/// Extended command selected by the low byte of `val`.
pub const PGREQ_EXTENDED_COMMAND: u32 = 2;
/// Mask over the entry-size alignment slack of `ptr`.
pub const PGREQ_KIND_MASK: u32 = 3;

/// Pin a frame as a level-1 table.
pub const PGEXT_PIN_L1_TABLE: u32 = 0;
/// Pin a frame as a level-2 directory.
pub const PGEXT_PIN_L2_TABLE: u32 = 1;
// Codes 2 and 3 are reserved for deeper table levels.
/// Undo a pin.
pub const PGEXT_UNPIN_TABLE: u32 = 4;
/// Install a new root directory.
pub const PGEXT_NEW_BASEPTR: u32 = 5;
/// Request a full local TLB flush at batch end.
pub const PGEXT_TLB_FLUSH: u32 = 6;
/// Invalidate one virtual address immediately.
pub const PGEXT_INVLPG: u32 = 7;
/// Mask over the command byte of `val`.
pub const PGEXT_CMD_MASK: u32 = 0xFF;

/// One guest update request: two little-endian machine words as copied off
/// the trap path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct UpdateRequest {
    pub ptr: u32,
    pub val: u32,
}

impl UpdateRequest {
    /// A checked update of the entry at physical address `entry`.
    pub const fn normal(entry: PhysAddr, val: u32) -> UpdateRequest {
        UpdateRequest {
            ptr: entry.as_u32() | PGREQ_NORMAL,
            val,
        }
    }

    /// A privileged unchecked write of the entry at `entry`.
    pub const fn unchecked(entry: PhysAddr, val: u32) -> UpdateRequest {
        UpdateRequest {
            ptr: entry.as_u32() | PGREQ_UNCHECKED_UPDATE,
            val,
        }
    }

    /// An extended command against `target`.
    pub const fn extended(target: Pfn, cmd: u32) -> UpdateRequest {
        UpdateRequest {
            ptr: target.base().as_u32() | PGREQ_EXTENDED_COMMAND,
            val: cmd,
        }
    }

    /// An INVLPG of `va`.
    pub const fn invlpg(va: VirtAddr) -> UpdateRequest {
        UpdateRequest {
            ptr: PGREQ_EXTENDED_COMMAND,
            val: (va.as_u32() & !PGEXT_CMD_MASK) | PGEXT_INVLPG,
        }
    }
}

// ── Page-level accounting ───────────────────────────────────────

/// Accounts one PTE-level reference to `pfn`.
///
/// A writeable mapping commits the frame to the writeable type (or joins
/// the existing writeable count); a read-only mapping bumps only the total
/// count and leaves the type alone, which is what lets a live page table
/// also be mapped read-only.
fn get_page(
    frames: &mut FrameTable,
    dom: DomainId,
    pfn: Pfn,
    writeable: bool,
) -> Result<(), UpdateError> {
    let frame = frames.frame_mut(pfn)?;

    if frame.owner != Owner::Domain(dom) {
        warn!("{}: page {} owned by {:?}", dom, pfn, frame.owner);
        return Err(UpdateError::WrongDomain);
    }
    if writeable {
        if frame.ftype != FrameType::Writeable {
            if frame.type_count != 0 {
                warn!(
                    "{}: page {} is {} (cnt={}), cannot map writeable",
                    dom,
                    pfn,
                    frame.ftype,
                    frame.type_count()
                );
                return Err(UpdateError::TypeConflict);
            }
            frame.ftype = FrameType::Writeable;
        }
        frame.type_count += 1;
    }
    frame.tot_count += 1;
    Ok(())
}

/// Drops one PTE-level reference to `pfn`.
///
/// The caller holds the reference, so this cannot legitimately fail; the
/// preconditions are checked defensively. Dropping the last writeable
/// reference demotes the frame and schedules a local TLB flush.
fn put_page(frames: &mut FrameTable, dom: DomainId, pfn: Pfn, writeable: bool, flush: &mut bool) {
    let Ok(frame) = frames.frame_mut(pfn) else {
        debug_assert!(false, "put_page beyond max_page");
        return;
    };
    debug_assert_eq!(frame.owner, Owner::Domain(dom));

    if writeable {
        debug_assert!(frame.ftype == FrameType::Writeable && frame.type_count != 0);
        frame.type_count -= 1;
        if frame.type_count == 0 {
            frame.ftype = FrameType::None;
            *flush = true;
        }
    }
    frame.tot_count -= 1;
}

// ── The update context ──────────────────────────────────────────

/// Everything one batch of updates runs against.
///
/// The context carries the frame table, the boot layout, the current
/// domain, and the platform explicitly; there are no hidden singletons.
/// Dropping the context without [`finish`](UpdateCtx::finish) discards any
/// pending flush — the dispatcher does exactly that on the kill path.
pub struct UpdateCtx<'a, P: Platform> {
    frames: &'a mut FrameTable,
    layout: &'a HypervisorLayout,
    dom: &'a mut Domain,
    platform: &'a mut P,
    flush_pending: bool,
}

impl<'a, P: Platform> UpdateCtx<'a, P> {
    pub fn new(
        frames: &'a mut FrameTable,
        layout: &'a HypervisorLayout,
        dom: &'a mut Domain,
        platform: &'a mut P,
    ) -> Self {
        UpdateCtx {
            frames,
            layout,
            dom,
            platform,
            flush_pending: false,
        }
    }

    /// True if a full local flush is scheduled for batch end.
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Consumes the context, discharging a deferred TLB flush.
    pub fn finish(self) {
        if self.flush_pending {
            self.platform.flush_local_tlb();
        }
    }

    // ── Table acquire / release walks ───────────────────────────

    /// Takes a level-1-table reference to `pfn`, validating and accounting
    /// every PTE on the first reference of the incarnation.
    pub fn get_l1_table(&mut self, pfn: Pfn) -> Result<(), UpdateError> {
        let prior = self.frames.acquire(pfn, FrameType::L1Table, self.dom.id)?;
        if prior != 0 {
            return Ok(());
        }

        // First reference. The window stays valid across the whole walk:
        // get_page touches only the frame table.
        let win = self.platform.map_frame(pfn.base());
        for idx in 0..ENTRIES_PER_L1_PAGETABLE {
            let entry = L1Entry::from_raw(win[idx]);
            if !entry.present() {
                continue;
            }
            if entry.has_disallowed_bits() {
                warn!("{}: bad l1 entry {:?} in frame {}", self.dom.id, entry, pfn);
                return Err(UpdateError::ForbiddenBits);
            }
            get_page(self.frames, self.dom.id, entry.pfn(), entry.rw())?;
        }
        Ok(())
    }

    /// Takes a level-2-directory reference to `pfn`.
    ///
    /// On the first reference, validates and accounts every guest PDE,
    /// then splices the hypervisor half and the per-domain mapping over
    /// the high portion of the directory.
    pub fn get_l2_table(&mut self, pfn: Pfn) -> Result<(), UpdateError> {
        let prior = self.frames.acquire(pfn, FrameType::L2Table, self.dom.id)?;
        if prior != 0 {
            return Ok(());
        }

        // First reference. Each nested get_l1_table recycles the mapping
        // window, so the directory is re-mapped per entry.
        let base = pfn.base();
        for idx in 0..DOMAIN_ENTRIES_PER_L2_PAGETABLE {
            let entry = L2Entry::from_raw(self.platform.map_frame(base)[idx]);
            if !entry.present() {
                continue;
            }
            if entry.has_disallowed_bits() {
                warn!("{}: bad l2 entry {:?} in frame {}", self.dom.id, entry, pfn);
                return Err(UpdateError::ForbiddenBits);
            }
            self.get_l1_table(entry.pfn())?;
        }

        let perdomain = L2Entry::new(self.dom.perdomain_pt, EntryFlags::HYPERVISOR);
        let win = self.platform.map_frame(base);
        let high = &mut win[DOMAIN_ENTRIES_PER_L2_PAGETABLE..];
        for (slot, idle) in high.iter_mut().zip(self.layout.idle_entries().iter()) {
            *slot = idle.raw();
        }
        high[PERDOMAIN_SLOT] = perdomain.raw();
        Ok(())
    }

    /// Drops a level-1-table reference, unwinding every PTE's reference
    /// when the last one goes away.
    pub fn put_l1_table(&mut self, pfn: Pfn) {
        let Ok(remaining) = self.frames.release(pfn, FrameType::L1Table, self.dom.id) else {
            debug_assert!(false, "put_l1_table without a held reference");
            return;
        };
        if remaining != 0 {
            return;
        }

        let win = self.platform.map_frame(pfn.base());
        for idx in 0..ENTRIES_PER_L1_PAGETABLE {
            let entry = L1Entry::from_raw(win[idx]);
            if entry.present() {
                put_page(
                    self.frames,
                    self.dom.id,
                    entry.pfn(),
                    entry.rw(),
                    &mut self.flush_pending,
                );
            }
        }
    }

    /// Drops a level-2-directory reference, unwinding the guest portion
    /// when the last one goes away. The hypervisor half is not walked —
    /// those entries were never accounted against the guest.
    pub fn put_l2_table(&mut self, pfn: Pfn) {
        let Ok(remaining) = self.frames.release(pfn, FrameType::L2Table, self.dom.id) else {
            debug_assert!(false, "put_l2_table without a held reference");
            return;
        };
        if remaining != 0 {
            return;
        }

        // put_l1_table recycles the window; re-map per entry.
        let base = pfn.base();
        for idx in 0..DOMAIN_ENTRIES_PER_L2_PAGETABLE {
            let entry = L2Entry::from_raw(self.platform.map_frame(base)[idx]);
            if entry.present() {
                self.put_l1_table(entry.pfn());
            }
        }
    }

    // ── Entry modifiers ─────────────────────────────────────────

    /// Applies one PTE change at physical address `pa`.
    ///
    /// The new value is written only after the accounting succeeds: an RW
    /// downgrade that was speculatively visible could not be rolled back
    /// without losing the distinction. Nothing below re-enters the mapping
    /// window, so the slot mapped at entry stays valid throughout.
    fn mod_l1_entry(&mut self, pa: PhysAddr, new: L1Entry) -> Result<(), UpdateError> {
        let idx = pa.entry_index();
        let win = self.platform.map_frame(pa.page_base());
        let old = L1Entry::from_raw(win[idx]);

        if new.present() {
            if new.has_disallowed_bits() {
                warn!("{}: bad l1 entry value {:?}", self.dom.id, new);
                return Err(UpdateError::ForbiddenBits);
            }
            // Differ in frame, presence, or writability?
            if (old.raw() ^ new.raw()) & L1_ENTRY_CHANGE_MASK != 0 {
                if old.present() {
                    put_page(
                        self.frames,
                        self.dom.id,
                        old.pfn(),
                        old.rw(),
                        &mut self.flush_pending,
                    );
                }
                get_page(self.frames, self.dom.id, new.pfn(), new.rw())?;
            }
        } else if old.present() {
            put_page(
                self.frames,
                self.dom.id,
                old.pfn(),
                old.rw(),
                &mut self.flush_pending,
            );
        }

        win[idx] = new.raw();
        Ok(())
    }

    /// Applies one PDE change at physical address `pa`.
    ///
    /// The new value is written speculatively before validation: the
    /// nested walks recycle the mapping window, and a directory that
    /// (legally) reaches itself mid-walk must read its own pending state.
    /// Updates are serialized per domain and the local TLB is not reloaded
    /// before validation completes, so no hardware walk can observe the
    /// intermediate value. On failure the old entry is written back
    /// through a re-grabbed window.
    fn mod_l2_entry(&mut self, pa: PhysAddr, new: L2Entry) -> Result<(), UpdateError> {
        let idx = pa.entry_index();
        if idx >= DOMAIN_ENTRIES_PER_L2_PAGETABLE {
            warn!(
                "{}: l2 update into hypervisor area ({} slot {})",
                self.dom.id, pa, idx
            );
            return Err(UpdateError::HypervisorArea);
        }

        let base = pa.page_base();
        let old = {
            let win = self.platform.map_frame(base);
            let old = L2Entry::from_raw(win[idx]);
            win[idx] = new.raw();
            old
        };

        if let Err(reason) = self.install_l2_entry(old, new) {
            self.platform.map_frame(base)[idx] = old.raw();
            return Err(reason);
        }
        Ok(())
    }

    fn install_l2_entry(&mut self, old: L2Entry, new: L2Entry) -> Result<(), UpdateError> {
        if new.present() {
            if new.has_disallowed_bits() {
                warn!("{}: bad l2 entry value {:?}", self.dom.id, new);
                return Err(UpdateError::ForbiddenBits);
            }
            // Differ in frame or presence?
            if (old.raw() ^ new.raw()) & L2_ENTRY_CHANGE_MASK != 0 {
                if old.present() {
                    self.put_l1_table(old.pfn());
                }
                self.get_l1_table(new.pfn())?;
            }
        } else if old.present() {
            self.put_l1_table(old.pfn());
        }
        Ok(())
    }

    // ── Extended commands ───────────────────────────────────────

    fn pin_table(&mut self, pfn: Pfn, ftype: FrameType) -> Result<(), UpdateError> {
        match ftype {
            FrameType::L1Table => self.get_l1_table(pfn)?,
            FrameType::L2Table => self.get_l2_table(pfn)?,
            _ => {
                debug_assert!(false, "pin of a non-table type");
                return Err(UpdateError::WrongType);
            }
        }

        if self.frames.frame(pfn)?.pinned() {
            // Unwind the acquire through the matching release path; the
            // counts must not stay perturbed by a refused pin.
            match ftype {
                FrameType::L1Table => self.put_l1_table(pfn),
                _ => self.put_l2_table(pfn),
            }
            warn!("{}: frame {} already pinned", self.dom.id, pfn);
            return Err(UpdateError::AlreadyPinned);
        }

        // Convert the counted reference just taken into the pin marker.
        // Raw decrements, not release(): the type stays committed even as
        // the plain count reaches zero.
        let frame = self.frames.frame_mut(pfn)?;
        frame.type_count -= 1;
        frame.tot_count -= 1;
        frame.set_pinned();
        Ok(())
    }

    fn unpin_table(&mut self, pfn: Pfn) -> Result<(), UpdateError> {
        let frame = self.frames.frame(pfn)?;
        if frame.owner() != Owner::Domain(self.dom.id) {
            warn!(
                "{}: unpin of frame {} owned by {:?}",
                self.dom.id,
                pfn,
                frame.owner()
            );
            return Err(UpdateError::WrongDomain);
        }
        if !frame.pinned() {
            warn!("{}: frame {} not pinned", self.dom.id, pfn);
            return Err(UpdateError::NotPinned);
        }
        let ftype = frame.frame_type();
        if !matches!(ftype, FrameType::L1Table | FrameType::L2Table) {
            debug_assert!(false, "pinned frame {pfn} has non-table type");
            return Err(UpdateError::WrongType);
        }

        // Turn the pin back into a counted reference, then drop it through
        // the ordinary release walk.
        let frame = self.frames.frame_mut(pfn)?;
        frame.clear_pinned();
        frame.type_count += 1;
        frame.tot_count += 1;
        match ftype {
            FrameType::L1Table => self.put_l1_table(pfn),
            _ => self.put_l2_table(pfn),
        }
        Ok(())
    }

    fn extended_command(&mut self, ptr: u32, val: u32) -> Result<(), UpdateError> {
        let pfn = PhysAddr::new(ptr).pfn();
        match val & PGEXT_CMD_MASK {
            PGEXT_PIN_L1_TABLE => self.pin_table(pfn, FrameType::L1Table),
            PGEXT_PIN_L2_TABLE => self.pin_table(pfn, FrameType::L2Table),
            PGEXT_UNPIN_TABLE => self.unpin_table(pfn),
            PGEXT_NEW_BASEPTR => {
                self.get_l2_table(pfn)?;
                if let Some(old_root) = self.dom.root_pfn {
                    self.put_l2_table(old_root);
                }
                self.dom.root_pfn = Some(pfn);
                self.flush_pending = true;
                Ok(())
            }
            PGEXT_TLB_FLUSH => {
                self.flush_pending = true;
                Ok(())
            }
            PGEXT_INVLPG => {
                self.platform.invlpg(VirtAddr::new(val & !PGEXT_CMD_MASK));
                Ok(())
            }
            cmd => {
                warn!("{}: invalid extended command {:#x}", self.dom.id, cmd);
                Err(UpdateError::UnknownCommand)
            }
        }
    }

    // ── Request dispatch ────────────────────────────────────────

    /// Applies a single update request.
    pub fn apply(&mut self, req: UpdateRequest) -> Result<(), UpdateError> {
        let pfn = PhysAddr::new(req.ptr).pfn();
        if pfn.as_usize() >= self.frames.max_page() {
            warn!("{}: request frame {} out of range", self.dom.id, pfn);
            return Err(UpdateError::OutOfRange);
        }

        match req.ptr & PGREQ_KIND_MASK {
            PGREQ_NORMAL => {
                // The target must be a committed page-table frame of ours;
                // its level selects the entry format.
                let (owner, ftype) = {
                    let frame = self.frames.frame(pfn)?;
                    (frame.owner(), frame.frame_type())
                };
                if owner != Owner::Domain(self.dom.id) {
                    warn!("{}: update to frame {} owned by {:?}", self.dom.id, pfn, owner);
                    return Err(UpdateError::WrongDomain);
                }
                match ftype {
                    FrameType::L1Table => {
                        self.mod_l1_entry(PhysAddr::new(req.ptr), L1Entry::from_raw(req.val))
                    }
                    FrameType::L2Table => {
                        self.mod_l2_entry(PhysAddr::new(req.ptr), L2Entry::from_raw(req.val))
                    }
                    other => {
                        warn!(
                            "{}: update to non-pagetable frame {} ({})",
                            self.dom.id, pfn, other
                        );
                        Err(UpdateError::WrongType)
                    }
                }
            }
            PGREQ_UNCHECKED_UPDATE => {
                // Raw write used to bootstrap device mappings: control
                // domain only, into its own committed level-1 frames.
                if !self.dom.is_privileged() {
                    warn!("{}: unchecked update refused", self.dom.id);
                    return Err(UpdateError::PrivilegeRequired);
                }
                let (owner, ftype) = {
                    let frame = self.frames.frame(pfn)?;
                    (frame.owner(), frame.frame_type())
                };
                if owner != Owner::Domain(DomainId::PRIVILEGED) {
                    warn!(
                        "{}: unchecked update to frame {} owned by {:?}",
                        self.dom.id, pfn, owner
                    );
                    return Err(UpdateError::WrongDomain);
                }
                if ftype != FrameType::L1Table {
                    warn!(
                        "{}: unchecked update to non-l1 frame {} ({})",
                        self.dom.id, pfn, ftype
                    );
                    return Err(UpdateError::WrongType);
                }
                let pa = PhysAddr::new(req.ptr & !PGREQ_KIND_MASK);
                self.platform.map_frame(pa.page_base())[pa.entry_index()] = req.val;
                Ok(())
            }
            PGREQ_EXTENDED_COMMAND => self.extended_command(req.ptr & !PGREQ_KIND_MASK, req.val),
            kind => {
                warn!("{}: invalid update request kind {}", self.dom.id, kind);
                Err(UpdateError::UnknownCommand)
            }
        }
    }
}

// ── Batch entry point ───────────────────────────────────────────

/// Applies a batch of update requests on behalf of the current domain.
///
/// The frame table is process-wide; the lock is held for the whole batch
/// so concurrent ownership transfers cannot race the accounting. Requests
/// apply in order, and the first failure is fatal: it is logged, the batch
/// stops, and the returned [`DomainFault`] tells the embedder to destroy
/// the domain. On success any deferred TLB flush is discharged before
/// returning.
pub fn process_page_updates<P: Platform>(
    frames: &Mutex<FrameTable>,
    layout: &HypervisorLayout,
    dom: &mut Domain,
    platform: &mut P,
    requests: &[UpdateRequest],
) -> Result<(), DomainFault> {
    let mut guard = frames.lock();
    let mut ctx = UpdateCtx::new(&mut guard, layout, dom, platform);

    for (index, &request) in requests.iter().enumerate() {
        if let Err(reason) = ctx.apply(request) {
            error!(
                "{}: fatal update request {} (ptr={:#010x}, val={:#010x}): {}",
                ctx.dom.id, index, request.ptr, request.val, reason
            );
            return Err(DomainFault {
                index,
                request,
                reason,
            });
        }
    }

    ctx.finish();
    Ok(())
}
