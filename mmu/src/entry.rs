//! Page-directory and page-table entry layout.
//!
//! Guest entries are 32-bit words: low bits are attribute flags, bits 12..32
//! are the referenced frame number. The engine honors present, RW, and user;
//! PAT (L1), PSE (L2), and global are forbidden in guest-supplied entries.

use bitflags::bitflags;
use core::fmt;
use static_assertions::{const_assert, const_assert_eq};

use crate::address::Pfn;

// ── Directory geometry ──────────────────────────────────────────

/// Entries in a level-1 page table (4 KiB of 32-bit words).
pub const ENTRIES_PER_L1_PAGETABLE: usize = 1024;

/// Entries in a level-2 page directory.
pub const ENTRIES_PER_L2_PAGETABLE: usize = 1024;

/// Virtual-address span of one L2 entry.
pub const L2_PAGETABLE_SHIFT: u32 = 22;

/// Start of the hypervisor-reserved high region of every address space.
pub const HYPERVISOR_VIRT_START: u32 = 0xFC00_0000;

/// Start of the per-domain private mapping within the hypervisor region.
pub const PERDOMAIN_VIRT_START: u32 = 0xFC40_0000;

/// Directory slots a guest may populate: everything below the hypervisor
/// region.
pub const DOMAIN_ENTRIES_PER_L2_PAGETABLE: usize =
    (HYPERVISOR_VIRT_START >> L2_PAGETABLE_SHIFT) as usize;

/// Directory slots owned by the hypervisor in every address space.
pub const HYPERVISOR_ENTRIES_PER_L2_PAGETABLE: usize =
    ENTRIES_PER_L2_PAGETABLE - DOMAIN_ENTRIES_PER_L2_PAGETABLE;

/// Index of the per-domain mapping slot, relative to the start of the
/// hypervisor-owned portion of a directory.
pub const PERDOMAIN_SLOT: usize = ((PERDOMAIN_VIRT_START >> L2_PAGETABLE_SHIFT) as usize)
    - DOMAIN_ENTRIES_PER_L2_PAGETABLE;

const_assert_eq!(
    DOMAIN_ENTRIES_PER_L2_PAGETABLE + HYPERVISOR_ENTRIES_PER_L2_PAGETABLE,
    ENTRIES_PER_L2_PAGETABLE
);
const_assert!(PERDOMAIN_SLOT < HYPERVISOR_ENTRIES_PER_L2_PAGETABLE);

// ── Attribute flags ─────────────────────────────────────────────

bitflags! {
    /// 32-bit x86 page-table entry attribute bits.
    ///
    /// PSE and PAT share bit 7: the hardware interprets it as PSE in a
    /// directory entry and as PAT in a table entry. Both readings are
    /// forbidden in guest entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Entry is valid; if clear every other bit is ignored.
        const PRESENT       = 1 << 0;

        /// Mapping is writeable. Tracked in the referent's type count for
        /// L1 entries; ignored for L2 refcounting.
        const RW            = 1 << 1;

        /// Mapping is reachable from user mode. Untouched by the engine.
        const USER          = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled.
        const NO_CACHE      = 1 << 4;

        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;

        /// Set by the CPU on a write.
        const DIRTY         = 1 << 6;

        /// Page-size bit in an L2 entry (4 MiB mapping). Forbidden.
        const PSE           = 1 << 7;

        /// PAT selector in an L1 entry (same bit as PSE). Forbidden.
        const PAT           = 1 << 7;

        /// TLB entry survives a root switch. Forbidden in guest entries.
        const GLOBAL        = 1 << 8;
    }
}

impl EntryFlags {
    /// Attributes spliced-in hypervisor mappings carry.
    pub const HYPERVISOR: EntryFlags = EntryFlags::PRESENT
        .union(EntryFlags::RW)
        .union(EntryFlags::ACCESSED)
        .union(EntryFlags::DIRTY);
}

/// Attribute bits a guest may never set in an L1 entry.
pub const L1_DISALLOWED: EntryFlags = EntryFlags::GLOBAL.union(EntryFlags::PAT);

/// Attribute bits a guest may never set in an L2 entry.
pub const L2_DISALLOWED: EntryFlags = EntryFlags::GLOBAL.union(EntryFlags::PSE);

/// Bits of an L1 entry whose change forces re-accounting: frame number,
/// present, and RW (RW moves the referent in and out of the writeable
/// type).
pub const L1_ENTRY_CHANGE_MASK: u32 = 0xFFFF_F003;

/// Bits of an L2 entry whose change forces re-accounting: frame number and
/// present only.
pub const L2_ENTRY_CHANGE_MASK: u32 = 0xFFFF_F001;

const PFN_MASK: u32 = 0xFFFF_F000;

// ── Entry newtypes ──────────────────────────────────────────────

/// A level-1 page-table entry: maps one 4 KiB page.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct L1Entry(u32);

/// A level-2 page-directory entry: references one level-1 table.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct L2Entry(u32);

macro_rules! entry_common {
    ($name:ident) => {
        impl $name {
            /// An empty (not-present) entry.
            pub const EMPTY: $name = $name(0);

            #[inline]
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn new(pfn: Pfn, flags: EntryFlags) -> Self {
                Self((pfn.as_u32() << crate::address::PAGE_SHIFT) | flags.bits())
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// The frame this entry references.
            #[inline]
            pub const fn pfn(self) -> Pfn {
                Pfn::new((self.0 & PFN_MASK) >> crate::address::PAGE_SHIFT)
            }

            /// The attribute bits, with the frame number stripped.
            #[inline]
            pub const fn flags(self) -> EntryFlags {
                EntryFlags::from_bits_truncate(self.0)
            }

            #[inline]
            pub const fn present(self) -> bool {
                self.0 & EntryFlags::PRESENT.bits() != 0
            }

            #[inline]
            pub const fn rw(self) -> bool {
                self.0 & EntryFlags::RW.bits() != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#010x})"), self.0)
            }
        }
    };
}

entry_common!(L1Entry);
entry_common!(L2Entry);

impl L1Entry {
    /// True if any forbidden attribute bit is set.
    #[inline]
    pub fn has_disallowed_bits(self) -> bool {
        self.flags().intersects(L1_DISALLOWED)
    }
}

impl L2Entry {
    /// True if any forbidden attribute bit is set.
    #[inline]
    pub fn has_disallowed_bits(self) -> bool {
        self.flags().intersects(L2_DISALLOWED)
    }
}
