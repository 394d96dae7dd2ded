//! Guest page-table update engine for the Paravisor hypervisor.
//!
//! The hypervisor retains sole authority over the hardware MMU on a
//! two-level (32-bit x86) paged machine. Guest domains never write
//! page-directory or page-table entries directly: they batch `(ptr, val)`
//! update requests and trap in, and this crate validates and applies them.
//! The safety property the whole crate exists to enforce: no guest can,
//! directly or transitively, gain write access to a frame the hypervisor
//! is using as a page-table structure, nor to any frame outside its
//! ownership.
//!
//! # Reference counting of frames
//!
//! Each frame has two refcounts. `tot_count` counts all uses of the frame
//! by a domain — as a directory, a table, or a plain PTE mapping — and
//! keeps the frame out of the free pool while anything references it.
//! `type_count` counts references consistent with the frame's current
//! incarnation, one of three mutually exclusive uses: level-2 directory,
//! level-1 table, or writeable mapping. A frame changes type only when its
//! type count is zero, and the first reference under a new type triggers a
//! deep validation walk of the frame's contents.
//!
//! # Pinning
//!
//! A domain may pin a frame's type with the PIN extended commands. A pin
//! is not reference counted — each frame pins at most once — and holds the
//! type committed so the count can fall to zero without triggering fresh
//! safety checks on the next reference.
//!
//! # Writeable mappings
//!
//! The writeable count is taken from the RW bit of each present PTE alone;
//! the parent directory entry's RW bit is not cross-checked. The count may
//! therefore overstate true write reachability, never understate it, which
//! is the direction safety needs.
//!
//! Read-only mappings bump only `tot_count`: that is what lets a domain
//! keep its own page tables mapped for reading while the hypervisor
//! forbids writing them. (Guests run with CR0.WP set so read-only is
//! honored even in rings 1 and 2.)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address;
pub mod domain;
pub mod entry;
pub mod err;
pub mod frametable;
pub mod platform;
pub mod update;

pub use address::{PhysAddr, Pfn, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use domain::Domain;
pub use entry::{EntryFlags, L1Entry, L2Entry};
pub use err::{DomainFault, UpdateError};
pub use frametable::{DomainId, FrameTable, FrameTableStats, FrameType, Owner};
pub use platform::{HypervisorLayout, PageWords, Platform};
pub use update::{process_page_updates, UpdateCtx, UpdateRequest};
