//! Shared harness: a memory-backed platform and a small guest world.
#![allow(dead_code)]

use std::collections::HashSet;

use spin::Mutex;

use paravisor_mmu::address::{PhysAddr, Pfn, VirtAddr, PAGE_SIZE};
use paravisor_mmu::domain::Domain;
use paravisor_mmu::entry::{
    EntryFlags, L1Entry, L2Entry, DOMAIN_ENTRIES_PER_L2_PAGETABLE, ENTRIES_PER_L1_PAGETABLE,
};
use paravisor_mmu::err::DomainFault;
use paravisor_mmu::frametable::{DomainId, FrameTable, FrameType, Owner};
use paravisor_mmu::platform::{HypervisorLayout, PageWords, Platform};
use paravisor_mmu::update::{process_page_updates, UpdateRequest};

/// Frames in the test machine.
pub const NR_PAGES: usize = 64;

/// Hypervisor image size fed to the frame table.
pub const RESERVED_BYTES: usize = 4 * PAGE_SIZE as usize;

/// A fake machine: physical memory is a `Vec` of frames and TLB
/// maintenance is recorded instead of performed.
pub struct TestPlatform {
    pub mem: Vec<PageWords>,
    pub full_flushes: usize,
    pub invlpgs: Vec<u32>,
}

impl TestPlatform {
    pub fn new(frames: usize) -> TestPlatform {
        TestPlatform {
            mem: vec![[0u32; ENTRIES_PER_L1_PAGETABLE]; frames],
            full_flushes: 0,
            invlpgs: Vec::new(),
        }
    }
}

impl Platform for TestPlatform {
    fn map_frame(&mut self, base: PhysAddr) -> &mut PageWords {
        assert!(base.is_page_aligned());
        &mut self.mem[base.pfn().as_usize()]
    }

    fn invlpg(&mut self, va: VirtAddr) {
        self.invlpgs.push(va.as_u32());
    }

    fn flush_local_tlb(&mut self) {
        self.full_flushes += 1;
    }
}

/// A raw PTE value.
pub fn pte(pfn: Pfn, flags: EntryFlags) -> u32 {
    L1Entry::new(pfn, flags).raw()
}

/// A raw PDE value.
pub fn pde(pfn: Pfn, flags: EntryFlags) -> u32 {
    L2Entry::new(pfn, flags).raw()
}

/// References each frame should hold, recomputed from table contents.
struct Expected {
    exp_type: Vec<u32>,
    exp_tot: Vec<u32>,
    exp_kind: Vec<Option<FrameType>>,
}

impl Expected {
    fn new(max: usize) -> Expected {
        Expected {
            exp_type: vec![0; max],
            exp_tot: vec![0; max],
            exp_kind: vec![None; max],
        }
    }

    fn add(&mut self, pfn: Pfn, kind: Option<FrameType>) {
        self.exp_tot[pfn.as_usize()] += 1;
        if let Some(kind) = kind {
            self.exp_type[pfn.as_usize()] += 1;
            let slot = &mut self.exp_kind[pfn.as_usize()];
            assert!(
                slot.is_none() || *slot == Some(kind),
                "frame {pfn} referenced under two types"
            );
            *slot = Some(kind);
        }
    }
}

/// Per-frame state snapshot for before/after comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub owner: Owner,
    pub ftype: FrameType,
    pub type_count: u32,
    pub tot_count: u32,
    pub pinned: bool,
}

/// One guest domain plus the machine it runs on.
pub struct World {
    pub frames: Mutex<FrameTable>,
    pub layout: HypervisorLayout,
    pub dom: Domain,
    pub platform: TestPlatform,
}

impl World {
    pub fn new() -> World {
        World::with_domain(DomainId(1))
    }

    pub fn privileged() -> World {
        World::with_domain(DomainId::PRIVILEGED)
    }

    pub fn with_domain(id: DomainId) -> World {
        let table = FrameTable::new(NR_PAGES, RESERVED_BYTES);
        World {
            frames: Mutex::new(table),
            layout: HypervisorLayout::default(),
            // The per-domain table lives in a hypervisor-owned frame.
            dom: Domain::new(id, Pfn::new(2)),
            platform: TestPlatform::new(NR_PAGES),
        }
    }

    /// Allocates a frame to the world's domain. Its contents start zeroed.
    pub fn alloc(&mut self) -> Pfn {
        self.frames.lock().alloc_domain_frame(self.dom.id).unwrap()
    }

    /// Allocates a frame to some other domain.
    pub fn alloc_foreign(&mut self, id: DomainId) -> Pfn {
        self.frames.lock().alloc_domain_frame(id).unwrap()
    }

    pub fn write_word(&mut self, frame: Pfn, idx: usize, raw: u32) {
        self.platform.mem[frame.as_usize()][idx] = raw;
    }

    pub fn read_word(&self, frame: Pfn, idx: usize) -> u32 {
        self.platform.mem[frame.as_usize()][idx]
    }

    pub fn run(&mut self, requests: &[UpdateRequest]) -> Result<(), DomainFault> {
        process_page_updates(
            &self.frames,
            &self.layout,
            &mut self.dom,
            &mut self.platform,
            requests,
        )
    }

    /// Runs a single request and expects it to succeed.
    pub fn run_ok(&mut self, request: UpdateRequest) {
        self.run(&[request]).expect("request should be accepted");
    }

    pub fn snapshot(&self, pfn: Pfn) -> FrameSnapshot {
        let table = self.frames.lock();
        let f = table.frame(pfn).unwrap();
        FrameSnapshot {
            owner: f.owner(),
            ftype: f.frame_type(),
            type_count: f.type_count(),
            tot_count: f.tot_count(),
            pinned: f.pinned(),
        }
    }

    /// The physical address of entry `idx` within `table`.
    pub fn entry_pa(table: Pfn, idx: usize) -> PhysAddr {
        PhysAddr::new(table.base().as_u32() + (idx as u32) * 4)
    }

    /// Cross-checks the frame table against mock physical memory.
    ///
    /// Recomputes, from the contents of every committed table frame plus
    /// the saved root pointer, the references each frame of the world's
    /// domain should hold, and compares with the live counts. Also checks
    /// the global count and free-list invariants for every frame.
    pub fn check_invariants(&self) {
        let table = self.frames.lock();
        let mut expected = Expected::new(table.max_page());

        if let Some(root) = self.dom.root_pfn {
            expected.add(root, Some(FrameType::L2Table));
        }

        for (pfn, f) in table.iter() {
            let mem = &self.platform.mem[pfn.as_usize()];
            match f.frame_type() {
                FrameType::L2Table => {
                    for raw in &mem[..DOMAIN_ENTRIES_PER_L2_PAGETABLE] {
                        let e = L2Entry::from_raw(*raw);
                        if e.present() {
                            expected.add(e.pfn(), Some(FrameType::L1Table));
                        }
                    }
                }
                FrameType::L1Table => {
                    for raw in mem.iter() {
                        let e = L1Entry::from_raw(*raw);
                        if e.present() {
                            expected.add(e.pfn(), e.rw().then_some(FrameType::Writeable));
                        }
                    }
                }
                _ => {}
            }
        }
        let Expected { exp_type, exp_tot, exp_kind } = expected;

        let free: HashSet<Pfn> = table.free_list().collect();
        for (pfn, f) in table.iter() {
            // Count ordering and type commitment hold for every frame.
            assert!(
                f.tot_count() >= f.type_count(),
                "frame {pfn}: tot {} < type {}",
                f.tot_count(),
                f.type_count()
            );
            if f.type_count() > 0 || f.pinned() {
                assert_ne!(f.frame_type(), FrameType::None, "frame {pfn} counted but untyped");
            }

            // Free-pool membership is exactly owner == Free with no refs.
            assert_eq!(f.owner() == Owner::Free, free.contains(&pfn), "frame {pfn}");
            if f.owner() == Owner::Free {
                assert_eq!(f.tot_count(), 0, "free frame {pfn} still referenced");
            }

            // Exact per-entry accounting for the guest's own frames.
            if f.owner() == Owner::Domain(self.dom.id) {
                assert_eq!(
                    f.type_count(),
                    exp_type[pfn.as_usize()],
                    "frame {pfn}: type count does not match table contents"
                );
                assert_eq!(
                    f.tot_count(),
                    exp_tot[pfn.as_usize()],
                    "frame {pfn}: tot count does not match table contents"
                );
                if f.type_count() > 0 {
                    assert_eq!(Some(f.frame_type()), exp_kind[pfn.as_usize()], "frame {pfn}");
                }
            }
        }
    }
}
