//! Randomized update sequences.
//!
//! Drives an adversarial mix of guest stores, entry updates, pins, and
//! root switches against a small world. Every accepted batch must leave
//! the frame table consistent with physical memory; every rejected batch
//! kills the domain, after which the world is rebuilt.

mod common;

use common::{pde, pte, World};

use paravisor_mmu::address::{Pfn, VirtAddr};
use paravisor_mmu::entry::{EntryFlags, DOMAIN_ENTRIES_PER_L2_PAGETABLE};
use paravisor_mmu::frametable::{DomainId, FrameType};
use paravisor_mmu::update::{
    UpdateRequest, PGEXT_NEW_BASEPTR, PGEXT_PIN_L1_TABLE, PGEXT_PIN_L2_TABLE, PGEXT_TLB_FLUSH,
    PGEXT_UNPIN_TABLE,
};

const POOL: usize = 8;
const STEPS: usize = 1500;

struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next() % n
    }

    fn pick<T: Copy>(&mut self, xs: &[T]) -> T {
        xs[self.below(xs.len() as u32) as usize]
    }
}

struct Setup {
    world: World,
    pool: Vec<Pfn>,
    foreign: Pfn,
}

fn build() -> Setup {
    let mut world = World::new();
    let pool: Vec<Pfn> = (0..POOL).map(|_| world.alloc()).collect();
    let foreign = world.alloc_foreign(DomainId(9));
    world.run_ok(UpdateRequest::extended(pool[0], PGEXT_NEW_BASEPTR));
    Setup {
        world,
        pool,
        foreign,
    }
}

fn random_pte(rng: &mut XorShift, setup: &Setup) -> u32 {
    let mut targets = setup.pool.clone();
    targets.push(setup.foreign);
    targets.push(Pfn::new(100)); // beyond max_page
    let target = rng.pick(&targets);

    match rng.below(6) {
        0 => 0,
        1 => pte(target, EntryFlags::PRESENT),
        2 | 3 => pte(target, EntryFlags::PRESENT | EntryFlags::RW),
        4 => pte(
            target,
            EntryFlags::PRESENT | EntryFlags::RW | EntryFlags::USER,
        ),
        _ => pte(target, EntryFlags::PRESENT | EntryFlags::PAT),
    }
}

fn random_pde(rng: &mut XorShift, setup: &Setup) -> u32 {
    let target = rng.pick(&setup.pool);
    match rng.below(6) {
        0 => 0,
        1 | 2 | 3 => pde(target, EntryFlags::PRESENT),
        4 => pde(target, EntryFlags::PRESENT | EntryFlags::PSE),
        _ => pde(target, EntryFlags::PRESENT | EntryFlags::USER),
    }
}

/// Frames of the pool currently committed as level-1 tables.
fn l1_frames(setup: &Setup) -> Vec<Pfn> {
    setup
        .pool
        .iter()
        .copied()
        .filter(|&p| setup.world.snapshot(p).ftype == FrameType::L1Table)
        .collect()
}

#[test]
fn randomized_sequences_preserve_invariants() {
    let mut rng = XorShift(0x9E37_79B9);
    let mut setup = build();
    let mut accepted = 0usize;
    let mut killed = 0usize;

    for _ in 0..STEPS {
        // A guest store: plain memory writes are only possible into frames
        // the guest could have mapped writeable, never into live tables.
        if rng.below(3) == 0 {
            let frame = rng.pick(&setup.pool);
            let ftype = setup.world.snapshot(frame).ftype;
            if !matches!(ftype, FrameType::L1Table | FrameType::L2Table) {
                let idx = rng.below(6) as usize;
                let val = random_pte(&mut rng, &setup);
                setup.world.write_word(frame, idx, val);
            }
            continue;
        }

        let request = match rng.below(10) {
            // Directory entry updates, occasionally aimed at the
            // hypervisor half.
            0 | 1 | 2 => {
                let root = setup.world.dom.root_pfn.unwrap();
                let idx = match rng.below(8) {
                    7 => DOMAIN_ENTRIES_PER_L2_PAGETABLE - 1,
                    6 => DOMAIN_ENTRIES_PER_L2_PAGETABLE + 1,
                    i => i as usize,
                };
                let val = random_pde(&mut rng, &setup);
                UpdateRequest::normal(World::entry_pa(root, idx), val)
            }
            // Table entry updates through any committed table.
            3 | 4 | 5 => {
                let tables = l1_frames(&setup);
                if tables.is_empty() {
                    UpdateRequest::extended(Pfn::new(0), PGEXT_TLB_FLUSH)
                } else {
                    let table = rng.pick(&tables);
                    let idx = rng.below(6) as usize;
                    let val = random_pte(&mut rng, &setup);
                    UpdateRequest::normal(World::entry_pa(table, idx), val)
                }
            }
            6 => UpdateRequest::extended(rng.pick(&setup.pool), PGEXT_PIN_L1_TABLE),
            7 => UpdateRequest::extended(rng.pick(&setup.pool), PGEXT_PIN_L2_TABLE),
            8 => UpdateRequest::extended(rng.pick(&setup.pool), PGEXT_UNPIN_TABLE),
            _ => match rng.below(3) {
                0 => UpdateRequest::extended(rng.pick(&setup.pool), PGEXT_NEW_BASEPTR),
                1 => UpdateRequest::invlpg(VirtAddr::new(rng.next() & 0xFFFF_F000)),
                _ => UpdateRequest::extended(Pfn::new(0), PGEXT_TLB_FLUSH),
            },
        };

        match setup.world.run(&[request]) {
            Ok(()) => {
                accepted += 1;
                setup.world.check_invariants();
            }
            Err(_) => {
                // The domain is dead; nothing of it survives to inspect.
                killed += 1;
                setup = build();
            }
        }
    }

    // The mix must actually exercise both outcomes.
    assert!(accepted > 100, "only {accepted} accepted batches");
    assert!(killed > 10, "only {killed} kills");
}
