//! PhysRead/PhysWrite stress: random guest-physical accesses checked
//! against a shadow copy of guest RAM.
//!
//! Usage:
//!   cargo run --release --bin phys_stress -- [seed] [ops]
//!
//! The chunk cache is kept small so accesses keep evicting and remapping
//! chunks, and every access size from one byte to several pages is mixed
//! in, including spans across chunk boundaries and the end of RAM.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use ringzero_vmm::pgm::{HostMemoryConfig, MmapHostMemory, Pgm, PgmConfig, RamRangeKind};
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Instant;

const RAM_PAGES: u64 = 256;
const PAGE: u64 = 4096;
const RAM_SIZE: u64 = RAM_PAGES * PAGE;
/// Unassigned gap between RAM and the dynamic range.
const DYN_BASE: u64 = RAM_SIZE + 16 * PAGE;
const DYN_PAGES: u64 = 32;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Vec<String> = env::args().collect();
    let seed: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(42);
    let ops: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(200_000);

    let host = match MmapHostMemory::new(HostMemoryConfig { pages_per_chunk: 8, max_pages: None }) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            eprintln!("host memory: {e}");
            process::exit(1);
        }
    };
    let config = PgmConfig { max_mapped_chunks: 6, ..PgmConfig::default() };
    let pgm = Pgm::new(config, host.clone());
    let setup = pgm
        .register_ram_range(0, RAM_SIZE, RamRangeKind::Ram, "ram")
        .and_then(|()| pgm.register_ram_range(DYN_BASE, DYN_PAGES * PAGE, RamRangeKind::DynamicRam, "dyn"));
    if let Err(e) = setup {
        eprintln!("setup: {e}");
        process::exit(1);
    }

    println!("=== phys_stress seed={seed} ops={ops} ===");
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut tlb = pgm.new_tlb();
    let mut shadow = vec![0u8; RAM_SIZE as usize];
    let mut dyn_shadow = vec![0u8; (DYN_PAGES * PAGE) as usize];
    let mut mismatches = 0u64;
    let start = Instant::now();

    for op in 0..ops {
        let len = match rng.gen_range(0..10) {
            0..=5 => rng.gen_range(1..=8),
            6..=8 => rng.gen_range(9..=512),
            _ => rng.gen_range(513..=3 * PAGE as usize),
        };
        let in_dyn = rng.gen_ratio(1, 8);
        let (base, size) = if in_dyn { (DYN_BASE, DYN_PAGES * PAGE) } else { (0, RAM_SIZE) };
        let offset = rng.gen_range(0..size - len as u64);
        let gc_phys = base + offset;
        let shadow_buf = if in_dyn { &mut dyn_shadow } else { &mut shadow };
        let range = offset as usize..offset as usize + len;

        if rng.gen_bool(0.4) {
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            pgm.phys_write(&mut tlb, gc_phys, &data);
            shadow_buf[range].copy_from_slice(&data);
        } else {
            let mut buf = vec![0u8; len];
            pgm.phys_read(&mut tlb, gc_phys, &mut buf);
            if buf[..] != shadow_buf[range] {
                mismatches += 1;
                eprintln!("op {op}: mismatch reading {len} bytes at {gc_phys:#x}");
            }
        }

        // Reads past the end of RAM zero-fill the tail.
        if op % 1024 == 0 {
            let mut buf = [0xffu8; 64];
            pgm.phys_read(&mut tlb, RAM_SIZE - 32, &mut buf);
            if buf[..32] != shadow[RAM_SIZE as usize - 32..] || buf[32..].iter().any(|&b| b != 0) {
                mismatches += 1;
                eprintln!("op {op}: bad read across end of RAM");
            }
        }
        if op % 4096 == 0 {
            pgm.age_chunks();
        }
    }

    let elapsed = start.elapsed();
    let stats = pgm.stats();
    println!("  elapsed:          {:.2?} ({:.0} ops/s)", elapsed, ops as f64 / elapsed.as_secs_f64());
    println!("  phys tlb:         {} hits / {} misses / {} recent", tlb.hits(), tlb.misses(), tlb.recent_hits());
    println!("  chunk cache:      {:?}", stats.chunks);
    println!("  pages allocated:  {}", host.allocated_pages());
    println!("  dynamic growths:  {}", stats.range_growths);
    println!("  unassigned reads: {} bytes", stats.unassigned_reads);

    if mismatches == 0 {
        println!("  ✅ shadow matches");
    } else {
        println!("  ❌ {mismatches} mismatches");
        process::exit(1);
    }
}
