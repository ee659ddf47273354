//! Halt wake-up latency: how long a VCPU blocked in the ring-0 halt path
//! takes to resume after another thread posts an interrupt.
//!
//! Usage:
//!   cargo run --release --bin halt_latency -- [rounds] [seed]
//!
//! Uses the std host (condvar wait queue) and a trivial backend whose
//! guest halts, then exits to ring-3 once resumed. A poker thread sleeps
//! a random 0.2-2 ms and then raises an APIC interrupt on the VCPU.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use ringzero_vmm::entry::{BackendError, ExitReason, HmBackend};
use ringzero_vmm::halt::{InterruptController, TimerPoll, TimerSource};
use ringzero_vmm::host::{HostScheduler, StdHost, ThreadCtxEvent};
use ringzero_vmm::pgm::{HostMemoryConfig, MmapHostMemory, Pgm, PgmConfig};
use ringzero_vmm::vcpu::{HaltEvent, VCpu, VCpuForceFlags};
use ringzero_vmm::verified::halt::Interruptibility;
use ringzero_vmm::vm::{Platform, Vm, VmConfig};
use std::env;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Alternates Halt and ToRing3 exits.
struct HaltingBackend {
    runs: AtomicU64,
}

impl HmBackend for HaltingBackend {
    fn enter(&self, _vcpu: &VCpu) -> Result<(), BackendError> {
        Ok(())
    }

    fn run_guest_code(&self, _vcpu: &VCpu) -> Result<ExitReason, BackendError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(if n % 2 == 0 { ExitReason::Halt } else { ExitReason::ToRing3 })
    }

    fn context_callback(&self, _vcpu: &VCpu, _event: ThreadCtxEvent) {}
}

/// Acknowledges APIC interrupts with a fixed vector.
struct ApicStub {
    delivered: Mutex<u64>,
}

impl InterruptController for ApicStub {
    fn interruptibility(&self, _vcpu: &VCpu) -> Interruptibility {
        Interruptibility::Unrestrained
    }

    fn mwait_state(&self, _vcpu: &VCpu) -> u32 {
        0
    }

    fn has_pending_trap(&self, _vcpu: &VCpu) -> bool {
        false
    }

    fn update_pending(&self, _vcpu: &VCpu) {}

    fn get_interrupt(&self, vcpu: &VCpu) -> Option<u8> {
        vcpu.ff.test_and_clear(VCpuForceFlags::INTERRUPT_APIC).then_some(0x30)
    }

    fn assert_trap(&self, _vcpu: &VCpu, _vector: u8) {
        if let Ok(mut n) = self.delivered.lock() {
            *n += 1;
        }
    }
}

/// Next timer event is always far away.
struct IdleTimer;

impl TimerSource for IdleTimer {
    fn poll(&self, _vcpu: &VCpu, now_ns: u64) -> TimerPoll {
        let delta_ns = 1_000_000_000;
        TimerPoll { deadline_ns: now_ns + delta_ns, delta_ns }
    }

    fn host_timer_hz(&self, _vcpu: &VCpu) -> u32 {
        100
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = env::args().collect();
    let rounds: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(200);
    let seed: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(42);

    let host = Arc::new(StdHost::new());
    let pgm = match MmapHostMemory::new(HostMemoryConfig::default()) {
        Ok(mem) => Pgm::new(PgmConfig::default(), Arc::new(mem)),
        Err(e) => {
            eprintln!("host memory: {e}");
            process::exit(1);
        }
    };
    let irq = Arc::new(ApicStub { delivered: Mutex::new(0) });
    let platform = Platform {
        host: host.clone(),
        backend: Arc::new(HaltingBackend { runs: AtomicU64::new(0) }),
        irq: irq.clone(),
        timers: Arc::new(IdleTimer),
    };
    let vm = match Vm::new(VmConfig::default(), pgm, platform) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("vm: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = vm.register_vcpu_thread(0) {
        eprintln!("register: {e}");
        process::exit(1);
    }

    println!("=== halt_latency rounds={rounds} seed={seed} online_cpus={} ===", host.online_cpu_count());
    let posted_at = Mutex::new(None::<Instant>);
    let mut latencies = Vec::with_capacity(rounds as usize);
    let mut failures = 0u32;

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let (vm, posted_at) = (&vm, &posted_at);

    thread::scope(|s| {
        for _ in 0..rounds {
            let delay = Duration::from_micros(rng.gen_range(200..2000));
            let poker = s.spawn(move || {
                thread::sleep(delay);
                if let Ok(mut t) = posted_at.lock() {
                    *t = Some(Instant::now());
                }
                vm.raise_interrupt(0, VCpuForceFlags::INTERRUPT_APIC)
            });
            match vm.run_once(0) {
                Ok(ExitReason::ToRing3) => {
                    let posted = posted_at.lock().ok().and_then(|mut t| t.take());
                    if let Some(t) = posted {
                        latencies.push(t.elapsed().as_nanos() as u64);
                    }
                }
                Ok(other) => {
                    failures += 1;
                    eprintln!("unexpected exit {other:?}");
                }
                Err(e) => {
                    failures += 1;
                    eprintln!("run_once: {e}");
                }
            }
            if let Ok(Err(e)) = poker.join() {
                eprintln!("poker: {e}");
            }
        }
    });

    latencies.sort_unstable();
    let stats = vm.vcpu(0).map(VCpu::halt_stats).unwrap_or_default();
    println!("  wake latency p50:  {} us", percentile(&latencies, 0.50) / 1000);
    println!("  wake latency p99:  {} us", percentile(&latencies, 0.99) / 1000);
    println!("  wake latency max:  {} us", latencies.last().copied().unwrap_or(0) / 1000);
    println!("  blocks:            {}", stats.count(HaltEvent::Block));
    println!("  exec from block:   {}", stats.count(HaltEvent::ExecFromBlock));
    println!("  to ring-3:         {}", stats.count(HaltEvent::ToRing3));
    println!("  vectors delivered: {}", irq.delivered.lock().map(|n| *n).unwrap_or(0));

    if failures == 0 {
        println!("  ✅ every halt resumed in ring-0");
    } else {
        println!("  ❌ {failures} rounds failed");
        process::exit(1);
    }
}
