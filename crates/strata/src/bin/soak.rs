//! # STRATA Soak
//!
//! Headless soak run: a synthetic host ticks at 60 Hz, walks a cursor across
//! a region grid, pre-schedules the units around it and pushes the results
//! back through the main-thread queue.
//!
//! ```text
//! strata_soak [config.toml] [seconds]
//! ```
//!
//! Set `RUST_LOG=strata=debug` for per-tick limiter and batch logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata::{
    Engine, RegionKey, ScheduleContext, SliceError, StrataConfig, StrataResult, TickSignal,
    UnitPos, UnitWork,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Host tick budget (60 Hz).
const TICK_BUDGET: Duration = Duration::from_micros(16_667);

/// Synthetic host work per tick.
const HOST_WORK: Duration = Duration::from_millis(6);

/// Default run length.
const DEFAULT_SECONDS: u64 = 10;

/// Height-field style unit work: a few thousand rounds of mixing per unit.
struct NoiseWork {
    units: AtomicU64,
    batches: AtomicU64,
    failed: AtomicU64,
}

impl UnitWork for NoiseWork {
    type Output = u64;

    fn run(&self, region: RegionKey, unit: UnitPos) -> Result<u64, SliceError> {
        let mut h = (i64::from(unit.x) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (i64::from(unit.z) as u64).rotate_left(29)
            ^ u64::from(region.namespace);
        for _ in 0..4_096 {
            h ^= h >> 33;
            h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        }
        self.units.fetch_add(1, Ordering::Relaxed);
        Ok(h)
    }

    fn on_batch_complete(&self, _regions: &[RegionKey], result: &StrataResult<Vec<u64>>) {
        match result {
            Ok(_) => self.batches.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

struct Overworld;

impl ScheduleContext for Overworld {
    fn namespace(&self) -> u32 {
        0
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn burn(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn main() {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match StrataConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {path}: {e}");
                std::process::exit(2);
            }
        },
        None => StrataConfig::default(),
    };
    let seconds = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);

    let engine = match Engine::builder(config).build() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to start engine: {e}");
            std::process::exit(2);
        }
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                      STRATA SOAK RUN                             ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!("  Duration:      {seconds}s");
    println!("  Tick budget:   {}us", TICK_BUDGET.as_micros());
    println!("  Limiter:       {}", engine.limiter().limit());
    println!();

    let work = Arc::new(NoiseWork {
        units: AtomicU64::new(0),
        batches: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    });
    let batcher = engine.spatial_batcher("noise", Arc::clone(&work));
    let integrated = Arc::new(AtomicU64::new(0));

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut tick: i32 = 0;
    while Instant::now() < deadline {
        let start = Instant::now();

        // Cursor walks east, drifting north every 64 ticks.
        let cursor = UnitPos::new(tick / 2, tick / 64);
        for dx in -8..=8 {
            for dz in -8..=8 {
                batcher.pre_schedule(&Overworld, UnitPos::new(cursor.x + dx, cursor.z + dz));
            }
        }
        batcher.prefetch_around(&Overworld, cursor);

        let seen = Arc::clone(&integrated);
        engine.submit_to_main_thread(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        burn(HOST_WORK);
        let report = engine.on_tick(TickSignal::new(start.elapsed(), TICK_BUDGET));
        if report.limit_changed {
            tracing::debug!(tick, limit = report.limit, "limit changed");
        }

        let spent = start.elapsed();
        if spent < TICK_BUDGET {
            thread::sleep(TICK_BUDGET - spent);
        }
        tick += 1;
    }

    engine.shutdown();

    let counters = engine.counters();
    let ticks = engine.tick_stats();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                        FINAL RESULTS                             ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!("  Ticks:             {}", ticks.ticks_recorded);
    println!("  Avg tick:          {}us", ticks.avg_tick_us());
    println!("  Max tick:          {}us", ticks.max_tick_us);
    println!("  Over budget:       {:.2}%", ticks.over_budget_percent());
    println!("  Avg drain:         {}us", ticks.avg_drain_us());
    println!("  Main-thread tasks: {}", integrated.load(Ordering::Relaxed));
    println!("  Units computed:    {}", work.units.load(Ordering::Relaxed));
    println!("  Batches ok/failed: {}/{}", work.batches.load(Ordering::Relaxed), work.failed.load(Ordering::Relaxed));
    println!("  Schedule hits:     {}", counters.cache_hits);
    println!("  Schedule misses:   {}", counters.cache_misses);
    println!("  Saturations:       {}", counters.dispatch.saturations);
    println!("  Fallbacks:         {}", counters.dispatch.fallbacks);
    println!("  Final limit:       {}", counters.limiter_limit);
}
