//! Headless driver: seed a world, run it for a fixed number of ticks, and
//! report population summaries as structured log events.

use anyhow::Context;
use petri_core::{UniformScene, World, WorldConfig};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ticks between progress log lines.
const REPORT_INTERVAL: u64 = 500;

struct CliArgs {
    ticks: u64,
    seed: Option<u64>,
}

impl CliArgs {
    fn parse() -> anyhow::Result<Self> {
        let mut args = std::env::args().skip(1);
        let ticks = match args.next() {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid tick count: {raw}"))?,
            None => 10_000,
        };
        let seed = match args.next() {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid seed: {raw}"))?,
            ),
            None => None,
        };
        Ok(Self { ticks, seed })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = CliArgs::parse()?;

    let config = WorldConfig {
        rng_seed: args.seed,
        ..WorldConfig::default()
    };
    let mut world = World::new(config).context("constructing world")?;
    world.set_scene(Box::new(UniformScene::default()));
    world.rebuild_scene();
    info!(
        cells = world.cell_count(),
        food = world.food_count(),
        seed = ?args.seed,
        "world seeded"
    );

    let started = Instant::now();
    for _ in 0..args.ticks {
        world.update();
        if world.tick() > 0 && world.tick().is_multiple_of(REPORT_INTERVAL) {
            if let Some(summary) = world.history().last() {
                info!(
                    tick = summary.tick,
                    cells = summary.cells,
                    food = summary.food,
                    births = summary.births,
                    deaths = summary.deaths,
                    avg_energy = summary.average_energy,
                    "population census"
                );
            }
        }
    }

    let elapsed = started.elapsed();
    let rate = args.ticks as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    if world.cell_count() == 0 {
        warn!("run ended with no living cells");
    }
    info!(
        ticks = args.ticks,
        entities = world.entity_count(),
        elapsed_ms = elapsed.as_millis() as u64,
        ticks_per_sec = rate,
        "run complete"
    );
    Ok(())
}
