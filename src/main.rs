//! Double Pendulum Ensemble Simulation
//!
//! Steps tens of thousands of independent double pendulums on the best
//! available compute device, paced to a fixed step rate. The main thread
//! reads positions back at a bounded rate, the way a renderer would.

use anyhow::{anyhow, Context, Result};
use pendulum_physics::{DEFAULT_LENGTH, DEFAULT_MASS};
use pendulum_simulation::{DriverConfig, SimulationConfig, SimulationEngine, StepPacer};
use rand::Rng;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper rod horizontal, lower rod pointing straight up, both at rest,
/// every angle jittered by up to `jitter` radians.
fn initialize_pendulums(engine: &SimulationEngine, jitter: f32) -> Result<()> {
    let mut rng = rand::rng();
    let count = engine.instance_count();
    let jitter = jitter.abs();

    engine.set_lengths(&vec![(DEFAULT_LENGTH, DEFAULT_LENGTH); count])?;
    engine.set_masses(&vec![(DEFAULT_MASS, DEFAULT_MASS); count])?;

    let positions: Vec<(f32, f32)> = (0..count)
        .map(|_| {
            (
                PI / 2.0 + rng.random_range(-jitter..=jitter),
                PI + rng.random_range(-jitter..=jitter),
            )
        })
        .collect();
    engine.set_positions(&positions)?;
    engine.set_velocities(&vec![(0.0, 0.0); count])?;

    log::info!("✓ Initialized {} pendulums", count);
    Ok(())
}

/// Bob positions relative to the pivot, y pointing down
fn bob_positions(theta: (f32, f32), length: (f32, f32)) -> ([f32; 2], [f32; 2]) {
    let first = [length.0 * theta.0.sin(), length.0 * theta.0.cos()];
    let second = [
        first[0] + length.1 * theta.1.sin(),
        first[1] + length.1 * theta.1.cos(),
    ];
    (first, second)
}

fn report_status(engine: &SimulationEngine, reads: u64, elapsed: Duration) {
    match (engine.step_latency_nanos(), engine.steps_per_second()) {
        (latency, Some(sps)) => log::info!(
            "Simulation step duration: {}ns, SPS: {:.0}, read-backs/s: {:.1}",
            latency,
            sps,
            reads as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        ),
        _ => log::info!("Simulation has not completed a step yet"),
    }
}

/// Read state back until shutdown or the configured run time is over
fn consume(engine: &SimulationEngine, driver: &DriverConfig, shutdown: &AtomicBool) -> Result<()> {
    let started = Instant::now();
    let run_for = (driver.run_for_secs > 0).then(|| Duration::from_secs(driver.run_for_secs));
    let sync_interval = Duration::from_millis(driver.sync_interval_ms.max(1));
    let status_interval = Duration::from_secs(driver.status_interval_secs.max(1));
    let mut next_status = started + status_interval;
    let mut reads = 0u64;

    let count = engine.instance_count();
    let sample =
        rand::seq::index::sample(&mut rand::rng(), count, driver.sample_count.min(count)).into_vec();
    let lengths = engine.read_lengths();

    while !shutdown.load(Ordering::Relaxed) {
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("Run time of {}s reached", driver.run_for_secs);
            break;
        }

        engine.sync_state(false).context("reading state back")?;
        let positions = engine.read_positions();
        reads += 1;

        if log::log_enabled!(log::Level::Debug) {
            for &i in sample.iter().take(4) {
                let (first, second) = bob_positions(positions[i], lengths[i]);
                log::debug!(
                    "  [{}] bob1=({:.3}, {:.3}) bob2=({:.3}, {:.3})",
                    i,
                    first[0],
                    first[1],
                    second[0],
                    second[1]
                );
            }
        }

        if Instant::now() >= next_status {
            report_status(engine, reads, started.elapsed());
            next_status += status_interval;
        }

        std::thread::sleep(sync_interval);
    }

    Ok(())
}

fn main() -> Result<()> {
    // Initialize logger (RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting double pendulum simulation...");

    let config = match std::env::args().nth(1) {
        Some(path) => SimulationConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => SimulationConfig::default(),
    };

    let engine = Arc::new(
        SimulationEngine::new(config.engine.clone()).context("creating simulation engine")?,
    );
    initialize_pendulums(&engine, config.driver.initial_jitter)?;
    engine
        .send_initial_state()
        .context("sending initial state to device")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let pacing = {
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        let pacer_config = config.pacer.clone();
        std::thread::Builder::new()
            .name("pacer".into())
            .spawn(move || {
                let mut pacer = StepPacer::new(&pacer_config);
                let result = pacer.run(engine.as_ref(), &shutdown);
                shutdown.store(true, Ordering::Relaxed);
                result
            })?
    };

    let consumed = consume(&engine, &config.driver, &shutdown);
    shutdown.store(true, Ordering::Relaxed);
    let paced = pacing
        .join()
        .map_err(|_| anyhow!("pacing thread panicked"))?;

    // The pacing thread is gone, so nothing can race with teardown.
    let closed = engine.close();

    consumed?;
    let stats = paced.context("stepping the simulation")?;
    closed.context("releasing device resources")?;

    log::info!(
        "Simulation finished: {} steps, {} late",
        stats.steps,
        stats.late_steps
    );
    Ok(())
}
