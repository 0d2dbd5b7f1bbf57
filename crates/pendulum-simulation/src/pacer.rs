//! Adaptive step pacing
//!
//! Holds the step rate near one step per budget. A late step adds one unit
//! of correction, which shortens every later sleep until the lost time is
//! clawed back. After a long run of on-time steps one unit is released
//! again, so the correction does not outlive the slowdown that caused it.
//!
//! The correction is a heuristic with hand-picked thresholds. How it behaves
//! under strongly varying latency (thermal throttling, contention) has not
//! been characterized; treat [`PacerConfig`] values as tunables.

use crate::engine::{SimulationEngine, LATENCY_UNKNOWN};
use crate::{EngineResult, PacerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Something that can be stepped and reports how long the last step took
pub trait PacedStep {
    fn step(&self) -> EngineResult<()>;

    /// Latency of the latest step in nanoseconds, `LATENCY_UNKNOWN` if none
    fn step_latency_nanos(&self) -> u64;
}

impl PacedStep for SimulationEngine {
    fn step(&self) -> EngineResult<()> {
        SimulationEngine::step(self)
    }

    fn step_latency_nanos(&self) -> u64 {
        SimulationEngine::step_latency_nanos(self)
    }
}

/// Result of one pacing iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceOutcome {
    pub latency: Option<Duration>,
    /// How long the caller should sleep before the next step
    pub sleep: Duration,
    /// The step used up its whole budget
    pub behind: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacerStats {
    pub steps: u64,
    pub late_steps: u64,
}

pub struct StepPacer {
    budget: Duration,
    relax_after: u64,
    correction_unit: Duration,
    delta: u64,
    on_time: u64,
    behind: bool,
    stats: PacerStats,
}

impl StepPacer {
    pub fn new(config: &PacerConfig) -> Self {
        Self {
            budget: config.target_step(),
            relax_after: config.relax_after,
            correction_unit: config.correction_unit(),
            delta: 0,
            on_time: 0,
            behind: false,
            stats: PacerStats::default(),
        }
    }

    /// Current correction, in units
    pub fn delta(&self) -> u64 {
        self.delta
    }

    /// Consecutive on-time steps since the last late step or relaxation
    pub fn on_time_streak(&self) -> u64 {
        self.on_time
    }

    /// Whether the latest step was late
    pub fn is_behind(&self) -> bool {
        self.behind
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Step once and decide how long to sleep. Does not sleep itself.
    pub fn tick<S: PacedStep + ?Sized>(&mut self, stepper: &S) -> EngineResult<PaceOutcome> {
        stepper.step()?;
        self.stats.steps += 1;

        let latency = match stepper.step_latency_nanos() {
            LATENCY_UNKNOWN => None,
            nanos => Some(Duration::from_nanos(nanos)),
        };

        let outcome = match latency {
            Some(latency) if latency < self.budget => {
                let units = u32::try_from(self.delta).unwrap_or(u32::MAX);
                let correction = self.correction_unit.saturating_mul(units);
                self.on_time += 1;
                self.behind = false;
                PaceOutcome {
                    latency: Some(latency),
                    sleep: (self.budget - latency).saturating_sub(correction),
                    behind: false,
                }
            }
            _ => {
                self.delta += 1;
                self.on_time = 0;
                self.behind = true;
                self.stats.late_steps += 1;
                log::warn!(
                    "Running behind: step took {:?} (budget {:?}), correction now {}",
                    latency,
                    self.budget,
                    self.delta
                );
                PaceOutcome {
                    latency,
                    sleep: Duration::ZERO,
                    behind: true,
                }
            }
        };

        if self.on_time >= self.relax_after {
            self.on_time = 0;
            self.delta = self.delta.saturating_sub(1);
        }

        Ok(outcome)
    }

    /// Step and sleep until `shutdown` is set.
    ///
    /// An in-flight step always runs to completion; the flag is checked
    /// between steps.
    pub fn run<S: PacedStep + ?Sized>(
        &mut self,
        stepper: &S,
        shutdown: &AtomicBool,
    ) -> EngineResult<PacerStats> {
        log::info!(
            "Pacing started: budget {:?}, relax after {} on-time steps",
            self.budget,
            self.relax_after
        );
        while !shutdown.load(Ordering::Relaxed) {
            let outcome = self.tick(stepper)?;
            if !outcome.sleep.is_zero() {
                std::thread::sleep(outcome.sleep);
            }
        }
        log::info!(
            "Pacing stopped after {} steps ({} late)",
            self.stats.steps,
            self.stats.late_steps
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::Instant;

    /// Device stand-in whose latency is scripted per step
    struct MockStepper<'a> {
        latency: Box<dyn Fn(u64) -> u64 + 'a>,
        steps: Cell<u64>,
        last: Cell<u64>,
        stop_after: Option<(u64, &'a AtomicBool)>,
    }

    impl<'a> MockStepper<'a> {
        fn new(latency: impl Fn(u64) -> u64 + 'a) -> Self {
            Self {
                latency: Box::new(latency),
                steps: Cell::new(0),
                last: Cell::new(LATENCY_UNKNOWN),
                stop_after: None,
            }
        }

        fn stopping_after(mut self, steps: u64, flag: &'a AtomicBool) -> Self {
            self.stop_after = Some((steps, flag));
            self
        }
    }

    impl PacedStep for MockStepper<'_> {
        fn step(&self) -> EngineResult<()> {
            let n = self.steps.get();
            self.last.set((self.latency)(n));
            self.steps.set(n + 1);
            if let Some((limit, flag)) = self.stop_after {
                if n + 1 >= limit {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            Ok(())
        }

        fn step_latency_nanos(&self) -> u64 {
            self.last.get()
        }
    }

    struct FailingStepper;

    impl PacedStep for FailingStepper {
        fn step(&self) -> EngineResult<()> {
            Err(EngineError::Closed)
        }

        fn step_latency_nanos(&self) -> u64 {
            LATENCY_UNKNOWN
        }
    }

    fn config(target_ms: u64, relax_after: u64) -> PacerConfig {
        PacerConfig {
            target_step_nanos: target_ms * 1_000_000,
            relax_after,
            correction_unit_nanos: 1_000_000,
        }
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn test_instant_device_sleeps_whole_budget() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|_| 0);

        for _ in 0..1000 {
            let outcome = pacer.tick(&device).unwrap();
            assert!(!outcome.behind);
            assert_eq!(outcome.sleep, Duration::from_millis(15));
        }
        assert_eq!(pacer.delta(), 0);
        assert_eq!(pacer.stats().late_steps, 0);
        assert_eq!(pacer.on_time_streak(), 1000);
    }

    #[test]
    fn test_instant_device_over_wall_clock_run() {
        let mut pacer = StepPacer::new(&config(1, 20));
        let device = MockStepper::new(|_| 0);
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            flag.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        let stats = pacer.run(&device, &shutdown).unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(stats.steps > 0);
        assert_eq!(stats.late_steps, 0);
        assert_eq!(pacer.delta(), 0);
        assert!(!pacer.is_behind());
    }

    #[test]
    fn test_late_device_is_behind_every_step_and_never_sleeps() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|_| 30 * MS);

        for i in 1..=100 {
            let outcome = pacer.tick(&device).unwrap();
            assert!(outcome.behind);
            assert_eq!(outcome.sleep, Duration::ZERO);
            assert_eq!(pacer.delta(), i);
            assert_eq!(pacer.on_time_streak(), 0);
        }
        assert_eq!(pacer.stats().late_steps, 100);
    }

    #[test]
    fn test_latency_equal_to_budget_is_late() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|_| 15 * MS);
        assert!(pacer.tick(&device).unwrap().behind);
    }

    #[test]
    fn test_late_run_stops_on_shutdown_without_sleeping() {
        let shutdown = AtomicBool::new(false);
        let device = MockStepper::new(|_| 1_000 * MS).stopping_after(5, &shutdown);
        let mut pacer = StepPacer::new(&config(15, 50_000));

        let started = Instant::now();
        let stats = pacer.run(&device, &shutdown).unwrap();

        assert_eq!(
            stats,
            PacerStats {
                steps: 5,
                late_steps: 5
            }
        );
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_correction_shortens_sleep() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|n| if n < 2 { 20 * MS } else { 5 * MS });

        pacer.tick(&device).unwrap();
        pacer.tick(&device).unwrap();
        assert_eq!(pacer.delta(), 2);

        let outcome = pacer.tick(&device).unwrap();
        assert!(!outcome.behind);
        assert_eq!(outcome.sleep, Duration::from_millis(8));
    }

    #[test]
    fn test_sleep_floors_at_zero() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|n| if n < 20 { 20 * MS } else { 10 * MS });

        for _ in 0..20 {
            pacer.tick(&device).unwrap();
        }
        let outcome = pacer.tick(&device).unwrap();
        assert!(!outcome.behind);
        assert_eq!(outcome.sleep, Duration::ZERO);
    }

    #[test]
    fn test_correction_relaxes_back_to_zero() {
        let mut pacer = StepPacer::new(&config(15, 10));
        let device = MockStepper::new(|n| if n < 3 { 20 * MS } else { MS });

        for _ in 0..3 {
            pacer.tick(&device).unwrap();
        }
        assert_eq!(pacer.delta(), 3);

        for _ in 0..30 {
            assert!(!pacer.tick(&device).unwrap().behind);
        }
        assert_eq!(pacer.delta(), 0);

        // Sustained headroom never pushes the correction below zero.
        for _ in 0..100 {
            pacer.tick(&device).unwrap();
        }
        assert_eq!(pacer.delta(), 0);
        assert_eq!(
            pacer.tick(&device).unwrap().sleep,
            Duration::from_millis(14)
        );
    }

    #[test]
    fn test_unknown_latency_counts_as_late() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let device = MockStepper::new(|_| LATENCY_UNKNOWN);
        let outcome = pacer.tick(&device).unwrap();
        assert!(outcome.behind);
        assert_eq!(outcome.latency, None);
    }

    #[test]
    fn test_step_error_stops_run() {
        let mut pacer = StepPacer::new(&config(15, 50_000));
        let shutdown = AtomicBool::new(false);
        assert!(matches!(
            pacer.run(&FailingStepper, &shutdown),
            Err(EngineError::Closed)
        ));
        assert_eq!(pacer.stats().steps, 0);
    }
}
