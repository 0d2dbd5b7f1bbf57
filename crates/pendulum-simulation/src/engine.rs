//! Simulation engine: host state bound to device buffers
//!
//! The engine is shared by reference between the pacing thread, which calls
//! [`SimulationEngine::step`], and any reader thread, which calls
//! [`SimulationEngine::sync_state`] and the `read_*` snapshots.
//!
//! All queue work goes through one mutex around the compute context, so a
//! sync blocks while a step is in flight and vice versa. Host columns sit
//! behind an `RwLock` and a sync replaces whole columns under the write
//! lock: readers never see a half-written field, but may see positions from
//! a newer sync than velocities.

use crate::context::ComputeContext;
use crate::device::{select_best_device, DeviceInfo, SelectedDevice};
use crate::{EngineConfig, EngineError, EngineResult};
use pendulum_physics::{Field, StateStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Step latency before the first step has completed
pub const LATENCY_UNKNOWN: u64 = u64::MAX;

pub struct SimulationEngine {
    config: EngineConfig,
    device: DeviceInfo,
    state: RwLock<StateStore>,
    context: Mutex<Option<ComputeContext>>,
    latency_nanos: AtomicU64,
}

impl SimulationEngine {
    /// Select the best device on any platform and build the engine on it
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let selected = select_best_device(&instance)?;
        Self::with_device(selected, config)
    }

    /// Build the engine on an already selected device
    pub fn with_device(selected: SelectedDevice, config: EngineConfig) -> EngineResult<Self> {
        log::info!(
            "Initializing SimulationEngine ({} pendulums, workgroup size {})...",
            config.instance_count,
            config.workgroup_size
        );
        let device = selected.info.clone();
        let mut context = ComputeContext::new(selected, &config)?;
        context.bind_arguments()?;
        log::info!("✓ Simulation engine initialized");

        Ok(Self {
            state: RwLock::new(StateStore::new(config.instance_count as usize)),
            config,
            device,
            context: Mutex::new(Some(context)),
            latency_nanos: AtomicU64::new(LATENCY_UNKNOWN),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn instance_count(&self) -> usize {
        self.config.instance_count as usize
    }

    fn state(&self) -> RwLockReadGuard<'_, StateStore> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, StateStore> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_context<T>(
        &self,
        f: impl FnOnce(&mut ComputeContext) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut guard = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        let context = guard.as_mut().ok_or(EngineError::Closed)?;
        f(context)
    }

    pub fn set_lengths(&self, pairs: &[(f32, f32)]) -> EngineResult<()> {
        Ok(self.state_mut().set_lengths(pairs)?)
    }

    pub fn set_masses(&self, pairs: &[(f32, f32)]) -> EngineResult<()> {
        Ok(self.state_mut().set_masses(pairs)?)
    }

    /// Set (θ1, θ2) for every instance
    pub fn set_positions(&self, pairs: &[(f32, f32)]) -> EngineResult<()> {
        Ok(self.state_mut().set_positions(pairs)?)
    }

    /// Set (ω1, ω2) for every instance
    pub fn set_velocities(&self, pairs: &[(f32, f32)]) -> EngineResult<()> {
        Ok(self.state_mut().set_velocities(pairs)?)
    }

    /// Upload all eight host columns to their device buffers.
    ///
    /// Call once after the setters and before the first step.
    pub fn send_initial_state(&self) -> EngineResult<()> {
        self.with_context(|context| {
            let state = self.state();
            for field in Field::ALL {
                context.write_buffer(field, state.column(field))?;
            }
            Ok(())
        })?;
        log::info!("Initial state sent to device");
        Ok(())
    }

    /// Run one kernel invocation over all instances and wait for it.
    ///
    /// The wall-clock time of the whole call becomes the step latency.
    pub fn step(&self) -> EngineResult<()> {
        let started = Instant::now();
        let total_work = self.config.instance_count;
        let group_size = self.config.workgroup_size;

        self.with_context(|context| {
            context.bind_arguments()?;
            context.enqueue_range(total_work, group_size)?;
            context.finish()
        })?;

        let elapsed = started.elapsed().as_nanos().min((LATENCY_UNKNOWN - 1) as u128) as u64;
        self.latency_nanos.store(elapsed, Ordering::Relaxed);
        Ok(())
    }

    /// Latest step latency, or [`LATENCY_UNKNOWN`] before the first step
    pub fn step_latency_nanos(&self) -> u64 {
        self.latency_nanos.load(Ordering::Relaxed)
    }

    pub fn step_latency(&self) -> Option<Duration> {
        match self.step_latency_nanos() {
            LATENCY_UNKNOWN => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Step rate implied by the latest latency
    pub fn steps_per_second(&self) -> Option<f64> {
        self.step_latency()
            .map(|latency| 1e9 / latency.as_nanos().max(1) as f64)
    }

    /// Wait for outstanding work and pull angles (and optionally angular
    /// velocities) back into the host columns.
    pub fn sync_state(&self, include_velocity: bool) -> EngineResult<()> {
        let fields: &[Field] = if include_velocity {
            &[Field::Theta1, Field::Theta2, Field::Omega1, Field::Omega2]
        } else {
            &[Field::Theta1, Field::Theta2]
        };
        let len = self.instance_count();

        let columns = self.with_context(|context| {
            context.finish()?;
            fields
                .iter()
                .map(|&field| {
                    let mut values = vec![0.0; len];
                    context.read_buffer(field, &mut values)?;
                    Ok((field, values))
                })
                .collect::<EngineResult<Vec<_>>>()
        })?;

        let mut state = self.state_mut();
        for (field, values) in columns {
            state.replace_column(field, &values)?;
        }
        Ok(())
    }

    /// Host-side (θ1, θ2) as of the latest sync or set
    pub fn read_positions(&self) -> Vec<(f32, f32)> {
        self.state().positions()
    }

    pub fn read_velocities(&self) -> Vec<(f32, f32)> {
        self.state().velocities()
    }

    pub fn read_lengths(&self) -> Vec<(f32, f32)> {
        self.state().lengths()
    }

    pub fn read_masses(&self) -> Vec<(f32, f32)> {
        self.state().masses()
    }

    /// Copy of the whole host state
    pub fn snapshot(&self) -> StateStore {
        self.state().clone()
    }

    /// Release all device resources.
    ///
    /// Closing an already closed engine does nothing and returns `Ok(())`.
    /// Must not race with `step` or `sync_state`; join the pacing thread
    /// first.
    pub fn close(&self) -> EngineResult<()> {
        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match context {
            Some(context) => {
                log::info!("Closing simulation engine");
                context.close()
            }
            None => {
                log::debug!("Simulation engine already closed");
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
