//! Device context for the pendulum kernel
//!
//! Owns the wgpu device and its single in-order queue, one storage buffer
//! per state field, a shared read-back staging buffer and the compiled
//! `pendulum` kernel.
//!
//! wgpu reports most device errors through an asynchronous uncaptured-error
//! handler. Every device operation here runs inside error scopes instead, so
//! a failure comes back as the operation's `Err` in call order.

use crate::device::{DeviceInfo, SelectedDevice, KERNEL_STORAGE_BUFFERS};
use crate::{EngineConfig, EngineError, EngineResult};
use pendulum_physics::Field;

/// Kernel template packaged with the crate
pub const KERNEL_TEMPLATE: &str = include_str!("shaders/pendulum.wgsl");

/// Entry point of the kernel
pub const KERNEL_ENTRY_POINT: &str = "pendulum";

pub const G_PLACEHOLDER: &str = "$G_CONSTANT$";
pub const DT_PLACEHOLDER: &str = "$DT_CONSTANT$";
pub const WORKGROUP_SIZE_PLACEHOLDER: &str = "$WORKGROUP_SIZE$";

const FLOAT_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Bake the constants into the kernel template.
///
/// g and Δt are written with six decimals.
pub fn render_kernel_source(template: &str, g: f32, dt: f32, workgroup_size: u32) -> String {
    template
        .replace(G_PLACEHOLDER, &format!("{:.6}", g))
        .replace(DT_PLACEHOLDER, &format!("{:.6}", dt))
        .replace(WORKGROUP_SIZE_PLACEHOLDER, &workgroup_size.to_string())
}

/// Run `f` inside out-of-memory and validation error scopes.
///
/// Returns the value together with the first error the device raised.
fn capture<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    (value, validation.or(out_of_memory))
}

/// Compiled kernel program and its argument binding
pub struct Kernel {
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    bind_group: Option<wgpu::BindGroup>,
    workgroup_size: u32,
}

pub struct ComputeContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    instance_count: u32,
    // Indexed by `Field as usize`
    buffers: Vec<wgpu::Buffer>,
    staging: Option<wgpu::Buffer>,
    kernel: Option<Kernel>,
}

impl ComputeContext {
    /// Create the device, allocate one buffer per field and compile the kernel
    pub fn new(selected: SelectedDevice, config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let SelectedDevice { info, adapter } = selected;

        let buffer_bytes = config.instance_count as u64 * FLOAT_SIZE;
        let binding_bytes = u32::try_from(buffer_bytes).map_err(|_| EngineError::Allocation {
            label: "state buffers".into(),
            reason: format!("{} bytes exceed the binding size range", buffer_bytes),
        })?;

        let defaults = wgpu::Limits::downlevel_defaults();
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: KERNEL_STORAGE_BUFFERS,
            max_compute_invocations_per_workgroup: defaults
                .max_compute_invocations_per_workgroup
                .max(config.workgroup_size),
            max_compute_workgroup_size_x: defaults
                .max_compute_workgroup_size_x
                .max(config.workgroup_size),
            max_storage_buffer_binding_size: defaults
                .max_storage_buffer_binding_size
                .max(binding_bytes),
            max_buffer_size: defaults.max_buffer_size.max(buffer_bytes),
            ..defaults
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Pendulum Device"),
            required_features: wgpu::Features::empty(),
            required_limits,
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| EngineError::Context(e.to_string()))?;

        let mut context = Self {
            device,
            queue,
            info,
            instance_count: config.instance_count,
            buffers: Vec::with_capacity(Field::ALL.len()),
            staging: None,
            kernel: None,
        };

        for field in Field::ALL {
            let buffer = context.allocate_buffer(field.label(), config.instance_count)?;
            context.buffers.push(buffer);
        }
        context.staging = Some(context.allocate_staging(config.instance_count)?);
        log::info!(
            "Buffers created: {} x {} bytes",
            Field::ALL.len(),
            buffer_bytes
        );

        let kernel = context.compile_kernel(
            KERNEL_TEMPLATE,
            config.gravity,
            config.time_step,
            config.workgroup_size,
        )?;
        context.kernel = Some(kernel);
        log::info!(
            "Kernel compiled (g = {:.6}, dt = {:.6}, workgroup size {})",
            config.gravity,
            config.time_step,
            config.workgroup_size
        );

        Ok(context)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Device-side read-write allocation for `count` f32 values
    pub fn allocate_buffer(&self, label: &str, count: u32) -> EngineResult<wgpu::Buffer> {
        self.allocate(
            label,
            count,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )
    }

    fn allocate_staging(&self, count: u32) -> EngineResult<wgpu::Buffer> {
        self.allocate(
            "staging",
            count,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )
    }

    fn allocate(
        &self,
        label: &str,
        count: u32,
        usage: wgpu::BufferUsages,
    ) -> EngineResult<wgpu::Buffer> {
        let size = count as u64 * FLOAT_SIZE;
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(EngineError::Allocation {
                label: label.to_string(),
                reason: format!("{} bytes exceed the device maximum of {}", size, max),
            });
        }

        let (buffer, error) = capture(&self.device, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        match error {
            Some(e) => Err(EngineError::Allocation {
                label: label.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(buffer),
        }
    }

    /// Substitute the constants into `template` and build the compute pipeline
    pub fn compile_kernel(
        &self,
        template: &str,
        g: f32,
        dt: f32,
        workgroup_size: u32,
    ) -> EngineResult<Kernel> {
        let source = render_kernel_source(template, g, dt, workgroup_size);

        let (module, error) = capture(&self.device, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("Pendulum Kernel"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
        });

        let compilation = pollster::block_on(module.get_compilation_info());
        let mut diagnostics: Vec<String> = compilation
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
            .map(|m| m.message.clone())
            .collect();
        if let Some(e) = error {
            diagnostics.push(e.to_string());
        }
        if !diagnostics.is_empty() {
            return Err(EngineError::Compile(diagnostics.join("\n")));
        }

        let entries: Vec<wgpu::BindGroupLayoutEntry> = Field::ALL
            .iter()
            .map(|field| wgpu::BindGroupLayoutEntry {
                binding: field.binding(),
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let ((bind_group_layout, pipeline), error) = capture(&self.device, || {
            let bind_group_layout =
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("Pendulum Bind Group Layout"),
                        entries: &entries,
                    });

            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("Pendulum Pipeline Layout"),
                        bind_group_layouts: &[&bind_group_layout],
                        push_constant_ranges: &[],
                    });

            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("Pendulum Pipeline"),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(KERNEL_ENTRY_POINT),
                    compilation_options: Default::default(),
                    cache: None,
                });

            (bind_group_layout, pipeline)
        });
        if let Some(e) = error {
            return Err(EngineError::Compile(e.to_string()));
        }

        Ok(Kernel {
            module,
            bind_group_layout,
            pipeline,
            bind_group: None,
            workgroup_size,
        })
    }

    /// Bind the eight field buffers as kernel arguments.
    ///
    /// Binding happens once; later calls are no-ops.
    pub fn bind_arguments(&mut self) -> EngineResult<()> {
        let kernel = self
            .kernel
            .as_mut()
            .ok_or_else(|| EngineError::Compile("kernel has not been compiled".into()))?;
        if kernel.bind_group.is_some() {
            return Ok(());
        }

        let entries: Vec<wgpu::BindGroupEntry> = Field::ALL
            .iter()
            .map(|field| wgpu::BindGroupEntry {
                binding: field.binding(),
                resource: self.buffers[*field as usize].as_entire_binding(),
            })
            .collect();

        let (bind_group, error) = capture(&self.device, || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Pendulum Bind Group"),
                layout: &kernel.bind_group_layout,
                entries: &entries,
            })
        });
        if let Some(e) = error {
            return Err(EngineError::Compile(format!(
                "binding kernel arguments failed: {}",
                e
            )));
        }

        kernel.bind_group = Some(bind_group);
        log::debug!("Kernel arguments bound");
        Ok(())
    }

    /// Blocking upload of exactly N values into a field's buffer
    pub fn write_buffer(&self, field: Field, host: &[f32]) -> EngineResult<()> {
        self.check_transfer_len(field, host.len())?;

        let ((), error) = capture(&self.device, || {
            self.queue
                .write_buffer(&self.buffers[field as usize], 0, bytemuck::cast_slice(host));
            self.queue.submit(std::iter::empty());
        });
        if let Some(e) = error {
            return Err(EngineError::Transfer {
                field,
                reason: e.to_string(),
            });
        }

        self.finish().map_err(|e| EngineError::Transfer {
            field,
            reason: e.to_string(),
        })
    }

    /// Blocking download of exactly N values from a field's buffer
    pub fn read_buffer(&self, field: Field, host: &mut [f32]) -> EngineResult<()> {
        self.check_transfer_len(field, host.len())?;
        let staging = self.staging.as_ref().ok_or(EngineError::Closed)?;
        let size = self.instance_count as u64 * FLOAT_SIZE;
        let transfer_error = |reason: String| EngineError::Transfer { field, reason };

        let ((), error) = capture(&self.device, || {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Read-back Encoder"),
                });
            encoder.copy_buffer_to_buffer(&self.buffers[field as usize], 0, staging, 0, size);
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = error {
            return Err(transfer_error(e.to_string()));
        }

        let slice = staging.slice(..size);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.finish().map_err(|e| transfer_error(e.to_string()))?;

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(transfer_error(e.to_string())),
            Err(_) => return Err(transfer_error("mapping was never completed".into())),
        }

        {
            let data = slice.get_mapped_range();
            let bytes: &[u8] = &data;
            host.copy_from_slice(bytemuck::cast_slice(bytes));
        }
        staging.unmap();
        Ok(())
    }

    fn check_transfer_len(&self, field: Field, len: usize) -> EngineResult<()> {
        if len != self.instance_count as usize {
            return Err(EngineError::Transfer {
                field,
                reason: format!(
                    "host array holds {} values, buffer holds {}",
                    len, self.instance_count
                ),
            });
        }
        Ok(())
    }

    /// Submit one kernel invocation over `total_work` work-items.
    ///
    /// `total_work` must be a multiple of `local_group_size`, and the group
    /// size must be the one the kernel was compiled with.
    pub fn enqueue_range(&self, total_work: u32, local_group_size: u32) -> EngineResult<()> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| EngineError::Launch("kernel has not been compiled".into()))?;
        let bind_group = kernel
            .bind_group
            .as_ref()
            .ok_or_else(|| EngineError::Launch("kernel arguments are not bound".into()))?;

        let invalid = EngineError::InvalidWorkRange {
            total_work,
            group_size: local_group_size,
        };
        if local_group_size == 0
            || local_group_size != kernel.workgroup_size
            || total_work % local_group_size != 0
        {
            return Err(invalid);
        }
        let groups = total_work / local_group_size;
        if groups > self.device.limits().max_compute_workgroups_per_dimension {
            return Err(invalid);
        }

        let ((), error) = capture(&self.device, || {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Pendulum Encoder"),
                });
            {
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Pendulum Step Pass"),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&kernel.pipeline);
                compute_pass.set_bind_group(0, bind_group, &[]);
                compute_pass.dispatch_workgroups(groups, 1, 1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        match error {
            Some(e) => Err(EngineError::Launch(e.to_string())),
            None => Ok(()),
        }
    }

    /// Block until everything submitted to the queue has completed
    pub fn finish(&self) -> EngineResult<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| EngineError::Device(e.to_string()))
    }

    /// Release everything: kernel, program, buffers, queue, device.
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn close(self) -> EngineResult<()> {
        let mut first_error: Option<EngineError> = None;
        let mut record = |step: &str, error: Option<EngineError>| {
            if let Some(e) = error {
                log::warn!("Release step '{}' failed: {}", step, e);
                first_error.get_or_insert(e);
            }
        };

        self.queue.submit(std::iter::empty());
        record("finish", self.finish().err());

        let ComputeContext {
            device,
            queue,
            buffers,
            staging,
            kernel,
            ..
        } = self;

        let device_error = |e: wgpu::Error| EngineError::Device(e.to_string());

        if let Some(kernel) = kernel {
            let Kernel {
                module,
                bind_group_layout,
                pipeline,
                bind_group,
                ..
            } = kernel;
            let ((), error) = capture(&device, || {
                drop(bind_group);
                drop(pipeline);
                drop(bind_group_layout);
            });
            record("kernel", error.map(device_error));
            let ((), error) = capture(&device, || drop(module));
            record("program", error.map(device_error));
        }

        let ((), error) = capture(&device, || {
            for buffer in buffers.iter().chain(staging.iter()) {
                buffer.destroy();
            }
        });
        record("buffers", error.map(device_error));
        drop(buffers);
        drop(staging);

        drop(queue);
        device.destroy();
        drop(device);

        log::info!("Compute context released");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
