/* dispatches go straight to the render queue, one submit per stage, so a
stage always sees what the stage before it wrote */

use std::collections::HashMap;
use std::sync::mpsc;

use bevy::log::{debug, warn};
use bevy::render::render_resource::{Buffer, BufferDescriptor, BufferUsages};
use bevy::render::renderer::{RenderDevice, RenderQueue};
use bevy::tasks::block_on;

use crate::device::{BindingPoint, BindingTable, ComputeDevice, Dispatch, ProgramKind};
use crate::error::{Result, SolverError};
use crate::particles::binding;
use crate::search::SolverStage;

/// Binding of the uniform block in both programs.
pub const UNIFORMS: BindingPoint = 15;

/// Fault counters the solver kernels bump instead of writing out of range.
/// Owned by the device, not by the particle store.
pub const FAULTS: BindingPoint = 16;

/// Storage buffers the solver binds at once, fault counters included. Above
/// the default wgpu limit of 8, so the render device has to be created with a
/// raised `max_storage_buffers_per_shader_stage`.
pub const REQUIRED_STORAGE_BUFFERS: u32 = binding::SOLVER.len() as u32 + 1;

// bucket writes outside the bin array, scatter slots past num_particles
const FAULT_WORDS: usize = 2;
const FAULT_BYTES: u64 = (FAULT_WORDS * 4) as u64;

const SOLVER_WGSL: &str = include_str!("../../assets/shaders/solver.wgsl");
const PREFIX_SUM_WGSL: &str = include_str!("../../assets/shaders/prefix_sum.wgsl");

fn source(program: ProgramKind) -> &'static str {
    match program {
        ProgramKind::Solver => SOLVER_WGSL,
        ProgramKind::PrefixSum => PREFIX_SUM_WGSL,
    }
}

fn storage_bindings(program: ProgramKind) -> &'static [BindingPoint] {
    match program {
        ProgramKind::Solver => &binding::SOLVER,
        ProgramKind::PrefixSum => &binding::PREFIX_SUM,
    }
}

/// Turns the counters read back from the fault buffer into the error they stand for.
fn fault_from_counters(counters: [u32; FAULT_WORDS]) -> Option<SolverError> {
    let program = ProgramKind::Solver.name().to_owned();
    match counters {
        [0, 0] => None,
        [0, overflow] => Some(SolverError::KernelFault {
            program,
            stage: SolverStage::Scatter as u32,
            message: format!("{overflow} particles scattered past the last slot"),
        }),
        [outside, _] => Some(SolverError::KernelFault {
            program,
            stage: SolverStage::Bucket as u32,
            message: format!("{outside} particles mapped outside the bin array"),
        }),
    }
}

/// Runs the solver on bevy's render device.
pub struct GpuDevice {
    device: RenderDevice,
    queue: RenderQueue,
    faults: Buffer,
    fault: Option<SolverError>,
}

impl GpuDevice {
    pub fn new(device: RenderDevice, queue: RenderQueue) -> Result<Self> {
        let limits = device.limits();
        if limits.max_storage_buffers_per_shader_stage < REQUIRED_STORAGE_BUFFERS {
            return Err(SolverError::Device(format!(
                "{} storage buffers per stage needed, the device allows {}",
                REQUIRED_STORAGE_BUFFERS, limits.max_storage_buffers_per_shader_stage
            )));
        }
        let faults = device.create_buffer(&BufferDescriptor {
            label: Some("solver_faults"),
            size: FAULT_BYTES,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(Self {
            device,
            queue,
            faults,
            fault: None,
        })
    }

    pub fn render_device(&self) -> &RenderDevice {
        &self.device
    }

    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        let device = self.device.wgpu_device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(device);
        let err = block_on(device.pop_error_scope());
        (out, err)
    }
}

/// A program compiled for the render device. Pipelines are specialized per
/// workgroup size on first use.
pub struct GpuKernels {
    program: ProgramKind,
    module: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<(u32, u32), wgpu::ComputePipeline>,
    uniforms: wgpu::Buffer,
    uniform_revision: Option<u64>,
    bind_group: Option<(u64, wgpu::BindGroup)>,
}

impl GpuKernels {
    fn prepare_pipeline(&mut self, device: &wgpu::Device, stage: u32, workgroup_size: u32) {
        if self.pipelines.contains_key(&(stage, workgroup_size)) {
            return;
        }
        let label = format!("{}_{}", self.program.name(), stage);
        let constants = HashMap::from([("workgroup_size".to_owned(), workgroup_size as f64)]);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&self.pipeline_layout),
            module: &self.module,
            entry_point: Some(self.program.entry_points()[stage as usize]),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                zero_initialize_workgroup_memory: false,
            },
            cache: None,
        });
        self.pipelines.insert((stage, workgroup_size), pipeline);
    }

    /// Rebuilt whenever the binding table changed since the last dispatch.
    fn prepare_bind_group(
        &mut self,
        device: &wgpu::Device,
        table: &BindingTable<Buffer>,
        faults: &Buffer,
    ) -> Result<()> {
        let fresh = self
            .bind_group
            .as_ref()
            .is_some_and(|(revision, _)| *revision == table.revision());
        if fresh {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(storage_bindings(self.program).len() + 2);
        for &point in storage_bindings(self.program) {
            let buffer = table.get(point).ok_or_else(|| SolverError::UnboundBinding {
                program: self.program.name().into(),
                binding: point,
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: point,
                resource: buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: UNIFORMS,
            resource: self.uniforms.as_entire_binding(),
        });
        if self.program == ProgramKind::Solver {
            entries.push(wgpu::BindGroupEntry {
                binding: FAULTS,
                resource: faults.as_entire_binding(),
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.program.name()),
            layout: &self.layout,
            entries: &entries,
        });
        debug!("{}: bind group rebuilt", self.program.name());
        self.bind_group = Some((table.revision(), bind_group));
        Ok(())
    }
}

fn layout_entry(binding: BindingPoint, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl ComputeDevice for GpuDevice {
    type Buffer = Buffer;
    type Kernels = GpuKernels;

    fn create_buffer(&mut self, label: &str, size: u64) -> Result<Buffer> {
        let max = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > max {
            return Err(SolverError::Device(format!(
                "`{label}` needs {size} bytes, storage bindings are limited to {max}"
            )));
        }
        Ok(self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }))
    }

    fn destroy_buffer(&mut self, buffer: &Buffer) {
        buffer.destroy();
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > buffer.size() {
            return Err(SolverError::Device(format!(
                "write of {} bytes at {} overruns a buffer of {} bytes",
                data.len(),
                offset,
                buffer.size()
            )));
        }
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &Buffer, size: u64) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        // copies have to be 4 byte aligned
        let padded = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if padded > buffer.size() {
            return Err(SolverError::Readback(format!(
                "{size} bytes requested from a buffer of {} bytes",
                buffer.size()
            )));
        }
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("readback_staging"),
            size: padded,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, padded);
        self.queue.submit([encoder.finish()]);

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SolverError::Readback(err.to_string())),
            Err(_) => return Err(SolverError::Readback("map callback dropped".into())),
        }

        let mut bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        staging.destroy();
        bytes.truncate(size as usize);
        Ok(bytes)
    }

    fn load_kernels(&mut self, program: ProgramKind) -> Result<GpuKernels> {
        let uniform_size = crate::device::UniformSet::default()
            .pack(program.uniform_layout())
            .len() as u64;

        let (kernels, err) = self.scoped(|device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(program.name()),
                source: wgpu::ShaderSource::Wgsl(source(program).into()),
            });

            let mut entries: Vec<_> = storage_bindings(program)
                .iter()
                .map(|&point| {
                    layout_entry(point, wgpu::BufferBindingType::Storage { read_only: false })
                })
                .collect();
            entries.push(layout_entry(UNIFORMS, wgpu::BufferBindingType::Uniform));
            if program == ProgramKind::Solver {
                entries.push(layout_entry(
                    FAULTS,
                    wgpu::BufferBindingType::Storage { read_only: false },
                ));
            }
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(program.name()),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(program.name()),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("uniforms"),
                size: uniform_size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            GpuKernels {
                program,
                module,
                layout,
                pipeline_layout,
                pipelines: HashMap::new(),
                uniforms,
                uniform_revision: None,
                bind_group: None,
            }
        });
        match err {
            Some(err) => Err(SolverError::KernelCompilation {
                program: program.name().into(),
                message: err.to_string(),
            }),
            None => Ok(kernels),
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch<'_, Self>) -> Result<()> {
        let kernels = dispatch.kernels;
        if kernels.uniform_revision != Some(dispatch.uniforms.revision()) {
            let bytes = dispatch.uniforms.pack(dispatch.program.uniform_layout());
            self.queue.write_buffer(&kernels.uniforms, 0, &bytes);
            kernels.uniform_revision = Some(dispatch.uniforms.revision());
        }

        let queue = self.queue.clone();
        let faults = &self.faults;
        let (submitted, err) = self.scoped(|device| -> Result<()> {
            kernels.prepare_bind_group(device, dispatch.bindings, faults)?;
            kernels.prepare_pipeline(device, dispatch.stage, dispatch.workgroup_size);
            let (Some((_, bind_group)), Some(pipeline)) = (
                &kernels.bind_group,
                kernels.pipelines.get(&(dispatch.stage, dispatch.workgroup_size)),
            ) else {
                return Err(SolverError::Device("pipeline state missing".into()));
            };

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(dispatch.program.name()),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(dispatch.program.name()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(dispatch.workgroups, 1, 1);
            }
            queue.submit([encoder.finish()]);
            Ok(())
        });
        submitted?;

        if let Some(err) = err {
            warn!(
                "{} stage {} rejected: {}",
                dispatch.program.name(),
                dispatch.stage,
                err
            );
            self.fault.get_or_insert(SolverError::KernelFault {
                program: dispatch.program.name().into(),
                stage: dispatch.stage,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    /// Validation errors first, then the kernel fault counters. Reading the
    /// counters waits for every dispatch issued so far; they are zeroed after.
    fn check_errors(&mut self) -> Result<()> {
        let faults = self.faults.clone();
        let bytes = self.read_buffer(&faults, FAULT_BYTES)?;
        let mut counters = [0u32; FAULT_WORDS];
        bytemuck::cast_slice_mut::<u32, u8>(&mut counters).copy_from_slice(&bytes);
        let counted = fault_from_counters(counters);
        if counted.is_some() {
            self.queue.write_buffer(&faults, 0, &[0u8; FAULT_BYTES as usize]);
        }

        match self.fault.take().or(counted) {
            Some(err) => {
                warn!("{err}");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_needs_one_storage_buffer_beyond_the_particle_set() {
        assert_eq!(REQUIRED_STORAGE_BUFFERS, 15);
        assert!(!binding::SOLVER.contains(&FAULTS));
        assert_ne!(FAULTS, UNIFORMS);
    }

    #[test]
    fn zero_counters_are_not_a_fault() {
        assert_eq!(fault_from_counters([0, 0]), None);
    }

    #[test]
    fn scatter_overflow_is_reported_against_scatter() {
        assert!(matches!(
            fault_from_counters([0, 3]),
            Some(SolverError::KernelFault { stage: 1, ref message, .. }) if message.starts_with("3 ")
        ));
    }

    #[test]
    fn out_of_grid_bucket_wins_over_overflow() {
        assert!(matches!(
            fault_from_counters([2, 5]),
            Some(SolverError::KernelFault { stage: 0, .. })
        ));
    }
}
