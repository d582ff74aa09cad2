use ndarray::{Array3, ArrayView3};
use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use wgpu::{PollType, util::DeviceExt};

use crate::interpolator::{ResampleError, SampleMesh, TrilinearInterpolator};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIMENSION: u32 = 65_535;

/// Device and queue handed over by a caller that already owns a wgpu context.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// Trilinear resampling in a compute shader.
pub struct GpuInterpolator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    source_x: u32,
    source_y: u32,
    source_z: u32,
    target_x: u32,
    target_y: u32,
    target_z: u32,
    total: u32,
    _padding: u32,
}

impl GpuInterpolator {
    /// Request the default high-performance adapter and build the pipeline.
    pub async fn new() -> Result<Self, ResampleError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|e| ResampleError::Adapter(e.to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Resampler Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|e| ResampleError::Device(e.to_string()))?;

        Ok(Self::from_context(GpuContext { device, queue }))
    }

    pub fn from_context(context: GpuContext) -> Self {
        let GpuContext { device, queue } = context;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Trilinear Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/trilinear.wgsl"
            ))),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Trilinear Bind Group Layout"),
            entries: &[
                // Source samples
                storage(0, true),
                // Mesh coordinates per axis
                storage(1, true),
                storage(2, true),
                storage(3, true),
                // Output samples
                storage(4, false),
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Trilinear Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Trilinear Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
        }
    }

    fn check_size(&self, elements: usize) -> Result<(), ResampleError> {
        let bytes = (elements * std::mem::size_of::<f32>()) as u64;
        let limits = self.device.limits();
        let limit = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        if bytes > limit {
            return Err(ResampleError::TooLarge { bytes, limit });
        }
        Ok(())
    }

    pub async fn interpolate_async(
        &self,
        source: ArrayView3<'_, f32>,
        mesh: &SampleMesh,
    ) -> Result<Array3<f32>, ResampleError> {
        let (source_x, source_y, source_z) = source.dim();
        let (target_x, target_y, target_z) = mesh.dim();
        let total = mesh.len();
        if total == 0 {
            return Ok(Array3::zeros(mesh.dim()));
        }
        self.check_size(source.len())?;
        self.check_size(total)?;
        let total_u32 = u32::try_from(total).map_err(|_| ResampleError::TooLarge {
            bytes: (total * std::mem::size_of::<f32>()) as u64,
            limit: u64::from(u32::MAX),
        })?;

        let contiguous = source.as_standard_layout();
        let source_slice = contiguous
            .as_slice()
            .ok_or_else(|| ResampleError::Execution("source is not contiguous".to_owned()))?;

        let params = Params {
            source_x: source_x as u32,
            source_y: source_y as u32,
            source_z: source_z as u32,
            target_x: target_x as u32,
            target_y: target_y as u32,
            target_z: target_z as u32,
            total: total_u32,
            _padding: 0,
        };

        let input = |label: &'static str, contents: &[f32]| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(contents),
                    usage: wgpu::BufferUsages::STORAGE,
                })
        };
        let source_buffer = input("Source Buffer", source_slice);
        let mesh_x_buffer = input("Mesh X Buffer", &mesh.x);
        let mesh_y_buffer = input("Mesh Y Buffer", &mesh.y);
        let mesh_z_buffer = input("Mesh Z Buffer", &mesh.z);

        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Uniform Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let output_size = (total * std::mem::size_of::<f32>()) as u64;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Trilinear Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: source_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: mesh_x_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: mesh_y_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: mesh_z_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Trilinear Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Trilinear Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let groups = total_u32.div_ceil(WORKGROUP_SIZE);
            let dispatch_x = groups.min(MAX_GROUPS_PER_DIMENSION);
            let dispatch_y = groups.div_ceil(dispatch_x);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| ResampleError::Execution(e.to_string()))?;
        receiver
            .await
            .map_err(|e| ResampleError::Execution(e.to_string()))?
            .map_err(|e| ResampleError::Execution(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let mapped: &[f32] = bytemuck::cast_slice(&data);
        let samples = mapped.to_vec();
        drop(data);
        staging_buffer.unmap();

        Array3::from_shape_vec(mesh.dim(), samples)
            .map_err(|e| ResampleError::Execution(e.to_string()))
    }
}

impl TrilinearInterpolator for GpuInterpolator {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn interpolate(
        &self,
        source: ArrayView3<'_, f32>,
        mesh: &SampleMesh,
    ) -> Result<Array3<f32>, ResampleError> {
        // Uncaptured wgpu validation errors panic; treat them as a failed run.
        catch_unwind(AssertUnwindSafe(|| {
            futures::executor::block_on(self.interpolate_async(source, mesh))
        }))
        .map_err(|_| ResampleError::Execution("GPU dispatch panicked".to_owned()))?
    }
}
