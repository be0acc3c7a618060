//! Compute-shader paths for the `wgpu` backend.
//!
//! The GPU context (adapter, device, queue and every compiled pipeline) is
//! created lazily on first use and shared for the life of the process. Each
//! dispatch uploads its operands, runs one compute pass and reads the results
//! back into the host buffers the calling command holds locked, so callers
//! never observe device memory.
//!
//! Validation errors raised by `wgpu` are captured with an error scope and
//! returned as [`Error::Gpu`]; callers fall back to the host kernels.

mod adam;
mod matmul;

pub(crate) use self::adam::adam;
pub(crate) use self::matmul::matmul;

use std::sync::mpsc;

use wgpu::util::DeviceExt;

use crate::error::{Error, Result};

const MATMUL: &str = include_str!("shaders/matmul.wgsl");
const ADAM: &str = include_str!("shaders/adam.wgsl");

/// Maximum workgroups along one dispatch axis.
pub(crate) const MAX_GROUPS_PER_AXIS: u32 = 65_535;

/// A compiled compute pipeline and the layout of its single bind group.
pub(crate) struct ShaderPipeline {
    label: &'static str,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Binding kinds of a shader's bind group, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Uniform,
    Read,
    ReadWrite,
}

impl Slot {
    fn entry(self, binding: u32) -> wgpu::BindGroupLayoutEntry {
        let ty = match self {
            Self::Uniform => wgpu::BufferBindingType::Uniform,
            Self::Read => wgpu::BufferBindingType::Storage { read_only: true },
            Self::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
        };
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
}

/// Holds the wgpu device and queue plus every pipeline the kernels use.
pub(crate) struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pub(crate) matmul: ShaderPipeline,
    pub(crate) adam: ShaderPipeline,
}

fn compile(
    device: &wgpu::Device,
    label: &'static str,
    source: &str,
    slots: &[Slot],
) -> ShaderPipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let entries: Vec<_> = slots
        .iter()
        .zip(0u32..)
        .map(|(slot, binding)| slot.entry(binding))
        .collect();
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });
    ShaderPipeline {
        label,
        layout,
        pipeline,
    }
}

impl GpuContext {
    /// Selects the default adapter, opens a device and compiles every shader.
    fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| Error::Gpu(format!("no adapter: {e}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("gradpipe"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::Gpu(format!("no device: {e}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let matmul = compile(
            &device,
            "matmul",
            MATMUL,
            &[Slot::Uniform, Slot::Read, Slot::Read, Slot::ReadWrite],
        );
        let adam = compile(
            &device,
            "adam",
            ADAM,
            &[
                Slot::Uniform,
                Slot::ReadWrite,
                Slot::Read,
                Slot::ReadWrite,
                Slot::ReadWrite,
            ],
        );
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::Gpu(format!("shader compilation failed: {err}")));
        }

        log::info!("wgpu backend on {}", adapter.get_info().name);
        Ok(Self {
            device,
            queue,
            matmul,
            adam,
        })
    }

    /// Uploads `data` as a storage buffer.
    pub(crate) fn storage(&self, label: &str, data: &[f32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            })
    }

    /// Uploads `params` as a uniform buffer.
    pub(crate) fn uniform<T: bytemuck::Pod>(&self, label: &str, params: &T) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// An uninitialised storage buffer of `len` floats.
    pub(crate) fn output(&self, label: &str, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len * size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Binds `buffers` in order, dispatches `groups` workgroups, waits, and
    /// copies every `(device, host)` pair of `outputs` back to the host.
    pub(crate) fn run(
        &self,
        shader: &ShaderPipeline,
        buffers: &[&wgpu::Buffer],
        groups: (u32, u32, u32),
        outputs: &mut [(&wgpu::Buffer, &mut [f32])],
    ) -> Result<()> {
        let device = &self.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let entries: Vec<_> = buffers
            .iter()
            .zip(0u32..)
            .map(|(buffer, binding)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(shader.label),
            layout: &shader.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(shader.label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(shader.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&shader.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        }

        let staging: Vec<wgpu::Buffer> = outputs
            .iter()
            .map(|(src, host)| {
                let size = (host.len() * size_of::<f32>()) as u64;
                let dst = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(src, 0, &dst, 0, size);
                dst
            })
            .collect();
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        for buffer in &staging {
            let sender = sender.clone();
            buffer
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = sender.send(result);
                });
        }
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Gpu(format!("{}: poll failed: {e}", shader.label)))?;
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::Gpu(format!("{}: {err}", shader.label)));
        }
        for _ in 0..staging.len() {
            receiver
                .try_recv()
                .map_err(|_| Error::Gpu(format!("{}: readback never completed", shader.label)))?
                .map_err(|e| Error::Gpu(format!("{}: readback failed: {e}", shader.label)))?;
        }

        for (buffer, (_, host)) in staging.iter().zip(outputs.iter_mut()) {
            {
                let view = buffer.slice(..).get_mapped_range();
                let data: &[f32] = bytemuck::try_cast_slice(&view)
                    .map_err(|e| Error::Gpu(format!("{}: {e}", shader.label)))?;
                host.copy_from_slice(data);
            }
            buffer.unmap();
        }
        Ok(())
    }
}

/// Splits `groups` workgroups over two axes so neither exceeds the limit.
pub(crate) fn spread_groups(groups: u32) -> (u32, u32) {
    if groups <= MAX_GROUPS_PER_AXIS {
        (groups, 1)
    } else {
        (MAX_GROUPS_PER_AXIS, groups.div_ceil(MAX_GROUPS_PER_AXIS))
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: std::result::Result<GpuContext, String> =
        GpuContext::new().map_err(|e| e.to_string());
}

/// The process-wide GPU context, initialised on first call.
///
/// # Errors
/// Returns [`Error::Gpu`] if no adapter or device is available or a shader
/// fails to compile. The failure is remembered; later calls fail fast.
pub(crate) fn context() -> Result<&'static GpuContext> {
    GPU_CONTEXT.as_ref().map_err(|e| Error::Gpu(e.clone()))
}

/// Converts an extent to the `u32` shaders index with.
pub(crate) fn to_u32(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Gpu(format!("{what} {n} exceeds u32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_stay_under_axis_limit() {
        assert_eq!(spread_groups(10), (10, 1));
        let (x, y) = spread_groups(200_000);
        assert!(x <= MAX_GROUPS_PER_AXIS && y <= MAX_GROUPS_PER_AXIS);
        assert!(x * y >= 200_000);
    }
}
