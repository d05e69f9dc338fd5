//! Texture-based backend on wgpu.
//!
//! The video frame is uploaded into a persistent texture and drawn through a
//! full-target triangle into an offscreen render target, which is read back
//! for the output sink. Flip, opacity and the cover-fit rectangle travel in
//! a uniform buffer, so nothing is rebuilt per frame. When the composite
//! fragment stage validates on this device the renderer also exposes
//! [`CompositeBinding`] and blends background and mask on the GPU. The mask
//! covers the captured frame, so it is sampled through the frame's
//! cover-fit rectangle too.

use super::{upload_with_fallback, BackendKind, CompositeBinding, FrameRenderer, FrameUploader, RenderInput, UploadOutcome};
use crate::background::BackgroundAsset;
use crate::error::UploadError;
use crate::refine::RefinedMask;
use anyhow::{anyhow, bail, Context, Result};
use image::RgbaImage;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CompositeParams {
    flip: u32,
    opacity: f32,
    has_mask: u32,
    has_background: u32,
    neutral: [f32; 4],
    frame_rect: [f32; 4],
}

/// A sampled texture and its default view.
struct LayerTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
}

impl LayerTexture {
    fn new(
        device: &wgpu::Device,
        label: &str,
        size: (u32, u32),
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            size,
        }
    }

    fn sampled(device: &wgpu::Device, label: &str, size: (u32, u32), format: wgpu::TextureFormat) -> Self {
        Self::new(
            device,
            label,
            size,
            format,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        )
    }

    fn write(&self, queue: &wgpu::Queue, data: &[u8], bytes_per_pixel: u32) {
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.size.0 * bytes_per_pixel),
                rows_per_image: None,
            },
            extent(self.size),
        );
    }
}

fn extent((width, height): (u32, u32)) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Offscreen target plus the buffer it is read back through.
struct Target {
    color: LayerTexture,
    readback: wgpu::Buffer,
    padded_row: u32,
}

impl Target {
    fn new(device: &wgpu::Device, size: (u32, u32)) -> Self {
        let color = LayerTexture::new(
            device,
            "composite_target",
            size,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let padded_row = padded_bytes_per_row(size.0);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("composite_readback"),
            size: padded_row as u64 * size.1 as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            color,
            readback,
            padded_row,
        }
    }
}

fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

/// Cover fit of a `src` texture into a `dst` target as a uv transform:
/// `[scale_x, scale_y, offset_x, offset_y]`.
pub(crate) fn cover_rect(src: (u32, u32), dst: (u32, u32)) -> [f32; 4] {
    let (sw, sh) = (src.0.max(1) as f32, src.1.max(1) as f32);
    let (dw, dh) = (dst.0.max(1) as f32, dst.1.max(1) as f32);
    let s = (dw / sw).max(dh / sh);
    let fx = dw / (sw * s);
    let fy = dh / (sh * s);
    [fx, fy, (1.0 - fx) / 2.0, (1.0 - fy) / 2.0]
}

/// Upload path into the persistent frame texture.
struct FrameUpload<'a> {
    device: &'a wgpu::Device,
    queue: &'a wgpu::Queue,
    texture: &'a LayerTexture,
}

impl FrameUploader for FrameUpload<'_> {
    fn texture_size(&self) -> (u32, u32) {
        self.texture.size
    }

    fn upload(&mut self, frame: &RgbaImage) -> Result<(), UploadError> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return Err(UploadError::EmptyFrame);
        }
        if (w, h) != self.texture.size {
            return Err(UploadError::SizeMismatch {
                expected: self.texture.size,
                actual: (w, h),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.texture.write(self.queue, frame.as_raw(), 4);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(UploadError::Device(e.to_string())),
            None => Ok(()),
        }
    }
}

struct BoundMask {
    mask: Rc<RefinedMask>,
    texture: LayerTexture,
}

struct BoundBackground {
    generation: u64,
    texture: LayerTexture,
}

/// Everything that lives on the device. Dropped as a whole on release.
struct Gpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    frame_pipeline: wgpu::RenderPipeline,
    composite_pipeline: Option<wgpu::RenderPipeline>,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    frame: LayerTexture,
    placeholder_mask: LayerTexture,
    placeholder_background: LayerTexture,
    mask: Option<BoundMask>,
    background: Option<BoundBackground>,
    target: Option<Target>,
}

pub struct AcceleratedRenderer {
    gpu: Option<Gpu>,
    supports_composite: bool,
}

impl AcceleratedRenderer {
    /// Acquire a device and build the pipeline for frames of `frame_size`.
    ///
    /// Fails when no adapter or device is available; callers fall back to
    /// the software renderer.
    pub fn new(frame_size: (u32, u32), output: (u32, u32)) -> Result<Self> {
        if frame_size.0 == 0 || frame_size.1 == 0 || output.0 == 0 || output.1 == 0 {
            bail!("Invalid renderer dimensions {:?} -> {:?}", frame_size, output);
        }
        let mut gpu = pollster::block_on(create_gpu(frame_size))?;
        gpu.target = Some(Target::new(&gpu.device, output));
        let supports_composite = gpu.composite_pipeline.is_some();
        Ok(Self {
            gpu: Some(gpu),
            supports_composite,
        })
    }

    pub fn supports_composite(&self) -> bool {
        self.supports_composite
    }

    /// Make sure the offscreen target matches `output`. Only the target and
    /// its readback buffer are touched.
    fn ensure_configured(gpu: &mut Gpu, output: (u32, u32)) {
        let current = gpu.target.as_ref().map(|t| t.color.size);
        if current != Some(output) {
            debug!(width = output.0, height = output.1, "Reconfiguring render target");
            gpu.target = Some(Target::new(&gpu.device, output));
        }
    }
}

async fn create_gpu(frame_size: (u32, u32)) -> Result<Gpu> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        })
        .await
        .ok_or_else(|| anyhow!("No GPU adapter available"))?;

    let adapter_info = adapter.get_info();
    info!(
        name = %adapter_info.name,
        backend = ?adapter_info.backend,
        "GPU adapter selected"
    );

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("backdrop_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults()
                    .using_resolution(adapter.limits()),
            },
            None,
        )
        .await
        .context("Failed to create GPU device")?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("composite_shader"),
        source: wgpu::ShaderSource::Wgsl(include_str!("composite.wgsl").into()),
    });

    let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("composite_bind_group_layout"),
        entries: &[
            texture_entry(0),
            texture_entry(1),
            texture_entry(2),
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 4,
                visibility: wgpu::ShaderStages::FRAGMENT,
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
        label: Some("composite_pipeline_layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let frame_pipeline = build_pipeline(&device, &pipeline_layout, &shader, "fs_frame");

    if let Some(e) = device.pop_error_scope().await {
        bail!("Frame pipeline rejected by device: {}", e);
    }

    // The blending stage is optional: without it frames are still drawn.
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let composite = build_pipeline(&device, &pipeline_layout, &shader, "fs_composite");
    let composite_pipeline = match device.pop_error_scope().await {
        None => Some(composite),
        Some(e) => {
            warn!("Composite stage unavailable, drawing frames only: {}", e);
            None
        }
    };

    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("composite_sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    });

    let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("composite_uniforms"),
        size: std::mem::size_of::<CompositeParams>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let frame = LayerTexture::sampled(&device, "frame_texture", frame_size, wgpu::TextureFormat::Rgba8Unorm);
    let placeholder_mask = LayerTexture::sampled(&device, "mask_placeholder", (1, 1), wgpu::TextureFormat::R8Unorm);
    placeholder_mask.write(&queue, &[0], 1);
    let placeholder_background =
        LayerTexture::sampled(&device, "background_placeholder", (1, 1), wgpu::TextureFormat::Rgba8Unorm);
    placeholder_background.write(&queue, &[0, 0, 0, 255], 4);

    info!(
        width = frame_size.0,
        height = frame_size.1,
        composite = composite_pipeline.is_some(),
        "Accelerated renderer ready"
    );

    Ok(Gpu {
        device,
        queue,
        layout,
        frame_pipeline,
        composite_pipeline,
        sampler,
        uniforms,
        frame,
        placeholder_mask,
        placeholder_background,
        mask: None,
        background: None,
        target: None,
    })
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    fragment_entry: &str,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(fragment_entry),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: "vs_main",
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: fragment_entry,
            targets: &[Some(wgpu::ColorTargetState {
                format: wgpu::TextureFormat::Rgba8Unorm,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        multiview: None,
    })
}

fn read_target(gpu: &Gpu, target: &Target) -> Result<RgbaImage> {
    let (width, height) = target.color.size;
    let slice = target.readback.slice(..);

    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = gpu.device.poll(wgpu::Maintain::Wait);

    rx.recv()
        .context("Readback callback dropped")?
        .map_err(|e| anyhow!("Failed to map readback buffer: {:?}", e))?;

    let row_bytes = (width * 4) as usize;
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    {
        let data = slice.get_mapped_range();
        for row in data.chunks(target.padded_row as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes]);
        }
    }
    target.readback.unmap();

    RgbaImage::from_raw(width, height, pixels).ok_or_else(|| anyhow!("Readback size mismatch"))
}

impl FrameRenderer for AcceleratedRenderer {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerated
    }

    fn render(&mut self, input: &RenderInput<'_>) -> Result<RgbaImage> {
        let _span = tracing::debug_span!("accelerated_render").entered();
        let gpu = self
            .gpu
            .as_mut()
            .ok_or_else(|| anyhow!("Accelerated renderer already released"))?;
        let (w, h) = input.output;
        if w == 0 || h == 0 {
            bail!("Invalid output dimensions {}x{}", w, h);
        }

        Self::ensure_configured(gpu, input.output);

        let outcome = upload_with_fallback(
            &mut FrameUpload {
                device: &gpu.device,
                queue: &gpu.queue,
                texture: &gpu.frame,
            },
            input.frame,
        );
        if outcome != UploadOutcome::Direct {
            debug!(?outcome, "Frame upload fell back");
        }

        let has_mask = gpu
            .mask
            .as_ref()
            .is_some_and(|m| m.mask.subject_detected);
        let opacity = if has_mask { input.params.opacity.clamp(0.0, 1.0) } else { 0.0 };
        let neutral = input.params.neutral;
        let params = CompositeParams {
            flip: input.params.mirror as u32,
            opacity,
            has_mask: has_mask as u32,
            has_background: gpu.background.is_some() as u32,
            neutral: [
                neutral[0] as f32 / 255.0,
                neutral[1] as f32 / 255.0,
                neutral[2] as f32 / 255.0,
                1.0,
            ],
            frame_rect: cover_rect(gpu.frame.size, input.output),
        };
        gpu.queue
            .write_buffer(&gpu.uniforms, 0, bytemuck::bytes_of(&params));

        let mask_view = gpu
            .mask
            .as_ref()
            .map_or(&gpu.placeholder_mask.view, |m| &m.texture.view);
        let background_view = gpu
            .background
            .as_ref()
            .map_or(&gpu.placeholder_background.view, |b| &b.texture.view);

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("composite_bind_group"),
            layout: &gpu.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&gpu.frame.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(background_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&gpu.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: gpu.uniforms.as_entire_binding(),
                },
            ],
        });

        let target = gpu
            .target
            .as_ref()
            .ok_or_else(|| anyhow!("Render target not configured"))?;
        let pipeline = gpu
            .composite_pipeline
            .as_ref()
            .unwrap_or(&gpu.frame_pipeline);

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("composite_encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("composite_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.color.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.color.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &target.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(target.padded_row),
                    rows_per_image: Some(h),
                },
            },
            extent(target.color.size),
        );

        gpu.queue.submit(std::iter::once(encoder.finish()));

        read_target(gpu, target)
    }

    fn release(&mut self) {
        if self.gpu.take().is_some() {
            info!("Released accelerated renderer");
        }
    }

    fn composite_binding(&mut self) -> Option<&mut dyn CompositeBinding> {
        if self.supports_composite && self.gpu.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl CompositeBinding for AcceleratedRenderer {
    fn bind_background(&mut self, background: Option<&Arc<BackgroundAsset>>) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        let Some(asset) = background else {
            gpu.background = None;
            return;
        };
        if gpu
            .background
            .as_ref()
            .is_some_and(|b| b.generation == asset.generation)
        {
            return;
        }

        let texture = LayerTexture::sampled(
            &gpu.device,
            "background_texture",
            asset.dimensions(),
            wgpu::TextureFormat::Rgba8Unorm,
        );
        texture.write(&gpu.queue, asset.canvas.as_raw(), 4);
        debug!(id = %asset.id, generation = asset.generation, "Bound background texture");
        gpu.background = Some(BoundBackground {
            generation: asset.generation,
            texture,
        });
    }

    fn update_mask(&mut self, mask: Option<&Rc<RefinedMask>>) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        let Some(mask) = mask else {
            gpu.mask = None;
            return;
        };
        if gpu
            .mask
            .as_ref()
            .is_some_and(|m| Rc::ptr_eq(&m.mask, mask))
        {
            return;
        }

        let size = mask.dimensions();
        if size.0 == 0 || size.1 == 0 {
            gpu.mask = None;
            return;
        }
        let texture = match gpu.mask.take() {
            Some(bound) if bound.texture.size == size => bound.texture,
            _ => LayerTexture::sampled(&gpu.device, "mask_texture", size, wgpu::TextureFormat::R8Unorm),
        };
        texture.write(&gpu.queue, mask.alpha.as_raw(), 1);
        gpu.mask = Some(BoundMask {
            mask: Rc::clone(mask),
            texture,
        });
    }
}
