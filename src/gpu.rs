//! Integrated GPU context that manages both compute simulation and rendering
//!
//! `LifeResources` owns everything the two passes share: the grid uniform,
//! both cell state buffers, the neighbour-count buffer, one bind group
//! layout and the two precomputed binding sets. `GpuLifeRenderer` adds a
//! surface and the cell render pipeline on top.

use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};

use bytemuck::{Pod, Zeroable};
use wgpu::{
    Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, BufferUsages, CommandEncoder, CommandEncoderDescriptor,
    ComputePipeline, Device, FragmentState, Instance, LoadOp, MultisampleState, Operations,
    PipelineLayout, PipelineLayoutDescriptor, PrimitiveState, Queue, RenderPassColorAttachment,
    RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor, ShaderStages, StoreOp, Surface,
    SurfaceConfiguration, SurfaceTexture, TextureUsages, TextureView, TextureViewDescriptor,
    VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::{
    driver::{BINDING_SETS, BindingSet, TickBackend},
    error::{LifeError, ResourceError, SubmissionError},
    rendering::{CLEAR_COLOR, QUAD_VERTICES, VERTICES_PER_CELL},
    sim::{GridDescriptor, InitialState, SimulationParameters},
};

pub const COMPUTE_ENTRY_POINT: &str = "compute_main";
pub const VERTEX_ENTRY_POINT: &str = "vertex_main";
pub const FRAGMENT_ENTRY_POINT: &str = "fragment_main";

/// WGSL for the simulation kernel and the cell renderer.
///
/// Both are passed to the device untouched. Any replacement must use the
/// bind group layout described on [`LifeResources`] and the entry points
/// `compute_main`, `vertex_main` and `fragment_main`.
#[derive(Clone, Debug)]
pub struct ShaderSources {
    pub simulation: Cow<'static, str>,
    pub cells: Cow<'static, str>,
}

impl Default for ShaderSources {
    fn default() -> Self {
        Self {
            simulation: Cow::Borrowed(include_str!("./sim/shader.wgsl")),
            cells: Cow::Borrowed(include_str!("./rendering/render.wgsl")),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GridUniform {
    width: u32,
    height: u32,
}

/// Request an adapter (compatible with `surface` if given) that supports
/// compute shaders, and a device from it.
pub async fn request_device(
    instance: &Instance,
    surface: Option<&Surface<'_>>,
) -> Result<(Adapter, Device, Queue), ResourceError> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: surface,
        })
        .await?;

    log::info!("Using adapter: {:?}", adapter.get_info());

    let downlevel_caps = adapter.get_downlevel_capabilities();
    if !downlevel_caps
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
    {
        return Err(ResourceError::MissingComputeSupport);
    }

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("gpulife device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
        })
        .await?;

    Ok((adapter, device, queue))
}

/// Records a device-lost notification so the next submission can report it.
#[derive(Clone, Default)]
pub(crate) struct DeviceLostFlag(Arc<Mutex<Option<String>>>);

impl DeviceLostFlag {
    pub(crate) fn watch(device: &Device) -> Self {
        let flag = Self::default();
        let slot = flag.0.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({reason:?}): {message}");
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(format!("{reason:?}: {message}"));
            }
        });
        flag
    }

    pub(crate) fn check(&self) -> Result<(), SubmissionError> {
        match self.0.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(message) => Err(SubmissionError::DeviceLost(message.clone())),
                None => Ok(()),
            },
            Err(_) => Err(SubmissionError::DeviceLost(
                "device-lost callback panicked".into(),
            )),
        }
    }
}

fn storage_entry(binding: u32, visibility: ShaderStages, read_only: bool) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Buffers, binding sets and the compute pipeline shared by the headless
/// compute context and the renderer.
///
/// Bind group layout (group 0):
/// - 0: grid size uniform, `vec2<u32>`
/// - 1: cell state read this tick, read-only storage
/// - 2: cell state written this tick, storage
/// - 3: neighbour counts, storage
pub(crate) struct LifeResources {
    pub grid: GridDescriptor,
    pub states: [Buffer; 2],
    pub metrics: Buffer,
    pub pipeline_layout: PipelineLayout,
    pub binding_sets: [BindGroup; 2],
    pub compute_pipeline: ComputePipeline,
}

impl LifeResources {
    pub async fn create(
        device: &Device,
        initial: &InitialState,
        simulation_shader: &str,
    ) -> Result<Self, LifeError> {
        let grid = initial.grid();
        grid.check_limits(&device.limits())?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let resources = Self::build(device, grid, initial, simulation_shader);
        if let Some(source) = device.pop_error_scope().await {
            return Err(ResourceError::Validation {
                stage: "simulation resources",
                source,
            }
            .into());
        }
        Ok(resources)
    }

    fn build(
        device: &Device,
        grid: GridDescriptor,
        initial: &InitialState,
        simulation_shader: &str,
    ) -> Self {
        let grid_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("grid uniforms"),
            contents: bytemuck::bytes_of(&GridUniform {
                width: grid.width(),
                height: grid.height(),
            }),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });

        let state_usage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        let states = [
            device.create_buffer_init(&BufferInitDescriptor {
                label: Some("cell state A"),
                contents: bytemuck::cast_slice(&initial.primary.cells),
                usage: state_usage,
            }),
            device.create_buffer_init(&BufferInitDescriptor {
                label: Some("cell state B"),
                contents: bytemuck::cast_slice(&initial.secondary.cells),
                usage: state_usage,
            }),
        ];

        let metrics = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("neighbor counts"),
            contents: bytemuck::cast_slice(&initial.metrics),
            usage: state_usage,
        });

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("cell bind group layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::VERTEX
                        | ShaderStages::COMPUTE
                        | ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, ShaderStages::VERTEX | ShaderStages::COMPUTE, true),
                storage_entry(2, ShaderStages::COMPUTE, false),
                storage_entry(3, ShaderStages::COMPUTE | ShaderStages::FRAGMENT, false),
            ],
        });

        let binding_sets = BINDING_SETS.map(|set| {
            device.create_bind_group(&BindGroupDescriptor {
                label: Some(if set.index == 0 {
                    "cell bind group A"
                } else {
                    "cell bind group B"
                }),
                layout: &bind_group_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: grid_buf.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: states[set.read].as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: states[set.write].as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 3,
                        resource: metrics.as_entire_binding(),
                    },
                ],
            })
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("cell pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("simulation compute shader"),
            source: wgpu::ShaderSource::Wgsl(simulation_shader.into()),
        });

        let compute_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("simulation compute pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(COMPUTE_ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            grid,
            states,
            metrics,
            pipeline_layout,
            binding_sets,
            compute_pipeline,
        }
    }

    /// Record one simulation step over the whole grid, one workgroup per tile.
    pub fn encode_compute(&self, encoder: &mut CommandEncoder, bindings: &BindingSet) {
        let (tiles_x, tiles_y) = self.grid.tiles();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("simulation step compute pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.compute_pipeline);
        pass.set_bind_group(0, &self.binding_sets[bindings.index], &[]);
        pass.dispatch_workgroups(tiles_x, tiles_y, 1);
    }
}

/// The cell render pipeline and its quad, drawn with the binding sets of a
/// [`LifeResources`]. Target format is up to the caller: the surface format
/// on screen, a plain texture when rendering offscreen.
pub(crate) struct CellRenderer {
    pipeline: RenderPipeline,
    vertex_buffer: Buffer,
}

impl CellRenderer {
    pub async fn create(
        device: &Device,
        resources: &LifeResources,
        format: wgpu::TextureFormat,
        cell_shader: &str,
    ) -> Result<Self, LifeError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let renderer = Self::build(device, resources, format, cell_shader);
        if let Some(source) = device.pop_error_scope().await {
            return Err(ResourceError::Validation {
                stage: "cell render pipeline",
                source,
            }
            .into());
        }
        Ok(renderer)
    }

    fn build(
        device: &Device,
        resources: &LifeResources,
        format: wgpu::TextureFormat,
        cell_shader: &str,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cell shader"),
            source: wgpu::ShaderSource::Wgsl(cell_shader.into()),
        });

        let vertex_buffer = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("cell vertices"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("cell render pipeline"),
            layout: Some(&resources.pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some(VERTEX_ENTRY_POINT),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some(FRAGMENT_ENTRY_POINT),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            vertex_buffer,
        }
    }

    /// Clear `view` and draw one instance per cell from `bindings.read`.
    pub fn encode(
        &self,
        encoder: &mut CommandEncoder,
        view: &TextureView,
        resources: &LifeResources,
        bindings: &BindingSet,
    ) {
        let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("cell render pass"),
            color_attachments: &[Some(RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: Operations {
                    load: LoadOp::Clear(CLEAR_COLOR.into()),
                    store: StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        render_pass.set_bind_group(0, &resources.binding_sets[bindings.index], &[]);
        render_pass.draw(0..VERTICES_PER_CELL, 0..resources.grid.cell_count() as u32);
    }
}

/// Integrated GPU context for simulation and rendering
///
/// This struct manages:
/// - Shared GPU device and queue
/// - Simulation buffers and both binding sets
/// - Render pipeline and surface
pub struct GpuLifeRenderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Device,
    queue: Queue,
    resources: LifeResources,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    cells: CellRenderer,
    device_lost: DeviceLostFlag,
    window: Arc<Window>,
}

/// Work recorded for one tick, submitted by [`TickBackend::present`].
pub struct GpuFrame {
    output: SurfaceTexture,
    view: TextureView,
    encoder: CommandEncoder,
}

impl GpuLifeRenderer {
    /// Create the device, all simulation resources and the render pipeline.
    ///
    /// # Arguments
    /// * `window` - The window to render to
    /// * `parameters` - Grid size and seed policies
    /// * `shaders` - Kernel and renderer source
    pub async fn new(
        window: Arc<Window>,
        parameters: &SimulationParameters,
        shaders: &ShaderSources,
    ) -> Result<Self, LifeError> {
        let initial = parameters.initial_state()?;

        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find compatible adapter
        let surface = instance
            .create_surface(window.clone())
            .map_err(ResourceError::from)?;
        let (adapter, device, queue) = request_device(&instance, Some(&surface)).await?;
        let device_lost = DeviceLostFlag::watch(&device);

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or(surface_caps.formats.first())
            .copied()
            .ok_or(ResourceError::UnsupportedSurface)?;
        let alpha_mode = if surface_caps
            .alpha_modes
            .contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            wgpu::CompositeAlphaMode::Auto
        };

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let resources = LifeResources::create(&device, &initial, &shaders.simulation).await?;
        let cells =
            CellRenderer::create(&device, &resources, surface_format, &shaders.cells).await?;

        log::info!(
            "Initialized {}x{} grid ({} tiles), surface {}x{} {:?}",
            resources.grid.width(),
            resources.grid.height(),
            resources.grid.tile_count(),
            surface_config.width,
            surface_config.height,
            surface_format
        );

        Ok(Self {
            instance,
            device,
            queue,
            resources,
            surface,
            surface_config,
            cells,
            device_lost,
            window,
        })
    }

    /// Request a redraw of the window
    /// Call this after rendering to keep the animation loop going
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Get window reference
    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn grid(&self) -> GridDescriptor {
        self.resources.grid
    }

    /// Resize the render surface
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }
}

impl TickBackend for GpuLifeRenderer {
    type Frame = GpuFrame;

    fn acquire_frame(&mut self) -> Result<Option<GpuFrame>, LifeError> {
        self.device_lost.check()?;

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("Surface acquisition timed out, skipping tick");
                return Ok(None);
            }
            Err(e @ (wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost)) => {
                log::warn!("Surface {e}, reconfiguring and skipping tick");
                self.surface.configure(&self.device, &self.surface_config);
                return Ok(None);
            }
            Err(e) => return Err(SubmissionError::Surface(e).into()),
        };
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());
        let encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("compute and render encoder"),
            });

        Ok(Some(GpuFrame {
            output,
            view,
            encoder,
        }))
    }

    fn dispatch(&mut self, frame: &mut GpuFrame, bindings: &BindingSet) {
        self.resources.encode_compute(&mut frame.encoder, bindings);
    }

    fn draw(&mut self, frame: &mut GpuFrame, bindings: &BindingSet) {
        self.cells.encode(&mut frame.encoder, &frame.view, &self.resources, bindings);
    }

    fn present(&mut self, frame: GpuFrame) -> Result<(), LifeError> {
        self.queue.submit(std::iter::once(frame.encoder.finish()));
        self.device_lost.check()?;
        frame.output.present();
        Ok(())
    }
}
