//! Headless compute context: the simulation kernel without a surface.
//!
//! Shares [`LifeResources`] with the windowed renderer, so the buffers,
//! binding sets and dispatch are exactly the ones used on screen.

use std::borrow::Cow;

use wgpu::{
    Buffer, BufferDescriptor, BufferUsages, CommandEncoder, CommandEncoderDescriptor, Device,
    Queue, TextureUsages,
};

use crate::{
    driver::{BindingSet, TickBackend, binding_set},
    error::{ConfigError, LifeError, ResourceError},
    gpu::{CellRenderer, DeviceLostFlag, LifeResources, ShaderSources, request_device},
    sim::{GridDescriptor, InitialState, SimulationFrame, SimulationParameters},
};

/// Format used by [`ComputeContext::render_image`].
pub const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// RGBA8 pixels of an offscreen render, row-major from the top-left corner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[u8; 4]>,
}

impl RenderedImage {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

pub struct ComputeContext {
    device: Device,
    queue: Queue,
    resources: LifeResources,
    cell_shader: Cow<'static, str>,
    device_lost: DeviceLostFlag,
    /// Steps submitted so far, by either [`ComputeContext::compute_step`] or a driver.
    step: u64,
}

impl ComputeContext {
    /// Seed from `parameters` and upload to a freshly requested device.
    pub async fn create(
        parameters: &SimulationParameters,
        shaders: &ShaderSources,
    ) -> Result<Self, LifeError> {
        Self::with_initial_state(&parameters.initial_state()?, shaders).await
    }

    pub async fn with_initial_state(
        initial: &InitialState,
        shaders: &ShaderSources,
    ) -> Result<Self, LifeError> {
        initial.validate()?;
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let (_adapter, device, queue) = request_device(&instance, None).await?;
        let device_lost = DeviceLostFlag::watch(&device);
        let resources = LifeResources::create(&device, initial, &shaders.simulation).await?;
        log::debug!(
            "Headless compute context ready for a {}x{} grid",
            resources.grid.width(),
            resources.grid.height()
        );
        Ok(Self {
            device,
            queue,
            resources,
            cell_shader: shaders.cells.clone(),
            device_lost,
            step: 0,
        })
    }

    pub fn grid(&self) -> GridDescriptor {
        self.resources.grid
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Buffer holding the latest generation after `step` steps.
    pub fn current(&self) -> usize {
        binding_set(self.step).read
    }

    /// Submit one simulation step on its own.
    pub fn compute_step(&mut self) -> Result<(), LifeError> {
        self.device_lost.check()?;
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("simulation step encoder"),
            });
        self.resources
            .encode_compute(&mut encoder, binding_set(self.step));
        self.queue.submit(std::iter::once(encoder.finish()));
        self.step += 1;
        Ok(())
    }

    fn state_buffer(&self, buffer: usize) -> Result<&Buffer, ConfigError> {
        self.resources
            .states
            .get(buffer)
            .ok_or(ConfigError::NoSuchBuffer(buffer))
    }

    /// Overwrite state buffer `buffer` (0 = A, 1 = B).
    pub fn write_state(&self, buffer: usize, frame: &SimulationFrame) -> Result<(), ConfigError> {
        let grid = self.resources.grid;
        grid.check_same("uploaded frame", frame.grid)?;
        grid.check_len("uploaded frame", frame.cells.len())?;
        self.queue.write_buffer(
            self.state_buffer(buffer)?,
            0,
            bytemuck::cast_slice(&frame.cells),
        );
        Ok(())
    }

    /// Copy state buffer `buffer` back to the host.
    pub async fn read_state(&self, buffer: usize) -> Result<SimulationFrame, LifeError> {
        let src = self.state_buffer(buffer)?;
        let cells = self.read_buffer(src).await?;
        Ok(SimulationFrame {
            grid: self.resources.grid,
            cells,
        })
    }

    pub async fn read_metrics(&self) -> Result<Vec<u32>, LifeError> {
        self.read_buffer(&self.resources.metrics).await
    }

    async fn read_buffer(&self, src: &Buffer) -> Result<Vec<u32>, LifeError> {
        let staging = self.staging_buffer("state readback buffer", src.size());
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, None);
        self.queue.submit(std::iter::once(encoder.finish()));

        let bytes = self.map_read(&staging).await?;
        Ok(bytemuck::cast_slice::<u8, u32>(&bytes).to_vec())
    }

    /// Draw the latest generation into a `width` x `height` texture with the
    /// cell render pipeline and read the pixels back.
    pub async fn render_image(&self, width: u32, height: u32) -> Result<RenderedImage, LifeError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroDimension { width, height }.into());
        }
        self.device_lost.check()?;

        let cells = CellRenderer::create(
            &self.device,
            &self.resources,
            OFFSCREEN_FORMAT,
            &self.cell_shader,
        )
        .await?;

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen cell target"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        // Rows in a texture copy are padded to the copy alignment
        let row_bytes = width * 4;
        let padded_row_bytes = row_bytes.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let staging = self.staging_buffer(
            "offscreen readback buffer",
            padded_row_bytes as u64 * height as u64,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("offscreen render encoder"),
            });
        cells.encode(
            &mut encoder,
            &view,
            &self.resources,
            binding_set(self.step),
        );
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            extent,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let bytes = self.map_read(&staging).await?;
        let pixels = bytes
            .chunks_exact(padded_row_bytes as usize)
            .flat_map(|row| bytemuck::cast_slice::<u8, [u8; 4]>(&row[..row_bytes as usize]))
            .copied()
            .collect();
        Ok(RenderedImage {
            width,
            height,
            pixels,
        })
    }

    fn staging_buffer(&self, label: &'static str, size: u64) -> Buffer {
        self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Wait for all submitted work, then map `staging` and copy it out.
    async fn map_read(&self, staging: &Buffer) -> Result<Vec<u8>, LifeError> {
        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // Receiver dropped means the caller gave up.
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        rx.receive()
            .await
            .ok_or(ResourceError::ReadbackCancelled)?
            .map_err(ResourceError::from)?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

/// Lets the headless context run under a [`crate::driver::FrameDriver`].
/// Drawing is a no-op; each tick is one submitted compute pass.
impl TickBackend for ComputeContext {
    type Frame = CommandEncoder;

    fn acquire_frame(&mut self) -> Result<Option<CommandEncoder>, LifeError> {
        self.device_lost.check()?;
        Ok(Some(self.device.create_command_encoder(
            &CommandEncoderDescriptor {
                label: Some("headless tick encoder"),
            },
        )))
    }

    fn dispatch(&mut self, encoder: &mut CommandEncoder, bindings: &BindingSet) {
        self.resources.encode_compute(encoder, bindings);
    }

    fn draw(&mut self, _encoder: &mut CommandEncoder, _bindings: &BindingSet) {}

    fn present(&mut self, encoder: CommandEncoder) -> Result<(), LifeError> {
        self.queue.submit(std::iter::once(encoder.finish()));
        self.step += 1;
        self.device_lost.check()?;
        Ok(())
    }
}
