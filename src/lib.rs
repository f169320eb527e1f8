use std::sync::Arc;

use anyhow::Context;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;
use winit::{
    event::WindowEvent,
    event_loop::{ControlFlow, EventLoop, EventLoopProxy},
    window::{Window, WindowAttributes},
};

use crate::{
    driver::{CancelToken, FrameDriver, RedrawTimer, Schedule, Scheduler, TickOutcome, Wake},
    gpu::{GpuLifeRenderer, ShaderSources},
    sim::SimulationParameters,
};

pub mod driver;
pub mod error;
pub mod gpu;
pub mod rendering;
pub mod sim;
pub mod util;

/// Id of the canvas element the browser build draws into.
pub const CANVAS_ID: &str = "gpulife-surface";

/// How often the per-tick progress line is logged.
const PROGRESS_LOG_EVERY: u64 = 64;

/// Install the `fern` logger at `level`. Repeat calls are ignored.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging(level: log::LevelFilter) {
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();
}

/// Install the `fern` logger at `level`, writing to the browser console.
#[cfg(target_arch = "wasm32")]
pub fn init_logging(level: log::LevelFilter) {
    console_error_panic_hook::set_once();
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(fern::Output::call(console_log::log))
        .apply();
}

/// Message type for GPU renderer events
pub enum GpuMessage {
    Initialized(GpuLifeRenderer),
    Error(String),
}

struct Application {
    proxy: Option<EventLoopProxy<GpuMessage>>,
    driver: Option<FrameDriver<GpuLifeRenderer>>,
    scheduler: Scheduler,
    parameters: SimulationParameters,
    shaders: ShaderSources,
    redraw_timer: RedrawTimer,
    /// First fatal error; reported once the event loop returns.
    failure: Option<anyhow::Error>,
}

impl Application {
    fn new(event_loop: &EventLoop<GpuMessage>, parameters: SimulationParameters) -> Self {
        Self {
            proxy: Some(event_loop.create_proxy()),
            driver: None,
            scheduler: Scheduler::from_parameters(&parameters, CancelToken::new()),
            parameters,
            shaders: ShaderSources::default(),
            redraw_timer: RedrawTimer::default(),
            failure: None,
        }
    }

    fn fail(&mut self, event_loop: &winit::event_loop::ActiveEventLoop, error: anyhow::Error) {
        log::error!("{error:#}");
        self.scheduler.cancel_token().cancel();
        self.redraw_timer.disarm();
        self.driver = None;
        self.failure.get_or_insert(error);
        event_loop.exit();
    }

    #[cfg(target_arch = "wasm32")]
    fn window_attributes(&self) -> anyhow::Result<WindowAttributes> {
        use winit::platform::web::WindowAttributesExtWebSys;

        let dom_window = web_sys::window().context("no global window")?;
        let canvas: web_sys::HtmlCanvasElement = dom_window
            .document()
            .context("no document")?
            .get_element_by_id(CANVAS_ID)
            .with_context(|| format!("no element with id `{CANVAS_ID}`"))?
            .dyn_into()
            .map_err(|_| anyhow::anyhow!("`{CANVAS_ID}` is not a canvas"))?;

        // Back the canvas with physical pixels
        let ratio = dom_window.device_pixel_ratio();
        canvas.set_width((canvas.client_width() as f64 * ratio).round().max(1.0) as u32);
        canvas.set_height((canvas.client_height() as f64 * ratio).round().max(1.0) as u32);

        Ok(WindowAttributes::default().with_canvas(Some(canvas)))
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn window_attributes(&self) -> anyhow::Result<WindowAttributes> {
        Ok(WindowAttributes::default().with_title(format!(
            "gpulife {}x{}",
            self.parameters.width, self.parameters.height
        )))
    }

    fn create_window(
        &self,
        event_loop: &winit::event_loop::ActiveEventLoop,
    ) -> anyhow::Result<Arc<Window>> {
        let window = event_loop
            .create_window(self.window_attributes()?)
            .context("failed to create window")?;
        Ok(Arc::new(window))
    }

    /// Tick if one is due. A presented tick is paced by vsync and redraws
    /// straight away; otherwise the loop sleeps until the next tick is due.
    fn on_redraw(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };

        let now = util::monotonic_now();
        match self.scheduler.poll(now) {
            Schedule::Tick => {
                let outcome = match driver.tick() {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let step = driver.step();
                        let e = anyhow::Error::new(e);
                        self.fail(event_loop, e.context(format!("tick failed after step {step}")));
                        return;
                    }
                };
                self.scheduler.record(outcome);
                if let TickOutcome::Presented { step } = outcome {
                    if step % PROGRESS_LOG_EVERY == 0 {
                        log::debug!("step {step}");
                    }
                }
                driver.backend().request_redraw();
            }
            Schedule::Wait(wait) => self.redraw_timer.arm(now, wait),
            Schedule::Cancelled => {
                log::info!("Simulation finished after {} steps", driver.step());
                event_loop.exit();
            }
        }
    }
}

impl winit::application::ApplicationHandler<GpuMessage> for Application {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        let Some(proxy) = self.proxy.take() else {
            return;
        };

        let window = match self.create_window(event_loop) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, e),
        };

        let parameters = self.parameters.clone();
        let shaders = self.shaders.clone();

        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(async move {
            let message = match GpuLifeRenderer::new(window, &parameters, &shaders).await {
                Ok(renderer) => GpuMessage::Initialized(renderer),
                Err(e) => GpuMessage::Error(e.to_string()),
            };
            let _ = proxy.send_event(message);
        });

        #[cfg(not(target_arch = "wasm32"))]
        {
            // On native, use pollster to block on the future
            let message =
                match pollster::block_on(GpuLifeRenderer::new(window, &parameters, &shaders)) {
                    Ok(renderer) => GpuMessage::Initialized(renderer),
                    Err(e) => GpuMessage::Error(e.to_string()),
                };
            let _ = proxy.send_event(message);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                self.scheduler.cancel_token().cancel();
                self.redraw_timer.disarm();
                self.driver = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(driver) = self.driver.as_mut() {
                    driver.backend_mut().resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.on_redraw(event_loop),
            _ => (),
        }
    }

    fn about_to_wait(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        match self.redraw_timer.poll(util::monotonic_now()) {
            Wake::Redraw => {
                if let Some(driver) = self.driver.as_ref() {
                    driver.backend().request_redraw();
                }
                event_loop.set_control_flow(ControlFlow::Wait);
            }
            Wake::Sleep(wait) => event_loop.set_control_flow(ControlFlow::wait_duration(wait)),
            Wake::Idle => event_loop.set_control_flow(ControlFlow::Wait),
        }
    }

    fn user_event(&mut self, event_loop: &winit::event_loop::ActiveEventLoop, event: GpuMessage) {
        match event {
            GpuMessage::Initialized(renderer) => {
                log::info!("GPU renderer initialized successfully");
                // Request first redraw to kick off the animation loop
                renderer.request_redraw();
                self.driver = Some(FrameDriver::new(renderer));
            }
            GpuMessage::Error(e) => {
                self.fail(
                    event_loop,
                    anyhow::anyhow!(e).context("GPU initialization failed"),
                );
            }
        }
    }
}

/// Open a window (or bind the page canvas) and run the simulation until it
/// is closed, cancelled or fails.
pub fn start(parameters: SimulationParameters) -> anyhow::Result<()> {
    log::info!(
        "Starting {}x{} simulation, one tick every {}",
        parameters.width,
        parameters.height,
        humantime::format_duration(parameters.tick_interval)
    );

    // Fail on bad dimensions before touching the windowing system
    parameters.grid()?;

    let event_loop = EventLoop::<GpuMessage>::with_user_event()
        .build()
        .context("failed to create event loop")?;

    #[allow(unused_mut)]
    let mut app = Application::new(&event_loop, parameters);

    // On web, we need to spawn the event loop
    #[cfg(target_arch = "wasm32")]
    {
        use winit::platform::web::EventLoopExtWebSys;
        event_loop.spawn_app(app);
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        event_loop.run_app(&mut app).context("event loop error")?;
        if let Some(e) = app.failure {
            return Err(e);
        }
    }

    Ok(())
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn initialize() {
    init_logging(SimulationParameters::default().log_level);
}

/// Browser entry point: run with default parameters on the `gpulife-surface` canvas.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = start)]
pub fn start_web() -> Result<(), JsValue> {
    start(SimulationParameters::default()).map_err(|e| JsValue::from_str(&format!("{e:#}")))
}
