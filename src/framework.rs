use log::{debug, error, info, warn};
use std::sync::Arc;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::error::{FrameError, SetupError};
use crate::frame::{FrameLoop, InputState};
use crate::scene::Scene;
use crate::sim_params::SimParams;

/// Device, queue and the configured window surface.
pub struct Gpu {
    pub surface: wgpu::Surface<'static>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
}

impl Gpu {
    pub async fn init(window: Arc<winit::window::Window>) -> Result<Gpu, SetupError> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let surface = instance.create_surface(window)?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(SetupError::NoAdapter)?;
        let adapter_info = adapter.get_info();
        info!(
            "Using adapter {} ({:?}, driver {} {})",
            adapter_info.name, adapter_info.backend, adapter_info.driver, adapter_info.driver_info
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;
        device.on_uncaptured_error(Box::new(|e| error!("Uncaptured device error: {}", e)));

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| SetupError::Window("surface reports no formats".to_string()))?;
        // Frames are only capturable when the surface can be a copy source.
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if caps.usages.contains(wgpu::TextureUsages::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        } else {
            warn!("Surface cannot be copied from; screenshots are disabled");
        }
        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        info!(
            "Configured {}x{} surface as {:?}",
            config.width, config.height, config.format
        );

        Ok(Gpu {
            surface,
            device,
            queue,
            config,
        })
    }

    pub fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }
}

/// Opens the window, builds the scene and runs frames until the window asks
/// to close. Setup failures return before the first frame.
pub fn run(params: SimParams) -> anyhow::Result<()> {
    params.validate()?;

    let event_loop = EventLoop::new().map_err(|e| SetupError::Window(e.to_string()))?;
    info!("Initializing the window...");
    let window = Arc::new(
        winit::window::WindowBuilder::new()
            .with_title(params.window_title.as_str())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                params.window_width,
                params.window_height,
            ))
            .with_resizable(false)
            .build(&event_loop)
            .map_err(|e| SetupError::Window(e.to_string()))?,
    );

    let gpu = futures::executor::block_on(Gpu::init(window.clone()))?;
    info!("Initializing the scene...");
    let mut scene = Scene::init(gpu, &params)?;
    let mut frame_loop = FrameLoop::new(
        scene.dispatch_grid(),
        params.num_particles,
        params.screenshot_path.clone(),
    );
    let mut input = InputState::default();
    let mut fatal: Option<FrameError> = None;
    let mut last_frame_start = std::time::Instant::now();

    info!("Entering render loop...");
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop
        .run(|event, elwt| match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(code),
                            state,
                            ..
                        },
                    ..
                } => {
                    let pressed = state == ElementState::Pressed;
                    match code {
                        KeyCode::F3 => input.screenshot = pressed,
                        KeyCode::Escape | KeyCode::KeyQ if pressed => elwt.exit(),
                        _ => {}
                    }
                }
                WindowEvent::RedrawRequested => {
                    let cpu_time_start = std::time::Instant::now();
                    match frame_loop.run_frame(&mut scene, &input) {
                        Ok(()) => {
                            let frame_time = last_frame_start.elapsed();
                            last_frame_start = std::time::Instant::now();
                            debug!(
                                "Frame {} time: {:?}, CPU time: {:?}",
                                frame_loop.frame_count(),
                                frame_time,
                                cpu_time_start.elapsed()
                            );
                        }
                        Err(FrameError::SurfaceLost) => {
                            warn!("Surface lost, reconfiguring");
                            scene.reconfigure();
                        }
                        Err(e) if e.is_recoverable() => warn!("Skipping frame: {}", e),
                        Err(e) => {
                            error!("Fatal frame error: {}", e);
                            fatal = Some(e);
                            elwt.exit();
                        }
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.request_redraw(),
            _ => {}
        })
        .map_err(|e| SetupError::Window(e.to_string()))?;

    info!("Rendered {} frames, tearing down", frame_loop.frame_count());
    drop(scene);
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
