use log::{debug, error, info};
use std::collections::BTreeMap;
use zerocopy::AsBytes;

use crate::camera::{Camera, UniformWriter};
use crate::error::{FrameError, ScreenshotError, SetupError};
use crate::frame::FrameBackend;
use crate::framework::Gpu;
use crate::particles::{self, DispatchGrid, ParticleBuffers, ParticleState};
use crate::screenshot::{self, Capture, PixelLayout, RowOrigin};
use crate::shader_utils::{self, ShaderProgram, ShaderStage, UniformLocation};
use crate::sim_params::SimParams;

const MAT4_SIZE: wgpu::BufferAddress = std::mem::size_of::<[[f32; 4]; 4]>() as wgpu::BufferAddress;

/// One uniform buffer per matrix the render program declares, all in
/// group 0.
pub struct UniformBuffers {
    buffers: BTreeMap<u32, wgpu::Buffer>,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub bind_group: wgpu::BindGroup,
}

impl UniformBuffers {
    fn init(device: &wgpu::Device, locations: &[UniformLocation]) -> Result<Self, SetupError> {
        let mut buffers = BTreeMap::new();
        for location in locations {
            if location.group != 0 {
                return Err(SetupError::Interface {
                    program: "points".to_string(),
                    detail: format!("uniform at {:?} must be in group 0", location),
                });
            }
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Matrix Uniform Buffer"),
                size: MAT4_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            if buffers.insert(location.binding, buffer).is_some() {
                return Err(SetupError::Interface {
                    program: "points".to_string(),
                    detail: format!("two uniforms share binding {}", location.binding),
                });
            }
        }

        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = buffers
            .keys()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(MAT4_SIZE),
                },
                count: None,
            })
            .collect();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform_bind_group_layout"),
            entries: &layout_entries,
        });
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .map(|(&binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform_bind_group"),
            layout: &bind_group_layout,
            entries: &entries,
        });
        Ok(UniformBuffers {
            buffers,
            bind_group_layout,
            bind_group,
        })
    }

    fn writer<'a>(&'a self, queue: &'a wgpu::Queue) -> QueueUniformWriter<'a> {
        QueueUniformWriter {
            queue,
            buffers: &self.buffers,
        }
    }
}

impl Drop for UniformBuffers {
    fn drop(&mut self) {
        for buffer in self.buffers.values() {
            buffer.destroy();
        }
        debug!("Released {} uniform buffers", self.buffers.len());
    }
}

struct QueueUniformWriter<'a> {
    queue: &'a wgpu::Queue,
    buffers: &'a BTreeMap<u32, wgpu::Buffer>,
}

impl UniformWriter for QueueUniformWriter<'_> {
    fn write_mat4(&mut self, location: UniformLocation, value: &[[f32; 4]; 4]) {
        match self.buffers.get(&location.binding) {
            Some(buffer) => self.queue.write_buffer(buffer, 0, value.as_bytes()),
            None => error!("No uniform buffer at {:?}", location),
        }
    }
}

// Commands recorded so far this frame, plus the texture they target.
struct FrameInFlight {
    encoder: wgpu::CommandEncoder,
    target: Option<wgpu::SurfaceTexture>,
}

/// Everything that lives on the GPU for the lifetime of the window.
pub struct Scene {
    gpu: Gpu,
    compute_program: ShaderProgram,
    render_program: ShaderProgram,
    compute_pipeline: wgpu::ComputePipeline,
    render_pipeline: wgpu::RenderPipeline,
    particles: ParticleBuffers,
    uniforms: UniformBuffers,
    clear_color: wgpu::Color,
    workgroup_size: [u32; 3],

    frame: Option<FrameInFlight>,
    readback: wgpu::Buffer,
    padded_row: u32,
    capture_layout: Option<PixelLayout>,
    retained: bool,
}

impl Scene {
    pub fn init(gpu: Gpu, params: &SimParams) -> Result<Self, SetupError> {
        let device = &gpu.device;
        let paths = &params.shader_paths;

        let mut compute_program = ShaderProgram::create("particles");
        compute_program.attach(shader_utils::load(&paths.compute, ShaderStage::Compute)?);
        compute_program.link()?;

        let mut render_program = ShaderProgram::create("points");
        render_program.attach(shader_utils::load(&paths.vertex, ShaderStage::Vertex)?);
        render_program.attach(shader_utils::load(&paths.fragment, ShaderStage::Fragment)?);
        render_program.link()?;

        let workgroup_size = compute_program
            .workgroup_size()
            .ok_or_else(|| SetupError::Interface {
                program: compute_program.label.clone(),
                detail: "no compute entry point".to_string(),
            })?;

        DispatchGrid::check_limits(params.num_particles, workgroup_size, &device.limits())?;

        let state = ParticleState::seed(params.num_particles, &params.seed_params);
        let particles = ParticleBuffers::init(device, &state, &mut compute_program)?;

        let mut camera = Camera::from_params(&params.camera_params, params.aspect_ratio());
        camera.assign_uniform_locations(&render_program)?;
        let locations: Vec<UniformLocation> = [camera.projection_uniform, camera.view_uniform]
            .iter()
            .flatten()
            .copied()
            .collect();
        let uniforms = UniformBuffers::init(device, &locations)?;
        camera.set_uniforms(&mut uniforms.writer(&gpu.queue))?;

        let compute_pipeline =
            create_compute_pipeline(device, &compute_program, &particles.bind_group_layout)?;
        let render_pipeline = create_render_pipeline(
            device,
            &render_program,
            &uniforms.bind_group_layout,
            gpu.config.format,
        )?;

        let capture_layout = if gpu
            .config
            .usage
            .contains(wgpu::TextureUsages::COPY_SRC)
        {
            PixelLayout::from_format(gpu.config.format)
        } else {
            None
        };
        let padded_row = screenshot::padded_bytes_per_row(gpu.config.width);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Screenshot Readback Buffer"),
            size: padded_row as wgpu::BufferAddress * gpu.config.height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let [r, g, b, a] = params.clear_color;
        Ok(Scene {
            gpu,
            compute_program,
            render_program,
            compute_pipeline,
            render_pipeline,
            particles,
            uniforms,
            clear_color: wgpu::Color { r, g, b, a },
            workgroup_size,
            frame: None,
            readback,
            padded_row,
            capture_layout,
            retained: false,
        })
    }

    pub fn dispatch_grid(&self) -> DispatchGrid {
        DispatchGrid::covering(self.particles.num_particles, self.workgroup_size)
    }

    /// Reconfigures the surface after it was lost or went out of date and
    /// drops whatever the interrupted frame had recorded.
    pub fn reconfigure(&mut self) {
        self.frame = None;
        self.retained = false;
        self.gpu.reconfigure();
    }
}

fn frame_in_flight<'a>(
    frame: &'a mut Option<FrameInFlight>,
    device: &wgpu::Device,
) -> &'a mut FrameInFlight {
    frame.get_or_insert_with(|| FrameInFlight {
        encoder: device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame"),
        }),
        target: None,
    })
}

fn create_compute_pipeline(
    device: &wgpu::Device,
    program: &ShaderProgram,
    particle_layout: &wgpu::BindGroupLayout,
) -> Result<wgpu::ComputePipeline, SetupError> {
    program.require_linked()?;
    let shader = program
        .stage(ShaderStage::Compute)
        .ok_or_else(|| SetupError::Interface {
            program: program.label.clone(),
            detail: "no compute stage".to_string(),
        })?;
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = shader.create_module(device);
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("compute_pipeline_layout"),
        bind_group_layouts: &[particle_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&program.label),
        layout: Some(&layout),
        module: &module,
        entry_point: Some(shader.entry_point()),
        compilation_options: Default::default(),
        cache: None,
    });
    check_error_scope(device, &program.label)?;
    info!("Created compute pipeline '{}'", program.label);
    Ok(pipeline)
}

fn create_render_pipeline(
    device: &wgpu::Device,
    program: &ShaderProgram,
    uniform_layout: &wgpu::BindGroupLayout,
    format: wgpu::TextureFormat,
) -> Result<wgpu::RenderPipeline, SetupError> {
    program.require_linked()?;
    let (vertex, fragment) = match (
        program.stage(ShaderStage::Vertex),
        program.stage(ShaderStage::Fragment),
    ) {
        (Some(v), Some(f)) => (v, f),
        _ => {
            return Err(SetupError::Interface {
                program: program.label.clone(),
                detail: "missing vertex or fragment stage".to_string(),
            })
        }
    };
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let vertex_module = vertex.create_module(device);
    let fragment_module = fragment.create_module(device);
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("render_pipeline_layout"),
        bind_group_layouts: &[uniform_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&program.label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: &vertex_module,
            entry_point: Some(vertex.entry_point()),
            compilation_options: Default::default(),
            buffers: &[particles::position_vertex_layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module: &fragment_module,
            entry_point: Some(fragment.entry_point()),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::PointList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });
    check_error_scope(device, &program.label)?;
    info!("Created render pipeline '{}' targeting {:?}", program.label, format);
    Ok(pipeline)
}

fn check_error_scope(device: &wgpu::Device, label: &str) -> Result<(), SetupError> {
    match futures::executor::block_on(device.pop_error_scope()) {
        Some(e) => {
            error!("Device rejected pipeline '{}'", label);
            Err(SetupError::Pipeline {
                label: label.to_string(),
                log: e.to_string(),
            })
        }
        None => Ok(()),
    }
}

impl FrameBackend for Scene {
    fn dispatch_compute(&mut self, grid: DispatchGrid) -> Result<(), FrameError> {
        let frame = frame_in_flight(&mut self.frame, &self.gpu.device);
        let mut cpass = frame
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("particles"),
                timestamp_writes: None,
            });
        cpass.set_pipeline(&self.compute_pipeline);
        cpass.set_bind_group(0, &self.particles.bind_group, &[]);
        cpass.dispatch_workgroups(grid.width_units, grid.height_units, 1);
        Ok(())
    }

    // Submission order is a full barrier between the compute and render
    // command buffers.
    fn memory_barrier(&mut self) -> Result<(), FrameError> {
        if let Some(frame) = self.frame.take() {
            self.gpu.queue.submit(Some(frame.encoder.finish()));
        }
        Ok(())
    }

    fn draw_points(&mut self, count: u32) -> Result<(), FrameError> {
        let target = self.gpu.surface.get_current_texture()?;
        let view = target
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let frame = frame_in_flight(&mut self.frame, &self.gpu.device);
        {
            let mut rpass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("points"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(&self.render_pipeline);
            rpass.set_bind_group(0, &self.uniforms.bind_group, &[]);
            rpass.set_vertex_buffer(0, self.particles.positions.slice(..));
            rpass.draw(0..count, 0..1);
        }
        frame.target = Some(target);
        Ok(())
    }

    fn present(&mut self, retain: bool) -> Result<(), FrameError> {
        let Some(mut frame) = self.frame.take() else {
            return Ok(());
        };
        self.retained = false;
        if let (true, Some(_), Some(target)) =
            (retain, self.capture_layout, frame.target.as_ref())
        {
            frame.encoder.copy_texture_to_buffer(
                wgpu::ImageCopyTexture {
                    texture: &target.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyBuffer {
                    buffer: &self.readback,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(self.padded_row),
                        rows_per_image: None,
                    },
                },
                wgpu::Extent3d {
                    width: self.gpu.config.width,
                    height: self.gpu.config.height,
                    depth_or_array_layers: 1,
                },
            );
            self.retained = true;
        }
        self.gpu.queue.submit(Some(frame.encoder.finish()));
        if let Some(target) = frame.target {
            target.present();
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Capture, FrameError> {
        let layout = self.capture_layout.ok_or(ScreenshotError::Unsupported)?;
        if !self.retained {
            return Err(ScreenshotError::NothingRetained.into());
        }
        self.retained = false;

        let slice = self.readback.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.gpu.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| ScreenshotError::Disconnected)?
            .map_err(ScreenshotError::from)?;

        let capture = {
            let data = slice.get_mapped_range();
            Capture::from_padded_rows(
                self.gpu.config.width,
                self.gpu.config.height,
                self.padded_row,
                &data,
                layout,
                // Texture copies start at the top row.
                RowOrigin::TopLeft,
            )
        };
        self.readback.unmap();
        Ok(capture?)
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        self.frame = None;
        self.readback.destroy();
        info!(
            "Tearing down scene (programs '{}' and '{}')",
            self.compute_program.label, self.render_program.label
        );
    }
}
