use log::info;
use rand::{Rng, SeedableRng};
use wgpu::util::DeviceExt;
use zerocopy::AsBytes;

use crate::error::SetupError;
use crate::shader_utils::ShaderProgram;
use crate::sim_params::SeedParams;

// Storage slots the compute shader declares its buffers at.
pub const POSITION_BINDING: u32 = 0;
pub const VELOCITY_BINDING: u32 = 1;
pub const POSITION_BUFFER: &str = "positions";
pub const VELOCITY_BUFFER: &str = "velocities";

// One vec4<f32> per particle per buffer.
pub const PARTICLE_STRIDE: wgpu::BufferAddress =
    std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress;

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x4];

/// Host-side seed data. Written once, uploaded, then no longer kept in sync
/// with the GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleState {
    pub positions: Vec<[f32; 4]>,
    pub velocities: Vec<[f32; 4]>,
}

impl ParticleState {
    pub fn seed(count: u32, params: &SeedParams) -> Self {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(params.rng_seed);
        let positions = fill_cube(&mut rng, count, params.position_extent, 1.0);
        let velocities = fill_cube(&mut rng, count, params.velocity_extent, 0.0);
        ParticleState {
            positions,
            velocities,
        }
    }
}

// Uniform samples in [-extent, extent)^3 with a fixed w.
fn fill_cube(rng: &mut rand::rngs::SmallRng, count: u32, extent: f32, w: f32) -> Vec<[f32; 4]> {
    (0..count)
        .map(|_| {
            [
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
                w,
            ]
        })
        .collect()
}

/// Work-group grid for one compute dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub width_units: u32,
    pub height_units: u32,
}

impl DispatchGrid {
    /// The smallest single-row grid whose invocations cover `num_particles`
    /// given the shader's work-group size.
    pub fn covering(num_particles: u32, workgroup_size: [u32; 3]) -> Self {
        let per_group = workgroup_size.iter().product::<u32>().max(1);
        DispatchGrid {
            width_units: num_particles.div_ceil(per_group),
            height_units: 1,
        }
    }

    /// Rejects particle counts the device cannot hold in one storage binding
    /// or cover with a single row of work groups.
    pub fn check_limits(
        num_particles: u32,
        workgroup_size: [u32; 3],
        limits: &wgpu::Limits,
    ) -> Result<(), SetupError> {
        let per_group = workgroup_size.iter().map(|&n| n as u64).product::<u64>().max(1);
        let max_dispatched = limits.max_compute_workgroups_per_dimension as u64 * per_group;
        if num_particles as u64 > max_dispatched {
            return Err(SetupError::Params(format!(
                "{} particles need more than {} work groups of {}",
                num_particles, limits.max_compute_workgroups_per_dimension, per_group
            )));
        }
        let max_stored = limits.max_storage_buffer_binding_size as u64 / PARTICLE_STRIDE;
        if num_particles as u64 > max_stored {
            return Err(SetupError::Params(format!(
                "{} particles exceed the {} a storage binding can hold",
                num_particles, max_stored
            )));
        }
        Ok(())
    }

    pub fn invocations(&self, workgroup_size: [u32; 3]) -> u64 {
        self.width_units as u64
            * self.height_units as u64
            * workgroup_size.iter().map(|&n| n as u64).product::<u64>()
    }
}

/// Describes the position buffer as vertex input: one `vec4<f32>` at
/// location 0.
pub fn position_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: PARTICLE_STRIDE,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &POSITION_ATTRIBUTES,
    }
}

/// GPU-resident particle state. After upload only the compute shader writes
/// these.
pub struct ParticleBuffers {
    pub positions: wgpu::Buffer,
    pub velocities: wgpu::Buffer,
    pub num_particles: u32,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub bind_group: wgpu::BindGroup,
}

impl ParticleBuffers {
    /// Uploads `state` and binds both buffers at the storage slots the
    /// compute program declares, associating them with the program.
    pub fn init(
        device: &wgpu::Device,
        state: &ParticleState,
        compute_program: &mut ShaderProgram,
    ) -> Result<Self, SetupError> {
        compute_program.require_storage(POSITION_BUFFER, POSITION_BINDING)?;
        compute_program.require_storage(VELOCITY_BUFFER, VELOCITY_BINDING)?;

        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::VERTEX
            | wgpu::BufferUsages::COPY_DST;
        let positions = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Position Buffer"),
            contents: state.positions.as_bytes(),
            usage,
        });
        let velocities = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Velocity Buffer"),
            contents: state.velocities.as_bytes(),
            usage,
        });
        compute_program.add_buffer(POSITION_BINDING);
        compute_program.add_buffer(VELOCITY_BINDING);
        info!(
            "Uploaded {} particles ({} bytes per buffer)",
            state.positions.len(),
            state.positions.len() as wgpu::BufferAddress * PARTICLE_STRIDE
        );

        let entries: Vec<wgpu::BindGroupLayoutEntry> = compute_program
            .buffers()
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(PARTICLE_STRIDE),
                },
                count: None,
            })
            .collect();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("particle_bind_group_layout"),
            entries: &entries,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("particle_bind_group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: POSITION_BINDING,
                    resource: positions.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: VELOCITY_BINDING,
                    resource: velocities.as_entire_binding(),
                },
            ],
        });

        Ok(ParticleBuffers {
            positions,
            velocities,
            num_particles: state.positions.len() as u32,
            bind_group_layout,
            bind_group,
        })
    }
}

impl Drop for ParticleBuffers {
    fn drop(&mut self) {
        self.positions.destroy();
        self.velocities.destroy();
        info!("Released particle buffers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_lie_inside_their_cubes() {
        let params = SeedParams::default();
        let state = ParticleState::seed(4096, &params);
        assert_eq!(state.positions.len(), 4096);
        assert_eq!(state.velocities.len(), 4096);
        for p in &state.positions {
            assert!(p[..3].iter().all(|v| (-32.0..=32.0).contains(v)), "{:?}", p);
            assert_eq!(p[3], 1.0);
        }
        for v in &state.velocities {
            assert!(v[..3].iter().all(|c| (-6.0..=6.0).contains(c)), "{:?}", v);
            assert_eq!(v[3], 0.0);
        }
    }

    #[test]
    fn seeds_fill_the_cube() {
        // With thousands of samples every axis should reach well past half
        // the extent on both sides.
        let state = ParticleState::seed(4096, &SeedParams::default());
        for axis in 0..3 {
            let min = state.positions.iter().map(|p| p[axis]).fold(f32::MAX, f32::min);
            let max = state.positions.iter().map(|p| p[axis]).fold(f32::MIN, f32::max);
            assert!(min < -16.0 && max > 16.0, "axis {}: [{}, {}]", axis, min, max);
        }
    }

    #[test]
    fn seeding_is_deterministic() {
        let params = SeedParams::default();
        assert_eq!(
            ParticleState::seed(128, &params),
            ParticleState::seed(128, &params)
        );
        let reseeded = SeedParams {
            rng_seed: params.rng_seed + 1,
            ..params
        };
        assert_ne!(
            ParticleState::seed(128, &params),
            ParticleState::seed(128, &reseeded)
        );
    }

    #[test]
    fn seed_bytes_are_tightly_packed() {
        let state = ParticleState::seed(3, &SeedParams::default());
        assert_eq!(
            state.positions.as_bytes().len() as wgpu::BufferAddress,
            3 * PARTICLE_STRIDE
        );
        assert_eq!(&state.positions.as_bytes()[12..16], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn dispatch_grid_covers_every_particle() {
        assert_eq!(
            DispatchGrid::covering(1024, [1, 1, 1]),
            DispatchGrid {
                width_units: 1024,
                height_units: 1
            }
        );
        assert_eq!(DispatchGrid::covering(1024, [64, 1, 1]).width_units, 16);
        assert_eq!(DispatchGrid::covering(1000, [64, 1, 1]).width_units, 16);
        assert_eq!(DispatchGrid::covering(1, [256, 1, 1]).width_units, 1);
        for n in [1u32, 63, 64, 65, 1023, 1024, 5000] {
            let grid = DispatchGrid::covering(n, [8, 8, 1]);
            assert!(grid.invocations([8, 8, 1]) >= n as u64);
            assert!(grid.invocations([8, 8, 1]) < n as u64 + 64);
        }
    }

    #[test]
    fn particle_count_is_bounded_by_device_limits() {
        let limits = wgpu::Limits::default();
        assert!(DispatchGrid::check_limits(1024, [64, 1, 1], &limits).is_ok());
        assert!(matches!(
            DispatchGrid::check_limits(8_000_000, [64, 1, 1], &limits),
            Err(SetupError::Params(_))
        ));
        // Dispatchable, but larger than one storage binding.
        assert!(matches!(
            DispatchGrid::check_limits(16_000_000, [256, 1, 1], &limits),
            Err(SetupError::Params(_))
        ));
        assert!(DispatchGrid::check_limits(u32::MAX, [1, 1, 1], &limits).is_err());
        assert_eq!(DispatchGrid::covering(u32::MAX, [64, 1, 1]).width_units, 67_108_864);
    }

    #[test]
    fn vertex_layout_matches_buffer_stride() {
        let layout = position_vertex_layout();
        assert_eq!(layout.array_stride, PARTICLE_STRIDE);
        assert_eq!(layout.attributes.len(), 1);
        assert_eq!(layout.attributes[0].shader_location, 0);
        assert_eq!(layout.attributes[0].format, wgpu::VertexFormat::Float32x4);
    }
}
