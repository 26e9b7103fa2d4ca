use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SetupError;

// Parameters that define the simulation. These don't change at runtime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimParams {
    pub window_width: u32,
    pub window_height: u32,
    pub window_title: String,

    pub num_particles: u32,
    pub clear_color: [f64; 4],
    pub screenshot_path: PathBuf,

    pub seed_params: SeedParams,
    pub camera_params: CameraParams,
    pub shader_paths: ShaderPaths,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SeedParams {
    // Half-width of the cube initial positions are drawn from.
    pub position_extent: f32,
    // Half-width of the cube initial velocities are drawn from.
    pub velocity_extent: f32,
    pub rng_seed: u64,
}

impl Default for SeedParams {
    fn default() -> Self {
        SeedParams {
            position_extent: 32.0,
            velocity_extent: 6.0,
            rng_seed: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CameraParams {
    pub eye: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    pub fovy_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        CameraParams {
            eye: [0.0, 0.0, 100.0],
            target: [0.0, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fovy_degrees: 60.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ShaderPaths {
    pub compute: PathBuf,
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderPaths {
    fn default() -> Self {
        ShaderPaths {
            compute: PathBuf::from("shaders/particles.wgsl"),
            vertex: PathBuf::from("shaders/vert.wgsl"),
            fragment: PathBuf::from("shaders/frag.wgsl"),
        }
    }
}

impl Default for SimParams {
    fn default() -> Self {
        SimParams {
            window_width: 1024,
            window_height: 1024,
            window_title: "Compute".to_string(),
            num_particles: 1024,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            screenshot_path: PathBuf::from("screenshot.png"),
            seed_params: SeedParams::default(),
            camera_params: CameraParams::default(),
            shader_paths: ShaderPaths::default(),
        }
    }
}

impl std::str::FromStr for SimParams {
    type Err = toml::de::Error;
    fn from_str(serialized: &str) -> Result<Self, Self::Err> {
        let params = toml::from_str(serialized)?;
        Ok(params)
    }
}

impl SimParams {
    pub fn aspect_ratio(&self) -> f32 {
        self.window_width as f32 / self.window_height as f32
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let fail = |msg: &str| Err(SetupError::Params(msg.to_string()));
        if self.window_width == 0 || self.window_height == 0 {
            return fail("window dimensions must be non-zero");
        }
        if self.num_particles == 0 {
            return fail("num_particles must be non-zero");
        }
        let positive = |x: f32| x.is_finite() && x > 0.0;
        let seed = &self.seed_params;
        if !positive(seed.position_extent) || !positive(seed.velocity_extent) {
            return fail("seed extents must be positive and finite");
        }
        let camera = &self.camera_params;
        if !(positive(camera.near) && positive(camera.far) && camera.near < camera.far) {
            return fail("camera planes must satisfy 0 < near < far");
        }
        if !(camera.fovy_degrees > 0.0 && camera.fovy_degrees < 180.0) {
            return fail("fovy_degrees must lie in (0, 180)");
        }
        Ok(())
    }
}

pub fn read_params_from_file(path: &str) -> anyhow::Result<SimParams> {
    let params = std::fs::read_to_string(path)?.parse()?;
    Ok(params)
}

pub fn get_params(path: &str) -> SimParams {
    match read_params_from_file(path) {
        Ok(params) => params,
        Err(e) => {
            log::error!("Failed to parse config file({}): {:?}", path, e);
            SimParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let params = SimParams::default();
        assert_eq!((params.window_width, params.window_height), (1024, 1024));
        assert_eq!(params.num_particles, 1024);
        assert_eq!(params.seed_params.position_extent, 32.0);
        assert_eq!(params.seed_params.velocity_extent, 6.0);
        assert_eq!(params.screenshot_path, PathBuf::from("screenshot.png"));
        assert_eq!(params.aspect_ratio(), 1.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn smoke() {
        let params = SimParams {
            num_particles: 4096,
            ..SimParams::default()
        };
        let serialized = toml::to_string(&params).unwrap();
        let deserialized: SimParams = serialized.parse().unwrap();
        assert_eq!(params, deserialized);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let params: SimParams = r#"
            num_particles = 256

            [camera_params]
            fovy_degrees = 45.0
        "#
        .parse()
        .unwrap();
        assert_eq!(params.num_particles, 256);
        assert_eq!(params.camera_params.fovy_degrees, 45.0);
        assert_eq!(params.camera_params.far, 1000.0);
        assert_eq!(params.window_title, "Compute");
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_particles = SimParams {
            num_particles: 0,
            ..SimParams::default()
        };
        assert!(matches!(
            zero_particles.validate(),
            Err(SetupError::Params(_))
        ));

        let mut inverted_planes = SimParams::default();
        inverted_planes.camera_params.near = 10.0;
        inverted_planes.camera_params.far = 1.0;
        assert!(inverted_planes.validate().is_err());

        let mut flat_cube = SimParams::default();
        flat_cube.seed_params.velocity_extent = 0.0;
        assert!(flat_cube.validate().is_err());

        let unbounded: SimParams = "[seed_params]\nposition_extent = inf".parse().unwrap();
        assert!(matches!(unbounded.validate(), Err(SetupError::Params(_))));

        let mut infinite_far = SimParams::default();
        infinite_far.camera_params.far = f32::INFINITY;
        assert!(infinite_far.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let params = get_params("this/file/does/not/exist.toml");
        assert_eq!(params, SimParams::default());
    }

    #[test]
    fn shipped_config_parses() {
        let serialized = include_str!("../particles.toml");
        let params: SimParams = serialized.parse().unwrap();
        assert!(params.validate().is_ok());
    }
}
