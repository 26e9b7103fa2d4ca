pub mod camera;
pub mod error;
pub mod frame;
pub mod framework;
pub mod particles;
pub mod scene;
pub mod screenshot;
pub mod shader_utils;
pub mod sim_params;
