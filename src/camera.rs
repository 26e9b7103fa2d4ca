use cgmath::{Matrix4, Point3, Rad, Vector3};

use crate::error::SetupError;
use crate::shader_utils::{ShaderProgram, UniformLocation};
use crate::sim_params::CameraParams;

// cgmath produces OpenGL clip space, with z in [-1, 1]. wgpu expects [0, 1].
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

pub const PROJECTION_UNIFORM: &str = "projection";
pub const VIEW_UNIFORM: &str = "view";

/// Destination for matrix uniforms, keyed by where the shader declares them.
pub trait UniformWriter {
    fn write_mat4(&mut self, location: UniformLocation, value: &[[f32; 4]; 4]);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Point3<f32>,
    pub target: Point3<f32>,
    pub up: Vector3<f32>,

    pub fovy: Rad<f32>,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,

    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,

    pub view_uniform: Option<UniformLocation>,
    pub projection_uniform: Option<UniformLocation>,
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: Point3<f32>,
        target: Point3<f32>,
        up: Vector3<f32>,
        fovy: Rad<f32>,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let mut camera = Camera {
            position,
            target,
            up,
            fovy,
            aspect,
            near,
            far,
            view: Matrix4::from_scale(1.0),
            projection: Matrix4::from_scale(1.0),
            view_uniform: None,
            projection_uniform: None,
        };
        camera.update_matrices();
        camera
    }

    pub fn from_params(params: &CameraParams, aspect: f32) -> Self {
        Camera::new(
            Point3::from(params.eye),
            Point3::from(params.target),
            Vector3::from(params.up),
            cgmath::Deg(params.fovy_degrees).into(),
            aspect,
            params.near,
            params.far,
        )
    }

    /// Recomputes view and projection from the current fields.
    pub fn update_matrices(&mut self) {
        self.view = Matrix4::look_at_rh(self.position, self.target, self.up);
        self.projection = cgmath::perspective(self.fovy, self.aspect, self.near, self.far);
    }

    /// Resolves the projection and view uniforms by name from the linked
    /// render program.
    pub fn assign_uniform_locations(&mut self, program: &ShaderProgram) -> Result<(), SetupError> {
        self.projection_uniform = Some(program.require_uniform(PROJECTION_UNIFORM)?);
        self.view_uniform = Some(program.require_uniform(VIEW_UNIFORM)?);
        Ok(())
    }

    pub fn set_uniforms<W: UniformWriter>(&self, writer: &mut W) -> Result<(), SetupError> {
        let (view_location, projection_location) =
            match (self.view_uniform, self.projection_uniform) {
                (Some(view), Some(projection)) => (view, projection),
                _ => {
                    return Err(SetupError::Interface {
                        program: "camera".to_string(),
                        detail: "uniform locations were never assigned".to_string(),
                    })
                }
            };
        let view: [[f32; 4]; 4] = self.view.into();
        let projection: [[f32; 4]; 4] = (OPENGL_TO_WGPU_MATRIX * self.projection).into();
        writer.write_mat4(view_location, &view);
        writer.write_mat4(projection_location, &projection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader_utils::tests::render_program;
    use cgmath::Transform;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingWriter {
        writes: HashMap<UniformLocation, [[f32; 4]; 4]>,
    }

    impl UniformWriter for RecordingWriter {
        fn write_mat4(&mut self, location: UniformLocation, value: &[[f32; 4]; 4]) {
            self.writes.insert(location, *value);
        }
    }

    fn bits(m: Matrix4<f32>) -> Vec<u32> {
        let raw: [[f32; 4]; 4] = m.into();
        raw.iter().flatten().map(|v| v.to_bits()).collect()
    }

    fn default_camera() -> Camera {
        Camera::from_params(&CameraParams::default(), 1.0)
    }

    #[test]
    fn projection_is_pure() {
        let mut camera = default_camera();
        let first = bits(camera.projection);
        camera.update_matrices();
        camera.update_matrices();
        assert_eq!(first, bits(camera.projection));

        let other = Camera::new(
            Point3::new(5.0, -3.0, 12.0),
            Point3::new(1.0, 1.0, 1.0),
            Vector3::unit_z(),
            camera.fovy,
            camera.aspect,
            camera.near,
            camera.far,
        );
        // Projection does not depend on where the camera sits.
        assert_eq!(first, bits(other.projection));
    }

    #[test]
    fn update_tracks_field_changes() {
        let mut camera = default_camera();
        let before = camera.projection;
        camera.fovy = cgmath::Deg(30.0).into();
        assert_eq!(camera.projection, before);
        camera.update_matrices();
        assert_ne!(camera.projection, before);
    }

    #[test]
    fn view_looks_down_negative_z_at_target() {
        let camera = default_camera();
        let target = camera.view.transform_point(Point3::new(0.0, 0.0, 0.0));
        assert!((target.x).abs() < 1e-5);
        assert!((target.y).abs() < 1e-5);
        assert!((target.z + 100.0).abs() < 1e-3);
    }

    #[test]
    fn uniforms_require_assigned_locations() {
        let camera = default_camera();
        let mut writer = RecordingWriter::default();
        assert!(camera.set_uniforms(&mut writer).is_err());
        assert!(writer.writes.is_empty());
    }

    #[test]
    fn uniforms_land_at_queried_locations() {
        let program = render_program();
        let mut camera = default_camera();
        camera.assign_uniform_locations(&program).unwrap();
        assert_eq!(
            camera.projection_uniform,
            program.uniform_location(PROJECTION_UNIFORM)
        );
        assert_eq!(camera.view_uniform, program.uniform_location(VIEW_UNIFORM));

        let mut writer = RecordingWriter::default();
        camera.set_uniforms(&mut writer).unwrap();
        assert_eq!(writer.writes.len(), 2);

        let projection = writer.writes[&camera.projection_uniform.unwrap()];
        let expected: [[f32; 4]; 4] = (OPENGL_TO_WGPU_MATRIX * camera.projection).into();
        assert_eq!(projection, expected);

        let view = writer.writes[&camera.view_uniform.unwrap()];
        let expected: [[f32; 4]; 4] = camera.view.into();
        assert_eq!(view, expected);
    }

    #[test]
    fn missing_uniform_is_an_interface_error() {
        let program = crate::shader_utils::tests::compute_program();
        let mut camera = default_camera();
        assert!(matches!(
            camera.assign_uniform_locations(&program),
            Err(SetupError::Interface { .. })
        ));
    }
}
