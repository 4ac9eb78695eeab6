use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::config::CameraConfig;

/// Push constant block read by the ray generation shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

/// Circles the vertical axis at a fixed height, always looking at the same point.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    settings: CameraConfig,
    perspective: Mat4,
}

impl OrbitCamera {
    pub fn new(settings: CameraConfig, (width, height): (u32, u32)) -> OrbitCamera {
        OrbitCamera {
            settings,
            perspective: Self::perspective_for(&settings, width, height),
        }
    }

    fn perspective_for(settings: &CameraConfig, width: u32, height: u32) -> Mat4 {
        let mut perspective = Mat4::perspective_rh(
            settings.fov_degrees.to_radians(),
            width as f32 / height.max(1) as f32,
            settings.near,
            settings.far,
        );
        // vulkan clip space has y pointing down
        perspective.y_axis = -perspective.y_axis;
        perspective
    }

    pub fn target(&self) -> Vec3 {
        Vec3::new(0.0, self.settings.target_height, 0.0)
    }

    /// Eye position `seconds` after the orbit started.
    pub fn eye(&self, seconds: f32) -> Vec3 {
        let angle = self.settings.angular_speed * seconds;
        Vec3::new(
            self.settings.radius * angle.cos(),
            self.settings.height,
            self.settings.radius * angle.sin(),
        )
    }

    pub fn view(&self, seconds: f32) -> Mat4 {
        Mat4::look_at_rh(self.eye(seconds), self.target(), Vec3::Y)
    }

    pub fn perspective(&self) -> Mat4 {
        self.perspective
    }

    pub fn constants(&self, seconds: f32) -> CameraConstants {
        CameraConstants {
            view_inverse: self.view(seconds).inverse(),
            proj_inverse: self.perspective.inverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::{CameraConstants, OrbitCamera};
    use crate::config::CameraConfig;

    fn camera() -> OrbitCamera {
        OrbitCamera::new(CameraConfig::default(), (1920, 1080))
    }

    #[test]
    fn eye_stays_on_the_orbit() {
        let camera = camera();
        let settings = CameraConfig::default();

        for step in 0..50 {
            let eye = camera.eye(step as f32 * 0.37);
            assert!((Vec3::new(eye.x, 0.0, eye.z).length() - settings.radius).abs() < 1e-4);
            assert_eq!(eye.y, settings.height);
        }
    }

    #[test]
    fn inverses_undo_the_camera() {
        let camera = camera();
        let constants = camera.constants(3.0);

        let view = constants.view_inverse * camera.view(3.0);
        let proj = constants.proj_inverse * camera.perspective();
        assert!(view.abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert!(proj.abs_diff_eq(Mat4::IDENTITY, 1e-4));

        // the inverse view maps the camera origin back onto the eye
        let eye = constants.view_inverse.w_axis.truncate();
        assert!((eye - camera.eye(3.0)).length() < 1e-4);
    }

    #[test]
    fn looks_at_the_target() {
        let camera = camera();
        let target_in_view = camera.view(1.5).transform_point3(camera.target());

        // right handed: forward is -z
        assert!(target_in_view.truncate().length() < 1e-4);
        assert!(target_in_view.z < 0.0);
    }

    #[test]
    fn projection_flips_y() {
        let up_in_clip = camera().perspective().project_point3(Vec3::new(0.0, 1.0, -5.0));
        assert!(up_in_clip.y < 0.0);
    }

    #[test]
    fn push_constant_block_size() {
        assert_eq!(std::mem::size_of::<CameraConstants>(), 128);
    }
}
