use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::scene::SceneAssets;

#[derive(Parser, Debug)]
#[command(version, about = "Scatters instances of a mesh over a point cloud and ray traces them")]
pub struct Args {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// OBJ mesh to instance
    #[arg(long)]
    pub mesh: Option<PathBuf>,

    /// OBJ point cloud: one instance per `v`, oriented by the matching `vn`
    #[arg(long)]
    pub placements: Option<PathBuf>,

    /// Directory holding the compiled ray tracing shaders
    #[arg(long)]
    pub shaders: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub window: WindowConfig,
    pub assets: AssetConfig,
    pub camera: CameraConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            title: "scatter".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssetConfig {
    pub mesh: PathBuf,
    pub placements: PathBuf,
    pub shader_dir: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            mesh: PathBuf::from("resources/mesh.obj"),
            placements: PathBuf::from("resources/placements.obj"),
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// distance of the eye from the vertical axis
    pub radius: f32,
    pub height: f32,
    pub target_height: f32,
    /// radians per second
    pub angular_speed: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 60.0,
            near: 0.1,
            far: 1000.0,
            radius: 10.0,
            height: 4.0,
            target_height: 1.0,
            angular_speed: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub frames_in_flight: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [1.0, 0.0, 0.0, 1.0],
            frames_in_flight: 3,
        }
    }
}

impl Config {
    /// Reads the configuration named on the command line (or the defaults),
    /// then applies the command line overrides.
    pub fn load(args: &Args) -> Result<Config> {
        let mut config = match &args.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(mesh) = &args.mesh {
            config.assets.mesh = mesh.clone();
        }
        if let Some(placements) = &args.placements {
            config.assets.placements = placements.clone();
        }
        if let Some(shaders) = &args.shaders {
            config.assets.shader_dir = shaders.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Config::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            bail!(
                "window size must be non-zero, got {}x{}",
                self.window.width,
                self.window.height
            );
        }
        if self.render.frames_in_flight == 0 {
            bail!("frames_in_flight must be at least 1");
        }
        let camera = &self.camera;
        if !(camera.near > 0.0 && camera.far > camera.near) {
            bail!(
                "camera clip planes must satisfy 0 < near < far, got {} and {}",
                camera.near,
                camera.far
            );
        }
        if !(camera.fov_degrees > 0.0 && camera.fov_degrees < 180.0) {
            bail!("camera fov must be within (0, 180), got {}", camera.fov_degrees);
        }
        Ok(())
    }

    pub fn scene_assets(&self) -> SceneAssets {
        SceneAssets {
            mesh: self.assets.mesh.clone(),
            placements: self.assets.placements.clone(),
            shader_dir: self.assets.shader_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Args, Config};

    fn no_args() -> Args {
        Args {
            config: None,
            mesh: None,
            placements: None,
            shaders: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::load(&no_args()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!((config.window.width, config.window.height), (1920, 1080));
        assert_eq!(config.render.frames_in_flight, 3);
        assert_eq!(config.render.clear_color, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "forest"

            [camera]
            radius = 25.0
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "forest");
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.camera.radius, 25.0);
        assert_eq!(config.camera.near, 0.1);
        assert_eq!(config.assets, Default::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[window]\nwidht = 3\n").is_err());
        assert!(Config::parse("[renderer]\n").is_err());
    }

    #[test]
    fn command_line_overrides_assets() {
        let args = Args {
            mesh: Some(PathBuf::from("tree.obj")),
            shaders: Some(PathBuf::from("out/spv")),
            ..no_args()
        };
        let config = Config::load(&args).unwrap();

        assert_eq!(config.assets.mesh, PathBuf::from("tree.obj"));
        assert_eq!(config.assets.shader_dir, PathBuf::from("out/spv"));
        assert_eq!(config.assets.placements, PathBuf::from("resources/placements.obj"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/scatter.toml")),
            ..no_args()
        };
        assert!(Config::load(&args).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.render.frames_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.camera.near = 10.0;
        config.camera.far = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bundled_config_is_valid() {
        let config = Config::parse(include_str!("../resources/config.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.render.frames_in_flight, 2);
        assert_eq!(config.assets.mesh, PathBuf::from("resources/mesh.obj"));
    }
}
