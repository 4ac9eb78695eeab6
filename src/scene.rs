use std::path::PathBuf;

pub mod geometry;
pub mod placements;

/// The on-disk inputs the resource loader turns into GPU resources.
#[derive(Debug, Clone)]
pub struct SceneAssets {
    pub mesh: PathBuf,
    pub placements: PathBuf,
    pub shader_dir: PathBuf,
}
