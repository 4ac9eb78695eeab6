use std::ffi::c_char;

use anyhow::Result;
use ash::{vk, Device, Instance};

use crate::config::Config;
use crate::features::FeatureChain;
use crate::render::memory::SharedAllocator;
use crate::scene::SceneAssets;
use crate::utils::QueueFamilyInfo;

pub mod accel;
pub mod descriptors;
pub mod frame;
pub mod gate;
pub mod immediate;
pub mod loader;
pub mod memory;
pub mod pipeline;
pub mod renderers;
pub mod resources;

#[cfg(test)]
mod gpu_tests;

// Device should be initialized outside the renderer, but renderer takes device for construction

pub trait Renderer<Target>
where
    Self: Sized,
{
    fn new(
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        queue_family_info: &QueueFamilyInfo,
        target: &Target,
        allocator: SharedAllocator,
        config: &Config,
    ) -> Result<Self>;

    /// Starts building the scene's GPU resources. Returns as soon as the work
    /// is underway; frames keep rendering in the meantime.
    fn ingest_scene(&mut self, assets: &SceneAssets) -> Result<()>;
    fn render_to(&mut self, target: &mut Target) -> Result<()>;

    fn required_instance_extensions() -> &'static [*const c_char];
    fn required_device_extensions() -> &'static [*const c_char];
    fn required_features() -> FeatureChain;

    fn has_required_queue_families(queue_family_info: &QueueFamilyInfo) -> bool;
    fn get_queue_info(queue_family_info: &QueueFamilyInfo) -> Vec<vk::DeviceQueueCreateInfo<'static>>;
}
