use ash::{khr, vk};
use log::debug;

use crate::render::accel::{destroy_acceleration_structure, AccelerationStructure, MeshBuffers};
use crate::render::descriptors::DescriptorSetObjects;
use crate::render::memory::DeviceMemory;
use crate::render::pipeline::{RaytracingPipeline, SbtRegions, ShaderBindingTable};
use crate::utils::AllocatedImage;

pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct RenderAttachments {
    pub color: AllocatedImage,
    pub depth: AllocatedImage,
}

/// Everything the ray dispatch path reads, built by the resource loader.
pub struct RaytracingResources {
    pub attachments: RenderAttachments,
    pub mesh: MeshBuffers,
    pub blas: AccelerationStructure,
    pub tlas: AccelerationStructure,
    pub descriptors: DescriptorSetObjects,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: RaytracingPipeline,
    pub sbt: ShaderBindingTable,
}

/// The handles a frame records against.
#[derive(Debug, Clone, Copy)]
pub struct FrameView {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub sbt: SbtRegions,
}

impl RaytracingResources {
    pub fn frame_view(&self) -> FrameView {
        FrameView {
            color_image: self.attachments.color.image,
            color_view: self.attachments.color.image_view,
            depth_image: self.attachments.depth.image,
            depth_view: self.attachments.depth.image_view,
            extent: self.attachments.color.extent(),
            pipeline: self.pipeline.pipeline,
            pipeline_layout: self.pipeline_layout,
            descriptor_set: self.descriptors.set,
            sbt: self.sbt.regions(),
        }
    }

    /// Destroys in reverse creation order. The device must be idle.
    pub fn destroy(self, memory: &DeviceMemory, accel_loader: &khr::acceleration_structure::Device) {
        let device = memory.device().clone();

        self.sbt.destroy(memory);
        unsafe {
            device.destroy_pipeline(self.pipeline.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.descriptors.destroy(&device);
        }

        destroy_acceleration_structure(accel_loader, memory, self.tlas);
        destroy_acceleration_structure(accel_loader, memory, self.blas);

        memory.destroy_buffer(self.mesh.indices);
        memory.destroy_buffer(self.mesh.vertices);

        self.attachments.destroy(memory);
        debug!("destroyed ray tracing resources");
    }
}

impl RenderAttachments {
    pub fn destroy(self, memory: &DeviceMemory) {
        memory.destroy_image(self.depth);
        memory.destroy_image(self.color);
    }
}
