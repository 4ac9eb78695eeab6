use anyhow::{anyhow, Result};
use ash::{khr, vk, Device, Entry, Instance};
use gpu_allocator::vulkan::*;
use gpu_allocator::MemoryLocation;

use crate::render::immediate::ImmediateCommands;

#[derive(Default, Clone, Debug)]
pub struct QueueFamilyInfo {
    pub graphics_index: Option<u32>,
    pub present_index: Option<u32>,
}

impl QueueFamilyInfo {
    /// A family that can both record graphics/ray tracing work and present.
    pub fn unified_index(&self) -> Option<u32> {
        match (self.graphics_index, self.present_index) {
            (Some(graphics), Some(present)) if graphics == present => Some(graphics),
            _ => None,
        }
    }
}

pub fn query_queue_families(
    vk_lib: &Entry,
    instance: &Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<QueueFamilyInfo> {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut info = QueueFamilyInfo::default();

    let surface_loader = khr::surface::Instance::new(vk_lib, instance);

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;
        let present_support =
            unsafe { surface_loader.get_physical_device_surface_support(device, i, surface) }?;
        let graphics_support = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);

        // a family doing both wins over whatever we picked before, since the
        // renderer records and presents on a single queue
        if graphics_support && present_support && info.unified_index().is_none() {
            info.graphics_index = Some(i);
            info.present_index = Some(i);
        }
        if info.graphics_index.is_none() && graphics_support {
            info.graphics_index = Some(i);
        }
        if info.present_index.is_none() && present_support {
            info.present_index = Some(i);
        }
    }

    Ok(info)
}

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two (or 0 for none).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
    offset_alignment: usize,
}

impl AllocatedBuffer {
    pub fn new_with_alignment(
        device: &Device,
        allocator: &mut Allocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        limits: &vk::PhysicalDeviceLimits,
        alignment: u64,
    ) -> Result<AllocatedBuffer> {
        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };

            let buffer = device.create_buffer(&buffer_info, None)?;

            let mut memory_req = device.get_buffer_memory_requirements(buffer);
            if alignment > 0 {
                memory_req.alignment = align_up(memory_req.alignment, alignment);
            }

            let allocation = match allocator.allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements: memory_req,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(e.into());
                }
            };

            if let Err(e) =
                device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                device.destroy_buffer(buffer, None);
                allocator.free(allocation)?;
                return Err(e.into());
            }

            let mut offset_alignment: usize = 1;
            if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
                offset_alignment = limits.min_storage_buffer_offset_alignment as usize;
            } else if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
                offset_alignment = limits.min_uniform_buffer_offset_alignment as usize;
            }

            Ok(AllocatedBuffer {
                buffer,
                size,
                allocation,
                offset_alignment,
            })
        }
    }

    /// Copies `data` to the start of a host-visible buffer.
    pub fn store<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        presser::copy_from_slice_to_offset_with_align(
            data,
            &mut self.allocation,
            0,
            self.offset_alignment,
        )?;
        Ok(())
    }

    /// The mapped contents of a host-visible buffer.
    pub fn mapped_bytes(&self) -> Result<&[u8]> {
        let bytes = self
            .allocation
            .mapped_slice()
            .ok_or(anyhow!("buffer is not host visible"))?;
        Ok(&bytes[..self.size as usize])
    }

    pub unsafe fn get_device_address(&self, device: &Device) -> u64 {
        let buffer_device_address_info = vk::BufferDeviceAddressInfo {
            buffer: self.buffer,
            ..Default::default()
        };
        device.get_buffer_device_address(&buffer_device_address_info)
    }

    pub unsafe fn destroy(self, device: &Device, allocator: &mut Allocator) -> Result<()> {
        device.destroy_buffer(self.buffer, None);
        allocator.free(self.allocation)?;
        Ok(())
    }
}

pub struct AllocatedImage {
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub aspect: vk::ImageAspectFlags,
    allocation: Allocation,
    layout: vk::ImageLayout,
}

impl AllocatedImage {
    pub fn new(
        device: &Device,
        allocator: &mut Allocator,
        size: (u32, u32),
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        location: MemoryLocation,
    ) -> Result<AllocatedImage> {
        let image_create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: size.0,
                height: size.1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };

        let image = unsafe { device.create_image(&image_create_info, None)? };

        let memory_req = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: "image",
            requirements: memory_req,
            location,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let view = unsafe {
            device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|_| {
                    let image_view_create_info = vk::ImageViewCreateInfo {
                        view_type: vk::ImageViewType::TYPE_2D,
                        format,
                        subresource_range: subresource_range(aspect),
                        image,
                        ..Default::default()
                    };
                    device.create_image_view(&image_view_create_info, None)
                })
        };

        let image_view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                allocator.free(allocation)?;
                return Err(e.into());
            }
        };

        Ok(AllocatedImage {
            image,
            image_view,
            width: size.0,
            height: size.1,
            aspect,
            allocation,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Records a full-pipeline layout transition into a one-shot command buffer.
    ///
    /// Only meant for setup work; per-frame transitions go through the frame
    /// plan with tight stage masks.
    pub fn transition(&mut self, commands: &ImmediateCommands<'_>, layout: vk::ImageLayout) {
        let barrier = vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access_mask: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            old_layout: self.layout,
            new_layout: layout,
            image: self.image,
            subresource_range: subresource_range(self.aspect),
            ..Default::default()
        };

        let dependency_info = vk::DependencyInfo {
            image_memory_barrier_count: 1,
            p_image_memory_barriers: &raw const barrier,
            ..Default::default()
        };

        unsafe {
            commands
                .device()
                .cmd_pipeline_barrier2(commands.buffer(), &dependency_info)
        };

        self.layout = layout;
    }

    pub unsafe fn destroy(self, device: &Device, allocator: &mut Allocator) -> Result<()> {
        device.destroy_image_view(self.image_view, None);
        device.destroy_image(self.image, None);
        allocator.free(self.allocation)?;
        Ok(())
    }
}

pub fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::{align_up, QueueFamilyInfo};

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(100, 0), 100);
    }

    #[test]
    fn unified_family_requires_matching_indices() {
        let mut info = QueueFamilyInfo {
            graphics_index: Some(0),
            present_index: Some(1),
            ..Default::default()
        };
        assert_eq!(info.unified_index(), None);

        info.present_index = Some(0);
        assert_eq!(info.unified_index(), Some(0));
    }
}
