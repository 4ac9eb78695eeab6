use anyhow::Result;
use ash::{vk, Device};

use crate::defer::Defer;

pub const TLAS_BINDING: u32 = 0;
pub const OUTPUT_IMAGE_BINDING: u32 = 1;
pub const VERTEX_BUFFER_BINDING: u32 = 2;
pub const INDEX_BUFFER_BINDING: u32 = 3;

/// Accumulates single-set bindings, then creates the layout, pool, and set.
#[derive(Default)]
pub struct DescriptorSetBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

pub struct DescriptorSetObjects {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl DescriptorSetObjects {
    /// Destroying the pool also frees the set.
    pub unsafe fn destroy(self, device: &Device) {
        device.destroy_descriptor_pool(self.pool, None);
        device.destroy_descriptor_set_layout(self.layout, None);
    }
}

impl DescriptorSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(vk::DescriptorSetLayoutBinding {
            binding,
            descriptor_type,
            descriptor_count: 1,
            stage_flags,
            ..Default::default()
        });
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// One pool entry per descriptor type, with the counts summed.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|x| x.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += binding.descriptor_count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: binding.descriptor_count,
                }),
            }
        }
        sizes
    }

    pub fn build(&self, device: &Device) -> Result<DescriptorSetObjects> {
        let layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo {
                    p_bindings: self.bindings.as_ptr(),
                    binding_count: self.bindings.len() as u32,
                    ..Default::default()
                },
                None,
            )
        }?
        .defer(|x| unsafe { device.destroy_descriptor_set_layout(x, None) });

        let sizes = self.pool_sizes();
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo {
                    pool_size_count: sizes.len() as u32,
                    p_pool_sizes: sizes.as_ptr(),
                    max_sets: 1,
                    ..Default::default()
                },
                None,
            )
        }?
        .defer(|x| unsafe { device.destroy_descriptor_pool(x, None) });

        let set = unsafe {
            device.allocate_descriptor_sets(&vk::DescriptorSetAllocateInfo {
                descriptor_pool: *pool,
                p_set_layouts: &*layout,
                descriptor_set_count: 1,
                ..Default::default()
            })?[0]
        };

        Ok(DescriptorSetObjects {
            layout: layout.undefer(),
            pool: pool.undefer(),
            set,
        })
    }
}

/// Bindings read by the ray tracing shaders.
pub fn raytracing_set_builder() -> DescriptorSetBuilder {
    let rt_stages = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;

    DescriptorSetBuilder::new()
        .add_binding(
            TLAS_BINDING,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            rt_stages,
        )
        .add_binding(
            OUTPUT_IMAGE_BINDING,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::RAYGEN_KHR,
        )
        // vertices and normals
        .add_binding(
            VERTEX_BUFFER_BINDING,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        )
        .add_binding(
            INDEX_BUFFER_BINDING,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        )
}

pub struct RaytracingDescriptorWrites {
    pub tlas: vk::AccelerationStructureKHR,
    pub output_view: vk::ImageView,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
}

pub fn write_raytracing_set(
    device: &Device,
    set: vk::DescriptorSet,
    resources: &RaytracingDescriptorWrites,
) {
    let tlas_write = vk::WriteDescriptorSetAccelerationStructureKHR {
        acceleration_structure_count: 1,
        p_acceleration_structures: &resources.tlas,
        ..Default::default()
    };
    let image_info = vk::DescriptorImageInfo {
        image_view: resources.output_view,
        image_layout: vk::ImageLayout::GENERAL,
        ..Default::default()
    };
    let vertex_info = vk::DescriptorBufferInfo {
        buffer: resources.vertex_buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    let index_info = vk::DescriptorBufferInfo {
        buffer: resources.index_buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };

    let writes = [
        vk::WriteDescriptorSet {
            dst_set: set,
            dst_binding: TLAS_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            p_next: &raw const tlas_write as *const _,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            dst_set: set,
            dst_binding: OUTPUT_IMAGE_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
            p_image_info: &raw const image_info,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            dst_set: set,
            dst_binding: VERTEX_BUFFER_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            p_buffer_info: &raw const vertex_info,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            dst_set: set,
            dst_binding: INDEX_BUFFER_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            p_buffer_info: &raw const index_info,
            ..Default::default()
        },
    ];

    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;

    #[test]
    fn pool_sizes_merge_by_type() {
        let sizes = raytracing_set_builder().pool_sizes();

        assert_eq!(sizes.len(), 3);
        let count = |ty: vk::DescriptorType| {
            sizes
                .iter()
                .find(|x| x.ty == ty)
                .map(|x| x.descriptor_count)
        };
        assert_eq!(count(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), Some(1));
        assert_eq!(count(vk::DescriptorType::STORAGE_IMAGE), Some(1));
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), Some(2));
    }

    #[test]
    fn bindings_keep_declaration_order() {
        let builder = raytracing_set_builder();
        let bindings: Vec<_> = builder.bindings().iter().map(|x| x.binding).collect();
        assert_eq!(
            bindings,
            [
                TLAS_BINDING,
                OUTPUT_IMAGE_BINDING,
                VERTEX_BUFFER_BINDING,
                INDEX_BUFFER_BINDING
            ]
        );
        assert!(builder.bindings()[0]
            .stage_flags
            .contains(vk::ShaderStageFlags::RAYGEN_KHR));
    }

    #[test]
    fn empty_builder_has_no_pool_sizes() {
        assert!(DescriptorSetBuilder::new().pool_sizes().is_empty());
    }
}
