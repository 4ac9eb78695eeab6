use std::ffi::c_void;

use ash::vk;

/// An owned `VkPhysicalDeviceFeatures2` chain covering everything the ray
/// tracing renderer needs.
///
/// Each struct lives in its own box so the `p_next` pointers stay valid when
/// the chain itself is moved.
pub struct FeatureChain {
    core: Box<vk::PhysicalDeviceFeatures2<'static>>,
    vulkan12: Box<vk::PhysicalDeviceVulkan12Features<'static>>,
    vulkan13: Box<vk::PhysicalDeviceVulkan13Features<'static>>,
    acceleration_structure: Box<vk::PhysicalDeviceAccelerationStructureFeaturesKHR<'static>>,
    ray_tracing_pipeline: Box<vk::PhysicalDeviceRayTracingPipelineFeaturesKHR<'static>>,
}

impl FeatureChain {
    /// A chain with every feature disabled, ready to be filled in by the driver.
    pub fn empty() -> Self {
        let mut chain = FeatureChain {
            core: Box::default(),
            vulkan12: Box::default(),
            vulkan13: Box::default(),
            acceleration_structure: Box::default(),
            ray_tracing_pipeline: Box::default(),
        };

        chain.ray_tracing_pipeline.p_next = std::ptr::null_mut();
        chain.acceleration_structure.p_next =
            &raw mut *chain.ray_tracing_pipeline as *mut c_void;
        chain.vulkan13.p_next = &raw mut *chain.acceleration_structure as *mut c_void;
        chain.vulkan12.p_next = &raw mut *chain.vulkan13 as *mut c_void;
        chain.core.p_next = &raw mut *chain.vulkan12 as *mut c_void;

        chain
    }

    /// The features the renderer enables at device creation.
    pub fn required() -> Self {
        let mut chain = Self::empty();
        chain.vulkan12.buffer_device_address = vk::TRUE;
        chain.vulkan13.dynamic_rendering = vk::TRUE;
        chain.vulkan13.synchronization2 = vk::TRUE;
        chain.acceleration_structure.acceleration_structure = vk::TRUE;
        chain.ray_tracing_pipeline.ray_tracing_pipeline = vk::TRUE;
        chain
    }

    /// The features `device` actually supports.
    pub fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Self {
        let mut chain = Self::empty();
        unsafe { instance.get_physical_device_features2(device, &mut chain.core) };
        chain
    }

    /// Head of the chain, suitable for `VkDeviceCreateInfo::p_next`.
    pub fn head(&self) -> &vk::PhysicalDeviceFeatures2<'static> {
        &self.core
    }

    fn flags(&self) -> [(&'static str, vk::Bool32); 5] {
        [
            (
                "bufferDeviceAddress",
                self.vulkan12.buffer_device_address,
            ),
            ("dynamicRendering", self.vulkan13.dynamic_rendering),
            ("synchronization2", self.vulkan13.synchronization2),
            (
                "accelerationStructure",
                self.acceleration_structure.acceleration_structure,
            ),
            (
                "rayTracingPipeline",
                self.ray_tracing_pipeline.ray_tracing_pipeline,
            ),
        ]
    }

    /// Names of features enabled in `self` but not in `available`.
    pub fn missing(&self, available: &FeatureChain) -> Vec<&'static str> {
        self.flags()
            .into_iter()
            .zip(available.flags())
            .filter(|((_, wanted), (_, have))| *wanted == vk::TRUE && *have == vk::FALSE)
            .map(|((name, _), _)| name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::FeatureChain;

    #[test]
    fn chain_links_every_struct() {
        let chain = FeatureChain::required();
        let mut curr = chain.head() as *const _ as *const vk::BaseOutStructure;
        let mut types = Vec::new();
        while !curr.is_null() {
            unsafe {
                types.push((*curr).s_type);
                curr = (*curr).p_next;
            }
        }

        assert_eq!(
            types,
            [
                vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
                vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
                vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
                vk::StructureType::PHYSICAL_DEVICE_ACCELERATION_STRUCTURE_FEATURES_KHR,
                vk::StructureType::PHYSICAL_DEVICE_RAY_TRACING_PIPELINE_FEATURES_KHR,
            ]
        );
    }

    #[test]
    fn chain_survives_move() {
        let chains: Vec<_> = (0..4).map(|_| FeatureChain::required()).collect();
        let moved = chains.into_iter().last().unwrap();
        assert!(moved.missing(&FeatureChain::required()).is_empty());
        assert!(!moved.head().p_next.is_null());
    }

    #[test]
    fn reports_missing_features() {
        let required = FeatureChain::required();
        let mut available = FeatureChain::required();
        available.ray_tracing_pipeline.ray_tracing_pipeline = vk::FALSE;
        available.vulkan13.dynamic_rendering = vk::FALSE;

        assert_eq!(
            required.missing(&available),
            ["dynamicRendering", "rayTracingPipeline"]
        );
        assert_eq!(required.missing(&FeatureChain::empty()).len(), 5);
        assert!(FeatureChain::empty().missing(&available).is_empty());
    }
}
