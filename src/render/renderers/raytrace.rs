use std::ffi::{c_char, c_void};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use ash::{khr, vk, Device, Instance};
use log::{debug, error, info, warn};

use crate::camera::OrbitCamera;
use crate::config::Config;
use crate::features::FeatureChain;
use crate::render::frame::{encode, plan_frame, BackBuffer};
use crate::render::gate::{ReadinessGate, ResourceState};
use crate::render::immediate::SharedQueue;
use crate::render::loader::{LoaderContext, ResourceLoader};
use crate::render::memory::{DeviceMemory, SharedAllocator};
use crate::render::pipeline::ShaderGroupHandleInfo;
use crate::render::resources::RaytracingResources;
use crate::render::Renderer;
use crate::scene::SceneAssets;
use crate::utils::QueueFamilyInfo;
use crate::window::WindowData;

/// Per-frame dispatcher. Presents loading frames until the resource loader
/// publishes, then traces rays every frame.
pub struct RaytraceRenderer {
    device: Device,
    accel_struct_device: khr::acceleration_structure::Device,
    rt_pipeline_device: khr::ray_tracing_pipeline::Device,
    handle_info: ShaderGroupHandleInfo,
    scratch_alignment: u64,
    memory: DeviceMemory,
    queue: Arc<SharedQueue>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    gate: Arc<ReadinessGate<RaytracingResources>>,
    loader: Option<ResourceLoader>,
    camera: OrbitCamera,
    clear_color: [f32; 4],
    extent: vk::Extent2D,
    start: Instant,
    seen_state: ResourceState,
    reported_load_failure: bool,
}

impl RaytraceRenderer {
    fn query_properties(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> (vk::PhysicalDeviceLimits, ShaderGroupHandleInfo, u64) {
        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_pipeline_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            p_next: &raw mut accel_properties as *mut c_void,
            ..Default::default()
        };
        let mut physical_device_properties2 = vk::PhysicalDeviceProperties2 {
            p_next: &raw mut rt_pipeline_properties as *mut c_void,
            ..Default::default()
        };
        unsafe {
            instance
                .get_physical_device_properties2(physical_device, &mut physical_device_properties2)
        };

        let handle_info = ShaderGroupHandleInfo::from_properties(&rt_pipeline_properties);
        let scratch_alignment =
            accel_properties.min_acceleration_structure_scratch_offset_alignment as u64;
        debug!("{handle_info:?}, scratch alignment {scratch_alignment}");

        (
            physical_device_properties2.properties.limits,
            handle_info,
            scratch_alignment,
        )
    }

    fn record_frame(&mut self, command_buffer: vk::CommandBuffer, back_buffer: &BackBuffer) -> Result<()> {
        let resources = self.gate.get();

        let state = self.gate.state();
        if state != self.seen_state {
            info!("resources ready, starting ray dispatch");
            self.seen_state = state;
        }
        if resources.is_none()
            && !self.reported_load_failure
            && self.loader.as_ref().is_some_and(|x| x.is_finished())
        {
            warn!("resource loader exited without publishing, only loading frames will be shown");
            self.reported_load_failure = true;
        }

        let view = resources.map(|x| x.frame_view());
        let constants = self.camera.constants(self.start.elapsed().as_secs_f32());
        let plan = plan_frame(
            back_buffer,
            view.as_ref().map(|x| (x, constants)),
            self.clear_color,
        );

        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
            encode(&self.device, &self.rt_pipeline_device, command_buffer, &plan);
            self.device.end_command_buffer(command_buffer)?;
        }

        Ok(())
    }
}

impl Renderer<WindowData> for RaytraceRenderer {
    fn new(
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        queue_family_info: &QueueFamilyInfo,
        target: &WindowData,
        allocator: SharedAllocator,
        config: &Config,
    ) -> Result<Self> {
        let accel_struct_device = khr::acceleration_structure::Device::new(instance, device);
        let rt_pipeline_device = khr::ray_tracing_pipeline::Device::new(instance, device);

        let (limits, handle_info, scratch_alignment) =
            Self::query_properties(instance, physical_device);

        let queue_index = queue_family_info
            .unified_index()
            .ok_or(anyhow!("no graphics queue family that can present"))?;
        let queue = Arc::new(SharedQueue::new(device, queue_index));

        let command_pool = {
            let create_info = vk::CommandPoolCreateInfo {
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                queue_family_index: queue_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&create_info, None) }?
        };

        let command_buffers = {
            let allocate_info = vk::CommandBufferAllocateInfo {
                command_buffer_count: target.frames_in_flight() as u32,
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                ..Default::default()
            };
            match unsafe { device.allocate_command_buffers(&allocate_info) } {
                Ok(x) => x,
                Err(e) => {
                    unsafe { device.destroy_command_pool(command_pool, None) };
                    return Err(e.into());
                }
            }
        };

        let extent = target.get_size();

        Ok(RaytraceRenderer {
            device: device.clone(),
            accel_struct_device,
            rt_pipeline_device,
            handle_info,
            scratch_alignment,
            memory: DeviceMemory::new(device, allocator, limits),
            queue,
            command_pool,
            command_buffers,
            gate: Arc::new(ReadinessGate::new()),
            loader: None,
            camera: OrbitCamera::new(config.camera, (extent.width, extent.height)),
            clear_color: config.render.clear_color,
            extent,
            start: Instant::now(),
            seen_state: ResourceState::Loading,
            reported_load_failure: false,
        })
    }

    fn ingest_scene(&mut self, assets: &SceneAssets) -> Result<()> {
        if self.loader.is_some() {
            bail!("scene was already ingested");
        }

        let context = LoaderContext {
            memory: self.memory.clone(),
            queue: self.queue.clone(),
            accel_loader: self.accel_struct_device.clone(),
            rt_pipeline_loader: self.rt_pipeline_device.clone(),
            handle_info: self.handle_info,
            scratch_alignment: self.scratch_alignment,
            extent: self.extent,
            assets: assets.clone(),
        };

        info!("loading scene {assets:?} in the background");
        self.loader = Some(ResourceLoader::spawn(context, self.gate.clone())?);
        Ok(())
    }

    fn render_to(&mut self, target: &mut WindowData) -> Result<()> {
        let Some(acquired) = target.acquire_next_image()? else {
            return Ok(());
        };

        let command_buffer = self.command_buffers[target.current_frame()];
        let back_buffer = BackBuffer {
            image: acquired.image,
            extent: target.get_size(),
        };
        self.record_frame(command_buffer, &back_buffer)?;

        let wait_stage =
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER;
        let submit_info = vk::SubmitInfo {
            command_buffer_count: 1,
            p_command_buffers: &raw const command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &raw const acquired.render_finished,
            wait_semaphore_count: 1,
            p_wait_semaphores: &raw const acquired.image_available,
            p_wait_dst_stage_mask: &raw const wait_stage,
            ..Default::default()
        };

        unsafe {
            self.queue
                .submit(&self.device, &[submit_info], acquired.in_flight)
                .context("submitting frame")?;
        }

        target.present(&self.queue, &acquired)
    }

    fn required_instance_extensions() -> &'static [*const c_char] {
        &[]
    }

    fn required_device_extensions() -> &'static [*const c_char] {
        const EXTENSIONS: &[*const c_char] = &[
            khr::acceleration_structure::NAME.as_ptr(),
            khr::deferred_host_operations::NAME.as_ptr(),
            khr::ray_tracing_pipeline::NAME.as_ptr(),
        ];
        EXTENSIONS
    }

    fn required_features() -> FeatureChain {
        FeatureChain::required()
    }

    fn has_required_queue_families(queue_family_info: &QueueFamilyInfo) -> bool {
        queue_family_info.unified_index().is_some()
    }

    fn get_queue_info(queue_family_info: &QueueFamilyInfo) -> Vec<vk::DeviceQueueCreateInfo<'static>> {
        // has_required_queue_families has already vetted the device
        let Some(queue_family_index) = queue_family_info.unified_index() else {
            return Vec::new();
        };

        vec![vk::DeviceQueueCreateInfo {
            queue_family_index,
            queue_count: 1,
            p_queue_priorities: &1.0,
            ..Default::default()
        }]
    }
}

impl Drop for RaytraceRenderer {
    fn drop(&mut self) {
        // the loader may still be submitting; it has to finish before anything is torn down
        if let Some(mut loader) = self.loader.take() {
            loader.join();
        }

        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("failed to wait for device idle: {e}");
            }
        }

        let gate = std::mem::take(&mut self.gate);
        match Arc::into_inner(gate).and_then(|x| x.into_inner()) {
            Some(resources) => resources.destroy(&self.memory, &self.accel_struct_device),
            None => debug!("no resources were published, nothing to destroy"),
        }

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &self.command_buffers);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
