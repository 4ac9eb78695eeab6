use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use ash::{khr, vk, Device};

/// The single graphics queue, shared by the frame loop and the resource loader.
///
/// `vkQueueSubmit` and `vkQueuePresentKHR` require external synchronization on
/// the queue, so both go through the same lock.
pub struct SharedQueue {
    queue: vk::Queue,
    family_index: u32,
    lock: Mutex<()>,
}

impl SharedQueue {
    pub fn new(device: &Device, family_index: u32) -> Self {
        let queue = unsafe { device.get_device_queue(family_index, 0) };
        Self {
            queue,
            family_index,
            lock: Mutex::new(()),
        }
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub unsafe fn submit(
        &self,
        device: &Device,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("queue lock poisoned"))?;
        device.queue_submit(self.queue, submits, fence)?;
        Ok(())
    }

    /// Returns `true` when the swapchain is suboptimal.
    pub unsafe fn present(
        &self,
        swapchain_loader: &khr::swapchain::Device,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> ash::prelude::VkResult<bool> {
        // a poisoned lock only means another thread panicked mid-submit;
        // the queue itself is still usable
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        swapchain_loader.queue_present(self.queue, present_info)
    }
}

/// Records and synchronously executes one-shot command buffers.
///
/// Command pools are externally synchronized, so every thread that needs
/// immediate submits owns its own context.
pub struct ImmediateCommandContext {
    device: Device,
    queue: Arc<SharedQueue>,
    command_pool: vk::CommandPool,
    fence: vk::Fence,
}

impl ImmediateCommandContext {
    pub fn new(device: &Device, queue: Arc<SharedQueue>) -> Result<Self> {
        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    queue_family_index: queue.family_index(),
                    ..Default::default()
                },
                None,
            )
        }?;

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            device: device.clone(),
            queue,
            command_pool,
            fence,
        })
    }

    pub fn begin(&self) -> Result<ImmediateCommands<'_>> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_buffer_count: 1,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            ..Default::default()
        };

        let command_buffer = unsafe { self.device.allocate_command_buffers(&allocate_info) }?[0];
        let commands = ImmediateCommands {
            context: self,
            command_buffer,
        };

        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }

        Ok(commands)
    }

    pub fn run<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ImmediateCommands<'_>) -> Result<()>,
    {
        let commands = self.begin()?;
        record(&commands)?;
        commands.submit_and_wait()
    }
}

impl Drop for ImmediateCommandContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

pub struct ImmediateCommands<'a> {
    context: &'a ImmediateCommandContext,
    command_buffer: vk::CommandBuffer,
}

impl ImmediateCommands<'_> {
    pub fn buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn device(&self) -> &Device {
        &self.context.device
    }

    pub fn submit_and_wait(self) -> Result<()> {
        let device = &self.context.device;
        let fence = self.context.fence;

        unsafe {
            device.end_command_buffer(self.command_buffer)?;
            device.reset_fences(&[fence])?;

            let submit_info = vk::SubmitInfo {
                command_buffer_count: 1,
                p_command_buffers: &raw const self.command_buffer,
                ..Default::default()
            };
            self.context.queue.submit(device, &[submit_info], fence)?;

            // wait outside the queue lock so the frame loop keeps presenting
            device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("waiting for one-shot command buffer")?;
        }

        Ok(())
    }
}

impl Drop for ImmediateCommands<'_> {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .free_command_buffers(self.context.command_pool, &[self.command_buffer]);
        }
    }
}
