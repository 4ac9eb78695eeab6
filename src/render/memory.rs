use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use ash::{vk, Device};
use gpu_allocator::vulkan::Allocator;
use gpu_allocator::MemoryLocation;
use log::warn;

use crate::render::immediate::ImmediateCommandContext;
use crate::utils::{AllocatedBuffer, AllocatedImage};

pub type SharedAllocator = Arc<Mutex<Allocator>>;

/// Creates, uploads into, and destroys device buffers and images.
#[derive(Clone)]
pub struct DeviceMemory {
    device: Device,
    allocator: SharedAllocator,
    limits: vk::PhysicalDeviceLimits,
}

impl DeviceMemory {
    pub fn new(device: &Device, allocator: SharedAllocator, limits: vk::PhysicalDeviceLimits) -> Self {
        Self {
            device: device.clone(),
            allocator,
            limits,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn allocator(&self) -> Result<MutexGuard<'_, Allocator>> {
        self.allocator
            .lock()
            .map_err(|_| anyhow!("allocator lock poisoned"))
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<AllocatedBuffer> {
        self.create_buffer_aligned(size, usage, location, 0)
    }

    pub fn create_buffer_aligned(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: u64,
    ) -> Result<AllocatedBuffer> {
        if size == 0 {
            bail!("cannot create an empty buffer (usage {usage:?})");
        }

        let mut allocator = self.allocator()?;
        AllocatedBuffer::new_with_alignment(
            &self.device,
            &mut allocator,
            size,
            usage,
            location,
            &self.limits,
            alignment,
        )
    }

    pub fn create_host_buffer<T: Copy>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        alignment: u64,
    ) -> Result<AllocatedBuffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer =
            self.create_buffer_aligned(size, usage, MemoryLocation::CpuToGpu, alignment)?;
        if let Err(e) = buffer.store(data) {
            self.destroy_buffer(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Uploads `data` into a new device-local buffer through a staging buffer.
    pub fn upload_from_host<T: Copy>(
        &self,
        immediate: &ImmediateCommandContext,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<AllocatedBuffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let staging_buffer =
            self.create_host_buffer(data, vk::BufferUsageFlags::TRANSFER_SRC, 0)?;

        let buffer = match self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.destroy_buffer(staging_buffer);
                return Err(e);
            }
        };

        let copied = self.copy_buffer(immediate, &staging_buffer, &buffer, size);
        self.destroy_buffer(staging_buffer);

        match copied {
            Ok(()) => Ok(buffer),
            Err(e) => {
                self.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Reads back the first `size` bytes of a device buffer.
    ///
    /// Debug path only; the source buffer needs `TRANSFER_SRC` usage.
    pub fn read_back(
        &self,
        immediate: &ImmediateCommandContext,
        buffer: &AllocatedBuffer,
        size: vk::DeviceSize,
    ) -> Result<Vec<u8>> {
        let readback_buffer = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let bytes = self
            .copy_buffer(immediate, buffer, &readback_buffer, size)
            .and_then(|_| readback_buffer.mapped_bytes().map(|x| x.to_vec()));
        self.destroy_buffer(readback_buffer);

        bytes
    }

    fn copy_buffer(
        &self,
        immediate: &ImmediateCommandContext,
        src: &AllocatedBuffer,
        dst: &AllocatedBuffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        immediate.run(|commands| {
            unsafe {
                self.device.cmd_copy_buffer(
                    commands.buffer(),
                    src.buffer,
                    dst.buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size,
                    }],
                );
            }
            Ok(())
        })
    }

    pub fn create_image(
        &self,
        (width, height): (u32, u32),
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<AllocatedImage> {
        let mut allocator = self.allocator()?;
        AllocatedImage::new(
            &self.device,
            &mut allocator,
            (width, height),
            format,
            usage,
            aspect,
            MemoryLocation::GpuOnly,
        )
    }

    pub fn destroy_buffer(&self, buffer: AllocatedBuffer) {
        let result = self
            .allocator()
            .and_then(|mut allocator| unsafe { buffer.destroy(&self.device, &mut allocator) });
        if let Err(e) = result {
            warn!("failed to free buffer memory: {e:#}");
        }
    }

    pub fn destroy_image(&self, image: AllocatedImage) {
        let result = self
            .allocator()
            .and_then(|mut allocator| unsafe { image.destroy(&self.device, &mut allocator) });
        if let Err(e) = result {
            warn!("failed to free image memory: {e:#}");
        }
    }
}
