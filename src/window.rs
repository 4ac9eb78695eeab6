use std::ffi::c_char;

use anyhow::{anyhow, Context, Result};
use ash::{khr, vk, Device, Entry, Instance};
use log::{debug, error, warn};
use winit::dpi::PhysicalSize;
use winit::window::{Window, WindowAttributes};

use crate::config::WindowConfig;
use crate::defer::Defer;
use crate::render::immediate::SharedQueue;
use crate::utils;

struct FrameSync {
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
}

/// A swapchain image acquired for the current frame, with the sync objects
/// its submit has to use.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

pub struct WindowData {
    swapchain: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    window: Window,

    swapchain_loader: khr::swapchain::Device,
    surface_loader: khr::surface::Instance,
    device: Device,

    image_extent: vk::Extent2D,
    images: Vec<vk::Image>,

    frames: Vec<FrameSync>,
    // indexed by swapchain image, since presentation holds on to them
    render_finished: Vec<vk::Semaphore>,
    current_frame: usize,
    reported_out_of_date: bool,
}

pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl WindowData {
    pub fn new(
        vk_lib: &Entry,
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        window: Window,
        frames_in_flight: u32,
    ) -> Result<WindowData> {
        let swapchain_loader = khr::swapchain::Device::new(instance, device);
        let surface_loader = khr::surface::Instance::new(vk_lib, instance);
        let surface = surface.defer(|x| unsafe { surface_loader.destroy_surface(x, None) });

        let (swapchain, image_format, image_extent, images) =
            Self::create_swapchain(vk_lib, instance, device, physical_device, *surface, &window)?;
        let swapchain =
            swapchain.defer(|x| unsafe { swapchain_loader.destroy_swapchain(x, None) });

        let frames = Self::create_frame_sync(device, frames_in_flight)?;
        let render_finished = match Self::create_semaphores(device, images.len()) {
            Ok(x) => x,
            Err(e) => {
                Self::destroy_frame_sync(device, frames);
                return Err(e);
            }
        };

        debug!(
            "swapchain: {} images of {:?} at {}x{}, {} frames in flight",
            images.len(),
            image_format,
            image_extent.width,
            image_extent.height,
            frames.len()
        );

        let swapchain = swapchain.undefer();
        let surface = surface.undefer();
        Ok(WindowData {
            surface_loader,
            swapchain_loader,
            swapchain,
            surface,
            window,
            device: device.clone(),
            image_extent,
            images,
            frames,
            render_finished,
            current_frame: 0,
            reported_out_of_date: false,
        })
    }

    fn create_swapchain(
        vk_lib: &Entry,
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        window: &Window,
    ) -> Result<(vk::SwapchainKHR, vk::Format, vk::Extent2D, Vec<vk::Image>)> {
        let swapchain_loader = khr::swapchain::Device::new(instance, device);

        let support_details =
            Self::query_swapchain_support_details(vk_lib, instance, physical_device, surface)?;
        let surface_format = Self::choose_surface_format(&support_details.formats)?;
        let present_mode = Self::choose_present_mode(&support_details.present_modes);
        let image_extent = Self::choose_extent(window, &support_details.capabilities);

        // rendering and presenting share one queue family
        let queue_info = utils::query_queue_families(vk_lib, instance, physical_device, surface)?;
        queue_info
            .unified_index()
            .ok_or(anyhow!("no queue family supports both graphics and present"))?;

        let image_count = if support_details.capabilities.max_image_count > 0 {
            (support_details.capabilities.min_image_count + 1)
                .min(support_details.capabilities.max_image_count)
        } else {
            support_details.capabilities.min_image_count + 1
        };

        let create_info = vk::SwapchainCreateInfoKHR {
            surface,
            min_image_count: image_count,
            image_format: surface_format.format,
            image_color_space: surface_format.color_space,
            image_extent,
            image_array_layers: 1,
            // frames are blitted in from the ray traced attachment
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: support_details.capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        Ok((swapchain, surface_format.format, image_extent, images))
    }

    fn create_frame_sync(device: &Device, count: u32) -> Result<Vec<FrameSync>> {
        let mut frames = Vec::new().defer(|x| Self::destroy_frame_sync(device, x));

        for _ in 0..count {
            let image_available =
                unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?
                    .defer(|x| unsafe { device.destroy_semaphore(x, None) });
            // signalled, so the first wait on every frame returns immediately
            let in_flight = unsafe {
                device.create_fence(
                    &vk::FenceCreateInfo {
                        flags: vk::FenceCreateFlags::SIGNALED,
                        ..Default::default()
                    },
                    None,
                )
            }?;

            frames.push(FrameSync {
                image_available: image_available.undefer(),
                in_flight,
            });
        }

        Ok(frames.undefer())
    }

    fn create_semaphores(device: &Device, count: usize) -> Result<Vec<vk::Semaphore>> {
        let mut semaphores = Vec::new().defer(|x: Vec<vk::Semaphore>| {
            x.into_iter()
                .for_each(|x| unsafe { device.destroy_semaphore(x, None) })
        });

        for _ in 0..count {
            semaphores
                .push(unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?);
        }

        Ok(semaphores.undefer())
    }

    fn destroy_frame_sync(device: &Device, frames: Vec<FrameSync>) {
        for frame in frames {
            unsafe {
                device.destroy_semaphore(frame.image_available, None);
                device.destroy_fence(frame.in_flight, None);
            }
        }
    }

    fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
        for format in formats {
            if format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            {
                return Ok(*format);
            }
        }

        formats
            .first()
            .copied()
            .ok_or(anyhow!("surface reports no formats"))
    }

    fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        if modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        }
    }

    fn choose_extent(window: &Window, capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
        if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            let min_extent = capabilities.min_image_extent;
            let max_extent = capabilities.max_image_extent;
            let size = window.inner_size();

            vk::Extent2D {
                width: size.width.clamp(min_extent.width, max_extent.width),
                height: size.height.clamp(min_extent.height, max_extent.height),
            }
        }
    }

    fn query_swapchain_support_details(
        vk_lib: &Entry,
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<SwapchainSupportDetails> {
        let surface_loader = khr::surface::Instance::new(vk_lib, instance);
        let capabilities =
            unsafe { surface_loader.get_physical_device_surface_capabilities(device, surface) }?;
        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }?;

        Ok(SwapchainSupportDetails {
            capabilities,
            formats,
            present_modes,
        })
    }

    pub fn is_device_suitable(
        vk_lib: &Entry,
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<bool> {
        let support_details =
            Self::query_swapchain_support_details(vk_lib, instance, device, surface)?;
        let supports_blit_target = support_details
            .capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST);

        Ok(supports_blit_target
            && !support_details.formats.is_empty()
            && !support_details.present_modes.is_empty())
    }

    pub fn required_device_extensions() -> &'static [*const c_char] {
        const EXTENSIONS: &[*const c_char] = &[khr::swapchain::NAME.as_ptr()];
        EXTENSIONS
    }

    /// Waits until the current frame slot is free, then acquires the next
    /// swapchain image. `None` means the swapchain is out of date and the
    /// frame should be skipped.
    pub fn acquire_next_image(&mut self) -> Result<Option<AcquiredImage>> {
        let frame = &self.frames[self.current_frame];

        unsafe {
            self.device
                .wait_for_fences(&[frame.in_flight], true, u64::MAX)
                .context("waiting for frame in flight")?;
        }

        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            )
        };
        let Some(index) = acquire_outcome(acquired, &mut self.reported_out_of_date)? else {
            return Ok(None);
        };

        // only reset once we know a submit will signal it again
        unsafe { self.device.reset_fences(&[frame.in_flight]) }?;

        Ok(Some(AcquiredImage {
            index,
            image: self.images[index as usize],
            image_available: frame.image_available,
            render_finished: self.render_finished[index as usize],
            in_flight: frame.in_flight,
        }))
    }

    pub fn present(&mut self, queue: &SharedQueue, acquired: &AcquiredImage) -> Result<()> {
        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &raw const acquired.render_finished,
            swapchain_count: 1,
            p_swapchains: &raw const self.swapchain,
            p_image_indices: &raw const acquired.index,
            ..Default::default()
        };

        self.current_frame = (self.current_frame + 1) % self.frames.len();

        match unsafe { queue.present(&self.swapchain_loader, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => {
                debug!("swapchain is suboptimal");
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                if !self.reported_out_of_date {
                    warn!("swapchain out of date on present");
                    self.reported_out_of_date = true;
                }
                Ok(())
            }
            Err(e) => Err(e).context("presenting swapchain image"),
        }
    }

    pub fn get_size(&self) -> vk::Extent2D {
        self.image_extent
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl Drop for WindowData {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("failed to wait for device idle: {e}");
            }
            Self::destroy_frame_sync(&self.device, std::mem::take(&mut self.frames));
            for semaphore in self.render_finished.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

/// The swapchain is never recreated, so the window keeps the configured size.
pub fn window_attributes(config: &WindowConfig) -> WindowAttributes {
    WindowAttributes::default()
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .with_title(config.title.clone())
        .with_resizable(false)
}

/// Maps the result of `vkAcquireNextImageKHR` to an image index, or `None`
/// when the frame has to be skipped. Out-of-date is only logged the first time.
fn acquire_outcome(
    acquired: ash::prelude::VkResult<(u32, bool)>,
    reported_out_of_date: &mut bool,
) -> Result<Option<u32>> {
    match acquired {
        Ok((index, suboptimal)) => {
            if suboptimal {
                debug!("swapchain is suboptimal");
            }
            Ok(Some(index))
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            if !*reported_out_of_date {
                warn!("swapchain out of date, skipping frames");
                *reported_out_of_date = true;
            }
            Ok(None)
        }
        Err(e) => Err(e).context("acquiring swapchain image"),
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use winit::dpi::{PhysicalSize, Size};

    use super::{acquire_outcome, window_attributes};
    use crate::config::WindowConfig;

    #[test]
    fn window_is_fixed_size() {
        let config = WindowConfig {
            width: 800,
            height: 600,
            title: "fixed".to_owned(),
        };
        let attributes = window_attributes(&config);

        assert!(!attributes.resizable);
        assert_eq!(attributes.title, "fixed");
        assert_eq!(
            attributes.inner_size,
            Some(Size::Physical(PhysicalSize::new(800, 600)))
        );
    }

    #[test]
    fn out_of_date_skips_frame_and_reports_once() {
        let mut reported = false;

        let skipped = acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), &mut reported);
        assert_eq!(skipped.unwrap(), None);
        assert!(reported);

        let skipped = acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), &mut reported);
        assert_eq!(skipped.unwrap(), None);
        assert!(reported);
    }

    #[test]
    fn acquired_index_is_passed_through() {
        let mut reported = false;
        assert_eq!(acquire_outcome(Ok((2, false)), &mut reported).unwrap(), Some(2));
        assert_eq!(acquire_outcome(Ok((0, true)), &mut reported).unwrap(), Some(0));
        assert!(!reported);
    }

    #[test]
    fn other_acquire_errors_are_fatal() {
        let mut reported = false;
        assert!(acquire_outcome(Err(vk::Result::ERROR_DEVICE_LOST), &mut reported).is_err());
        assert!(!reported);
    }
}
