use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use ash::vk::{
    DebugUtilsMessageSeverityFlagsEXT, DebugUtilsMessageTypeFlagsEXT,
    DebugUtilsMessengerCreateInfoEXT, EXT_DEBUG_UTILS_NAME,
};
use ash::{ext, khr, Device};
use ash::{
    vk::{self},
    Entry, Instance,
};

use clap::Parser;
use config::{Args, Config};
use debug::DebugUtilsData;
use defer::Defer;
use env_logger::Builder;
use features::FeatureChain;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{debug, error, info, warn, LevelFilter};
use render::memory::SharedAllocator;
use render::renderers::RaytraceRenderer;
use render::Renderer;
use utils::{query_queue_families, QueueFamilyInfo};
use window::WindowData;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::WindowId;

mod camera;
mod config;
mod debug;
mod defer;
mod features;
mod render;
mod scene;
mod utils;
mod window;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(debug_assertions)]
const DEBUG_MODE: bool = true;

#[cfg(not(debug_assertions))]
const DEBUG_MODE: bool = false;

const APPLICATION_NAME: &CStr = c"scatter";

struct App<R> {
    // WARNING: ORDER MATTERS HERE!!!
    // fields are dropped from top to bottom (not bottom to top like C++)
    // make sure to also update the Drop impl when adding fields
    renderer: Option<R>,
    window: Option<WindowData>,
    allocator: Option<SharedAllocator>,
    debug_data: Option<DebugUtilsData>,
    device: Option<Device>,
    instance: Instance,
    vk_lib: Entry,
    config: Config,
}

impl<R> App<R>
where
    R: Renderer<WindowData>,
{
    pub fn new(event_loop: &EventLoop<()>, config: Config, debug_mode: bool) -> Result<Self> {
        let vk_lib = unsafe { Entry::load() }.context("failed to load Vulkan library")?;

        let enable_vk_debug = debug_mode && Self::is_vk_debug_supported(&vk_lib)?;
        if debug_mode && !enable_vk_debug {
            warn!("running in debug mode, but validation layer/debug_utils extension are not found/supported");
        }

        let mut debug_utils_info = enable_vk_debug.then(|| DebugUtilsMessengerCreateInfoEXT {
            message_severity: DebugUtilsMessageSeverityFlagsEXT::ERROR
                | DebugUtilsMessageSeverityFlagsEXT::WARNING
                | DebugUtilsMessageSeverityFlagsEXT::INFO
                | DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            message_type: DebugUtilsMessageTypeFlagsEXT::GENERAL
                | DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            pfn_user_callback: Some(debug::debug_callback),
            p_user_data: ptr::null_mut(),
            ..Default::default()
        });

        let validation_feature_enable = [
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
            vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
        ];
        let mut validation_features = enable_vk_debug.then(|| vk::ValidationFeaturesEXT {
            enabled_validation_feature_count: validation_feature_enable.len() as u32,
            p_enabled_validation_features: validation_feature_enable.as_ptr(),
            ..Default::default()
        });

        let instance = Self::create_instance(
            &vk_lib,
            event_loop,
            debug_utils_info.as_mut(),
            validation_features.as_mut(),
        )?
        .defer(|x| unsafe { x.destroy_instance(None) });

        let debug_data = debug_utils_info
            .map(|x| {
                let loader = ext::debug_utils::Instance::new(&vk_lib, &instance);
                unsafe { DebugUtilsData::new(loader, &x) }
            })
            .transpose()?;

        Ok(App {
            renderer: None,
            window: None,
            allocator: None,
            debug_data,
            device: None,
            instance: instance.undefer(),
            vk_lib,
            config,
        })
    }

    fn is_vk_debug_supported(vk_lib: &Entry) -> Result<bool> {
        let available_layers = unsafe { vk_lib.enumerate_instance_layer_properties()? };
        let supported_extensions = unsafe { vk_lib.enumerate_instance_extension_properties(None)? };

        let validation_layer_supported = available_layers
            .iter()
            .any(|x| unsafe { CStr::from_ptr(x.layer_name.as_ptr()) == VALIDATION_LAYER });
        let debug_extensions_supported = supported_extensions
            .iter()
            .any(|x| unsafe { CStr::from_ptr(x.extension_name.as_ptr()) == EXT_DEBUG_UTILS_NAME });

        Ok(validation_layer_supported && debug_extensions_supported)
    }

    fn get_layers_and_extensions(
        event_loop: &EventLoop<()>,
        use_debug_layers: bool,
    ) -> Result<(Vec<*const c_char>, Vec<*const c_char>)> {
        let mut layers = Vec::new();
        let mut extensions = Vec::new();

        if use_debug_layers {
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(EXT_DEBUG_UTILS_NAME.as_ptr());
        }

        let display_handle = event_loop.owned_display_handle();
        let raw_display_handle = display_handle.display_handle()?.as_raw();
        let required_extensions = ash_window::enumerate_required_extensions(raw_display_handle)?;
        let required_renderer_extensions = R::required_instance_extensions();

        extensions.extend_from_slice(required_extensions);
        extensions.extend_from_slice(required_renderer_extensions);

        Ok((layers, extensions))
    }

    fn create_instance(
        vk_lib: &Entry,
        event_loop: &EventLoop<()>,
        debug_utils_info: Option<&mut DebugUtilsMessengerCreateInfoEXT>,
        validation_features: Option<&mut vk::ValidationFeaturesEXT>,
    ) -> Result<Instance> {
        let (layers, extensions) =
            Self::get_layers_and_extensions(event_loop, debug_utils_info.is_some())?;

        let app_info = vk::ApplicationInfo {
            p_application_name: APPLICATION_NAME.as_ptr(),
            application_version: vk::make_api_version(
                0,
                env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
                env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
                env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            ),
            api_version: vk::make_api_version(0, 1, 3, 0),
            ..Default::default()
        };

        let mut create_info = vk::InstanceCreateInfo {
            p_application_info: &app_info,
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };

        if let Some(debug_utils_info) = debug_utils_info {
            create_info = create_info.push_next(debug_utils_info);
        }

        if let Some(validation_features) = validation_features {
            create_info = create_info.push_next(validation_features);
        }

        unsafe { Ok(vk_lib.create_instance(&create_info, None)?) }
    }

    fn is_device_suitable(
        &self,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<bool> {
        let properties = unsafe { self.instance.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();

        // check compatibility of device with window and renderer
        let required_renderer_extensions = R::required_device_extensions();
        let required_window_extensions = WindowData::required_device_extensions();
        let required_extensions =
            [required_renderer_extensions, required_window_extensions].concat();

        let supported_extensions = unsafe {
            self.instance
                .enumerate_device_extension_properties(device)?
        };

        for ext in required_extensions {
            let ext_name = unsafe { CStr::from_ptr(ext) };
            if !supported_extensions
                .iter()
                .any(|x| x.extension_name_as_c_str() == Ok(ext_name))
            {
                debug!("{name}: missing extension {ext_name:?}");
                return Ok(false);
            }
        }

        let available_features = FeatureChain::query(&self.instance, device);
        let missing_features = R::required_features().missing(&available_features);
        if !missing_features.is_empty() {
            debug!("{name}: missing features {missing_features:?}");
            return Ok(false);
        }

        if !WindowData::is_device_suitable(&self.vk_lib, &self.instance, device, surface)? {
            debug!("{name}: cannot present to the window surface");
            return Ok(false);
        }

        let queue_family_info =
            utils::query_queue_families(&self.vk_lib, &self.instance, device, surface)?;
        Ok(R::has_required_queue_families(&queue_family_info))
    }

    fn pick_physical_device(
        &self,
        devices: impl Iterator<Item = vk::PhysicalDevice>,
    ) -> Option<vk::PhysicalDevice> {
        // take the first discrete GPU, or the first device that works if there is none
        let mut devices = devices.peekable();
        let first = devices.peek().cloned();

        for device in devices {
            let properties = unsafe { self.instance.get_physical_device_properties(device) };
            if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                return Some(device);
            }
        }

        first
    }

    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_info: &QueueFamilyInfo,
    ) -> Result<Device> {
        let enabled_extensions = [
            R::required_device_extensions(),
            WindowData::required_device_extensions(),
        ]
        .concat();
        let enabled_features = R::required_features();

        let queue_info = R::get_queue_info(queue_family_info);

        let create_info = vk::DeviceCreateInfo {
            p_next: enabled_features.head() as *const _ as *const c_void,
            queue_create_info_count: queue_info.len() as u32,
            p_queue_create_infos: queue_info.as_ptr(),
            enabled_extension_count: enabled_extensions.len() as u32,
            pp_enabled_extension_names: enabled_extensions.as_ptr(),
            p_enabled_features: ptr::null(),
            ..Default::default()
        };
        let device = unsafe {
            self.instance
                .create_device(physical_device, &create_info, None)
        }?;

        Ok(device)
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let surface_loader = khr::surface::Instance::new(&self.vk_lib, &self.instance);

        let window = event_loop.create_window(window::window_attributes(&self.config.window))?;
        let display_handle = window.display_handle()?;
        let window_handle = window.window_handle()?;
        let surface = unsafe {
            ash_window::create_surface(
                &self.vk_lib,
                &self.instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }?
        .defer(|x| unsafe { surface_loader.destroy_surface(x, None) });
        debug!("Created window: {:?}", window.title());

        // surface created - now we pick physical device
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .context("failed to enumerate physical devices")?;

        let valid_devices = devices.into_iter().filter(|device| {
            // skip and log if check function returns Err
            self.is_device_suitable(*device, *surface)
                .unwrap_or_else(|e| {
                    warn!("failed to check if device was suitable: {e:#}");
                    false
                })
        });

        let physical_device = self
            .pick_physical_device(valid_devices)
            .ok_or(anyhow!("failed to find a device with ray tracing support"))?;
        let properties = unsafe { self.instance.get_physical_device_properties(physical_device) };
        info!(
            "using {:?}",
            properties.device_name_as_c_str().unwrap_or(c"<unknown>")
        );

        let queue_family_info =
            query_queue_families(&self.vk_lib, &self.instance, physical_device, *surface)?;
        let device = self
            .create_device(physical_device, &queue_family_info)
            .context("failed to create device")?
            .defer(|x| unsafe { x.destroy_device(None) });

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: self.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("failed to create allocator")?;
        let allocator = Arc::new(Mutex::new(allocator));

        let window = WindowData::new(
            &self.vk_lib,
            &self.instance,
            &device,
            physical_device,
            // the window owns the surface from here on, including on failure
            surface.undefer(),
            window,
            self.config.render.frames_in_flight,
        )
        .context("swapchain creation failed")?;

        let mut renderer = R::new(
            &self.instance,
            &device,
            physical_device,
            &queue_family_info,
            &window,
            allocator.clone(),
            &self.config,
        )
        .context("failed to create renderer")?;

        // the renderer builds the scene in the background from here on
        let ingested = renderer.ingest_scene(&self.config.scene_assets());

        self.allocator = Some(allocator);
        self.window = Some(window);
        self.renderer = Some(renderer);
        self.device = Some(device.undefer());

        ingested.context("failed to start loading the scene")
    }
}

impl<R> Drop for App<R> {
    fn drop(&mut self) {
        drop(self.renderer.take());
        drop(self.window.take());
        drop(self.allocator.take());
        if let Some(device) = self.device.take() {
            unsafe { device.destroy_device(None) };
        }
        drop(self.debug_data.take());
        unsafe { self.instance.destroy_instance(None) };
    }
}

impl<R> ApplicationHandler for App<R>
where
    R: Renderer<WindowData>,
{
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        debug!("App resuming...");
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                error!("initialization failed: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                debug!("Closing window...");
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_mut())
                else {
                    return;
                };

                if let Err(e) = renderer.render_to(window) {
                    error!("failed to render frame: {e:#}");
                    event_loop.exit();
                    return;
                }

                window.request_redraw();
            }
            _ => (),
        }
    }
}

fn main() -> Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = Config::load(&args)?;
    debug!("{config:?}");

    let event_loop = EventLoop::new()?;
    let mut app: App<RaytraceRenderer> = App::new(&event_loop, config, DEBUG_MODE)?;
    event_loop.run_app(&mut app)?;
    Ok(())
}
