//! Tests that need a Vulkan device with ray tracing support. They are ignored
//! by default; run them with `cargo test -- --ignored` on a capable machine.

use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, Mutex};

use ash::{khr, vk, Device, Entry, Instance};
use glam::Vec3;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::features::FeatureChain;
use crate::render::accel::AccelerationStructureBuilder;
use crate::render::immediate::{ImmediateCommandContext, SharedQueue};
use crate::render::loader::upload_mesh;
use crate::render::memory::DeviceMemory;
use crate::scene::geometry::{Mesh, Vertex};
use crate::scene::placements::InstancePlacement;

const DEVICE_EXTENSIONS: [&CStr; 3] = [
    khr::acceleration_structure::NAME,
    khr::deferred_host_operations::NAME,
    khr::ray_tracing_pipeline::NAME,
];

struct Harness {
    immediate: Option<ImmediateCommandContext>,
    memory: Option<DeviceMemory>,
    accel_loader: khr::acceleration_structure::Device,
    scratch_alignment: u64,
    device: Device,
    instance: Instance,
    _entry: Entry,
}

impl Harness {
    /// `None` when there is no Vulkan driver or no device that can ray trace.
    fn new() -> Option<Harness> {
        let entry = unsafe { Entry::load() }.ok()?;
        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 3, 0),
            ..Default::default()
        };
        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo {
                    p_application_info: &app_info,
                    ..Default::default()
                },
                None,
            )
        }
        .ok()?;

        let Some((physical_device, family_index)) = Self::pick_device(&instance) else {
            unsafe { instance.destroy_instance(None) };
            return None;
        };

        let features = FeatureChain::required();
        let extensions: Vec<*const c_char> = DEVICE_EXTENSIONS.iter().map(|x| x.as_ptr()).collect();
        let queue_info = vk::DeviceQueueCreateInfo {
            queue_family_index: family_index,
            queue_count: 1,
            p_queue_priorities: &1.0,
            ..Default::default()
        };
        let device = unsafe {
            instance.create_device(
                physical_device,
                &vk::DeviceCreateInfo {
                    p_next: features.head() as *const _ as *const c_void,
                    queue_create_info_count: 1,
                    p_queue_create_infos: &raw const queue_info,
                    enabled_extension_count: extensions.len() as u32,
                    pp_enabled_extension_names: extensions.as_ptr(),
                    ..Default::default()
                },
                None,
            )
        }
        .unwrap();

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .unwrap();

        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2 {
            p_next: &raw mut accel_properties as *mut c_void,
            ..Default::default()
        };
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };

        let memory = DeviceMemory::new(
            &device,
            Arc::new(Mutex::new(allocator)),
            properties2.properties.limits,
        );
        let queue = Arc::new(SharedQueue::new(&device, family_index));
        let immediate = ImmediateCommandContext::new(&device, queue).unwrap();

        Some(Harness {
            immediate: Some(immediate),
            memory: Some(memory),
            accel_loader: khr::acceleration_structure::Device::new(&instance, &device),
            scratch_alignment: accel_properties.min_acceleration_structure_scratch_offset_alignment
                as u64,
            device,
            instance,
            _entry: entry,
        })
    }

    fn pick_device(instance: &Instance) -> Option<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.ok()?;
        devices.into_iter().find_map(|device| {
            let supported = unsafe { instance.enumerate_device_extension_properties(device) }.ok()?;
            let has_extensions = DEVICE_EXTENSIONS.iter().all(|wanted| {
                supported
                    .iter()
                    .any(|x| x.extension_name_as_c_str() == Ok(*wanted))
            });
            let missing = FeatureChain::required().missing(&FeatureChain::query(instance, device));
            if !has_extensions || !missing.is_empty() {
                return None;
            }

            let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let family = families
                .iter()
                .position(|x| x.queue_flags.contains(vk::QueueFlags::GRAPHICS))?;
            Some((device, family as u32))
        })
    }

    fn memory(&self) -> &DeviceMemory {
        self.memory.as_ref().unwrap()
    }

    fn immediate(&self) -> &ImmediateCommandContext {
        self.immediate.as_ref().unwrap()
    }

    fn accel_builder(&self) -> AccelerationStructureBuilder<'_> {
        AccelerationStructureBuilder::new(
            self.memory(),
            self.immediate(),
            self.accel_loader.clone(),
            self.scratch_alignment,
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        unsafe { self.device.device_wait_idle().unwrap() };
        drop(self.immediate.take());
        // last handle on the allocator, which has to go before the device
        drop(self.memory.take());
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn harness() -> Option<Harness> {
    let harness = Harness::new();
    if harness.is_none() {
        eprintln!("no ray tracing capable Vulkan device, skipping");
    }
    harness
}

fn triangle() -> Mesh {
    let positions = [Vec3::ZERO, Vec3::X, Vec3::Y];
    Mesh {
        vertices: positions
            .into_iter()
            .map(|position| Vertex {
                position,
                normal: Vec3::Z,
            })
            .collect(),
        indices: vec![0, 1, 2],
    }
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn uploaded_buffer_reads_back_unchanged() {
    let Some(harness) = harness() else { return };
    let memory = harness.memory();

    let data: Vec<u32> = (0..4096).map(|x| x * 7 + 3).collect();
    let buffer = memory
        .upload_from_host(
            harness.immediate(),
            &data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .unwrap();
    let bytes = memory
        .read_back(harness.immediate(), &buffer, buffer.size)
        .unwrap();
    memory.destroy_buffer(buffer);

    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&data));
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn single_triangle_blas() {
    let Some(harness) = harness() else { return };
    let mesh = upload_mesh(harness.memory(), harness.immediate(), &triangle()).unwrap();
    let builder = harness.accel_builder();

    let blas = builder.build_blas(&mesh).unwrap();
    assert_eq!(blas.primitive_count, 1);
    assert_eq!(blas.level, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
    assert_ne!(blas.device_address, 0);
    assert!(blas.memory_size() > 0);

    builder.destroy(blas);
    harness.memory().destroy_buffer(mesh.vertices);
    harness.memory().destroy_buffer(mesh.indices);
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn tlas_over_placements() {
    let Some(harness) = harness() else { return };
    let mesh = upload_mesh(harness.memory(), harness.immediate(), &triangle()).unwrap();
    let builder = harness.accel_builder();
    let blas = builder.build_blas(&mesh).unwrap();

    let placements = [
        InstancePlacement {
            position: Vec3::ZERO,
            normal: Vec3::Y,
        },
        InstancePlacement {
            position: Vec3::new(3.0, 0.0, -2.0),
            normal: Vec3::X,
        },
    ];
    let tlas = builder
        .build_tlas(&blas, mesh.index_count, &placements)
        .unwrap();
    assert_eq!(tlas.primitive_count, 2);
    assert_eq!(tlas.level, vk::AccelerationStructureTypeKHR::TOP_LEVEL);
    assert_ne!(tlas.device_address, 0);

    let empty = builder.build_tlas(&blas, mesh.index_count, &[]).unwrap();
    assert_eq!(empty.primitive_count, 0);
    assert_ne!(empty.device_address, 0);

    builder.destroy(empty);
    builder.destroy(tlas);
    builder.destroy(blas);
    harness.memory().destroy_buffer(mesh.vertices);
    harness.memory().destroy_buffer(mesh.indices);
}
