use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use ash::{khr, vk, Device};
use log::{error, info, warn};

use crate::camera::CameraConstants;
use crate::defer::Defer;
use crate::render::accel::{AccelerationStructureBuilder, MeshBuffers};
use crate::render::descriptors::{raytracing_set_builder, write_raytracing_set, RaytracingDescriptorWrites};
use crate::render::gate::ReadinessGate;
use crate::render::immediate::{ImmediateCommandContext, SharedQueue};
use crate::render::memory::DeviceMemory;
use crate::render::pipeline::{
    RaytracingPipelineFactory, ShaderBindingTable, ShaderGroupHandleInfo, ShaderStageDesc,
};
use crate::render::resources::{RaytracingResources, RenderAttachments, COLOR_FORMAT, DEPTH_FORMAT};
use crate::scene::geometry::{load_mesh, Mesh};
use crate::scene::placements::{load_placements, InstancePlacement};
use crate::scene::SceneAssets;

const MAX_RAY_RECURSION_DEPTH: u32 = 1;

/// Everything the loader thread needs, moved into it at spawn.
pub struct LoaderContext {
    pub memory: DeviceMemory,
    pub queue: Arc<SharedQueue>,
    pub accel_loader: khr::acceleration_structure::Device,
    pub rt_pipeline_loader: khr::ray_tracing_pipeline::Device,
    pub handle_info: ShaderGroupHandleInfo,
    pub scratch_alignment: u64,
    pub extent: vk::Extent2D,
    pub assets: SceneAssets,
}

/// The background thread building [`RaytracingResources`].
///
/// Never cancelled; dropping the handle waits for it to finish.
pub struct ResourceLoader {
    handle: Option<JoinHandle<()>>,
}

impl ResourceLoader {
    pub fn spawn(
        context: LoaderContext,
        gate: Arc<ReadinessGate<RaytracingResources>>,
    ) -> Result<ResourceLoader> {
        let handle = thread::Builder::new()
            .name("resource-loader".to_owned())
            .spawn(move || run(context, &gate))
            .context("spawning resource loader thread")?;

        Ok(ResourceLoader {
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |x| x.is_finished())
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("resource loader thread panicked");
            }
        }
    }
}

impl Drop for ResourceLoader {
    fn drop(&mut self) {
        self.join();
    }
}

fn run(context: LoaderContext, gate: &ReadinessGate<RaytracingResources>) {
    let start = Instant::now();

    let built = load_resources(&context);
    if let Some(duplicate) = publish_or_log(gate, built, start) {
        // every loader submit was waited on, so nothing is in flight
        duplicate.destroy(&context.memory, &context.accel_loader);
    }
}

/// Publishes a successful build. A failed build is logged and leaves the gate
/// loading. A set that arrives after another was published is handed back.
fn publish_or_log<T>(gate: &ReadinessGate<T>, built: Result<T>, start: Instant) -> Option<T> {
    match built {
        Ok(resources) => match gate.publish(resources) {
            Ok(()) => {
                info!("resources ready after {:.2?}", start.elapsed());
                None
            }
            Err(resources) => {
                warn!("resources were already published, discarding the new set");
                Some(resources)
            }
        },
        Err(e) => {
            error!("failed to load resources: {e:#}");
            None
        }
    }
}

fn load_assets(assets: &SceneAssets) -> Result<(Mesh, Vec<InstancePlacement>)> {
    let mesh = load_mesh(&assets.mesh)?;
    let placements = load_placements(&assets.placements)?;
    info!(
        "loaded {} triangles and {} placements",
        mesh.triangle_count(),
        placements.len()
    );
    Ok((mesh, placements))
}

/// Builds every resource the ray dispatch path reads. On failure whatever
/// was already built is destroyed before returning.
fn load_resources(context: &LoaderContext) -> Result<RaytracingResources> {
    // assets first, so a bad file fails before anything touches the device
    let (mesh, placements) = load_assets(&context.assets)?;

    let memory = &context.memory;
    let device = memory.device();
    let immediate = ImmediateCommandContext::new(device, context.queue.clone())?;

    let attachments = create_attachments(memory, &immediate, context.extent)
        .context("creating render attachments")?
        .defer(|x| x.destroy(memory));

    let mesh_buffers = upload_mesh(memory, &immediate, &mesh)
        .context("uploading mesh")?
        .defer(|x| {
            memory.destroy_buffer(x.indices);
            memory.destroy_buffer(x.vertices);
        });

    let builder = AccelerationStructureBuilder::new(
        memory,
        &immediate,
        context.accel_loader.clone(),
        context.scratch_alignment,
    );
    let blas = builder
        .build_blas(&mesh_buffers)
        .context("building bottom level acceleration structure")?
        .defer(|x| builder.destroy(x));
    let tlas = builder
        .build_tlas(&blas, mesh_buffers.index_count, &placements)
        .context("building top level acceleration structure")?
        .defer(|x| builder.destroy(x));
    info!(
        "acceleration structures use {} bytes (BLAS {}, TLAS {})",
        blas.memory_size() + tlas.memory_size(),
        blas.memory_size(),
        tlas.memory_size()
    );

    let descriptors = raytracing_set_builder()
        .build(device)
        .context("creating descriptor set")?
        .defer(|x| unsafe { x.destroy(device) });

    let pipeline_layout = create_pipeline_layout(device, descriptors.layout)?
        .defer(|x| unsafe { device.destroy_pipeline_layout(x, None) });

    let factory = RaytracingPipelineFactory::new(device, &context.rt_pipeline_loader);
    let stages = ShaderStageDesc::default_stages(&context.assets.shader_dir);
    let pipeline = factory
        .create_pipeline(&stages, *pipeline_layout, MAX_RAY_RECURSION_DEPTH)?
        .defer(|x| unsafe { device.destroy_pipeline(x.pipeline, None) });

    let handles = factory.group_handles(&pipeline, &context.handle_info)?;
    let sbt = ShaderBindingTable::new(memory, &handles, &pipeline, &context.handle_info)?;

    write_raytracing_set(
        device,
        descriptors.set,
        &RaytracingDescriptorWrites {
            tlas: tlas.handle,
            output_view: attachments.color.image_view,
            vertex_buffer: mesh_buffers.vertices.buffer,
            index_buffer: mesh_buffers.indices.buffer,
        },
    );

    Ok(RaytracingResources {
        attachments: attachments.undefer(),
        mesh: mesh_buffers.undefer(),
        blas: blas.undefer(),
        tlas: tlas.undefer(),
        descriptors: descriptors.undefer(),
        pipeline_layout: pipeline_layout.undefer(),
        pipeline: pipeline.undefer(),
        sbt,
    })
}

/// Color and depth targets, left in the layouts the first ready frame expects.
fn create_attachments(
    memory: &DeviceMemory,
    immediate: &ImmediateCommandContext,
    extent: vk::Extent2D,
) -> Result<RenderAttachments> {
    let size = (extent.width, extent.height);

    let mut color = memory
        .create_image(
            size,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
        )?
        .defer(|x| memory.destroy_image(x));
    let mut depth = memory
        .create_image(
            size,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?
        .defer(|x| memory.destroy_image(x));

    immediate.run(|commands| {
        color.transition(commands, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        depth.transition(commands, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        Ok(())
    })?;

    Ok(RenderAttachments {
        color: color.undefer(),
        depth: depth.undefer(),
    })
}

pub(super) fn upload_mesh(
    memory: &DeviceMemory,
    immediate: &ImmediateCommandContext,
    mesh: &Mesh,
) -> Result<MeshBuffers> {
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::TRANSFER_SRC;

    let vertices = memory
        .upload_from_host(immediate, &mesh.vertices, usage)?
        .defer(|x| memory.destroy_buffer(x));
    let indices = memory.upload_from_host(immediate, &mesh.indices, usage)?;

    Ok(MeshBuffers {
        vertices: vertices.undefer(),
        indices,
        vertex_count: mesh.vertices.len() as u32,
        index_count: mesh.indices.len() as u32,
    })
}

fn create_pipeline_layout(
    device: &Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let push_constant_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::RAYGEN_KHR,
        offset: 0,
        size: std::mem::size_of::<CameraConstants>() as u32,
    };

    let layout = unsafe {
        device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo {
                set_layout_count: 1,
                p_set_layouts: &raw const set_layout,
                push_constant_range_count: 1,
                p_push_constant_ranges: &raw const push_constant_range,
                ..Default::default()
            },
            None,
        )
    }?;

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use anyhow::anyhow;

    use super::{load_assets, publish_or_log};
    use crate::render::gate::{ReadinessGate, ResourceState};
    use crate::scene::SceneAssets;

    fn bundled(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources").join(name)
    }

    #[test]
    fn failed_build_leaves_gate_loading() {
        let gate = ReadinessGate::<u32>::new();

        let leftover = publish_or_log(&gate, Err(anyhow!("no mesh")), Instant::now());
        assert_eq!(leftover, None);
        assert_eq!(gate.state(), ResourceState::Loading);
        assert_eq!(gate.get(), None);
    }

    #[test]
    fn successful_build_publishes_once() {
        let gate = ReadinessGate::new();

        assert_eq!(publish_or_log(&gate, Ok(1), Instant::now()), None);
        assert_eq!(gate.state(), ResourceState::Ready);
        assert_eq!(gate.get(), Some(&1));

        // a second set is handed back for destruction and the first one stays
        assert_eq!(publish_or_log(&gate, Ok(2), Instant::now()), Some(2));
        assert_eq!(gate.get(), Some(&1));
    }

    #[test]
    fn missing_asset_never_publishes() {
        let assets = SceneAssets {
            mesh: bundled("does-not-exist.obj"),
            placements: bundled("placements.obj"),
            shader_dir: PathBuf::from("shaders"),
        };
        let gate = ReadinessGate::<()>::new();

        let built = load_assets(&assets).map(|_| ());
        let err = built.as_ref().unwrap_err();
        assert!(format!("{err:#}").contains("does-not-exist.obj"));

        publish_or_log(&gate, built, Instant::now());
        assert_eq!(gate.state(), ResourceState::Loading);
    }

    #[test]
    fn bundled_assets_load() {
        let assets = SceneAssets {
            mesh: bundled("mesh.obj"),
            placements: bundled("placements.obj"),
            shader_dir: PathBuf::from("shaders"),
        };
        let (mesh, placements) = load_assets(&assets).unwrap();
        assert_eq!(mesh.triangle_count(), 6);
        assert_eq!(placements.len(), 5);
    }
}
