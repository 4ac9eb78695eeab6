use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use ash::{khr, vk, Device};
use log::{debug, info};

use crate::defer::Defer;
use crate::render::memory::DeviceMemory;
use crate::utils::{align_up, AllocatedBuffer};

const SHADER_ENTRY_POINT: &std::ffi::CStr = c"Main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    RayGeneration,
    ClosestHit,
    Miss,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 3] = [
        ShaderKind::RayGeneration,
        ShaderKind::ClosestHit,
        ShaderKind::Miss,
    ];

    pub fn stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderKind::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderKind::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderKind::Miss => vk::ShaderStageFlags::MISS_KHR,
        }
    }

    pub fn group_type(self) -> vk::RayTracingShaderGroupTypeKHR {
        match self {
            ShaderKind::RayGeneration | ShaderKind::Miss => {
                vk::RayTracingShaderGroupTypeKHR::GENERAL
            }
            ShaderKind::ClosestHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
        }
    }

    /// Compiled SPIR-V file name inside the shader directory.
    pub fn file_name(self) -> &'static str {
        match self {
            ShaderKind::RayGeneration => "raygen.rgen.spv",
            ShaderKind::ClosestHit => "closesthit.rchit.spv",
            ShaderKind::Miss => "miss.rmiss.spv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub kind: ShaderKind,
    pub path: PathBuf,
}

impl ShaderStageDesc {
    /// Ray generation, closest hit, miss; in that order.
    pub fn default_stages(shader_dir: &Path) -> Vec<ShaderStageDesc> {
        ShaderKind::ALL
            .into_iter()
            .map(|kind| ShaderStageDesc {
                kind,
                path: shader_dir.join(kind.file_name()),
            })
            .collect()
    }
}

/// One group per stage, in stage order.
pub fn shader_groups(kinds: &[ShaderKind]) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
    kinds
        .iter()
        .enumerate()
        .map(|(stage_index, &kind)| {
            let stage_index = stage_index as u32;
            let (general_shader, closest_hit_shader) = match kind {
                ShaderKind::ClosestHit => (vk::SHADER_UNUSED_KHR, stage_index),
                ShaderKind::RayGeneration | ShaderKind::Miss => {
                    (stage_index, vk::SHADER_UNUSED_KHR)
                }
            };

            vk::RayTracingShaderGroupCreateInfoKHR {
                ty: kind.group_type(),
                general_shader,
                closest_hit_shader,
                any_hit_shader: vk::SHADER_UNUSED_KHR,
                intersection_shader: vk::SHADER_UNUSED_KHR,
                ..Default::default()
            }
        })
        .collect()
}

/// Index of the only group of `kind`.
pub fn group_index(group_kinds: &[ShaderKind], kind: ShaderKind) -> Result<usize> {
    let mut matches = group_kinds
        .iter()
        .enumerate()
        .filter(|(_, &k)| k == kind)
        .map(|(i, _)| i);

    match (matches.next(), matches.next()) {
        (Some(i), None) => Ok(i),
        (None, _) => bail!("pipeline has no {kind:?} shader group"),
        (Some(_), Some(_)) => bail!("pipeline has more than one {kind:?} shader group"),
    }
}

/// The parts of the device's ray tracing pipeline properties the shader
/// binding table depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupHandleInfo {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

impl ShaderGroupHandleInfo {
    pub fn from_properties(properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>) -> Self {
        Self {
            handle_size: properties.shader_group_handle_size,
            handle_alignment: properties.shader_group_handle_alignment,
            base_alignment: properties.shader_group_base_alignment,
        }
    }

    pub fn stride(&self) -> u64 {
        align_up(self.handle_size as u64, self.handle_alignment as u64)
    }
}

/// Copies the handle of `kind` out of the packed handle blob into a
/// stride-sized record.
pub fn shader_record(
    handles: &[u8],
    group_kinds: &[ShaderKind],
    kind: ShaderKind,
    info: &ShaderGroupHandleInfo,
) -> Result<Vec<u8>> {
    let handle_size = info.handle_size as usize;
    let index = group_index(group_kinds, kind)?;
    let handle = handles
        .get(index * handle_size..(index + 1) * handle_size)
        .ok_or(anyhow!("shader group handle data too short for group {index}"))?;

    let mut record = vec![0u8; info.stride() as usize];
    record[..handle_size].copy_from_slice(handle);
    Ok(record)
}

pub struct RaytracingPipeline {
    pub pipeline: vk::Pipeline,
    pub group_kinds: Vec<ShaderKind>,
}

pub struct RaytracingPipelineFactory<'a> {
    device: &'a Device,
    loader: &'a khr::ray_tracing_pipeline::Device,
}

impl<'a> RaytracingPipelineFactory<'a> {
    pub fn new(device: &'a Device, loader: &'a khr::ray_tracing_pipeline::Device) -> Self {
        Self { device, loader }
    }

    pub fn create_pipeline(
        &self,
        stages: &[ShaderStageDesc],
        layout: vk::PipelineLayout,
        max_recursion_depth: u32,
    ) -> Result<RaytracingPipeline> {
        // modules are only needed until the pipeline exists
        let mut modules = Vec::with_capacity(stages.len()).defer(|modules| {
            for module in modules {
                unsafe { self.device.destroy_shader_module(module, None) };
            }
        });

        for stage in stages {
            modules.push(load_shader_module(self.device, &stage.path)?);
        }

        let shader_stages: Vec<_> = stages
            .iter()
            .zip(modules.iter())
            .map(|(stage, &module)| vk::PipelineShaderStageCreateInfo {
                stage: stage.kind.stage(),
                module,
                p_name: SHADER_ENTRY_POINT.as_ptr(),
                ..Default::default()
            })
            .collect();

        let group_kinds: Vec<_> = stages.iter().map(|x| x.kind).collect();
        let groups = shader_groups(&group_kinds);

        let pipeline = unsafe {
            let out = self.loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[vk::RayTracingPipelineCreateInfoKHR {
                    stage_count: shader_stages.len() as u32,
                    p_stages: shader_stages.as_ptr(),
                    group_count: groups.len() as u32,
                    p_groups: groups.as_ptr(),
                    max_pipeline_ray_recursion_depth: max_recursion_depth,
                    layout,
                    ..Default::default()
                }],
                None,
            );
            match out {
                Ok(x) => x[0],
                Err((x, e)) => {
                    for pipeline in x {
                        self.device.destroy_pipeline(pipeline, None);
                    }
                    bail!("failed to create ray tracing pipeline: {e}");
                }
            }
        };

        info!(
            "created ray tracing pipeline with {} shader groups",
            groups.len()
        );
        Ok(RaytracingPipeline {
            pipeline,
            group_kinds,
        })
    }

    pub fn group_handles(
        &self,
        pipeline: &RaytracingPipeline,
        info: &ShaderGroupHandleInfo,
    ) -> Result<Vec<u8>> {
        let group_count = pipeline.group_kinds.len() as u32;
        let handles = unsafe {
            self.loader.get_ray_tracing_shader_group_handles(
                pipeline.pipeline,
                0,
                group_count,
                group_count as usize * info.handle_size as usize,
            )
        }
        .context("querying shader group handles")?;
        Ok(handles)
    }
}

fn read_shader_code(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| {
        format!(
            "opening shader {} (compile {}, {} and {} with entry point `Main` into the \
             `shader_dir` set under [assets] or by --shaders)",
            path.display(),
            ShaderKind::RayGeneration.file_name(),
            ShaderKind::ClosestHit.file_name(),
            ShaderKind::Miss.file_name(),
        )
    })?;
    ash::util::read_spv(&mut file).with_context(|| format!("reading SPIR-V from {}", path.display()))
}

fn load_shader_module(device: &Device, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_shader_code(path)?;

    let module = unsafe {
        device.create_shader_module(
            &vk::ShaderModuleCreateInfo {
                code_size: code.len() * 4,
                p_code: code.as_ptr(),
                ..Default::default()
            },
            None,
        )
    }
    .with_context(|| format!("creating shader module {}", path.display()))?;

    debug!("loaded shader {}", path.display());
    Ok(module)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

impl SbtRegions {
    pub fn region(&self, kind: ShaderKind) -> vk::StridedDeviceAddressRegionKHR {
        match kind {
            ShaderKind::RayGeneration => self.raygen,
            ShaderKind::ClosestHit => self.hit,
            ShaderKind::Miss => self.miss,
        }
    }
}

/// One host-visible buffer per shader kind, each holding a single record.
pub struct ShaderBindingTable {
    raygen: AllocatedBuffer,
    hit: AllocatedBuffer,
    miss: AllocatedBuffer,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    pub fn new(
        memory: &DeviceMemory,
        handles: &[u8],
        pipeline: &RaytracingPipeline,
        info: &ShaderGroupHandleInfo,
    ) -> Result<Self> {
        let stride = info.stride();
        let create = |kind| -> Result<AllocatedBuffer> {
            let record = shader_record(handles, &pipeline.group_kinds, kind, info)?;
            memory
                .create_host_buffer(
                    &record,
                    vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    info.base_alignment as u64,
                )
                .with_context(|| format!("creating {kind:?} shader binding table"))
        };

        let raygen = create(ShaderKind::RayGeneration)?.defer(|x| memory.destroy_buffer(x));
        let hit = create(ShaderKind::ClosestHit)?.defer(|x| memory.destroy_buffer(x));
        let miss = create(ShaderKind::Miss)?.defer(|x| memory.destroy_buffer(x));

        let region = |buffer: &AllocatedBuffer| vk::StridedDeviceAddressRegionKHR {
            device_address: unsafe { buffer.get_device_address(memory.device()) },
            stride,
            size: stride,
        };
        let regions = SbtRegions {
            raygen: region(&raygen),
            miss: region(&miss),
            hit: region(&hit),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        };

        debug!(
            "shader binding table: handle size {}, stride {}, base alignment {}",
            info.handle_size, stride, info.base_alignment
        );

        Ok(Self {
            raygen: raygen.undefer(),
            hit: hit.undefer(),
            miss: miss.undefer(),
            regions,
        })
    }

    pub fn regions(&self) -> SbtRegions {
        self.regions
    }

    pub fn destroy(self, memory: &DeviceMemory) {
        memory.destroy_buffer(self.raygen);
        memory.destroy_buffer(self.hit);
        memory.destroy_buffer(self.miss);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ash::vk;

    use super::*;

    const INFO: ShaderGroupHandleInfo = ShaderGroupHandleInfo {
        handle_size: 32,
        handle_alignment: 64,
        base_alignment: 64,
    };

    #[test]
    fn default_stages_follow_dispatch_order() {
        let stages = ShaderStageDesc::default_stages(Path::new("shaders"));
        let kinds: Vec<_> = stages.iter().map(|x| x.kind).collect();

        assert_eq!(
            kinds,
            [
                ShaderKind::RayGeneration,
                ShaderKind::ClosestHit,
                ShaderKind::Miss
            ]
        );
        assert_eq!(stages[1].path, Path::new("shaders/closesthit.rchit.spv"));
    }

    #[test]
    fn groups_reference_their_stage() {
        let groups = shader_groups(&ShaderKind::ALL);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[0].closest_hit_shader, vk::SHADER_UNUSED_KHR);

        assert_eq!(
            groups[1].ty,
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(groups[1].general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[1].closest_hit_shader, 1);

        assert_eq!(groups[2].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[2].general_shader, 2);
        for group in &groups {
            assert_eq!(group.any_hit_shader, vk::SHADER_UNUSED_KHR);
            assert_eq!(group.intersection_shader, vk::SHADER_UNUSED_KHR);
        }
    }

    #[test]
    fn every_kind_needs_exactly_one_group() {
        let kinds = [ShaderKind::Miss, ShaderKind::RayGeneration];
        assert_eq!(group_index(&kinds, ShaderKind::RayGeneration).unwrap(), 1);
        assert!(group_index(&kinds, ShaderKind::ClosestHit).is_err());

        let kinds = [ShaderKind::Miss, ShaderKind::Miss];
        assert!(group_index(&kinds, ShaderKind::Miss).is_err());
    }

    #[test]
    fn stride_rounds_handle_up_to_alignment() {
        assert_eq!(INFO.stride(), 64);

        let tight = ShaderGroupHandleInfo {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        };
        assert_eq!(tight.stride(), 32);
    }

    #[test]
    fn records_are_looked_up_by_kind() {
        // miss, raygen, closest hit: deliberately not the default order
        let kinds = [
            ShaderKind::Miss,
            ShaderKind::RayGeneration,
            ShaderKind::ClosestHit,
        ];
        let handles: Vec<u8> = (0..3u8).flat_map(|i| [i + 1; 32]).collect();

        let raygen = shader_record(&handles, &kinds, ShaderKind::RayGeneration, &INFO).unwrap();
        assert_eq!(raygen.len(), 64);
        assert!(raygen[..32].iter().all(|&x| x == 2));
        assert!(raygen[32..].iter().all(|&x| x == 0));

        let miss = shader_record(&handles, &kinds, ShaderKind::Miss, &INFO).unwrap();
        assert!(miss[..32].iter().all(|&x| x == 1));

        let hit = shader_record(&handles, &kinds, ShaderKind::ClosestHit, &INFO).unwrap();
        assert!(hit[..32].iter().all(|&x| x == 3));
    }

    #[test]
    fn short_handle_data_is_rejected() {
        let handles = vec![0u8; 32];
        assert!(shader_record(&handles, &ShaderKind::ALL, ShaderKind::Miss, &INFO).is_err());
    }

    #[test]
    fn missing_shader_names_expected_files() {
        let path = Path::new("/nonexistent/shaders").join(ShaderKind::Miss.file_name());
        let message = format!("{:#}", read_shader_code(&path).unwrap_err());

        assert!(message.contains("/nonexistent/shaders/miss.rmiss.spv"), "{message}");
        for kind in ShaderKind::ALL {
            assert!(message.contains(kind.file_name()), "{message}");
        }
        assert!(message.contains("--shaders"), "{message}");
    }

    #[test]
    fn spirv_words_are_read() {
        let words = [0x0723_0203u32, 0x0001_0000, 0, 1, 0];
        let path = std::env::temp_dir().join(format!("scatter-{}.spv", std::process::id()));
        std::fs::write(&path, bytemuck::cast_slice::<u32, u8>(&words)).unwrap();

        let code = read_shader_code(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(code.unwrap(), words);
    }
}
