use anyhow::{bail, Result};
use ash::{khr, vk};
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use log::{debug, info};

use crate::defer::Defer;
use crate::render::immediate::ImmediateCommandContext;
use crate::render::memory::DeviceMemory;
use crate::scene::geometry::Vertex;
use crate::scene::placements::InstancePlacement;
use crate::utils::AllocatedBuffer;

/// Arbitrary world direction the instance frames are built against.
const WORLD_FORWARD: Vec3 = Vec3::NEG_Z;

/// Used instead of [`WORLD_FORWARD`] when a normal points along it.
const FALLBACK_FORWARD: Vec3 = Vec3::Y;

/// Instance records must start on a 16 byte boundary.
const INSTANCE_BUFFER_ALIGNMENT: u64 = 16;

pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: AllocatedBuffer,
    pub device_address: vk::DeviceAddress,
    pub primitive_count: u32,
    pub level: vk::AccelerationStructureTypeKHR,
}

impl AccelerationStructure {
    pub fn memory_size(&self) -> vk::DeviceSize {
        self.buffer.size
    }
}

pub struct MeshBuffers {
    pub vertices: AllocatedBuffer,
    pub indices: AllocatedBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSizes {
    pub structure: vk::DeviceSize,
    pub scratch: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedFrame {
    pub right: Vec3,
    pub up: Vec3,
    pub forward: Vec3,
}

pub fn oriented_frame(normal: Vec3) -> OrientedFrame {
    let up = normal
        .try_normalize()
        .unwrap_or(InstancePlacement::DEFAULT_NORMAL);

    let mut right = WORLD_FORWARD.cross(up);
    if right.length_squared() < 1e-8 {
        right = FALLBACK_FORWARD.cross(up);
    }
    let right = right.normalize();
    let forward = up.cross(right);

    OrientedFrame { right, up, forward }
}

/// Row-major 3x4 transform with rotation columns right, up, forward and the
/// placement position as translation.
pub fn instance_transform(placement: &InstancePlacement) -> vk::TransformMatrixKHR {
    let OrientedFrame { right, up, forward } = oriented_frame(placement.normal);
    let transform = Mat4::from_cols(
        right.extend(0.0),
        up.extend(0.0),
        forward.extend(0.0),
        placement.position.extend(1.0),
    );

    // columns of the transpose are the rows we want
    let mut matrix = [0f32; 16];
    transform.transpose().write_cols_to_slice(&mut matrix);

    let mut matrix_3_4 = [0f32; 12];
    matrix_3_4.copy_from_slice(&matrix[0..12]);
    vk::TransformMatrixKHR { matrix: matrix_3_4 }
}

pub fn instance_records(
    blas_address: vk::DeviceAddress,
    placements: &[InstancePlacement],
) -> Vec<vk::AccelerationStructureInstanceKHR> {
    placements
        .iter()
        .map(|placement| vk::AccelerationStructureInstanceKHR {
            transform: instance_transform(placement),
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xff),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        })
        .collect()
}

pub fn triangle_count(index_count: u32) -> Result<u32> {
    if index_count % 3 != 0 {
        bail!("index count {index_count} is not a multiple of 3");
    }
    if index_count == 0 {
        bail!("mesh has no triangles");
    }
    Ok(index_count / 3)
}

pub struct AccelerationStructureBuilder<'a> {
    memory: &'a DeviceMemory,
    immediate: &'a ImmediateCommandContext,
    loader: khr::acceleration_structure::Device,
    scratch_alignment: u64,
}

impl<'a> AccelerationStructureBuilder<'a> {
    pub fn new(
        memory: &'a DeviceMemory,
        immediate: &'a ImmediateCommandContext,
        loader: khr::acceleration_structure::Device,
        scratch_alignment: u64,
    ) -> Self {
        Self {
            memory,
            immediate,
            loader,
            scratch_alignment,
        }
    }

    pub fn build_blas(&self, mesh: &MeshBuffers) -> Result<AccelerationStructure> {
        let primitive_count = triangle_count(mesh.index_count)?;
        let device = self.memory.device();

        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: unsafe { mesh.vertices.get_device_address(device) },
                    },
                    max_vertex: mesh.vertex_count.saturating_sub(1),
                    vertex_stride: std::mem::size_of::<Vertex>() as u64,
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: unsafe { mesh.indices.get_device_address(device) },
                    },
                    index_type: vk::IndexType::UINT32,
                    ..Default::default()
                },
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        };

        let blas = self.build(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry,
            primitive_count,
        )?;
        info!(
            "built BLAS over {} triangles at {:#x}",
            primitive_count, blas.device_address
        );
        Ok(blas)
    }

    /// Builds a TLAS with one instance of `blas` per placement.
    ///
    /// An empty placement list yields a valid TLAS with no instances.
    pub fn build_tlas(
        &self,
        blas: &AccelerationStructure,
        mesh_index_count: u32,
        placements: &[InstancePlacement],
    ) -> Result<AccelerationStructure> {
        let records = instance_records(blas.device_address, placements);
        let instance_count = records.len() as u32;

        // zero-sized buffers are invalid, so an empty scene still uploads one
        // (unused) record
        let placeholder = [vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix: [0f32; 12] },
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(0, 0),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: 0,
            },
        }];
        let upload = if records.is_empty() {
            &placeholder[..]
        } else {
            &records[..]
        };

        let instance_buffer = self
            .memory
            .create_host_buffer(
                upload,
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                INSTANCE_BUFFER_ALIGNMENT,
            )?
            .defer(|x| self.memory.destroy_buffer(x));

        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: unsafe {
                            instance_buffer.get_device_address(self.memory.device())
                        },
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        };

        let tlas = self.build(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            instance_count,
        )?;
        info!(
            "built TLAS with {} instances of a {}-triangle mesh at {:#x}",
            instance_count,
            mesh_index_count / 3,
            tlas.device_address
        );
        Ok(tlas)
    }

    fn query_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        primitive_count: u32,
    ) -> BuildSizes {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                &[primitive_count],
                &mut size_info,
            );
        }

        BuildSizes {
            structure: size_info.acceleration_structure_size,
            scratch: size_info.build_scratch_size,
        }
    }

    fn build(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: &vk::AccelerationStructureGeometryKHR<'_>,
        primitive_count: u32,
    ) -> Result<AccelerationStructure> {
        let device = self.memory.device();

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: geometry,
            ..Default::default()
        };

        let sizes = self.query_sizes(&build_info, primitive_count);
        debug!(
            "{:?} build sizes: structure {} bytes, scratch {} bytes",
            ty, sizes.structure, sizes.scratch
        );

        let buffer = self
            .memory
            .create_buffer(
                sizes.structure,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            )?
            .defer(|x| self.memory.destroy_buffer(x));

        let create_info = vk::AccelerationStructureCreateInfoKHR {
            ty,
            size: sizes.structure,
            buffer: buffer.buffer,
            offset: 0,
            ..Default::default()
        };
        let handle = unsafe { self.loader.create_acceleration_structure(&create_info, None) }?
            .defer(|x| unsafe { self.loader.destroy_acceleration_structure(x, None) });
        build_info.dst_acceleration_structure = *handle;

        let scratch_buffer = self
            .memory
            .create_buffer_aligned(
                sizes.scratch.max(1),
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuOnly,
                self.scratch_alignment,
            )?
            .defer(|x| self.memory.destroy_buffer(x));
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: unsafe { scratch_buffer.get_device_address(device) },
        };

        let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR {
            first_vertex: 0,
            primitive_count,
            primitive_offset: 0,
            transform_offset: 0,
        };

        self.immediate.run(|commands| {
            unsafe {
                if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
                    // bottom level builds must land before instances reference them
                    let barrier = vk::MemoryBarrier2 {
                        src_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                        src_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                        dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                        dst_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                        ..Default::default()
                    };
                    device.cmd_pipeline_barrier2(
                        commands.buffer(),
                        &vk::DependencyInfo {
                            memory_barrier_count: 1,
                            p_memory_barriers: &raw const barrier,
                            ..Default::default()
                        },
                    );
                }

                self.loader.cmd_build_acceleration_structures(
                    commands.buffer(),
                    &[build_info],
                    &[std::slice::from_ref(&build_range_info)],
                );
            }
            Ok(())
        })?;

        // scratch is only needed during the build
        drop(scratch_buffer);

        let device_address = unsafe {
            self.loader
                .get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR {
                        acceleration_structure: *handle,
                        ..Default::default()
                    },
                )
        };

        Ok(AccelerationStructure {
            handle: handle.undefer(),
            buffer: buffer.undefer(),
            device_address,
            primitive_count,
            level: ty,
        })
    }

    pub fn destroy(&self, accel: AccelerationStructure) {
        destroy_acceleration_structure(&self.loader, self.memory, accel);
    }
}

pub fn destroy_acceleration_structure(
    loader: &khr::acceleration_structure::Device,
    memory: &DeviceMemory,
    accel: AccelerationStructure,
) {
    unsafe { loader.destroy_acceleration_structure(accel.handle, None) };
    memory.destroy_buffer(accel.buffer);
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use glam::Vec3;
    use rand::{Rng, SeedableRng};

    use super::{instance_records, instance_transform, oriented_frame, triangle_count};
    use crate::scene::placements::InstancePlacement;

    const EPSILON: f32 = 1e-5;

    fn assert_orthonormal(normal: Vec3) {
        let frame = oriented_frame(normal);
        for v in [frame.right, frame.up, frame.forward] {
            assert!((v.length() - 1.0).abs() < EPSILON, "{normal}: {frame:?}");
        }
        assert!(frame.right.dot(frame.up).abs() < EPSILON, "{normal}: {frame:?}");
        assert!(frame.right.dot(frame.forward).abs() < EPSILON, "{normal}: {frame:?}");
        assert!(frame.up.dot(frame.forward).abs() < EPSILON, "{normal}: {frame:?}");
        assert!((frame.up - normal.normalize()).length() < EPSILON, "{normal}: {frame:?}");
    }

    fn column(transform: &vk::TransformMatrixKHR, col: usize) -> Vec3 {
        let m = &transform.matrix;
        Vec3::new(m[col], m[4 + col], m[8 + col])
    }

    #[test]
    fn frame_is_orthonormal_for_random_normals() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5ca7);
        for _ in 0..1000 {
            let normal = Vec3::new(
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-10.0..10.0),
            );
            if normal.length() < 1e-3 {
                continue;
            }
            assert_orthonormal(normal);
        }
    }

    #[test]
    fn frame_handles_normals_along_world_forward() {
        assert_orthonormal(Vec3::NEG_Z);
        assert_orthonormal(Vec3::Z * 3.0);
        assert_orthonormal(Vec3::new(0.0, 1e-6, -1.0));
    }

    #[test]
    fn frame_is_idempotent() {
        let normal = Vec3::new(0.3, 0.8, -0.2);
        let frame = oriented_frame(normal);
        assert_eq!(oriented_frame(frame.up), frame);
    }

    #[test]
    fn upright_placement_at_origin() {
        let transform = instance_transform(&InstancePlacement {
            position: Vec3::ZERO,
            normal: Vec3::Y,
        });

        assert_eq!(column(&transform, 0), Vec3::X);
        assert_eq!(column(&transform, 1), Vec3::Y);
        assert_eq!(column(&transform, 2), Vec3::NEG_Z);
        assert_eq!(column(&transform, 3), Vec3::ZERO);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let transform = instance_transform(&InstancePlacement {
            position: Vec3::new(4.0, -2.0, 7.5),
            normal: Vec3::new(1.0, 1.0, 0.0),
        });

        assert_eq!(column(&transform, 3), Vec3::new(4.0, -2.0, 7.5));
        assert!((column(&transform, 1) - Vec3::new(1.0, 1.0, 0.0).normalize()).length() < EPSILON);
    }

    #[test]
    fn one_record_per_placement() {
        let blas_address = 0xdead_b000;
        let placements: Vec<_> = (0..17)
            .map(|i| InstancePlacement {
                position: Vec3::splat(i as f32),
                normal: Vec3::Y,
            })
            .collect();

        let records = instance_records(blas_address, &placements);
        assert_eq!(records.len(), placements.len());
        for record in &records {
            assert_eq!(
                unsafe { record.acceleration_structure_reference.device_handle },
                blas_address
            );
            assert_eq!(record.instance_custom_index_and_mask.low_24(), 0);
            assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
            assert_eq!(
                record
                    .instance_shader_binding_table_record_offset_and_flags
                    .low_24(),
                0
            );
            assert_eq!(
                record
                    .instance_shader_binding_table_record_offset_and_flags
                    .high_8(),
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
            );
        }
    }

    #[test]
    fn no_placements_no_records() {
        assert!(instance_records(0x1000, &[]).is_empty());
    }

    #[test]
    fn instance_record_matches_device_layout() {
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            64
        );
    }

    #[test]
    fn triangle_counts() {
        assert_eq!(triangle_count(3).unwrap(), 1);
        assert_eq!(triangle_count(36).unwrap(), 12);
        assert!(triangle_count(0).is_err());
        assert!(triangle_count(4).is_err());
    }
}
