use ash::{khr, vk, Device};

use crate::camera::CameraConstants;
use crate::render::pipeline::{SbtRegions, ShaderKind};
use crate::render::resources::FrameView;
use crate::utils::subresource_range;

#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageTransition {
    fn barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2 {
            src_stage_mask: self.src_stage,
            src_access_mask: self.src_access,
            dst_stage_mask: self.dst_stage,
            dst_access_mask: self.dst_access,
            old_layout: self.old_layout,
            new_layout: self.new_layout,
            image: self.image,
            subresource_range: subresource_range(self.aspect),
            ..Default::default()
        }
    }
}

/// One step of a frame, recorded in order by [`encode`].
#[derive(Debug, Clone, Copy)]
pub enum FrameCommand {
    Transition(ImageTransition),
    /// An empty dynamic rendering pass that only clears.
    ClearAttachments {
        color: vk::ImageView,
        depth: vk::ImageView,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    },
    BindPipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    },
    PushCamera {
        layout: vk::PipelineLayout,
        constants: CameraConstants,
    },
    TraceRays {
        regions: SbtRegions,
        extent: vk::Extent2D,
    },
    CopyToBackBuffer {
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
    },
}

pub struct BackBuffer {
    pub image: vk::Image,
    pub extent: vk::Extent2D,
}

fn color_transition(
    image: vk::Image,
    (old_layout, src_stage, src_access): (vk::ImageLayout, vk::PipelineStageFlags2, vk::AccessFlags2),
    (new_layout, dst_stage, dst_access): (vk::ImageLayout, vk::PipelineStageFlags2, vk::AccessFlags2),
) -> FrameCommand {
    FrameCommand::Transition(ImageTransition {
        image,
        aspect: vk::ImageAspectFlags::COLOR,
        old_layout,
        new_layout,
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    })
}

/// Lays out the commands for one frame.
///
/// Without resources the back buffer is only made presentable; nothing else
/// is touched.
pub fn plan_frame(
    back_buffer: &BackBuffer,
    ready: Option<(&FrameView, CameraConstants)>,
    clear_color: [f32; 4],
) -> Vec<FrameCommand> {
    let Some((view, constants)) = ready else {
        return vec![color_transition(
            back_buffer.image,
            (
                vk::ImageLayout::UNDEFINED,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::NONE,
            ),
            (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        )];
    };

    let rt_stage = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    let color_output = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    let depth_tests = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    let transfer = vk::PipelineStageFlags2::TRANSFER;

    vec![
        // the previous frame's copy reads the attachment
        color_transition(
            view.color_image,
            (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                transfer,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                color_output,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
        ),
        FrameCommand::Transition(ImageTransition {
            image: view.depth_image,
            aspect: vk::ImageAspectFlags::DEPTH,
            old_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            src_stage: depth_tests,
            src_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_stage: depth_tests,
            dst_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        }),
        FrameCommand::ClearAttachments {
            color: view.color_view,
            depth: view.depth_view,
            extent: view.extent,
            clear_color,
        },
        color_transition(
            view.color_image,
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                color_output,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            (
                vk::ImageLayout::GENERAL,
                rt_stage,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
        ),
        FrameCommand::BindPipeline {
            pipeline: view.pipeline,
            layout: view.pipeline_layout,
            descriptor_set: view.descriptor_set,
        },
        FrameCommand::PushCamera {
            layout: view.pipeline_layout,
            constants,
        },
        FrameCommand::TraceRays {
            regions: view.sbt,
            extent: view.extent,
        },
        color_transition(
            view.color_image,
            (
                vk::ImageLayout::GENERAL,
                rt_stage,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                transfer,
                vk::AccessFlags2::TRANSFER_READ,
            ),
        ),
        color_transition(
            back_buffer.image,
            (vk::ImageLayout::UNDEFINED, transfer, vk::AccessFlags2::NONE),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                transfer,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ),
        FrameCommand::CopyToBackBuffer {
            src: view.color_image,
            src_extent: view.extent,
            dst: back_buffer.image,
            dst_extent: back_buffer.extent,
        },
        color_transition(
            back_buffer.image,
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                transfer,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        ),
    ]
}

fn blit_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// Records `commands` into a command buffer in the recording state.
pub unsafe fn encode(
    device: &Device,
    rt_pipeline_device: &khr::ray_tracing_pipeline::Device,
    command_buffer: vk::CommandBuffer,
    commands: &[FrameCommand],
) {
    for command in commands {
        match *command {
            FrameCommand::Transition(transition) => {
                let barrier = transition.barrier();
                device.cmd_pipeline_barrier2(
                    command_buffer,
                    &vk::DependencyInfo {
                        image_memory_barrier_count: 1,
                        p_image_memory_barriers: &raw const barrier,
                        ..Default::default()
                    },
                );
            }
            FrameCommand::ClearAttachments {
                color,
                depth,
                extent,
                clear_color,
            } => {
                let color_attachment = vk::RenderingAttachmentInfo {
                    image_view: color,
                    image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    },
                    ..Default::default()
                };
                let depth_attachment = vk::RenderingAttachmentInfo {
                    image_view: depth,
                    image_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    clear_value: vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    },
                    ..Default::default()
                };

                device.cmd_begin_rendering(
                    command_buffer,
                    &vk::RenderingInfo {
                        render_area: vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent,
                        },
                        layer_count: 1,
                        color_attachment_count: 1,
                        p_color_attachments: &raw const color_attachment,
                        p_depth_attachment: &raw const depth_attachment,
                        ..Default::default()
                    },
                );
                device.cmd_end_rendering(command_buffer);
            }
            FrameCommand::BindPipeline {
                pipeline,
                layout,
                descriptor_set,
            } => {
                device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    pipeline,
                );
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    layout,
                    0,
                    &[descriptor_set],
                    &[],
                );
            }
            FrameCommand::PushCamera { layout, constants } => {
                device.cmd_push_constants(
                    command_buffer,
                    layout,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                    0,
                    bytemuck::bytes_of(&constants),
                );
            }
            FrameCommand::TraceRays { regions, extent } => {
                rt_pipeline_device.cmd_trace_rays(
                    command_buffer,
                    &regions.region(ShaderKind::RayGeneration),
                    &regions.region(ShaderKind::Miss),
                    &regions.region(ShaderKind::ClosestHit),
                    &regions.callable,
                    extent.width,
                    extent.height,
                    1,
                );
            }
            FrameCommand::CopyToBackBuffer {
                src,
                src_extent,
                dst,
                dst_extent,
            } => {
                let layers = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                device.cmd_blit_image(
                    command_buffer,
                    src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::ImageBlit {
                        src_subresource: layers,
                        src_offsets: [vk::Offset3D::default(), blit_corner(src_extent)],
                        dst_subresource: layers,
                        dst_offsets: [vk::Offset3D::default(), blit_corner(dst_extent)],
                    }],
                    vk::Filter::NEAREST,
                );
            }
        }
    }
}
