// Graphics pipeline creation and management
//
// The caller supplies all fixed-function state in a PipelineConfig; the
// pipeline only adds the two shader stages. Shader modules live just long
// enough to create the pipeline.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::shader::ShaderModule;
use super::VulkanDevice;

const SHADER_ENTRY_POINT: &CStr = c"main";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipelineConfigError {
    #[error("pipeline layout is null")]
    MissingLayout,
    #[error("render pass is null")]
    MissingRenderPass,
}

/// Fixed-function state for one graphics pipeline
#[derive(Clone, Copy)]
pub struct PipelineConfig {
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub input_assembly: vk::PipelineInputAssemblyStateCreateInfo,
    pub rasterization: vk::PipelineRasterizationStateCreateInfo,
    pub multisample: vk::PipelineMultisampleStateCreateInfo,
    pub color_blend_attachment: vk::PipelineColorBlendAttachmentState,
    pub depth_stencil: vk::PipelineDepthStencilStateCreateInfo,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl PipelineConfig {
    /// Opaque triangle list covering `extent`, depth tested, nothing culled.
    /// Layout and render pass are left null for the caller to fill in.
    pub fn default_for(extent: vk::Extent2D) -> Self {
        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();

        let scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(extent)
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false)
            .build();

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0)
            .build();

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false)
            .build();

        Self {
            viewport,
            scissor,
            input_assembly,
            rasterization,
            multisample,
            color_blend_attachment,
            depth_stencil,
            layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        if self.layout == vk::PipelineLayout::null() {
            return Err(PipelineConfigError::MissingLayout);
        }
        if self.render_pass == vk::RenderPass::null() {
            return Err(PipelineConfigError::MissingRenderPass);
        }
        Ok(())
    }
}

/// Pipeline layout with no descriptor sets or push constants
pub struct PipelineLayout {
    pub handle: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl PipelineLayout {
    pub fn empty(device: &Arc<VulkanDevice>) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder();

        let handle = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        Ok(Self {
            handle,
            device: device.clone(),
        })
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

pub struct Pipeline {
    pub handle: vk::Pipeline,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    pub fn new(
        device: &Arc<VulkanDevice>,
        vert_path: &Path,
        frag_path: &Path,
        config: &PipelineConfig,
    ) -> Result<Self> {
        // Checked before touching the device
        config.validate().context("Invalid pipeline configuration")?;

        let vert_shader = ShaderModule::from_file(device, vert_path)?;
        let frag_shader = ShaderModule::from_file(device, frag_path)?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_shader.handle)
                .name(SHADER_ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_shader.handle)
                .name(SHADER_ENTRY_POINT)
                .build(),
        ];

        // Vertices come from gl_VertexIndex, no buffers bound
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let viewports = [config.viewport];
        let scissors = [config.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let color_blend_attachments = [config.color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments)
            .blend_constants([0.0; 4]);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&config.input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&config.rasterization)
            .multisample_state(&config.multisample)
            .depth_stencil_state(&config.depth_stencil)
            .color_blend_state(&color_blending)
            .layout(config.layout)
            .render_pass(config.render_pass)
            .subpass(config.subpass)
            .base_pipeline_handle(vk::Pipeline::null())
            .base_pipeline_index(-1)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };

        // vert_shader and frag_shader are dropped here, right after creation
        log::info!("Created graphics pipeline");

        Ok(Self {
            handle: pipelines[0],
            device: device.clone(),
        })
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.handle,
            );
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 800,
            height: 600,
        }
    }

    #[test]
    fn default_config_covers_the_extent() {
        let config = PipelineConfig::default_for(extent());

        assert_eq!(config.viewport.width, 800.0);
        assert_eq!(config.viewport.height, 600.0);
        assert_eq!(config.viewport.max_depth, 1.0);
        assert_eq!(config.scissor.extent.width, 800);
        assert_eq!(config.scissor.extent.height, 600);
        assert_eq!(config.subpass, 0);
    }

    #[test]
    fn default_config_draws_opaque_depth_tested_triangles() {
        let config = PipelineConfig::default_for(extent());

        assert_eq!(config.input_assembly.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.rasterization.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(config.rasterization.front_face, vk::FrontFace::CLOCKWISE);
        assert_eq!(config.color_blend_attachment.blend_enable, vk::FALSE);
        assert_eq!(
            config.color_blend_attachment.color_write_mask,
            vk::ColorComponentFlags::RGBA
        );
        assert_eq!(config.depth_stencil.depth_test_enable, vk::TRUE);
        assert_eq!(config.depth_stencil.depth_compare_op, vk::CompareOp::LESS);
    }

    #[test]
    fn null_layout_is_rejected() {
        let mut config = PipelineConfig::default_for(extent());
        config.render_pass = vk::RenderPass::from_raw(1);

        assert_eq!(config.validate(), Err(PipelineConfigError::MissingLayout));
    }

    #[test]
    fn null_render_pass_is_rejected() {
        let mut config = PipelineConfig::default_for(extent());
        config.layout = vk::PipelineLayout::from_raw(1);

        assert_eq!(config.validate(), Err(PipelineConfigError::MissingRenderPass));
    }

    #[test]
    fn complete_config_is_accepted() {
        let mut config = PipelineConfig::default_for(extent());
        config.layout = vk::PipelineLayout::from_raw(1);
        config.render_pass = vk::RenderPass::from_raw(2);

        assert!(config.validate().is_ok());
    }
}
