// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The two pipeline stages are read from
// disk at startup; a missing or malformed file aborts startup.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;
use crate::error::RendererError;

/// Read a compiled shader into 32-bit SPIR-V words
pub fn read_spirv(path: &Path) -> Result<Vec<u32>, RendererError> {
    let bytes = std::fs::read(path).map_err(|source| RendererError::ShaderReadFailure {
        path: path.to_path_buf(),
        source,
    })?;

    // read_spv checks the magic number and copies into aligned words
    ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|source| {
        RendererError::ShaderReadFailure {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read `path` and create its shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {:?} ({} words)", path, code.len());
    create_shader_module(device, &code)
}
