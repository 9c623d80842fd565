// Shader module loading
//
// The pipeline consumes precompiled SPIR-V read from disk at build time.
// build.rs produces the .spv files next to their GLSL sources.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V file into 4-byte words
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader bytecode: {:?}", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid shader bytecode: {:?}", path))
}

/// Validate and re-align raw bytecode
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() {
        bail!("shader bytecode is empty");
    }
    // read_spv handles alignment and byte order, and rejects lengths that
    // are not a multiple of four
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        bail!("missing SPIR-V magic number");
    }
    Ok(words)
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
