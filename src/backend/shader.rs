// Shader module loading
//
// SPIR-V is compiled by build.rs and loaded at runtime from the configured
// shader directory.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Decode SPIR-V bytes into words, rejecting data without the SPIR-V magic
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")?;
    Ok(words)
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = decode_spirv(bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Read a compiled shader from disk and create its module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?}. Was glslc available at build time?", path))?;

    let module = create_shader_module(device, &bytes)
        .with_context(|| format!("Failed to load shader {:?}", path))?;

    log::debug!("Loaded shader {:?} ({} bytes)", path, bytes.len());
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_spirv_header() {
        let mut bytes = Vec::new();
        for word in [0x0723_0203u32, 0x0001_0500, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words.len(), 5);
    }

    #[test]
    fn rejects_non_spirv() {
        assert!(decode_spirv(b"#version 460\n").is_err());
        assert!(decode_spirv(&[0u8; 8]).is_err());
    }
}
