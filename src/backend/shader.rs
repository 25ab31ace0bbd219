// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The binaries are produced by build.rs
// (or by hand with glslc) and read at runtime so they can be hot-reloaded.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Entry point every shader stage uses
pub const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Read a SPIR-V binary from disk into 32-bit words
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file: {:?}", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Convert raw bytes to SPIR-V words. `read_spv` takes care of alignment
/// and byte order and rejects data whose length is not a multiple of 4.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    if words.first() != Some(&0x0723_0203) {
        anyhow::bail!("missing SPIR-V magic number");
    }
    Ok(words)
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a shader module straight from a SPIR-V file
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {:?} ({} words)", path, code.len());
    create_shader_module(device, &code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_spirv_header() {
        let mut bytes = Vec::new();
        for word in [0x0723_0203u32, 0x0001_0000, 0, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn rejects_truncated_or_foreign_data() {
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
        assert!(parse_spirv(b"#version 450\n").is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_spirv(Path::new("no/such/shader.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("shader.spv"));
    }
}
