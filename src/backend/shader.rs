// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. The binaries are compiled by
// build.rs and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use super::VulkanDevice;

/// Decode a SPIR-V blob into 32-bit words.
///
/// `read_spv` handles alignment and endianness and rejects blobs whose
/// length is not a multiple of four.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V blob")?;
    if words.is_empty() {
        anyhow::bail!("Empty SPIR-V blob");
    }
    Ok(words)
}

/// Read a whole SPIR-V file
pub fn read_spirv_file<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file: {:?}", path))?;
    decode_spirv(&bytes).with_context(|| format!("Failed to load shader: {:?}", path))
}

/// Owned shader module, destroyed on drop
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn from_file<P: AsRef<Path>>(device: &Arc<VulkanDevice>, path: P) -> Result<Self> {
        let code = read_spirv_file(&path)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module: {:?}", path.as_ref()))?;

        log::debug!("Loaded shader {:?} ({} words)", path.as_ref(), code.len());

        Ok(Self {
            handle,
            device: device.clone(),
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn decodes_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_blob() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(decode_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_empty_blob() {
        assert!(decode_spirv(&[]).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_spirv_file("no/such/shader.spv").unwrap_err();
        assert!(format!("{:#}", err).contains("no/such/shader.spv"));
    }
}
