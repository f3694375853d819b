//! SPIR-V shader modules
//!
//! Shader binaries are read from the configured shader directory. The byte
//! stream is converted to little-endian words before it reaches the driver,
//! so a `Vec<u8>` with any alignment loads correctly.

use ash::{vk, Device};
use std::ffi::CStr;
use std::path::Path;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Entry point every shader in this crate uses
pub const ENTRY_POINT: &CStr = c"main";

/// Decode a SPIR-V byte stream into words
pub fn spirv_words(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(VulkanError::InitializationFailed(format!(
            "SPIR-V length {} is not a positive multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(VulkanError::InitializationFailed(format!(
            "Bad SPIR-V magic {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// SPIR-V shader module wrapper with automatic resource management
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        let words = spirv_words(bytes)?;
        log::debug!("[SHADER] Creating shader module from {} words", words.len());

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe {
            device.create_shader_module(&create_info, None).map_err(|e| {
                log::error!("[SHADER] vkCreateShaderModule failed: {:?}", e);
                VulkanError::Api(e)
            })?
        };

        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    /// Load shader from SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        log::debug!("[SHADER] Loading shader from: {:?}", path);

        let bytes = std::fs::read(path).map_err(|e| {
            log::error!("[SHADER] Failed to read shader file {:?}: {}", path, e);
            VulkanError::InitializationFailed(format!("Failed to read shader file {}: {e}", path.display()))
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Get shader module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage create info using the `main` entry point
    pub fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_spirv_words_decodes_little_endian() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0500, 42]);
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0500, 42]);
    }

    #[test]
    fn test_spirv_words_ignores_buffer_alignment() {
        let mut padded = vec![0u8];
        padded.extend(module_bytes(&[SPIRV_MAGIC, 7]));
        assert_eq!(spirv_words(&padded[1..]).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn test_spirv_words_rejects_bad_input() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&module_bytes(&[SPIRV_MAGIC])[..3]).is_err());
        assert!(spirv_words(&module_bytes(&[0xdead_beef, 0])).is_err());
    }
}
