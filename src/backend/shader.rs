// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. This module reads compiled
// binaries from disk and creates shader modules from them.

use super::Device;
use crate::error::{ComputeError, Result};
use ash::vk;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary, zero-padding it to a whole number of words
pub fn read_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    log::debug!("Read {} bytes of SPIR-V from {:?}", bytes.len(), path);
    spirv_words(&bytes)
}

pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    let words: Vec<u32> = bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect();

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&magic) => Err(ComputeError::InvalidSpirv(format!(
            "bad magic number {:#010x}",
            magic
        ))),
        None => Err(ComputeError::InvalidSpirv("empty file".to_string())),
    }
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    Ok(unsafe { device.raw().create_shader_module(&create_info, None) }?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pads_trailing_bytes() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0x01, 0x02]);
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0000_0201]);
    }

    #[test]
    fn rejects_non_spirv() {
        assert!(matches!(
            spirv_words(b"\x7fELF"),
            Err(ComputeError::InvalidSpirv(_))
        ));
        assert!(matches!(spirv_words(&[]), Err(ComputeError::InvalidSpirv(_))));
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&SPIRV_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&0x0001_0300u32.to_le_bytes()).unwrap();
        let words = read_spirv(file.path()).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0300]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_spirv(dir.path().join("nope.spv")),
            Err(ComputeError::Io(_))
        ));
    }
}
