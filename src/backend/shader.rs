// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Modules come from compiled files
// on disk or from byte arrays embedded in the binary in an obfuscated form
// (see `encode_embedded`).

use super::api::{GpuDevice, GpuInstance, GpuLoader};
use super::device::DeviceContext;
use super::error::{GpuError, GpuResult, VkResultExt};
use ash::vk;
use std::ffi::CStr;
use std::io::{self, Cursor};
use std::path::Path;

/// Entry point every stage is compiled with
pub const ENTRY_POINT: &CStr = c"main";

/// A compiled shader stage. Destroyed on drop.
pub struct ShaderModule<'ctx, D: GpuDevice> {
    device: &'ctx D,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl<'ctx, D: GpuDevice> ShaderModule<'ctx, D> {
    /// Load a SPIR-V file, e.g. `shaders/water.vert.spv`
    pub fn from_file<L>(
        ctx: &'ctx DeviceContext<L>,
        stage: vk::ShaderStageFlags,
        path: impl AsRef<Path>,
    ) -> GpuResult<Self>
    where
        L: GpuLoader,
        L::Instance: GpuInstance<Device = D>,
    {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| GpuError::ShaderIo {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded {} bytes of {:?} shader from {:?}", bytes.len(), stage, path);
        Self::from_bytes(ctx, stage, &bytes)
    }

    /// Build from bytes produced by [`encode_embedded`]
    pub fn from_embedded<L>(
        ctx: &'ctx DeviceContext<L>,
        stage: vk::ShaderStageFlags,
        encoded: &[u8],
    ) -> GpuResult<Self>
    where
        L: GpuLoader,
        L::Instance: GpuInstance<Device = D>,
    {
        Self::from_bytes(ctx, stage, &decode_embedded(encoded))
    }

    /// Build from raw SPIR-V bytes
    pub fn from_bytes<L>(
        ctx: &'ctx DeviceContext<L>,
        stage: vk::ShaderStageFlags,
        bytes: &[u8],
    ) -> GpuResult<Self>
    where
        L: GpuLoader,
        L::Instance: GpuInstance<Device = D>,
    {
        let code = spirv_words(bytes)?;
        let device: &'ctx D = ctx.device();
        let module = device
            .create_shader_module(&code)
            .during("create a shader module")?;

        Ok(Self { device, module, stage })
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl<D: GpuDevice> Drop for ShaderModule<'_, D> {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
    }
}

/// Stage descriptions in the order the modules are given
pub fn stage_infos<D: GpuDevice>(
    modules: &[ShaderModule<'_, D>],
) -> Vec<vk::PipelineShaderStageCreateInfo> {
    modules.iter().map(ShaderModule::stage_info).collect()
}

/// SPIR-V is a stream of 4-byte words; `read_spv` also handles alignment
/// and byte order.
fn spirv_words(bytes: &[u8]) -> GpuResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(GpuError::InvalidBytecode)?;
    if words.is_empty() {
        return Err(GpuError::InvalidBytecode(io::Error::new(
            io::ErrorKind::InvalidData,
            "shader bytecode is empty",
        )));
    }
    Ok(words)
}

/// Undo the embedding transform: byte `i` lands at `len - 1 - i` after
/// inverting its bits and rotating left by 3.
pub fn decode_embedded(encoded: &[u8]) -> Vec<u8> {
    encoded
        .iter()
        .rev()
        .map(|&b| (b ^ 0xFF).rotate_left(3))
        .collect()
}

/// Inverse of [`decode_embedded`]
pub fn encode_embedded(bytecode: &[u8]) -> Vec<u8> {
    bytecode
        .iter()
        .rev()
        .map(|&b| b.rotate_right(3) ^ 0xFF)
        .collect()
}
