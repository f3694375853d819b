//! Texture decoding and upload
//!
//! Images are decoded on the CPU with the `image` crate, copied through a
//! staging buffer into a device-local optimal-tiling image and left in
//! `SHADER_READ_ONLY_OPTIMAL`. A file that cannot be decoded is replaced by a
//! 1x1 fallback color so a missing asset never aborts startup.

use ash::{vk, Device};
use std::path::Path;

use super::allocator::{Allocator, ImageAllocation, MemoryUsageClass};
use super::transition::record_transition;
use crate::render::backends::vulkan::rendering::commands::CommandPool;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::scene::TextureSource;

/// Color used when a texture cannot be decoded
pub const FALLBACK_RGBA8: [u8; 4] = [255, 128, 0, 128];

/// Format of LDR textures and the LDR sky
pub const LDR_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Format of the HDR sky
pub const HDR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Decoded pixels ready for upload
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    /// 8-bit RGBA
    Rgba8(Vec<u8>),
    /// 32-bit float RGBA
    RgbaF32(Vec<f32>),
}

/// CPU-side image
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Tightly packed pixels
    pub pixels: PixelData,
}

impl DecodedImage {
    /// 1x1 fallback in 8-bit RGBA
    pub fn fallback_ldr() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: PixelData::Rgba8(FALLBACK_RGBA8.to_vec()),
        }
    }

    /// 1x1 fallback in float RGBA
    pub fn fallback_hdr() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: PixelData::RgbaF32(FALLBACK_RGBA8.iter().map(|&c| f32::from(c) / 255.0).collect()),
        }
    }

    /// Raw bytes to upload
    pub fn bytes(&self) -> &[u8] {
        match &self.pixels {
            PixelData::Rgba8(pixels) => pixels,
            PixelData::RgbaF32(pixels) => bytemuck::cast_slice(pixels),
        }
    }

    /// Vulkan format matching the pixel data
    pub const fn format(&self) -> vk::Format {
        match self.pixels {
            PixelData::Rgba8(_) => LDR_FORMAT,
            PixelData::RgbaF32(_) => HDR_FORMAT,
        }
    }

    /// Extent in pixels
    pub const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Decode an LDR image file to RGBA8, or the fallback on failure
pub fn decode_ldr(path: &Path) -> DecodedImage {
    match image::open(path) {
        Ok(image) => {
            let rgba = image.to_rgba8();
            DecodedImage {
                width: rgba.width(),
                height: rgba.height(),
                pixels: PixelData::Rgba8(rgba.into_raw()),
            }
        }
        Err(e) => {
            log::warn!("[TEXTURE] Failed to load {}: {}; using fallback", path.display(), e);
            DecodedImage::fallback_ldr()
        }
    }
}

/// Decode an image file, typically Radiance HDR, to float RGBA
pub fn decode_hdr(path: &Path) -> DecodedImage {
    match image::open(path) {
        Ok(image) => {
            let rgba = image.to_rgba32f();
            DecodedImage {
                width: rgba.width(),
                height: rgba.height(),
                pixels: PixelData::RgbaF32(rgba.into_raw()),
            }
        }
        Err(e) => {
            log::warn!("[TEXTURE] Failed to load HDR {}: {}; using fallback", path.display(), e);
            DecodedImage::fallback_hdr()
        }
    }
}

/// Decode a scene texture
pub fn decode_source(source: &TextureSource) -> DecodedImage {
    match source {
        TextureSource::File(path) => decode_ldr(path),
        TextureSource::Rgba8 { width, height, pixels } => {
            let expected = *width as usize * *height as usize * 4;
            if *width == 0 || *height == 0 || pixels.len() != expected {
                log::warn!(
                    "[TEXTURE] Raw texture {}x{} has {} bytes, expected {}; using fallback",
                    width,
                    height,
                    pixels.len(),
                    expected
                );
                return DecodedImage::fallback_ldr();
            }
            DecodedImage {
                width: *width,
                height: *height,
                pixels: PixelData::Rgba8(pixels.clone()),
            }
        }
    }
}

/// Image view wrapper with RAII cleanup
pub struct ImageView {
    device: Device,
    view: vk::ImageView,
}

impl ImageView {
    /// 2D view over mip 0, layer 0 of `image`
    pub fn new(device: Device, image: vk::Image, format: vk::Format, aspect: vk::ImageAspectFlags) -> VulkanResult<Self> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.create_image_view(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device, view })
    }

    /// View handle
    pub const fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
    }
}

/// Sampler wrapper with RAII cleanup
pub struct Sampler {
    device: Device,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Linear repeat sampler for material textures
    pub fn material(device: Device, max_anisotropy: f32) -> VulkanResult<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy.min(16.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        Self::create(device, &create_info)
    }

    /// Linear clamp-to-edge sampler for the sky spheres and the offscreen image
    pub fn clamped(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .compare_op(vk::CompareOp::NEVER)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(f32::MAX);
        Self::create(device, &create_info)
    }

    fn create(device: Device, create_info: &vk::SamplerCreateInfo) -> VulkanResult<Self> {
        let sampler = unsafe { device.create_sampler(create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device, sampler })
    }

    /// Sampler handle
    pub const fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

/// Device-local sampled image with its view
pub struct Texture {
    view: ImageView,
    image: ImageAllocation,
}

impl Texture {
    /// View handle
    pub const fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    /// Extent in pixels
    pub const fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    /// Descriptor for sampling with `sampler`
    pub const fn descriptor(&self, sampler: vk::Sampler) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler,
            image_view: self.view.handle(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Upload a decoded image and leave it ready for sampling
///
/// The copy runs in a one-shot command buffer; the staging buffer is queued
/// on the allocator for the next staging flush.
pub fn upload_texture(
    allocator: &mut Allocator,
    commands: &CommandPool,
    queue: vk::Queue,
    decoded: &DecodedImage,
) -> VulkanResult<Texture> {
    let device = allocator.device().clone();
    let extent = decoded.extent();
    let format = decoded.format();

    let staging = allocator.create_host_buffer(decoded.bytes(), vk::BufferUsageFlags::TRANSFER_SRC)?;
    let image = allocator.create_image(
        extent,
        vk::SampleCountFlags::TYPE_1,
        format,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        MemoryUsageClass::GpuOnly,
    )?;

    commands.run_single_time(queue, |command_buffer| {
        record_transition(
            &device,
            command_buffer,
            image.handle(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();
        unsafe {
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        record_transition(
            &device,
            command_buffer,
            image.handle(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    })?;
    allocator.defer_release(staging);

    let view = ImageView::new(device, image.handle(), format, vk::ImageAspectFlags::COLOR)?;
    log::debug!("[TEXTURE] Uploaded {}x{} {:?}", extent.width, extent.height, format);

    Ok(Texture { view, image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_missing_file_falls_back_to_single_pixel() {
        let decoded = decode_ldr(Path::new("no/such/texture.png"));
        assert_eq!(decoded, DecodedImage::fallback_ldr());
        assert_eq!(decoded.bytes(), &FALLBACK_RGBA8);
        assert_eq!(decoded.format(), vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn test_hdr_fallback_is_normalized_float() {
        let decoded = decode_hdr(Path::new("no/such/sky.hdr"));
        assert_eq!(decoded.format(), HDR_FORMAT);
        assert_eq!(decoded.bytes().len(), 16);
        match decoded.pixels {
            PixelData::RgbaF32(pixels) => {
                assert_relative_eq!(pixels[0], 1.0);
                assert_relative_eq!(pixels[1], 128.0 / 255.0);
            }
            PixelData::Rgba8(_) => panic!("expected float pixels"),
        }
    }

    #[test]
    fn test_png_decodes_to_rgba8() {
        let path = std::env::temp_dir().join(format!("hybrid_renderer_texture_{}.png", std::process::id()));
        image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let decoded = decode_ldr(&path);
        let _ = std::fs::remove_file(&path);

        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(decoded.bytes().len(), 3 * 2 * 4);
        assert_eq!(&decoded.bytes()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_raw_source_with_wrong_length_falls_back() {
        let source = TextureSource::Rgba8 {
            width: 2,
            height: 2,
            pixels: vec![0; 3],
        };
        assert_eq!(decode_source(&source), DecodedImage::fallback_ldr());

        let source = TextureSource::Rgba8 {
            width: 1,
            height: 1,
            pixels: vec![1, 2, 3, 4],
        };
        assert_eq!(decode_source(&source).bytes(), &[1, 2, 3, 4]);
    }
}
