//! Vulkan swapchain management
//!
//! Handles swapchain creation and recreation following RAII principles. The
//! surface format, present mode, extent and image count choices are plain
//! functions over the surface's reported support.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Instance};

use crate::render::backends::vulkan::initialization::PhysicalDeviceInfo;
use crate::render::backends::vulkan::resources::ImageView;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Preferred B8G8R8A8 UNORM with sRGB nonlinear color space, else the first format
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> VulkanResult<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_UNORM && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| available.first().copied())
        .ok_or_else(|| VulkanError::InitializationFailed("Surface reports no formats".to_string()))
}

/// MAILBOX when available, FIFO otherwise
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    available
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface's current extent, or the window size clamped to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub const fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// Swapchain management wrapper with RAII cleanup
pub struct Swapchain {
    // Views drop before the swapchain that owns their images
    views: Vec<ImageView>,
    images: Vec<vk::Image>,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, retiring `old_swapchain` when it is not null
    pub fn new(
        instance: &Instance,
        device: Device,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device_info: &PhysicalDeviceInfo,
        window_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let loader = SwapchainLoader::new(instance, &device);
        let physical = physical_device_info.device;

        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(physical, surface) }
            .map_err(VulkanError::Api)?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical, surface) }
            .map_err(VulkanError::Api)?;
        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical, surface) }
            .map_err(VulkanError::Api)?;

        let format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps);

        let queue_families = [physical_device_info.graphics_family, physical_device_info.present_family];
        let shared = queue_families[0] != queue_families[1];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);
        create_info = if shared {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.map_err(VulkanError::Api)?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let views = images
            .iter()
            .map(|&image| ImageView::new(device.clone(), image, format.format, vk::ImageAspectFlags::COLOR))
            .collect::<VulkanResult<Vec<_>>>();
        let views = match views {
            Ok(views) => views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        log::info!(
            "[SWAPCHAIN] {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        Ok(Self {
            views,
            images,
            loader,
            swapchain,
            format,
            extent,
        })
    }

    /// Get swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swapchain extension loader
    pub const fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }

    /// Presentable images
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Color view per image
    pub fn views(&self) -> &[ImageView] {
        &self.views
    }

    /// Number of images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Surface format
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Image extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.views.clear();
        unsafe {
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        log::debug!("[SWAPCHAIN] Destroyed {:?}", self.swapchain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_surface_format_prefers_bgra_unorm() {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, srgb),
            format(vk::Format::B8G8R8A8_UNORM, srgb),
        ];
        assert_eq!(choose_surface_format(&available).unwrap().format, vk::Format::B8G8R8A8_UNORM);

        let fallback = [format(vk::Format::R8G8B8A8_SRGB, srgb)];
        assert_eq!(choose_surface_format(&fallback).unwrap().format, vk::Format::R8G8B8A8_SRGB);
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_extent_uses_current_or_clamps_window() {
        let window = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert_eq!(choose_extent(&caps((800, 600), 2, 3), window).width, 800);

        let free = caps((u32::MAX, u32::MAX), 2, 3);
        assert_eq!(choose_extent(&free, window), window);
        let huge = vk::Extent2D {
            width: 10_000,
            height: 0,
        };
        let clamped = choose_extent(&free, huge);
        assert_eq!((clamped.width, clamped.height), (4096, 1));
    }

    #[test]
    fn test_image_count_respects_maximum() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 8)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 3, 3)), 3);
    }
}
