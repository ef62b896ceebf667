// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Format, present mode, extent and image count are negotiated against the
// surface once at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::QueueFamilies;
use super::VulkanDevice;

/// Everything the surface reports about what it can present
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Query capabilities, formats and present modes for the device's surface
pub fn get_swapchain_info(device: &VulkanDevice) -> Result<SwapchainSupport> {
    let loader = &device.instance.surface_loader;
    let surface = device.instance.surface;
    let physical = device.physical_device;

    unsafe {
        Ok(SwapchainSupport {
            capabilities: loader
                .get_physical_device_surface_capabilities(physical, surface)
                .context("Failed to query surface capabilities")?,
            formats: loader
                .get_physical_device_surface_formats(physical, surface)
                .context("Failed to query surface formats")?,
            present_modes: loader
                .get_physical_device_surface_present_modes(physical, surface)
                .context("Failed to query present modes")?,
        })
    }
}

/// Fallback when the surface has no preferred format
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick a surface format.
///
/// A lone `UNDEFINED` entry means any format is accepted. Otherwise 8-bit
/// BGRA/RGBA in the sRGB nonlinear color space wins, then the first entry.
pub fn choose_best_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return DEFAULT_SURFACE_FORMAT;
        }
    }

    formats
        .iter()
        .copied()
        .find(|f| {
            matches!(
                f.format,
                vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM
            ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .unwrap_or(DEFAULT_SURFACE_FORMAT)
}

/// MAILBOX: no tearing, low latency, triple buffered
/// FIFO: vsync, guaranteed available
pub fn choose_best_presentation_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's extent unless it reports "varies", then clamp the window size
pub fn choose_swapchain_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    // Not `clamp`: a driver reporting min > max must not abort startup
    vk::Extent2D {
        width: width
            .max(capabilities.min_image_extent.width)
            .min(capabilities.max_image_extent.width),
        height: height
            .max(capabilities.min_image_extent.height)
            .min(capabilities.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Concurrent across both families when they differ
pub fn choose_sharing_mode(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(device: Arc<VulkanDevice>, width: u32, height: u32) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let support = get_swapchain_info(&device)?;
        let surface_format = choose_best_surface_format(&support.formats);
        let present_mode = choose_best_presentation_mode(&support.present_modes);
        let extent = choose_swapchain_extent(&support.capabilities, width, height);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, family_indices) = choose_sharing_mode(device.queue_families);

        log::info!(
            "Surface format: {:?} / {:?}, present mode: {:?}, extent: {}x{}, images: {}",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            extent.width,
            extent.height,
            image_count
        );

        let swapchain_loader =
            ash::khr::swapchain::Device::new(&device.instance.handle, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.instance.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        // Views are pushed as they succeed so Drop can release a partial set
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::with_capacity(images.len()),
            format: surface_format.format,
            present_mode,
            extent,
            device,
        };

        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { this.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")?;
            this.image_views.push(view);
        }
        this.images = images;

        Ok(this)
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<u32, vk::Result> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }?;

        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }
        Ok(index)
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe { self.swapchain_loader.queue_present(queue, &present_info) }?;
        if suboptimal {
            log::warn!("Presented to a suboptimal swapchain");
        }
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn undefined_format_yields_default() {
        let formats = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = choose_best_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn prefers_8bit_srgb_nonlinear() {
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_best_surface_format(&formats).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(
            choose_best_surface_format(&formats).format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
    }

    #[test]
    fn mailbox_preferred_over_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_best_presentation_mode(&modes), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_without_mailbox() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(choose_best_presentation_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_extent_ignores_window_size() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        let extent = choose_swapchain_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn varying_extent_is_clamped() {
        let caps = caps((u32::MAX, u32::MAX), (100, 100), (1000, 800));
        let extent = choose_swapchain_extent(&caps, 4000, 50);
        assert_eq!((extent.width, extent.height), (1000, 100));

        let extent = choose_swapchain_extent(&caps, 640, 480);
        assert_eq!((extent.width, extent.height), (640, 480));
    }

    #[test]
    fn inverted_extent_bounds_resolve_to_max() {
        let caps = caps((u32::MAX, u32::MAX), (1000, 800), (100, 100));
        let extent = choose_swapchain_extent(&caps, 640, 480);
        assert_eq!((extent.width, extent.height), (100, 100));
    }

    #[test]
    fn image_count_bounds() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        c.min_image_count = 2;
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 3);

        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);

        c.max_image_count = 8;
        assert_eq!(choose_image_count(&c), 3);
    }

    #[test]
    fn sharing_mode_follows_families() {
        let (mode, indices) = choose_sharing_mode(QueueFamilies { graphics: 0, present: 0 });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());

        let (mode, indices) = choose_sharing_mode(QueueFamilies { graphics: 0, present: 2 });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }
}
