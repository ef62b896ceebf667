// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation from the window provider
// - Physical device selection (first device that can render and present)
// - Logical device + queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::error::RendererError;
use crate::platform::SurfaceProvider;

/// Device extensions every candidate GPU must expose
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices used by the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct families, one queue is requested per entry
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Find a graphics family and a present family.
///
/// A family that does both is preferred so the swapchain can stay exclusive.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, props) in families.iter().enumerate() {
        let index = index as u32;
        let is_graphics =
            props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = supports_present(index);

        if is_graphics && can_present {
            return Some(QueueFamilies {
                graphics: index,
                present: index,
            });
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

/// Required extensions absent from `available`
pub fn missing_extensions<'a>(available: &[&CStr], required: &[&'a CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|name| !available.contains(name))
        .collect()
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped explicitly before the device in `Drop`
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,
    // Host access to queues must be externally synchronized
    queue_lock: Mutex<()>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,

    // Instance, surface and messenger; dropped after the device
    pub instance: VulkanInstance,
}

/// Instance-level objects: loader, instance, debug messenger, surface.
///
/// Owned on its own so a failure before the logical device exists still
/// releases whatever was created.
pub struct VulkanInstance {
    pub entry: Entry,
    pub handle: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.handle.destroy_instance(None);
        }
    }
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `window` - Window the surface is created for
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window: &dyn SurfaceProvider,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Step 2: Create instance
        let handle = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &handle);
        let mut instance = VulkanInstance {
            entry,
            handle,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
            debug_utils: None,
        };

        // Step 3: Setup debug messenger if validation enabled
        if enable_validation {
            instance.debug_utils =
                Some(Self::setup_debug_messenger(&instance.entry, &instance.handle)?);
        }

        // Step 4: Create surface (platform-specific window connection)
        instance.surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.handle,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) = Self::retrieve_physical_device(
            &instance.handle,
            &instance.surface_loader,
            instance.surface,
        )?;

        // Step 6: Create logical device
        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance.handle, physical_device, queue_families)?;

        let properties = unsafe { instance.handle.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        // Step 7: Create memory allocator
        let allocator = match Self::create_allocator(&instance.handle, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            graphics_queue,
            present_queue,
            queue_families,
            queue_lock: Mutex::new(()),
            properties,
            instance,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: raw_window_handle::RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"Stream Renderer";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions required by this platform's display
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .context("Unsupported display for Vulkan surfaces")?
                .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Select the first device that can render to and present on `surface`
    fn retrieve_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(RendererError::NoSuitableDevice.into());
        }

        for device in devices {
            match Self::check_device(instance, surface_loader, surface, device) {
                Ok(Some(families)) => return Ok((device, families)),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping GPU after query failure: {:#}", e),
            }
        }

        Err(RendererError::NoSuitableDevice.into())
    }

    fn check_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilies>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        // (a) graphics + (b) present
        let families = find_queue_families(&queue_families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });
        let Some(families) = families else {
            log::debug!("GPU rejected: missing graphics or present queue");
            return Ok(None);
        };

        // (c) required extensions
        let extension_props = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let available: Vec<&CStr> = extension_props
            .iter()
            .filter_map(|props| props.extension_name_as_c_str().ok())
            .collect();
        let missing = missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS);
        if !missing.is_empty() {
            log::debug!("GPU rejected: missing extensions {:?}", missing);
            return Ok(None);
        }

        // (d) at least one format and one present mode
        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }?;
        if formats.is_empty() || present_modes.is_empty() {
            log::debug!("GPU rejected: no surface formats or present modes");
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        Ok(allocator)
    }

    /// Exclusive host access to the graphics and present queues
    pub fn lock_queues(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        let _queues = self.lock_queues();
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle failed")?;
        Ok(())
    }

    /// Same as `wait_idle` for callers already holding the queue lock
    pub fn wait_idle_locked(&self, _queues: &MutexGuard<'_, ()>) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Allocator before device; `instance` then drops surface, messenger, instance
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let found = find_queue_families(&families, |i| i != 0).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 2, present: 2 });
        assert!(found.is_shared());
        assert_eq!(found.unique(), vec![2]);
    }

    #[test]
    fn split_families_when_no_single_family_does_both() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = find_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(found.unique(), vec![0, 1]);
    }

    #[test]
    fn no_present_support_is_unsuitable() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(find_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn no_graphics_family_is_unsuitable() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(find_queue_families(&families, |_| true).is_none());
        assert!(find_queue_families(&[], |_| true).is_none());
    }

    #[test]
    fn swapchain_extension_is_required() {
        let available = [c"VK_KHR_maintenance1"];
        assert_eq!(
            missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS),
            vec![ash::khr::swapchain::NAME]
        );

        let available = [c"VK_KHR_maintenance1", c"VK_KHR_swapchain"];
        assert!(missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS).is_empty());
    }
}
