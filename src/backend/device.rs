// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface
// - Physical device selection (first suitable device wins)
// - Logical device + graphics/present queues
// - Command pool

use anyhow::{anyhow, Context, Result};
use ash::{extensions::ext::DebugUtils, extensions::khr, vk, Entry};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use thiserror::Error;
use winit::window::Window;

use super::surface::{Surface, SwapchainSupport};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Reason a physical device was skipped during selection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SuitabilityError {
    #[error("missing a graphics or present capable queue family")]
    MissingQueueFamilies,
    #[error("missing device extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("surface reports no formats or no present modes")]
    InadequateSwapchain,
    #[error("anisotropic sampling not supported")]
    NoSamplerAnisotropy,
}

/// Queue families used by the renderer. Graphics and present may coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Picks the first family that can do graphics and the first that can
    /// present. Families with no queues are ignored.
    pub fn select<F>(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: F,
    ) -> Result<Option<Self>>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }
            if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics = Some(index);
            }
            if present.is_none() && supports_present(index)? {
                present = Some(index);
            }
            if graphics.is_some() && present.is_some() {
                break;
            }
        }

        Ok(graphics.zip(present).map(|(graphics, present)| Self { graphics, present }))
    }

    /// Distinct family indices, one queue create info each
    pub fn unique(&self) -> BTreeSet<u32> {
        BTreeSet::from([self.graphics, self.present])
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Names in `required` that are not in `available`
pub fn missing_names<I>(available: I, required: &[&CStr]) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let available: BTreeSet<String> = available.into_iter().collect();
    required
        .iter()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !available.contains(name))
        .collect()
}

fn device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Instance and the debug messenger hanging off it. Destroyed on drop,
/// messenger first.
pub struct Instance {
    pub raw: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let raw = Self::create_instance(&entry, window, app_name, enable_validation)?;

        // Owned from here on, so a failing messenger still destroys the instance
        let mut instance = Self {
            raw,
            entry,
            debug_utils: None,
        };

        if enable_validation {
            instance.debug_utils = Some(Self::setup_debug_messenger(&instance.entry, &instance.raw)?);
        }

        Ok(instance)
    }

    fn create_instance(
        entry: &Entry,
        window: &Window,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        if enable_validation && !Self::validation_layer_available(entry)? {
            anyhow::bail!("Validation layers requested, but not available");
        }

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut required = Surface::required_extensions(window)?;
        if enable_validation {
            required.push(DebugUtils::name());
        }
        Self::check_instance_extensions(entry, &required)?;

        let extensions: Vec<_> = required.iter().map(|name| name.as_ptr()).collect();

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Also covers messages emitted while the instance itself is created/destroyed
        let mut debug_info = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        Ok(layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        }))
    }

    fn check_instance_extensions(entry: &Entry, required: &[&CStr]) -> Result<()> {
        let available: Vec<String> = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        log::debug!("Available instance extensions: {:?}", available);
        log::debug!("Required instance extensions: {:?}", required);

        let missing = missing_names(available, required);
        if !missing.is_empty() {
            anyhow::bail!("Missing required instance extensions: {:?}", missing);
        }
        Ok(())
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);
        let create_info = debug_messenger_info();

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
///
/// Field order matters for Drop: the surface goes before the instance.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: Surface,
    pub instance: Instance,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,
    pub command_pool: vk::CommandPool,

    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `window` - Window the surface is created for
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Both release themselves if a later step fails
        let instance = Instance::new(window, app_name, enable_validation)?;
        let surface = Surface::new(&instance.entry, &instance.raw, window)?;

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance.raw, &surface)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance.raw,
            physical_device,
            queue_families,
            enable_validation,
        )?;

        let properties = unsafe { instance.raw.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.raw.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let command_pool = match Self::create_command_pool(&device, queue_families.graphics) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            device,
            physical_device,
            surface,
            instance,
            graphics_queue,
            present_queue,
            queue_families,
            command_pool,
            memory_properties,
        }))
    }

    /// First device meeting every requirement wins. No ranking.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }
        log::info!("Device count: {}", devices.len());

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            match Self::check_physical_device(instance, surface, device) {
                Ok(queue_families) => {
                    log::info!("Selected physical device (`{}`)", name);
                    return Ok((device, queue_families));
                }
                Err(error) => {
                    log::warn!("Skipping physical device (`{}`): {:#}", name, error);
                }
            }
        }

        Err(anyhow!("Failed to find a suitable GPU"))
    }

    fn check_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
        device: vk::PhysicalDevice,
    ) -> Result<QueueFamilyIndices> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_families =
            QueueFamilyIndices::select(&families, |index| surface.supports_present(device, index))?
                .ok_or(SuitabilityError::MissingQueueFamilies)?;

        let available: Vec<String> = unsafe { instance.enumerate_device_extension_properties(device) }?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let missing = missing_names(available, &device_extensions());
        if !missing.is_empty() {
            return Err(SuitabilityError::MissingExtensions(missing).into());
        }

        let support: SwapchainSupport = surface.swapchain_support(device)?;
        if !support.is_adequate() {
            return Err(SuitabilityError::InadequateSwapchain.into());
        }

        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return Err(SuitabilityError::NoSamplerAnisotropy.into());
        }

        Ok(queue_families)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
        enable_validation: bool,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let extensions: Vec<_> = device_extensions().iter().map(|name| name.as_ptr()).collect();

        // Device layers are deprecated but older loaders still read them
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn create_command_pool(device: &ash::Device, graphics_family: u32) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")
    }

    pub fn swapchain_support(&self) -> Result<SwapchainSupport> {
        self.surface.swapchain_support(self.physical_device)
    }

    /// Block until a fence signals. No timeout.
    pub fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed waiting on fence")
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed waiting for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device wait idle failed during teardown: {:#}", e);
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
        // Surface, then messenger and instance, release themselves
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] ({:?}) {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] ({:?}) {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::debug!("[Vulkan] ({:?}) {}", message_type, message);
    } else {
        log::trace!("[Vulkan] ({:?}) {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    #[test]
    fn select_uses_one_family_for_graphics_and_present() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1)];
        let indices = QueueFamilyIndices::select(&families, |_| Ok(true))
            .unwrap()
            .unwrap();

        assert_eq!(indices, QueueFamilyIndices { graphics: 0, present: 0 });
        assert!(indices.is_shared());
        assert_eq!(indices.unique().len(), 1);
    }

    #[test]
    fn select_splits_graphics_and_present_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        let indices = QueueFamilyIndices::select(&families, |index| Ok(index == 2))
            .unwrap()
            .unwrap();

        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.present, 2);
        assert!(!indices.is_shared());
        assert_eq!(indices.unique().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn select_ignores_empty_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 2),
        ];
        let indices = QueueFamilyIndices::select(&families, |_| Ok(true))
            .unwrap()
            .unwrap();

        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.present, 1);
    }

    #[test]
    fn select_without_present_support_finds_nothing() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let indices = QueueFamilyIndices::select(&families, |_| Ok(false)).unwrap();
        assert!(indices.is_none());
    }

    #[test]
    fn select_propagates_query_errors() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let result = QueueFamilyIndices::select(&families, |_| {
            Err(anyhow!(vk::Result::ERROR_SURFACE_LOST_KHR))
        });
        assert!(result.is_err());
    }

    #[test]
    fn missing_names_reports_only_absent_extensions() {
        let available = vec!["VK_KHR_swapchain".to_string(), "VK_KHR_maintenance1".to_string()];
        let required = [c"VK_KHR_swapchain", c"VK_EXT_debug_utils"];

        assert_eq!(missing_names(available, &required), vec!["VK_EXT_debug_utils"]);
    }

    #[test]
    fn missing_names_is_empty_when_all_present() {
        let available = vec!["VK_KHR_swapchain".to_string()];
        assert!(missing_names(available, &device_extensions()).is_empty());
    }

    #[test]
    fn instance_and_surface_release_themselves() {
        // Early returns in VulkanDevice::new rely on these dropping their handles
        assert!(std::mem::needs_drop::<Instance>());
        assert!(std::mem::needs_drop::<Surface>());
    }

    #[test]
    fn suitability_errors_describe_the_gap() {
        let error = SuitabilityError::MissingExtensions(vec!["VK_KHR_swapchain".into()]);
        assert_eq!(
            error.to_string(),
            "missing device extensions: [\"VK_KHR_swapchain\"]"
        );
    }
}
