// Window surface - the connection between a winit window and Vulkan
//
// Platform specifics are delegated to ash-window, which picks the right
// VK_KHR_*_surface extension from the raw window handles.

use anyhow::{Context, Result};
use ash::{extensions::khr, vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::CStr;
use winit::window::Window;

/// Everything a physical device reports about presenting to a surface
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Platform surface handle. Must be dropped before the instance it came from.
pub struct Surface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    /// Instance extensions this window needs in order to create a surface
    pub fn required_extensions(window: &Window) -> Result<Vec<&'static CStr>> {
        let names = ash_window::enumerate_required_extensions(window.raw_display_handle())
            .context("Window system is not supported by Vulkan")?;

        // SAFETY: ash-window hands out static, nul-terminated extension names
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }

    pub fn new(entry: &Entry, instance: &ash::Instance, window: &Window) -> Result<Self> {
        let loader = khr::Surface::new(entry, instance);

        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(Self { loader, handle })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }?;
        Ok(supported)
    }

    pub fn swapchain_support(&self, physical_device: vk::PhysicalDevice) -> Result<SwapchainSupport> {
        unsafe {
            Ok(SwapchainSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // Any swapchain created from this surface is already gone
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn support_without_formats_is_inadequate() {
        let support = SwapchainSupport {
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(!support.is_adequate());
    }

    #[test]
    fn support_without_present_modes_is_inadequate() {
        let support = SwapchainSupport {
            formats: vec![vk::SurfaceFormatKHR::default()],
            ..Default::default()
        };
        assert!(!support.is_adequate());
    }

    #[test]
    fn support_with_formats_and_modes_is_adequate() {
        let support = SwapchainSupport {
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(support.is_adequate());
    }
}
