// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation, optionally with validation layers
// - Window surface creation
// - Physical device selection (graphics + present capable, prefer discrete)
// - Logical device + graphics/present queue creation

use anyhow::{bail, Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::guard::SetupGuard;

/// Layers requested when validation is on, for both instance and device
const VALIDATION_LAYERS: [&CStr; 1] = [c"VK_LAYER_KHRONOS_validation"];

/// Severities the debug messenger forwards; each maps to a log level
const MESSENGER_SEVERITIES: vk::DebugUtilsMessageSeverityFlagsEXT =
    vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
    );

/// Device extensions every candidate GPU must expose
const DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

/// Explicit setup options, resolved from config by the caller
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub app_name: String,
    pub enable_validation: bool,
}

/// Queue family indices for graphics submission and presentation.
/// Both may name the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Pick graphics and present families, preferring one family that does both
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Option<Self>>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            if family.queue_count == 0 {
                continue;
            }
            let index = index as u32;
            let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let is_present = supports_present(index)?;

            if is_graphics && is_present {
                return Ok(Some(Self { graphics: index, present: index }));
            }
            if is_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if is_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics.zip(present).map(|(graphics, present)| Self { graphics, present }))
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Deduplicated family list for queue creation and concurrent sharing
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Window surface, owned here because device selection depends on it
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Debug utils (if validation enabled)
    debug_utils: Option<DebugMessenger>,
    validation_enabled: bool,
}

type DebugMessenger = (ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT);

/// Instance-level handles made before the logical device exists
#[derive(Clone)]
struct InstanceSetup {
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl InstanceSetup {
    /// Reverse creation order; a null surface is skipped
    fn release(&self) {
        unsafe {
            if let Some((debug_utils, messenger)) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl VulkanDevice {
    /// Create the device context for a window
    pub fn new(
        config: &DeviceConfig,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", config.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, config, display_handle)?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        // Anything failing from here on releases what was already made
        let mut setup = SetupGuard::new(
            InstanceSetup {
                entry,
                instance,
                debug_utils: None,
                surface_loader,
                surface: vk::SurfaceKHR::null(),
            },
            InstanceSetup::release,
        );

        if config.enable_validation {
            let messenger = Self::setup_debug_messenger(&setup.get().entry, &setup.get().instance)?;
            setup.get_mut().debug_utils = Some(messenger);
        }

        let surface = unsafe {
            ash_window::create_surface(
                &setup.get().entry,
                &setup.get().instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;
        setup.get_mut().surface = surface;

        let partial = setup.get();
        let (physical_device, queue_families) =
            Self::pick_physical_device(&partial.instance, &partial.surface_loader, surface)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &partial.instance,
            physical_device,
            queue_families,
            config.enable_validation,
        )?;

        let InstanceSetup {
            entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
        } = setup.into_inner();

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            properties.device_name_as_c_str().unwrap_or_default().to_string_lossy()
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

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            graphics_queue,
            present_queue,
            queue_families,
            debug_utils,
            validation_enabled: config.enable_validation,
        }))
    }

    fn create_instance(
        entry: &Entry,
        config: &DeviceConfig,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        if config.enable_validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }?;
            let available: Vec<&CStr> = available
                .iter()
                .filter_map(|layer| layer.layer_name_as_c_str().ok())
                .collect();
            let missing = missing_names(&VALIDATION_LAYERS, &available);
            if !missing.is_empty() {
                bail!("validation layers requested, but not available: {:?}", missing);
            }
        }

        let app_name = CString::new(config.app_name.as_str())?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query required surface extensions")?
            .to_vec();
        if config.enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        Self::report_instance_extensions(entry, &extensions);

        let layer_names: Vec<*const std::ffi::c_char> = if config.enable_validation {
            VALIDATION_LAYERS.iter().map(|name| name.as_ptr()).collect()
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    /// Log available and required instance extensions, and any that are missing
    fn report_instance_extensions(entry: &Entry, required: &[*const std::ffi::c_char]) {
        let properties = match unsafe { entry.enumerate_instance_extension_properties(None) } {
            Ok(properties) => properties,
            Err(e) => {
                log::warn!("Could not enumerate instance extensions: {}", e);
                return;
            }
        };
        let available: Vec<&CStr> = properties
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();
        let required: Vec<&CStr> = required
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();

        log::debug!("Available instance extensions: {:?}", available);
        log::debug!("Required instance extensions: {:?}", required);

        let missing = missing_names(&required, &available);
        if !missing.is_empty() {
            log::warn!("Missing instance extensions: {:?}", missing);
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<DebugMessenger> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(MESSENGER_SEVERITIES)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        if devices.is_empty() {
            bail!("failed to find GPUs with Vulkan support");
        }

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilyIndices)> = None;

        for device in devices {
            let Some(families) = Self::check_device(instance, surface_loader, surface, device)? else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = score_device_type(props.device_type);
            log::debug!(
                "Candidate GPU {} scored {}",
                props.device_name_as_c_str().unwrap_or_default().to_string_lossy(),
                score
            );

            if best.map_or(true, |(best_score, _, _)| score > best_score) {
                best = Some((score, device, families));
            }
        }

        best.map(|(_, device, families)| (device, families))
            .context("failed to find a suitable GPU")
    }

    /// Queue families if the GPU can drive this surface, `None` otherwise
    fn check_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilyIndices>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let families = QueueFamilyIndices::find(&queue_families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .context("Failed to query surface support")
        })?;
        let Some(families) = families else {
            return Ok(None);
        };

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;
        let available: Vec<&CStr> = extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();
        if !missing_names(&DEVICE_EXTENSIONS, &available).is_empty() {
            return Ok(None);
        }

        // Swapchain support must be adequate for at least one format and mode
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device, surface)
        }?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device, surface)
        }?;
        if formats.is_empty() || present_modes.is_empty() {
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
        enable_validation: bool,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();
        let layer_names: Vec<*const std::ffi::c_char> = if enable_validation {
            VALIDATION_LAYERS.iter().map(|name| name.as_ptr()).collect()
        } else {
            Vec::new()
        };
        let features = vk::PhysicalDeviceFeatures::default();

        // Device layers are ignored by current loaders but older ones still read them
        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation_enabled
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Reverse creation order; the surface must go before the instance
        unsafe {
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Discrete GPUs win, then integrated, then anything else
pub fn score_device_type(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Requested names that do not appear in `available`
pub fn missing_names<'a>(requested: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    requested
        .iter()
        .copied()
        .filter(|name| !available.contains(name))
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    log::log!(message_level(message_severity), "[Vulkan {:?}] {}", message_type, message);

    vk::FALSE
}

/// Validation severity to log level
fn message_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Info,
        _ => log::Level::Trace,
    }
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
    fn prefers_single_family_for_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilyIndices::find(&families, |index| Ok(index != 0))
            .unwrap()
            .unwrap();
        assert_eq!(found, QueueFamilyIndices { graphics: 2, present: 2 });
        assert!(found.is_shared());
        assert_eq!(found.unique(), vec![2]);
    }

    #[test]
    fn splits_families_when_no_single_family_does_both() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = QueueFamilyIndices::find(&families, |index| Ok(index == 1))
            .unwrap()
            .unwrap();
        assert_eq!(found, QueueFamilyIndices { graphics: 0, present: 1 });
        assert!(!found.is_shared());
        assert_eq!(found.unique(), vec![0, 1]);
    }

    #[test]
    fn no_present_support_disqualifies() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let found = QueueFamilyIndices::find(&families, |_| Ok(false)).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let found = QueueFamilyIndices::find(&families, |_| Ok(true)).unwrap().unwrap();
        assert_eq!(found.graphics, 1);
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = QueueFamilyIndices::find(&families, |_| bail!("surface lost"));
        assert!(result.is_err());
    }

    #[test]
    fn discrete_outscores_integrated() {
        assert!(
            score_device_type(vk::PhysicalDeviceType::DISCRETE_GPU)
                > score_device_type(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            score_device_type(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > score_device_type(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn every_forwarded_severity_has_its_own_level() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        let expected = [
            (Severity::VERBOSE, log::Level::Trace),
            (Severity::INFO, log::Level::Info),
            (Severity::WARNING, log::Level::Warn),
            (Severity::ERROR, log::Level::Error),
        ];
        for (severity, level) in expected {
            assert!(MESSENGER_SEVERITIES.contains(severity), "{:?} not requested", severity);
            assert_eq!(message_level(severity), level);
        }
    }

    #[test]
    fn reports_missing_layers() {
        let available = [c"VK_LAYER_LUNARG_api_dump"];
        assert_eq!(missing_names(&VALIDATION_LAYERS, &available), VALIDATION_LAYERS.to_vec());

        let available = [c"VK_LAYER_LUNARG_api_dump", c"VK_LAYER_KHRONOS_validation"];
        assert!(missing_names(&VALIDATION_LAYERS, &available).is_empty());
    }
}
