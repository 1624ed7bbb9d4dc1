// Vulkan Instance - entry point into the API
//
// Responsibilities:
// - Load the Vulkan library
// - Check and enable the validation layer + debug utils when asked for
// - Forward validation messages to the log

use crate::config::InstanceConfig;
use crate::error::{ComputeError, Result};
use ash::{ext::debug_utils, vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance wrapper with automatic cleanup
pub struct Instance {
    instance: ash::Instance,
    _entry: Entry,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    api_version: u32,
}

impl Instance {
    pub fn new(settings: &InstanceConfig) -> Result<Arc<Self>> {
        let api_version = settings.vk_api_version().unwrap_or_else(|e| {
            log::warn!("{:#}, defaulting to Vulkan 1.1", e);
            vk::API_VERSION_1_1
        });
        Self::with_version(&settings.app_name, api_version, settings.validation_layers)
    }

    /// Create an instance for `api_version`
    ///
    /// Validation is only honored in debug builds.
    pub fn with_version(app_name: &str, api_version: u32, validation: bool) -> Result<Arc<Self>> {
        let enable_validation = cfg!(debug_assertions) && validation;
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let (layers, extensions) = find_layers_and_extensions(&entry, enable_validation)?;

        let app_name_cstr = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(0)
            .engine_name(c"No Engine")
            .engine_version(0)
            .api_version(api_version);

        let layer_ptrs: Vec<_> = layers.iter().map(|name| name.as_ptr()).collect();
        let extension_ptrs: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("--- available instance extensions ---");
            for extension in unsafe { entry.enumerate_instance_extension_properties(None) }? {
                if let Ok(name) = extension.extension_name_as_c_str() {
                    log::debug!("\t{}", name.to_string_lossy());
                }
            }
        }

        let debug_utils = if enable_validation {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            instance,
            _entry: entry,
            debug_utils,
            api_version,
        }))
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    pub fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.instance.enumerate_physical_devices() }?)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Layers and instance extensions needed for validation
fn find_layers_and_extensions(
    entry: &Entry,
    enable_validation: bool,
) -> Result<(Vec<&'static CStr>, Vec<&'static CStr>)> {
    if !enable_validation {
        return Ok((Vec::new(), Vec::new()));
    }

    let layer_properties = unsafe { entry.enumerate_instance_layer_properties() }?;
    let layer_names = layer_properties
        .iter()
        .filter_map(|prop| prop.layer_name_as_c_str().ok());
    if !has_name(layer_names, VALIDATION_LAYER) {
        return Err(ComputeError::LayerNotSupported(
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        ));
    }

    let extension_properties = unsafe { entry.enumerate_instance_extension_properties(None) }?;
    let extension_names = extension_properties
        .iter()
        .filter_map(|prop| prop.extension_name_as_c_str().ok());
    if !has_name(extension_names, debug_utils::NAME) {
        return Err(ComputeError::ExtensionNotSupported(
            debug_utils::NAME.to_string_lossy().into_owned(),
        ));
    }

    Ok((vec![VALIDATION_LAYER], vec![debug_utils::NAME]))
}

pub(crate) fn has_name<'a>(names: impl IntoIterator<Item = &'a CStr>, wanted: &CStr) -> bool {
    names.into_iter().any(|name| name == wanted)
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = debug_utils::Instance::new(entry, instance);

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

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

    Ok((debug_utils, messenger))
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
