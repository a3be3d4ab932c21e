//! Vulkan initialization: instance, device, queue, allocator and the immediate-submit scope.
//!
//! The context always enables acceleration structures, buffer device addresses and the
//! descriptor-indexing features the bindless texture array relies on. Ray queries are
//! enabled when the device offers them.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use log::{info, warn};
use std::ffi::{c_char, CStr, CString};

use crate::allocator::{self, GpuBuffer, GpuImage};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::submit::ImmediateSubmit;

const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 2] = [
    c"VK_KHR_acceleration_structure",
    c"VK_KHR_deferred_host_operations",
];

/// Holds all core Vulkan state for the engine.
///
/// Fields are ordered so that Rust's drop order (top-to-bottom declaration)
/// destroys resources before the device/instance they depend on.
pub struct VulkanContext {
    pub accel_struct_loader: ash::khr::acceleration_structure::Device,
    /// `minAccelerationStructureScratchOffsetAlignment`.
    pub scratch_alignment: u64,
    pub ray_query_supported: bool,

    // Allocator must be dropped before device, wrapped in Option so we can take() in destroy
    allocator_inner: Option<Allocator>,

    immediate: ImmediateSubmit,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    // Debug utils (only when validation is on), destroyed before instance
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    destroyed: bool,
}

impl VulkanContext {
    /// Create a headless context on the first device that supports acceleration structures,
    /// preferring discrete GPUs.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        // --- Entry ---
        let entry = unsafe {
            ash::Entry::load()
                .map_err(|e| EngineError::Unsupported(format!("Failed to load Vulkan: {}", e)))?
        };

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"strata")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"strata")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut layer_names: Vec<CString> = Vec::new();
        let mut extension_names: Vec<CString> = Vec::new();

        if config.validation {
            let validation_layer = c"VK_LAYER_KHRONOS_validation";
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer
            });
            if has_validation {
                layer_names.push(validation_layer.to_owned());
                extension_names.push(c"VK_EXT_debug_utils".to_owned());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();
        let extension_name_ptrs: Vec<*const c_char> =
            extension_names.iter().map(|n| n.as_ptr()).collect();

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_name_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| EngineError::vulkan("create instance", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if extension_names
            .iter()
            .any(|n| n.as_c_str() == c"VK_EXT_debug_utils")
        {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));

            let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_info, None).ok() };

            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Physical device selection ---
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|e| EngineError::vulkan("enumerate physical devices", e))?
        };

        let mut selected: Option<(vk::PhysicalDevice, u32, bool, bool)> = None;

        for &phys_dev in &physical_devices {
            let props = unsafe { instance.get_physical_device_properties(phys_dev) };
            let api_version = props.api_version;

            if vk::api_version_major(api_version) < 1
                || (vk::api_version_major(api_version) == 1
                    && vk::api_version_minor(api_version) < 2)
            {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
            let Some((family_idx, _)) = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            else {
                continue;
            };

            let dev_extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(phys_dev)
                    .unwrap_or_default()
            };
            let ext_names: Vec<&CStr> = dev_extensions
                .iter()
                .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) })
                .collect();

            if !REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .all(|required| ext_names.contains(required))
            {
                continue;
            }
            let has_ray_query = ext_names.contains(&c"VK_KHR_ray_query");
            let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;

            let replace = match selected {
                None => true,
                Some((_, _, _, selected_discrete)) => is_discrete && !selected_discrete,
            };
            if replace {
                let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(
                    "Selected GPU: {} (Vulkan {}.{}, ray query: {})",
                    dev_name.to_string_lossy(),
                    vk::api_version_major(api_version),
                    vk::api_version_minor(api_version),
                    if has_ray_query { "yes" } else { "no" }
                );
                selected = Some((phys_dev, family_idx as u32, has_ray_query, is_discrete));
            }
        }

        let (physical_device, queue_family, ray_query_supported, _) = selected.ok_or_else(|| {
            EngineError::Unsupported(
                "No GPU with Vulkan 1.2 and VK_KHR_acceleration_structure found".to_string(),
            )
        })?;

        // --- Device creation ---
        let queue_priority = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority);
        let queue_create_infos = [queue_create_info];

        let mut device_extensions: Vec<&CStr> = REQUIRED_DEVICE_EXTENSIONS.to_vec();
        if ray_query_supported {
            device_extensions.push(c"VK_KHR_ray_query");
        }
        let device_ext_ptrs: Vec<*const c_char> = device_extensions.iter().map(|n| n.as_ptr()).collect();

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features);
        if ray_query_supported {
            features2 = features2.push_next(&mut ray_query_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| EngineError::vulkan("create logical device", e))?
        };

        let graphics_queue = unsafe { device.get_device_queue(queue_family, 0) };

        let immediate = ImmediateSubmit::new(&device, queue_family, config.fence_timeout_ns())?;

        // --- gpu-allocator ---
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| EngineError::allocation("device allocator", e))?;

        // --- Acceleration structure loader and properties ---
        let accel_struct_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);

        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut as_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }

        info!(
            "Acceleration structure properties: max_instances={}, scratch_alignment={}",
            as_props.max_instance_count, as_props.min_acceleration_structure_scratch_offset_alignment
        );

        let scratch_alignment = as_props.min_acceleration_structure_scratch_offset_alignment as u64;

        info!("Vulkan context initialized successfully");

        Ok(VulkanContext {
            accel_struct_loader,
            scratch_alignment,
            ray_query_supported,
            allocator_inner: Some(allocator),
            immediate,
            graphics_queue,
            graphics_queue_family: queue_family,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            instance,
            entry,
            destroyed: false,
        })
    }

    fn device_and_allocator(&mut self) -> (&ash::Device, &mut Allocator) {
        let allocator = self
            .allocator_inner
            .as_mut()
            .expect("Allocator already destroyed");
        (&self.device, allocator)
    }

    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let (device, allocator) = self.device_and_allocator();
        allocator::create_buffer(device, allocator, size, usage, location, name)
    }

    pub fn create_buffer_with_data(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let (device, allocator) = self.device_and_allocator();
        allocator::create_buffer_with_data(device, allocator, data, usage, name)
    }

    pub fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) {
        let (device, allocator) = self.device_and_allocator();
        buffer.destroy(device, allocator);
    }

    pub fn create_image(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        let (device, allocator) = self.device_and_allocator();
        allocator::create_image(
            device,
            allocator,
            extent,
            format,
            usage,
            vk::ImageAspectFlags::COLOR,
            name,
        )
    }

    pub fn destroy_image(&mut self, image: &mut GpuImage) {
        let (device, allocator) = self.device_and_allocator();
        image.destroy(device, allocator);
    }

    /// Record, submit and wait for a batch of commands.
    pub fn immediate_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.immediate
            .submit(&self.device, self.graphics_queue, record)
    }

    /// Get the device address of a buffer created with SHADER_DEVICE_ADDRESS usage.
    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Explicitly destroy all Vulkan resources in the correct order.
    ///
    /// The Drop impl also calls this if it hasn't been called yet.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
        }

        self.immediate.destroy(&self.device);

        // Drop allocator (needs device alive)
        drop(self.allocator_inner.take());

        unsafe {
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}
