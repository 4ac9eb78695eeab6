use std::borrow::Cow;
use std::ffi::{c_void, CStr};

use anyhow::Result;
use ash::ext;
use ash::vk::{self, DebugUtilsMessageSeverityFlagsEXT, DebugUtilsMessageTypeFlagsEXT};
use log::{debug, error, info, warn};

pub struct DebugUtilsData {
    loader: ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtilsData {
    pub unsafe fn new(
        loader: ext::debug_utils::Instance,
        create_info: &vk::DebugUtilsMessengerCreateInfoEXT,
    ) -> Result<Self> {
        let messenger = loader.create_debug_utils_messenger(create_info, None)?;
        Ok(Self { loader, messenger })
    }
}

impl Drop for DebugUtilsData {
    fn drop(&mut self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None)
        };
    }
}

pub unsafe extern "system" fn debug_callback(
    severity: DebugUtilsMessageSeverityFlagsEXT,
    message_type: DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    match severity {
        DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[vk {:?}] {}", message_type, message),
        DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[vk {:?}] {}", message_type, message),
        DebugUtilsMessageSeverityFlagsEXT::INFO => info!("[vk {:?}] {}", message_type, message),
        _ => debug!("[vk {:?}] {}", message_type, message),
    }

    vk::FALSE
}
