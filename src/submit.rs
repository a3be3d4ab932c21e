//! Synchronous "record, submit, wait" command scope used for uploads and acceleration-structure builds.

use ash::vk;

use crate::error::{EngineError, Result};

/// A reusable one-shot command buffer plus the fence that guards it.
///
/// Every call to [`ImmediateSubmit::submit`] blocks until the GPU has finished, so anything
/// the recorded commands touched may be destroyed as soon as it returns.
pub struct ImmediateSubmit {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    timeout_ns: u64,
}

impl ImmediateSubmit {
    pub fn new(device: &ash::Device, queue_family: u32, timeout_ns: u64) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| EngineError::vulkan("create immediate command pool", e))?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| EngineError::vulkan("allocate immediate command buffer", e))?[0]
        };

        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| EngineError::vulkan("create immediate fence", e))?
        };

        Ok(Self {
            pool,
            cmd,
            fence,
            timeout_ns,
        })
    }

    /// Record commands with `record`, submit them to `queue` and wait for completion.
    ///
    /// A fence wait that exceeds the configured timeout is reported as
    /// [`EngineError::SubmitTimeout`]; callers treat it as device loss.
    pub fn submit<F>(&self, device: &ash::Device, queue: vk::Queue, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| EngineError::vulkan("reset immediate command buffer", e))?;
            device
                .begin_command_buffer(self.cmd, &begin_info)
                .map_err(|e| EngineError::vulkan("begin immediate command buffer", e))?;
        }

        record(device, self.cmd);

        let cmd_bufs = [self.cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        unsafe {
            device
                .end_command_buffer(self.cmd)
                .map_err(|e| EngineError::vulkan("end immediate command buffer", e))?;
            device
                .queue_submit(queue, &[submit_info], self.fence)
                .map_err(|e| EngineError::vulkan("submit immediate command buffer", e))?;

            match device.wait_for_fences(&[self.fence], true, self.timeout_ns) {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => {
                    return Err(EngineError::SubmitTimeout {
                        timeout_ms: self.timeout_ns / 1_000_000,
                    })
                }
                Err(e) => return Err(EngineError::vulkan("wait for immediate fence", e)),
            }

            device
                .reset_fences(&[self.fence])
                .map_err(|e| EngineError::vulkan("reset immediate fence", e))?;
        }

        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.pool, None);
        }
        self.fence = vk::Fence::null();
        self.pool = vk::CommandPool::null();
        self.cmd = vk::CommandBuffer::null();
    }
}
