//! Engine-wide error type.
//!
//! Every variant here is fatal to the renderer: there is no retry path and no degraded mode.
//! Programmer errors (bad entity indices, non-triangle index counts) are assertions instead.

use ash::vk;
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Vulkan call failed during {op}: {result:?}")]
    Vulkan { op: String, result: vk::Result },

    #[error("GPU allocation failed for '{name}': {source}")]
    Allocation {
        name: String,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    #[error("Immediate submit did not complete within {timeout_ms} ms (device lost?)")]
    SubmitTimeout { timeout_ms: u64 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Acceleration structure {stage} failed: {source}")]
    Accel {
        stage: AccelStage,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Texture error: {0}")]
    Texture(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The acceleration-structure operation that was running when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelStage {
    BottomLevelBuild,
    TopLevelBuild,
    TopLevelUpdate,
    ScratchGrowth,
    InstanceUpload,
    StorageGrowth,
}

impl fmt::Display for AccelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccelStage::BottomLevelBuild => "bottom-level build",
            AccelStage::TopLevelBuild => "top-level build",
            AccelStage::TopLevelUpdate => "top-level update",
            AccelStage::ScratchGrowth => "scratch buffer growth",
            AccelStage::InstanceUpload => "instance buffer upload",
            AccelStage::StorageGrowth => "storage buffer growth",
        };
        f.write_str(name)
    }
}

impl EngineError {
    pub fn vulkan(op: impl Into<String>, result: vk::Result) -> Self {
        EngineError::Vulkan {
            op: op.into(),
            result,
        }
    }

    pub fn allocation(name: impl Into<String>, source: gpu_allocator::AllocationError) -> Self {
        EngineError::Allocation {
            name: name.into(),
            source,
        }
    }

    /// Tag an error with the acceleration-structure stage it came from.
    pub fn in_stage(self, stage: AccelStage) -> Self {
        EngineError::Accel {
            stage,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accel_errors_name_the_failing_stage() {
        let err = EngineError::vulkan("vkCreateAccelerationStructureKHR", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            .in_stage(AccelStage::TopLevelUpdate);
        let msg = err.to_string();
        assert!(msg.contains("top-level update"), "{msg}");
    }

    #[test]
    fn timeout_message_mentions_duration() {
        let err = EngineError::SubmitTimeout { timeout_ms: 250 };
        assert!(err.to_string().contains("250 ms"));
    }
}
