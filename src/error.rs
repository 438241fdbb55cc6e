use thiserror::Error;

/// Failures reported by a [`GraphicsDevice`](crate::renderer::GraphicsDevice).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("graphics device lost")]
    Lost,
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },
    #[error("failed to compile program '{label}': {message}")]
    ShaderCompilation { label: String, message: String },
    #[error("out of device memory")]
    OutOfMemory,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl DeviceError {
    /// Context-level errors abort the whole frame; everything else only
    /// affects the draw item that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Lost)
    }
}

/// Hard failures surfaced to the caller of the renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("graphics device lost: {0}")]
    DeviceLost(String),
    #[error("failed to create graphics context: {0}")]
    ContextCreation(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RenderError {
    pub(crate) fn from_frame_error(err: DeviceError) -> Self {
        match err {
            DeviceError::Lost => RenderError::DeviceLost("lost during frame".to_string()),
            other => RenderError::Device(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_loss_is_fatal() {
        assert!(DeviceError::Lost.is_fatal());
        assert!(!DeviceError::OutOfMemory.is_fatal());
        assert!(!DeviceError::ShaderCompilation {
            label: "MeshStandard".into(),
            message: "bad".into(),
        }
        .is_fatal());
    }

    #[test]
    fn lost_frame_error_maps_to_device_lost() {
        assert!(matches!(
            RenderError::from_frame_error(DeviceError::Lost),
            RenderError::DeviceLost(_)
        ));
        assert!(matches!(
            RenderError::from_frame_error(DeviceError::OutOfMemory),
            RenderError::Device(DeviceError::OutOfMemory)
        ));
    }
}
