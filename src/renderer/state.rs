use super::device::{
    GraphicsDevice, PipelineState, ProgramId, RenderTargetId, ScissorRect, TextureId, Viewport,
};
use crate::error::DeviceError;

/// Mirror of what is bound on the device. Each setter forwards to the device
/// only when the value differs and reports whether it did.
#[derive(Debug, Default)]
pub struct GpuState {
    program: Option<ProgramId>,
    pipeline: Option<PipelineState>,
    target: Option<Option<RenderTargetId>>,
    viewport: Option<Viewport>,
    scissor: Option<Option<ScissorRect>>,
    textures: Vec<Option<Option<TextureId>>>,
}

impl GpuState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_program(
        &mut self,
        device: &mut dyn GraphicsDevice,
        program: ProgramId,
    ) -> Result<bool, DeviceError> {
        if self.program == Some(program) {
            return Ok(false);
        }
        device.use_program(program)?;
        self.program = Some(program);
        Ok(true)
    }

    pub fn set_pipeline_state(
        &mut self,
        device: &mut dyn GraphicsDevice,
        state: &PipelineState,
    ) -> bool {
        if self.pipeline.as_ref() == Some(state) {
            return false;
        }
        device.set_pipeline_state(state);
        self.pipeline = Some(*state);
        true
    }

    pub fn bind_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        unit: u32,
        texture: Option<TextureId>,
    ) -> Result<bool, DeviceError> {
        let slot = unit as usize;
        if self.textures.len() <= slot {
            self.textures.resize(slot + 1, None);
        }
        if self.textures[slot] == Some(texture) {
            return Ok(false);
        }
        device.bind_texture(unit, texture)?;
        self.textures[slot] = Some(texture);
        Ok(true)
    }

    /// Switching targets drops everything bound to the previous pass.
    pub fn set_render_target(
        &mut self,
        device: &mut dyn GraphicsDevice,
        target: Option<RenderTargetId>,
    ) -> Result<bool, DeviceError> {
        if self.target == Some(target) {
            return Ok(false);
        }
        device.set_render_target(target)?;
        *self = Self {
            target: Some(target),
            ..Self::default()
        };
        Ok(true)
    }

    pub fn set_viewport(&mut self, device: &mut dyn GraphicsDevice, viewport: Viewport) -> bool {
        if self.viewport == Some(viewport) {
            return false;
        }
        device.set_viewport(viewport);
        self.viewport = Some(viewport);
        true
    }

    pub fn set_scissor(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scissor: Option<ScissorRect>,
    ) -> bool {
        if self.scissor == Some(scissor) {
            return false;
        }
        device.set_scissor(scissor);
        self.scissor = Some(scissor);
        true
    }

    pub fn current_program(&self) -> Option<ProgramId> {
        self.program
    }

    /// Forgets everything; the next call of each setter always reaches the
    /// device.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::{CullMode, ProgramDescriptor};
    use crate::renderer::recording::DeviceCommand;
    use crate::renderer::RecordingDevice;

    fn program(device: &mut RecordingDevice, label: &str) -> ProgramId {
        device
            .create_program(&ProgramDescriptor {
                label: label.into(),
                source: String::new(),
            })
            .unwrap()
    }

    #[test]
    fn redundant_program_binds_are_dropped() {
        let mut device = RecordingDevice::new();
        let a = program(&mut device, "a");
        let b = program(&mut device, "b");
        let mut state = GpuState::new();

        assert!(state.use_program(&mut device, a).unwrap());
        assert!(!state.use_program(&mut device, a).unwrap());
        assert!(state.use_program(&mut device, b).unwrap());

        let binds = device
            .commands()
            .iter()
            .filter(|c| matches!(c, DeviceCommand::UseProgram(_)))
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn pipeline_state_changes_only_on_difference() {
        let mut device = RecordingDevice::new();
        let mut state = GpuState::new();
        let opaque = PipelineState::default();
        let double = PipelineState {
            cull_mode: CullMode::None,
            ..opaque
        };

        assert!(state.set_pipeline_state(&mut device, &opaque));
        assert!(!state.set_pipeline_state(&mut device, &opaque));
        assert!(state.set_pipeline_state(&mut device, &double));
    }

    #[test]
    fn texture_units_are_tracked_independently() {
        let mut device = RecordingDevice::new();
        let mut state = GpuState::new();

        assert!(state.bind_texture(&mut device, 0, Some(TextureId(7))).unwrap());
        assert!(state.bind_texture(&mut device, 3, Some(TextureId(7))).unwrap());
        assert!(!state.bind_texture(&mut device, 0, Some(TextureId(7))).unwrap());
        assert!(state.bind_texture(&mut device, 0, None).unwrap());
    }

    #[test]
    fn new_target_invalidates_bindings() {
        let mut device = RecordingDevice::new();
        let a = program(&mut device, "a");
        let mut state = GpuState::new();
        state.set_render_target(&mut device, None).unwrap();
        state.use_program(&mut device, a).unwrap();

        assert!(!state.set_render_target(&mut device, None).unwrap());
        assert_eq!(state.current_program(), Some(a));

        state.reset();
        assert!(state.set_render_target(&mut device, None).unwrap());
        assert_eq!(state.current_program(), None);
        assert!(state.use_program(&mut device, a).unwrap());
    }
}
