use std::collections::{BTreeMap, HashSet};

use super::device::*;
use crate::error::DeviceError;

/// One call made through [`GraphicsDevice`], in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    BeginFrame,
    EndFrame,
    CreateBuffer { id: BufferId, kind: BufferKind, size: usize },
    WriteBuffer { id: BufferId, offset: u64, size: usize },
    DeleteBuffer(BufferId),
    CreateTexture { id: TextureId, width: u32, height: u32 },
    WriteTexture { id: TextureId, width: u32, height: u32 },
    DeleteTexture(TextureId),
    CreateProgram { id: ProgramId, label: String },
    DeleteProgram(ProgramId),
    CreateRenderTarget { id: RenderTargetId, width: u32, height: u32 },
    DeleteRenderTarget(RenderTargetId),
    SetRenderTarget(Option<RenderTargetId>),
    SetViewport(Viewport),
    SetScissor(Option<ScissorRect>),
    Clear { color: Option<[f32; 4]>, depth: bool },
    UseProgram(ProgramId),
    SetPipelineState(PipelineState),
    SetUniforms { slot: UniformSlot, size: usize },
    SetVertexBuffers {
        bindings: Vec<VertexBinding>,
        index: Option<(BufferId, IndexFormat)>,
    },
    BindTexture { unit: u32, texture: Option<TextureId> },
    Draw(DrawCall),
}

/// Headless device that records every command instead of executing it.
///
/// Used by the test suite; it can also simulate device loss and shader
/// compile failures.
pub struct RecordingDevice {
    capabilities: DeviceCapabilities,
    size: (u32, u32),
    lost: bool,
    next_id: u32,
    commands: Vec<DeviceCommand>,
    buffers: BTreeMap<BufferId, usize>,
    textures: BTreeMap<TextureId, (u32, u32)>,
    programs: BTreeMap<ProgramId, ProgramDescriptor>,
    targets: BTreeMap<RenderTargetId, TextureId>,
    uniforms: BTreeMap<UniformSlot, Vec<u8>>,
    failing_programs: HashSet<String>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            size: (1, 1),
            lost: false,
            next_id: 1,
            commands: Vec::new(),
            buffers: BTreeMap::new(),
            textures: BTreeMap::new(),
            programs: BTreeMap::new(),
            targets: BTreeMap::new(),
            uniforms: BTreeMap::new(),
            failing_programs: HashSet::new(),
        }
    }

    /// Makes every following fallible call fail with [`DeviceError::Lost`].
    pub fn lose_device(&mut self) {
        self.lost = true;
    }

    /// Brings the context back; all previously created resources are gone.
    pub fn restore_device(&mut self) {
        self.lost = false;
        self.buffers.clear();
        self.textures.clear();
        self.programs.clear();
        self.targets.clear();
        self.uniforms.clear();
    }

    /// Programs whose label contains `label` fail to compile.
    pub fn fail_programs_labelled(&mut self, label: impl Into<String>) {
        self.failing_programs.insert(label.into());
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn draw_calls(&self) -> Vec<DrawCall> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                DeviceCommand::Draw(call) => Some(*call),
                _ => None,
            })
            .collect()
    }

    /// Creates plus writes that touched `buffer`.
    pub fn uploads_for(&self, buffer: BufferId) -> usize {
        self.commands
            .iter()
            .filter(|command| {
                matches!(command,
                    DeviceCommand::CreateBuffer { id, .. } | DeviceCommand::WriteBuffer { id, .. }
                    if *id == buffer)
            })
            .count()
    }

    pub fn texture_uploads(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, DeviceCommand::WriteTexture { .. }))
            .count()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn program(&self, id: ProgramId) -> Option<&ProgramDescriptor> {
        self.programs.get(&id)
    }

    pub fn texture_size(&self, id: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&id).copied()
    }

    /// Last data written to a uniform slot.
    pub fn uniforms(&self, slot: UniformSlot) -> Option<&[u8]> {
        self.uniforms.get(&slot).map(Vec::as_slice)
    }

    fn record(&mut self, command: DeviceCommand) {
        log::trace!("device: {:?}", command);
        self.commands.push(command);
    }

    fn alive(&self) -> Result<(), DeviceError> {
        if self.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl GraphicsDevice for RecordingDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn is_lost(&self) -> bool {
        self.lost
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width.max(1), height.max(1));
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        self.alive()?;
        self.record(DeviceCommand::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.alive()?;
        self.record(DeviceCommand::EndFrame);
        Ok(())
    }

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferId, DeviceError> {
        self.alive()?;
        let id = BufferId(self.allocate());
        self.buffers.insert(id, data.len());
        self.record(DeviceCommand::CreateBuffer {
            id,
            kind,
            size: data.len(),
        });
        Ok(id)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.alive()?;
        let capacity = *self.buffers.get(&buffer).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if offset as usize + data.len() > capacity {
            return Err(DeviceError::OutOfMemory);
        }
        self.record(DeviceCommand::WriteBuffer {
            id: buffer,
            offset,
            size: data.len(),
        });
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            self.record(DeviceCommand::DeleteBuffer(buffer));
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId, DeviceError> {
        self.alive()?;
        if desc.width > self.capabilities.max_texture_size
            || desc.height > self.capabilities.max_texture_size
        {
            return Err(DeviceError::Unsupported(format!(
                "texture '{}' is {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        let id = TextureId(self.allocate());
        self.textures.insert(id, (desc.width, desc.height));
        self.record(DeviceCommand::CreateTexture {
            id,
            width: desc.width,
            height: desc.height,
        });
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), DeviceError> {
        self.alive()?;
        let (w, h) = *self.textures.get(&texture).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if w != width || h != height || pixels.len() != (width * height * 4) as usize {
            return Err(DeviceError::Unsupported(format!(
                "upload of {}x{} into {}x{} texture",
                width, height, w, h
            )));
        }
        self.record(DeviceCommand::WriteTexture {
            id: texture,
            width,
            height,
        });
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            self.record(DeviceCommand::DeleteTexture(texture));
        }
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> Result<ProgramId, DeviceError> {
        self.alive()?;
        if self
            .failing_programs
            .iter()
            .any(|label| desc.label.contains(label.as_str()))
        {
            return Err(DeviceError::ShaderCompilation {
                label: desc.label.clone(),
                message: "rejected by recording device".to_string(),
            });
        }
        let id = ProgramId(self.allocate());
        self.programs.insert(id, desc.clone());
        self.record(DeviceCommand::CreateProgram {
            id,
            label: desc.label.clone(),
        });
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.record(DeviceCommand::DeleteProgram(program));
        }
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDescriptor,
    ) -> Result<RenderTargetId, DeviceError> {
        self.alive()?;
        let id = RenderTargetId(self.allocate());
        let texture = TextureId(self.allocate());
        self.textures.insert(texture, (desc.width, desc.height));
        self.targets.insert(id, texture);
        self.record(DeviceCommand::CreateRenderTarget {
            id,
            width: desc.width,
            height: desc.height,
        });
        Ok(id)
    }

    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId> {
        self.targets.get(&target).copied()
    }

    fn delete_render_target(&mut self, target: RenderTargetId) {
        if let Some(texture) = self.targets.remove(&target) {
            self.textures.remove(&texture);
            self.record(DeviceCommand::DeleteRenderTarget(target));
        }
    }

    fn set_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), DeviceError> {
        self.alive()?;
        if let Some(target) = target {
            if !self.targets.contains_key(&target) {
                return Err(DeviceError::InvalidHandle {
                    kind: "render target",
                    id: target.0,
                });
            }
        }
        self.record(DeviceCommand::SetRenderTarget(target));
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(DeviceCommand::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.record(DeviceCommand::SetScissor(scissor));
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool) {
        self.record(DeviceCommand::Clear { color, depth });
    }

    fn use_program(&mut self, program: ProgramId) -> Result<(), DeviceError> {
        self.alive()?;
        if !self.programs.contains_key(&program) {
            return Err(DeviceError::InvalidHandle {
                kind: "program",
                id: program.0,
            });
        }
        self.record(DeviceCommand::UseProgram(program));
        Ok(())
    }

    fn set_pipeline_state(&mut self, state: &PipelineState) {
        self.record(DeviceCommand::SetPipelineState(*state));
    }

    fn set_uniforms(&mut self, slot: UniformSlot, data: &[u8]) -> Result<(), DeviceError> {
        self.alive()?;
        self.uniforms.insert(slot, data.to_vec());
        self.record(DeviceCommand::SetUniforms {
            slot,
            size: data.len(),
        });
        Ok(())
    }

    fn set_vertex_buffers(
        &mut self,
        bindings: &[VertexBinding],
        index: Option<(BufferId, IndexFormat)>,
    ) -> Result<(), DeviceError> {
        self.alive()?;
        let missing = bindings
            .iter()
            .map(|binding| binding.buffer)
            .chain(index.map(|(buffer, _)| buffer))
            .find(|buffer| !self.buffers.contains_key(buffer));
        if let Some(buffer) = missing {
            return Err(DeviceError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            });
        }
        self.record(DeviceCommand::SetVertexBuffers {
            bindings: bindings.to_vec(),
            index,
        });
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) -> Result<(), DeviceError> {
        self.alive()?;
        if unit >= self.capabilities.max_texture_units {
            return Err(DeviceError::Unsupported(format!("texture unit {unit}")));
        }
        self.record(DeviceCommand::BindTexture { unit, texture });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), DeviceError> {
        self.alive()?;
        self.record(DeviceCommand::Draw(*call));
        Ok(())
    }
}
