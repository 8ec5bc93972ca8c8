//! Flat float layouts of per-particle shader data
//!
//! Fields are packed one after the other in a single float buffer: every field
//! occupies `element_size * particle_count` bytes, starting right after the
//! previous one. Shaders find them through the signed float offsets of
//! [`ParticleUniforms`], `-1` meaning the field is absent.

use crate::render::api::ParticleUniforms;
use crate::simulation::{fields, FieldData, FieldDefinition, FieldType, ParticlePage};

/// Shader input a declared field feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdditionalInputKind {
    /// Diffuse or distortion color (float4)
    Color,
    /// Emissive color (float3)
    EmissiveColor,
    /// Alpha remap cursor (float)
    AlphaCursor,
    /// Atlas texture id (float, GPU billboarding only)
    TextureId,
    /// Generic dynamic parameter 0..3 (float4)
    DynamicParameter(u8),
}

impl AdditionalInputKind {
    /// Classify a declared field; `None` for fields no shader consumes
    pub fn classify(field: &FieldDefinition) -> Option<Self> {
        let kind = match field.name.as_str() {
            fields::DIFFUSE_COLOR | fields::DISTORTION_COLOR => Self::Color,
            fields::EMISSIVE_COLOR => Self::EmissiveColor,
            fields::ALPHA_REMAP_CURSOR => Self::AlphaCursor,
            fields::TEXTURE_ID => Self::TextureId,
            name => {
                let slot = fields::SHADER_INPUTS.iter().position(|input| *input == name)?;
                Self::DynamicParameter(slot as u8)
            }
        };
        (field.field_type == kind.field_type()).then_some(kind)
    }

    /// Type the shader expects
    pub const fn field_type(self) -> FieldType {
        match self {
            Self::Color | Self::DynamicParameter(_) => FieldType::Float4,
            Self::EmissiveColor => FieldType::Float3,
            Self::AlphaCursor | Self::TextureId => FieldType::Float,
        }
    }

    /// Value used when a page lacks the field
    pub const fn default_value(self) -> f32 {
        match self {
            Self::Color => 1.0,
            _ => 0.0,
        }
    }
}

/// What a slot of the layout holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRole {
    /// Positions, widened to float4 with `w = 1`
    Position,
    /// Uniform sizes
    Size,
    /// Two-axis sizes
    Size2,
    /// Rotations
    Rotation,
    /// First free axis
    Axis0,
    /// Second free axis
    Axis1,
    /// Additional shader input
    Input(AdditionalInputKind),
}

/// One field of a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    /// Role of the field
    pub role: FieldRole,
    /// Particle field read from pages
    pub source: String,
    /// Stored element type
    pub field_type: FieldType,
    /// Byte offset of the first element
    pub offset_in_bytes: u32,
}

impl FieldSlot {
    const fn width(&self) -> usize {
        (self.field_type.size_in_bytes() / 4) as usize
    }

    fn default_value(&self) -> f32 {
        match self.role {
            FieldRole::Input(kind) => kind.default_value(),
            FieldRole::Size | FieldRole::Size2 => 1.0,
            _ => 0.0,
        }
    }
}

/// Identity of a layout; a change means the buffers are new, not resized
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayoutSignature {
    /// Particles covered
    pub particle_count: u32,
    /// Roles and types in packing order
    pub fields: Vec<(FieldRole, FieldType)>,
}

/// Contiguous field layout over `particle_count` particles
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimDataLayout {
    particle_count: u32,
    slots: Vec<FieldSlot>,
    size_in_bytes: u32,
}

impl SimDataLayout {
    /// Empty layout
    pub fn new(particle_count: u32) -> Self {
        Self {
            particle_count,
            slots: Vec::new(),
            size_in_bytes: 0,
        }
    }

    /// Layout of the declared additional inputs only
    ///
    /// `with_texture_id` keeps the atlas texture id, which only GPU billboarding reads.
    pub fn additional_inputs(inputs: &[FieldDefinition], particle_count: u32, with_texture_id: bool) -> Self {
        let mut layout = Self::new(particle_count);
        layout.push_inputs(inputs, with_texture_id);
        layout
    }

    /// Layout read by vertex-shader billboarding of main-memory particles
    ///
    /// Geometry fields are included when `sample` carries them; the size is
    /// two-axis when the sample stores it as float2.
    pub fn billboard(sample: Option<&ParticlePage>, inputs: &[FieldDefinition], particle_count: u32) -> Self {
        let mut layout = Self::new(particle_count);
        layout.push(FieldRole::Position, fields::POSITION, FieldType::Float4);
        let has = |name: &str| sample.and_then(|page| page.field(name)).map(FieldData::field_type);
        match has(fields::SIZE) {
            Some(FieldType::Float2) => layout.push(FieldRole::Size2, fields::SIZE, FieldType::Float2),
            _ => layout.push(FieldRole::Size, fields::SIZE, FieldType::Float),
        }
        if has(fields::ROTATION) == Some(FieldType::Float) {
            layout.push(FieldRole::Rotation, fields::ROTATION, FieldType::Float);
        }
        if has(fields::AXIS0) == Some(FieldType::Float3) {
            layout.push(FieldRole::Axis0, fields::AXIS0, FieldType::Float3);
        }
        if has(fields::AXIS1) == Some(FieldType::Float3) {
            layout.push(FieldRole::Axis1, fields::AXIS1, FieldType::Float3);
        }
        layout.push_inputs(inputs, true);
        layout
    }

    fn push_inputs(&mut self, inputs: &[FieldDefinition], with_texture_id: bool) {
        for input in inputs {
            match AdditionalInputKind::classify(input) {
                Some(AdditionalInputKind::TextureId) if !with_texture_id => {}
                Some(kind) => {
                    if self.slots.iter().all(|slot| slot.role != FieldRole::Input(kind)) {
                        self.push(FieldRole::Input(kind), &input.name, kind.field_type());
                    }
                }
                None => log::debug!("Discarding unsupported additional input '{}'", input.name),
            }
        }
    }

    fn push(&mut self, role: FieldRole, source: &str, field_type: FieldType) {
        let offset_in_bytes = self.size_in_bytes;
        self.size_in_bytes += field_type.size_in_bytes() * self.particle_count;
        self.slots.push(FieldSlot {
            role,
            source: source.to_string(),
            field_type,
            offset_in_bytes,
        });
    }

    /// Particles covered
    pub const fn particle_count(&self) -> u32 {
        self.particle_count
    }

    /// Slots in packing order
    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    /// Whether no field is packed
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total bytes
    pub const fn size_in_bytes(&self) -> u32 {
        self.size_in_bytes
    }

    /// Total floats
    pub const fn float_count(&self) -> u32 {
        self.size_in_bytes / 4
    }

    /// Byte offset of a role
    pub fn offset_in_bytes(&self, role: FieldRole) -> Option<u32> {
        self.slots
            .iter()
            .find(|slot| slot.role == role)
            .map(|slot| slot.offset_in_bytes)
    }

    /// Float offset of a role, `-1` when absent
    pub fn offset_in_floats(&self, role: FieldRole) -> i32 {
        self.offset_in_bytes(role).map_or(-1, |offset| (offset / 4) as i32)
    }

    /// Identity used to tell new buffers from resized ones
    pub fn signature(&self) -> LayoutSignature {
        LayoutSignature {
            particle_count: self.particle_count,
            fields: self.slots.iter().map(|slot| (slot.role, slot.field_type)).collect(),
        }
    }

    /// Write the offsets of every packed field into `uniforms`
    pub fn apply(&self, uniforms: &mut ParticleUniforms) {
        uniforms.positions_offset = self.offset_in_floats(FieldRole::Position);
        uniforms.sizes_offset = self.offset_in_floats(FieldRole::Size);
        uniforms.size2s_offset = self.offset_in_floats(FieldRole::Size2);
        uniforms.rotations_offset = self.offset_in_floats(FieldRole::Rotation);
        uniforms.axis0s_offset = self.offset_in_floats(FieldRole::Axis0);
        uniforms.axis1s_offset = self.offset_in_floats(FieldRole::Axis1);
        uniforms.texture_ids_offset = self.offset_in_floats(FieldRole::Input(AdditionalInputKind::TextureId));
        uniforms.colors_offset = self.offset_in_floats(FieldRole::Input(AdditionalInputKind::Color));
        uniforms.emissive_colors_offset =
            self.offset_in_floats(FieldRole::Input(AdditionalInputKind::EmissiveColor));
        uniforms.alpha_cursors_offset = self.offset_in_floats(FieldRole::Input(AdditionalInputKind::AlphaCursor));
        for (slot, offset) in uniforms.dyn_param_offsets.iter_mut().enumerate() {
            *offset = self.offset_in_floats(FieldRole::Input(AdditionalInputKind::DynamicParameter(slot as u8)));
        }
    }

    /// Pack the fields of `pages`, in order, into `dst`
    ///
    /// Missing fields are filled with their default value. Pages past the
    /// layout's particle count are ignored.
    pub fn fill<'a>(&self, pages: impl Iterator<Item = &'a ParticlePage> + Clone, dst: &mut [f32]) {
        let capacity = self.particle_count as usize;
        for slot in &self.slots {
            let width = slot.width();
            let base = (slot.offset_in_bytes / 4) as usize;
            let Some(column) = dst.get_mut(base..base + width * capacity) else {
                log::warn!("Field '{}' does not fit the mapped buffer", slot.source);
                continue;
            };

            let mut particle = 0;
            for page in pages.clone() {
                let count = (page.particle_count() as usize).min(capacity - particle);
                let out = &mut column[particle * width..(particle + count) * width];
                write_field(slot, page, count, out);
                particle += count;
                if particle == capacity {
                    break;
                }
            }
        }
    }
}

fn write_field(slot: &FieldSlot, page: &ParticlePage, count: usize, out: &mut [f32]) {
    match (slot.role, page.field(&slot.source)) {
        (FieldRole::Position, Some(FieldData::Float3(positions))) => {
            for (dst, p) in out.chunks_exact_mut(4).zip(positions) {
                dst.copy_from_slice(&[p[0], p[1], p[2], 1.0]);
            }
        }
        (_, Some(data)) if data.field_type() == slot.field_type => {
            if let Some(values) = data.as_floats() {
                let len = out.len().min(values.len());
                out[..len].copy_from_slice(&values[..len]);
            }
        }
        (FieldRole::Size2, Some(FieldData::Float(sizes))) => {
            for (dst, s) in out.chunks_exact_mut(2).zip(sizes) {
                dst.copy_from_slice(&[*s, *s]);
            }
        }
        _ => out.fill(slot.default_value()),
    }
    debug_assert_eq!(out.len(), count * slot.width());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new(fields::DIFFUSE_COLOR, FieldType::Float4),
            FieldDefinition::new(fields::SHADER_INPUTS[1], FieldType::Float4),
        ]
    }

    #[test]
    fn test_offsets_are_contiguous() {
        let layout = SimDataLayout::billboard(None, &inputs(), 8);
        let offsets: Vec<u32> = layout.slots().iter().map(|slot| slot.offset_in_bytes).collect();
        assert_eq!(offsets, vec![0, 128, 160, 288]);
        assert_eq!(layout.size_in_bytes(), 416);

        let mut end = 0;
        for slot in layout.slots() {
            assert_eq!(slot.offset_in_bytes, end);
            assert_eq!(slot.offset_in_bytes % slot.field_type.size_in_bytes().min(4), 0);
            end = slot.offset_in_bytes + slot.field_type.size_in_bytes() * 8;
        }
        assert_eq!(end, layout.size_in_bytes());
    }

    #[test]
    fn test_uniform_offsets() {
        let layout = SimDataLayout::billboard(None, &inputs(), 8);
        let mut uniforms = ParticleUniforms::default();
        layout.apply(&mut uniforms);

        assert_eq!(uniforms.positions_offset, 0);
        assert_eq!(uniforms.sizes_offset, 32);
        assert_eq!(uniforms.colors_offset, 40);
        assert_eq!(uniforms.dyn_param_offsets, [-1, 72, -1]);
        assert_eq!(uniforms.rotations_offset, -1);
        assert_eq!(uniforms.size2s_offset, -1);
    }

    #[test]
    fn test_unsupported_inputs_are_discarded() {
        let inputs = vec![
            FieldDefinition::new("Custom.Thing", FieldType::Float4),
            FieldDefinition::new(fields::DIFFUSE_COLOR, FieldType::Float3),
            FieldDefinition::new(fields::TEXTURE_ID, FieldType::Float),
            FieldDefinition::new(fields::ALPHA_REMAP_CURSOR, FieldType::Float),
        ];
        let cpu = SimDataLayout::additional_inputs(&inputs, 4, false);
        assert_eq!(cpu.slots().len(), 1);
        assert_eq!(cpu.size_in_bytes(), 16);

        let gpu = SimDataLayout::additional_inputs(&inputs, 4, true);
        assert_eq!(gpu.slots().len(), 2);
    }

    #[test]
    fn test_fill_widens_positions_and_defaults_missing_fields() {
        let page_a = ParticlePage::new(1)
            .with_field(fields::POSITION, FieldData::Float3(vec![[1.0, 2.0, 3.0]]))
            .with_field(fields::SIZE, FieldData::Float(vec![0.5]));
        let page_b = ParticlePage::new(1).with_field(fields::POSITION, FieldData::Float3(vec![[4.0, 5.0, 6.0]]));
        let inputs = vec![FieldDefinition::new(fields::DIFFUSE_COLOR, FieldType::Float4)];
        let layout = SimDataLayout::billboard(Some(&page_a), &inputs, 2);

        let mut dst = vec![0.0; layout.float_count() as usize];
        layout.fill([&page_a, &page_b].into_iter(), &mut dst);

        assert_eq!(dst[0..8], [1.0, 2.0, 3.0, 1.0, 4.0, 5.0, 6.0, 1.0]);
        assert_eq!(dst[8..10], [0.5, 1.0]);
        assert_eq!(dst[10..18], [1.0; 8]);
    }

    #[test]
    fn test_signature_tracks_count_and_fields() {
        let a = SimDataLayout::billboard(None, &inputs(), 8).signature();
        let b = SimDataLayout::billboard(None, &inputs(), 9).signature();
        let c = SimDataLayout::billboard(None, &inputs()[..1], 8).signature();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SimDataLayout::billboard(None, &inputs(), 8).signature());
    }
}
