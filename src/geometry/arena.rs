// Offset addressing into the shared mapped region
//
// The region is carved once into named ranges; callers only ever see range
// handles (base + stride + count) and compute byte offsets from a slot index.

use ash::vk;
use bytemuck::Pod;

use crate::error::{RenderError, RenderResult};

/// Descriptors per object in the texture table (base color, normal,
/// occlusion, emissive, metallic-roughness)
pub const TEXTURE_SLOTS: u64 = 5;

pub const RESOURCE_KIND_COUNT: usize = 7;

/// Resource kinds bound for every draw, in binding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Scene,
    Transform,
    Material,
    Meshlets,
    Indices,
    Vertices,
    Textures,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; RESOURCE_KIND_COUNT] = [
        ResourceKind::Scene,
        ResourceKind::Transform,
        ResourceKind::Material,
        ResourceKind::Meshlets,
        ResourceKind::Indices,
        ResourceKind::Vertices,
        ResourceKind::Textures,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Usage flags the kind's descriptor buffer is bound with
    pub fn buffer_usage(self) -> vk::BufferUsageFlags {
        match self {
            ResourceKind::Textures => {
                vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
            }
            _ => vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
        }
    }
}

/// A named sub-range of the mapped region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHandle {
    pub base: u64,
    pub stride: u64,
    pub count: u64,
}

impl RangeHandle {
    /// Byte offset of element `slot`: `base + slot * stride`
    pub fn offset_of(&self, slot: u64) -> RenderResult<u64> {
        if slot >= self.count {
            return Err(RenderError::SlotOutOfRange { slot, count: self.count });
        }
        strided_offset(self.base, self.stride, slot)
    }

    /// Total bytes covered
    pub fn size(&self) -> RenderResult<u64> {
        strided_offset(0, self.stride, self.count)
    }

    pub fn end(&self) -> RenderResult<u64> {
        strided_offset(self.base, self.stride, self.count)
    }
}

fn strided_offset(base: u64, stride: u64, slot: u64) -> RenderResult<u64> {
    slot.checked_mul(stride)
        .and_then(|scaled| scaled.checked_add(base))
        .ok_or(RenderError::OffsetOverflow { slot, stride, base })
}

/// Bump allocator of ranges over a fixed-size mapped region
#[derive(Debug)]
pub struct MappedArena {
    capacity: u64,
    cursor: u64,
    alignment: u64,
}

impl MappedArena {
    /// `alignment` must be a power of two
    pub fn new(capacity: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            capacity,
            cursor: 0,
            alignment: alignment.max(1),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Reserve `count` elements of `stride` bytes, base aligned
    pub fn reserve(&mut self, stride: u64, count: u64) -> RenderResult<RangeHandle> {
        let base = self
            .cursor
            .checked_add(self.alignment - 1)
            .map(|unaligned| unaligned & !(self.alignment - 1))
            .ok_or(RenderError::ArenaExhausted { requested: u64::MAX, available: 0 })?;
        let available = self.capacity.saturating_sub(base);
        let size = stride
            .checked_mul(count)
            .ok_or(RenderError::ArenaExhausted { requested: u64::MAX, available })?;
        if size > available {
            return Err(RenderError::ArenaExhausted { requested: size, available });
        }

        self.cursor = base + size;
        Ok(RangeHandle { base, stride, count })
    }

    /// Drop every reservation made after `mark` (a previous `used()`)
    pub fn rewind(&mut self, mark: u64) {
        debug_assert!(mark <= self.cursor);
        self.cursor = mark.min(self.cursor);
    }

    /// Reserve one element per `T` for `count` slots
    pub fn reserve_typed<T: Pod>(&mut self, count: u64) -> RenderResult<RangeHandle> {
        self.reserve(std::mem::size_of::<T>() as u64, count)
    }
}

/// Copy `data` into the region at `offset`
pub fn write_pod<T: Pod>(region: &mut [u8], offset: u64, data: &[T]) -> RenderResult<()> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let end = offset.saturating_add(bytes.len() as u64);
    if end > region.len() as u64 {
        return Err(RenderError::RegionTooSmall { len: region.len(), end });
    }
    let start = offset as usize;
    region[start..start + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Where one kind's descriptors start and how large one object's set is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub layout_offset: u64,
    pub layout_size: u64,
}

impl From<RangeHandle> for DescriptorLayout {
    fn from(range: RangeHandle) -> Self {
        Self {
            layout_offset: range.base,
            layout_size: range.stride,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorLayouts {
    layouts: [DescriptorLayout; RESOURCE_KIND_COUNT],
}

impl DescriptorLayouts {
    pub fn new(layouts: [DescriptorLayout; RESOURCE_KIND_COUNT]) -> Self {
        Self { layouts }
    }

    /// Same layout size and offset for every kind
    pub fn uniform(layout_size: u64, layout_offset: u64) -> Self {
        Self::new([DescriptorLayout { layout_offset, layout_size }; RESOURCE_KIND_COUNT])
    }

    pub fn get(&self, kind: ResourceKind) -> DescriptorLayout {
        self.layouts[kind.index()]
    }
}

/// Per-kind byte offsets for one object slot, computed once and cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorOffsets {
    offsets: [vk::DeviceSize; RESOURCE_KIND_COUNT],
}

impl DescriptorOffsets {
    pub fn compute(layouts: &DescriptorLayouts, slot: u64) -> RenderResult<Self> {
        let mut offsets = [0; RESOURCE_KIND_COUNT];
        for kind in ResourceKind::ALL {
            let layout = layouts.get(kind);
            offsets[kind.index()] = match kind {
                // One scene block shared by every object
                ResourceKind::Scene => layout.layout_offset,
                ResourceKind::Textures => {
                    let stride = layout.layout_size.checked_mul(TEXTURE_SLOTS).ok_or(
                        RenderError::OffsetOverflow {
                            slot,
                            stride: layout.layout_size,
                            base: layout.layout_offset,
                        },
                    )?;
                    strided_offset(layout.layout_offset, stride, slot)?
                }
                _ => strided_offset(layout.layout_offset, layout.layout_size, slot)?,
            };
        }
        Ok(Self { offsets })
    }

    pub fn get(&self, kind: ResourceKind) -> vk::DeviceSize {
        self.offsets[kind.index()]
    }

    pub fn as_slice(&self) -> &[vk::DeviceSize] {
        &self.offsets
    }
}
