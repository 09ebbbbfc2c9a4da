// Mesh - one drawable object
//
// Geometry is built and uploaded once. Transform and material changes mark the
// mesh render-dirty; `sync_buffers` then rewrites the object's uniform and
// material blocks at its cached offsets.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

use super::arena::{write_pod, DescriptorLayouts, DescriptorOffsets, MappedArena, RangeHandle};
use super::meshlet::{Meshlet, MeshletBuffers, MeshletProcessor};
use super::vertex::Vertex;
use crate::backend::commands::DrawItem;
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialData {
    pub base_color: [f32; 4],
    pub emissive: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub alpha_cutoff: f32,
    pub _padding: f32,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            emissive: [0.0; 4],
            metallic: 0.0,
            roughness: 1.0,
            alpha_cutoff: 0.5,
            _padding: 0.0,
        }
    }
}

/// Per-object uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelUniform {
    pub model_view_projection: Mat4,
    pub model: Mat4,
}

/// Per-object uniform and material slots shared by every mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRanges {
    pub transform: RangeHandle,
    pub material: RangeHandle,
}

impl ObjectRanges {
    pub fn reserve(arena: &mut MappedArena, max_objects: u64) -> RenderResult<Self> {
        Ok(Self {
            transform: arena.reserve_typed::<ModelUniform>(max_objects)?,
            material: arena.reserve_typed::<MaterialData>(max_objects)?,
        })
    }
}

/// Where a mesh's immutable geometry tables live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRanges {
    pub meshlets: RangeHandle,
    pub indices: RangeHandle,
    pub vertices: RangeHandle,
}

#[derive(Debug)]
pub struct Mesh {
    id: u32,
    name: String,
    slot: u64,
    transform: Transform,
    material: MaterialData,
    render_dirty: bool,
    buffers: MeshletBuffers,
    offsets: DescriptorOffsets,
    geometry: Option<GeometryRanges>,
}

impl Mesh {
    /// Wrap already-built meshlet buffers; descriptor offsets for `slot` are
    /// computed here and never change afterwards
    pub fn new(
        id: u32,
        name: impl Into<String>,
        slot: u64,
        buffers: MeshletBuffers,
        layouts: &DescriptorLayouts,
    ) -> RenderResult<Self> {
        Ok(Self {
            id,
            name: name.into(),
            slot,
            transform: Transform::default(),
            material: MaterialData::default(),
            render_dirty: true,
            buffers,
            offsets: DescriptorOffsets::compute(layouts, slot)?,
            geometry: None,
        })
    }

    pub fn from_geometry(
        id: u32,
        name: impl Into<String>,
        slot: u64,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        processor: &MeshletProcessor,
        layouts: &DescriptorLayouts,
    ) -> RenderResult<Self> {
        let name = name.into();
        let buffers = processor.build(vertices, indices)?;
        log::debug!("Mesh '{}' (slot {}): {} meshlets", name, slot, buffers.meshlets.len());
        Self::new(id, name, slot, buffers, layouts)
    }

    /// Unit cube centered on the origin
    pub fn cube(
        id: u32,
        slot: u64,
        processor: &MeshletProcessor,
        layouts: &DescriptorLayouts,
    ) -> RenderResult<Self> {
        let (vertices, indices) = cube_geometry();
        Self::from_geometry(id, "cube", slot, vertices, indices, processor, layouts)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn buffers(&self) -> &MeshletBuffers {
        &self.buffers
    }

    pub fn meshlets(&self) -> &[Meshlet] {
        &self.buffers.meshlets
    }

    pub fn offsets(&self) -> &DescriptorOffsets {
        &self.offsets
    }

    pub fn geometry_ranges(&self) -> Option<&GeometryRanges> {
        self.geometry.as_ref()
    }

    pub fn is_render_dirty(&self) -> bool {
        self.render_dirty
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.render_dirty = true;
    }

    pub fn set_material(&mut self, material: MaterialData) {
        self.material = material;
        self.render_dirty = true;
    }

    /// Reserve and fill the meshlet, index and vertex tables. Geometry is
    /// immutable once written, so later calls return the first ranges.
    pub fn upload_geometry(
        &mut self,
        arena: &mut MappedArena,
        region: &mut [u8],
    ) -> RenderResult<GeometryRanges> {
        if let Some(ranges) = self.geometry {
            return Ok(ranges);
        }

        let meshlets = &self.buffers.meshlets;
        let index_words = self.buffers.gpu_index_words();
        let vertices = self.buffers.gpu_vertices();

        let mark = arena.used();
        let ranges = match reserve_geometry(
            arena,
            region.len(),
            meshlets.len(),
            index_words.len(),
            vertices.len(),
        ) {
            Ok(ranges) => ranges,
            Err(err) => {
                arena.rewind(mark);
                return Err(err);
            }
        };

        write_pod(region, ranges.meshlets.base, meshlets)?;
        write_pod(region, ranges.indices.base, &index_words)?;
        write_pod(region, ranges.vertices.base, &vertices)?;

        log::debug!(
            "Uploaded '{}': {} meshlets, {} index words, {} vertices",
            self.name,
            meshlets.len(),
            index_words.len(),
            vertices.len()
        );
        self.geometry = Some(ranges);
        Ok(ranges)
    }

    /// Device addresses of the geometry tables, for writing descriptors
    pub fn geometry_addresses(&self, region_address: u64) -> Option<[u64; 3]> {
        self.geometry.map(|ranges| {
            [
                region_address + ranges.meshlets.base,
                region_address + ranges.indices.base,
                region_address + ranges.vertices.base,
            ]
        })
    }

    /// Write uniform and material blocks if render-dirty. Returns whether
    /// anything was written.
    pub fn sync_buffers(
        &mut self,
        region: &mut [u8],
        ranges: &ObjectRanges,
        view_projection: Mat4,
    ) -> RenderResult<bool> {
        if !self.render_dirty {
            return Ok(false);
        }

        let model = self.transform.matrix();
        let uniform = ModelUniform {
            model_view_projection: view_projection * model,
            model,
        };
        write_pod(region, ranges.transform.offset_of(self.slot)?, &[uniform])?;
        write_pod(region, ranges.material.offset_of(self.slot)?, &[self.material])?;

        self.render_dirty = false;
        Ok(true)
    }

    /// `None` for meshes with nothing to draw
    pub fn draw_item(&self) -> Option<DrawItem> {
        if self.buffers.is_empty() {
            return None;
        }
        Some(DrawItem {
            offsets: self.offsets,
            meshlet_count: self.buffers.meshlets.len() as u32,
        })
    }
}

fn reserve_geometry(
    arena: &mut MappedArena,
    region_len: usize,
    meshlets: usize,
    index_words: usize,
    vertices: usize,
) -> RenderResult<GeometryRanges> {
    let ranges = GeometryRanges {
        meshlets: arena.reserve_typed::<Meshlet>(meshlets as u64)?,
        indices: arena.reserve_typed::<u32>(index_words as u64)?,
        vertices: arena.reserve_typed::<Vertex>(vertices as u64)?,
    };
    let end = ranges.vertices.end()?;
    if end > region_len as u64 {
        return Err(RenderError::RegionTooSmall { len: region_len, end });
    }
    Ok(ranges)
}

/// 8 shared corners, 12 outward-facing triangles
pub fn cube_geometry() -> (Vec<Vertex>, Vec<u32>) {
    let vertices = (0..8u32)
        .map(|corner| {
            let sign = |bit: u32| if corner & bit != 0 { 0.5 } else { -0.5 };
            let position = [sign(1), sign(2), sign(4)];
            let normal = Vec3::from_array(position).normalize().to_array();
            let uv = [position[0] + 0.5, position[1] + 0.5];
            Vertex::new(position, normal, uv)
        })
        .collect();

    #[rustfmt::skip]
    let indices = vec![
        0, 2, 3, 0, 3, 1, // -z
        4, 5, 7, 4, 7, 6, // +z
        0, 4, 6, 0, 6, 2, // -x
        1, 3, 7, 1, 7, 5, // +x
        0, 1, 5, 0, 5, 4, // -y
        2, 6, 7, 2, 7, 3, // +y
    ];

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{MeshletConfig, ResourceKind};

    fn setup() -> (MeshletProcessor, DescriptorLayouts) {
        (
            MeshletProcessor::new(MeshletConfig::default()).unwrap(),
            DescriptorLayouts::uniform(64, 128),
        )
    }

    fn read<T: Pod>(region: &[u8], offset: u64) -> T {
        bytemuck::pod_read_unaligned(&region[offset as usize..offset as usize + std::mem::size_of::<T>()])
    }

    #[test]
    fn offsets_are_cached_for_the_slot() {
        let (processor, layouts) = setup();
        let mesh = Mesh::cube(1, 3, &processor, &layouts).unwrap();
        assert_eq!(mesh.offsets().get(ResourceKind::Scene), 128);
        assert_eq!(mesh.offsets().get(ResourceKind::Transform), 3 * 64 + 128);
        assert_eq!(mesh.draw_item().unwrap().offsets, *mesh.offsets());
        assert_eq!(mesh.draw_item().unwrap().meshlet_count, 1);
    }

    #[test]
    fn sync_writes_only_when_dirty() {
        let (processor, layouts) = setup();
        let mut arena = MappedArena::new(64 * 1024, 256);
        let ranges = ObjectRanges::reserve(&mut arena, 4).unwrap();
        let mut region = vec![0u8; arena.capacity() as usize];
        let mut mesh = Mesh::cube(1, 2, &processor, &layouts).unwrap();

        assert!(mesh.is_render_dirty());
        assert!(mesh.sync_buffers(&mut region, &ranges, Mat4::IDENTITY).unwrap());
        assert!(!mesh.is_render_dirty());
        assert!(!mesh.sync_buffers(&mut region, &ranges, Mat4::IDENTITY).unwrap());

        let transform = Transform {
            translation: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        mesh.set_transform(transform);
        assert!(mesh.is_render_dirty());

        let view_projection = Mat4::from_scale(Vec3::splat(2.0));
        assert!(mesh.sync_buffers(&mut region, &ranges, view_projection).unwrap());

        let written: ModelUniform = read(&region, ranges.transform.offset_of(2).unwrap());
        assert_eq!(written.model, transform.matrix());
        assert_eq!(written.model_view_projection, view_projection * transform.matrix());
        // not the model matrix squared
        assert_ne!(written.model_view_projection, transform.matrix() * transform.matrix());

        let material: MaterialData = read(&region, ranges.material.offset_of(2).unwrap());
        assert_eq!(material, MaterialData::default());
    }

    #[test]
    fn slot_outside_object_ranges_is_rejected() {
        let (processor, layouts) = setup();
        let mut arena = MappedArena::new(64 * 1024, 256);
        let ranges = ObjectRanges::reserve(&mut arena, 2).unwrap();
        let mut region = vec![0u8; arena.capacity() as usize];
        let mut mesh = Mesh::cube(1, 2, &processor, &layouts).unwrap();

        let err = mesh.sync_buffers(&mut region, &ranges, Mat4::IDENTITY).unwrap_err();
        assert!(matches!(err, RenderError::SlotOutOfRange { slot: 2, count: 2 }));
        assert!(mesh.is_render_dirty());
    }

    #[test]
    fn geometry_is_written_once() {
        let (processor, layouts) = setup();
        let mut arena = MappedArena::new(64 * 1024, 256);
        let mut region = vec![0u8; arena.capacity() as usize];
        let mut mesh = Mesh::cube(1, 0, &processor, &layouts).unwrap();

        let ranges = mesh.upload_geometry(&mut arena, &mut region).unwrap();
        let used = arena.used();
        assert_eq!(mesh.upload_geometry(&mut arena, &mut region).unwrap(), ranges);
        assert_eq!(arena.used(), used);

        let meshlet: Meshlet = read(&region, ranges.meshlets.base);
        assert_eq!(meshlet, mesh.meshlets()[0]);
        assert_eq!(ranges.indices.count, 9);
        assert_eq!(ranges.vertices.count, 8);
        assert_eq!(
            mesh.geometry_addresses(0x1000).unwrap(),
            [0x1000 + ranges.meshlets.base, 0x1000 + ranges.indices.base, 0x1000 + ranges.vertices.base]
        );
    }

    #[test]
    fn failed_upload_leaves_the_arena_untouched() {
        let (processor, layouts) = setup();
        let mut arena = MappedArena::new(64 * 1024, 256);
        // the mapped region is smaller than the arena claims
        let mut region = vec![0u8; 300];
        let mut mesh = Mesh::cube(1, 0, &processor, &layouts).unwrap();

        let err = mesh.upload_geometry(&mut arena, &mut region).unwrap_err();
        assert!(matches!(err, RenderError::RegionTooSmall { len: 300, .. }));
        assert_eq!(arena.used(), 0);
        assert!(mesh.geometry_ranges().is_none());

        let mut region = vec![0u8; arena.capacity() as usize];
        let ranges = mesh.upload_geometry(&mut arena, &mut region).unwrap();
        assert_eq!(ranges.meshlets.base, 0);
    }

    #[test]
    fn empty_mesh_has_no_draw() {
        let (processor, layouts) = setup();
        let mesh = Mesh::from_geometry(7, "empty", 0, Vec::new(), Vec::new(), &processor, &layouts)
            .unwrap();
        assert!(mesh.draw_item().is_none());
    }
}
