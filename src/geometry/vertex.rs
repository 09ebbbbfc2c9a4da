use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Vertex as stored in the GPU vertex table.
///
/// Fixed 64-byte stride; deduplication compares the whole stride byte for
/// byte, so two vertices differing only in a tangent stay distinct.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
    pub tangent: [f32; 4],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            color: [1.0; 4],
            tangent: [0.0; 4],
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}
