// Geometry - load-time mesh processing and mapped-region addressing

pub mod arena;
pub mod mesh;
pub mod meshlet;
pub mod vertex;

pub use arena::{
    DescriptorLayout, DescriptorLayouts, DescriptorOffsets, MappedArena, RangeHandle, ResourceKind,
    RESOURCE_KIND_COUNT, TEXTURE_SLOTS,
};
pub use mesh::{MaterialData, Mesh, ModelUniform, ObjectRanges, Transform};
pub use meshlet::{Meshlet, MeshletBuffers, MeshletConfig, MeshletProcessor};
pub use vertex::Vertex;
