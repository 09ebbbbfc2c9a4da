// Meshlet building
//
// Load-time only. Raw vertex/index streams are deduplicated, reordered for the
// post-transform cache, for overdraw and for fetch locality, then cut into
// clusters small enough for one mesh shader workgroup each. The passes follow
// meshoptimizer's (remap, vertex cache, overdraw, fetch, build_meshlets,
// optimize_meshlet) and keep its output layout.

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rustc_hash::FxHashMap;

use super::vertex::Vertex;
use crate::config::MeshletSettings;
use crate::error::{RenderError, RenderResult};

const UNMAPPED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshletConfig {
    pub max_vertices: u32,
    pub max_triangles: u32,
    /// How much cache efficiency overdraw sorting may give up (1.05 = 5%)
    pub overdraw_threshold: f32,
    pub vertex_cache_size: u32,
}

impl Default for MeshletConfig {
    fn default() -> Self {
        Self {
            max_vertices: 64,
            max_triangles: 124,
            overdraw_threshold: 1.05,
            vertex_cache_size: 16,
        }
    }
}

impl From<&MeshletSettings> for MeshletConfig {
    fn from(settings: &MeshletSettings) -> Self {
        Self {
            max_vertices: settings.max_vertices,
            max_triangles: settings.max_triangles,
            overdraw_threshold: settings.overdraw_threshold,
            ..Self::default()
        }
    }
}

impl MeshletConfig {
    pub fn validate(&self) -> RenderResult<()> {
        // Local indices are stored in a byte
        if !(3..=255).contains(&self.max_vertices) {
            return Err(RenderError::InvalidMeshletConfig(format!(
                "max_vertices {} outside 3..=255",
                self.max_vertices
            )));
        }
        if !(4..=512).contains(&self.max_triangles) || self.max_triangles % 4 != 0 {
            return Err(RenderError::InvalidMeshletConfig(format!(
                "max_triangles {} must be a multiple of 4 in 4..=512",
                self.max_triangles
            )));
        }
        if !(self.overdraw_threshold >= 1.0) {
            return Err(RenderError::InvalidMeshletConfig(format!(
                "overdraw_threshold {} below 1.0",
                self.overdraw_threshold
            )));
        }
        if self.vertex_cache_size < 4 {
            return Err(RenderError::InvalidMeshletConfig(format!(
                "vertex_cache_size {} below 4",
                self.vertex_cache_size
            )));
        }
        Ok(())
    }
}

/// One cluster. Also the GPU meshlet table entry: offsets index the meshlet
/// vertex table and the packed triangle bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Meshlet {
    pub vertex_offset: u32,
    pub triangle_offset: u32,
    pub vertex_count: u32,
    pub triangle_count: u32,
}

/// Result of `MeshletProcessor::build`
#[derive(Debug, Clone, Default)]
pub struct MeshletBuffers {
    /// Deduplicated, fetch-ordered vertices
    pub vertices: Vec<Vertex>,
    /// Optimized index stream the meshlets were cut from
    pub indices: Vec<u32>,
    pub meshlets: Vec<Meshlet>,
    /// Meshlet-local vertex index -> index into `vertices`
    pub meshlet_vertices: Vec<u32>,
    /// Three local indices per triangle, each meshlet's range 4-byte aligned
    pub meshlet_triangles: Vec<u8>,
}

impl MeshletBuffers {
    pub fn is_empty(&self) -> bool {
        self.meshlets.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.meshlets.iter().map(|m| m.triangle_count as usize).sum()
    }

    /// Vertex table in meshlet order, so `vertex_offset` addresses it directly
    pub fn gpu_vertices(&self) -> Vec<Vertex> {
        self.meshlet_vertices
            .iter()
            .map(|&index| self.vertices[index as usize])
            .collect()
    }

    /// Triangle bytes packed four to a word
    pub fn gpu_index_words(&self) -> Vec<u32> {
        self.meshlet_triangles
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect()
    }
}

pub struct MeshletProcessor {
    config: MeshletConfig,
}

impl MeshletProcessor {
    pub fn new(config: MeshletConfig) -> RenderResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MeshletConfig {
        &self.config
    }

    /// Run the full pipeline over one mesh
    pub fn build(&self, vertices: Vec<Vertex>, indices: Vec<u32>) -> RenderResult<MeshletBuffers> {
        if indices.len() % 3 != 0 {
            return Err(RenderError::InvalidMesh(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(RenderError::InvalidMesh(format!(
                "index {} out of range for {} vertices",
                bad,
                vertices.len()
            )));
        }

        let cache_size = self.config.vertex_cache_size as usize;

        let (remap, unique) = generate_vertex_remap(&indices, &vertices);
        let mut indices = remap_index_buffer(&indices, &remap);
        let vertices = remap_vertex_buffer(&vertices, &remap, unique);

        indices = optimize_vertex_cache(&indices, vertices.len(), cache_size);
        indices = optimize_overdraw(&indices, &vertices, cache_size, self.config.overdraw_threshold);
        let vertices = optimize_vertex_fetch(&mut indices, &vertices);

        // Nothing to cluster
        if indices.is_empty() {
            log::debug!("Empty mesh, skipping meshlet build");
            return Ok(MeshletBuffers { vertices, indices, ..Default::default() });
        }

        let scratch = build_meshlets(
            &indices,
            vertices.len(),
            self.config.max_vertices as usize,
            self.config.max_triangles as usize,
        );
        let (meshlets, mut meshlet_vertices, mut meshlet_triangles) = shrink_scratch(scratch);

        for meshlet in &meshlets {
            let vertex_range = meshlet.vertex_offset as usize
                ..(meshlet.vertex_offset + meshlet.vertex_count) as usize;
            let triangle_range = meshlet.triangle_offset as usize
                ..meshlet.triangle_offset as usize + meshlet.triangle_count as usize * 3;
            optimize_meshlet(
                &mut meshlet_vertices[vertex_range],
                &mut meshlet_triangles[triangle_range],
            );
        }

        log::debug!(
            "Built {} meshlets from {} vertices / {} triangles",
            meshlets.len(),
            vertices.len(),
            indices.len() / 3
        );

        Ok(MeshletBuffers {
            vertices,
            indices,
            meshlets,
            meshlet_vertices,
            meshlet_triangles,
        })
    }
}

// -- deduplication -------------------------------------------------------

/// Map every referenced vertex to its first byte-identical twin, numbered in
/// order of first appearance. Unreferenced vertices map to `u32::MAX`.
pub fn generate_vertex_remap(indices: &[u32], vertices: &[Vertex]) -> (Vec<u32>, usize) {
    let mut remap = vec![UNMAPPED; vertices.len()];
    let mut seen: FxHashMap<&[u8], u32> = FxHashMap::default();

    for &index in indices {
        let index = index as usize;
        if remap[index] != UNMAPPED {
            continue;
        }
        let next = seen.len() as u32;
        let key = bytemuck::bytes_of(&vertices[index]);
        remap[index] = *seen.entry(key).or_insert(next);
    }

    (remap, seen.len())
}

pub fn remap_index_buffer(indices: &[u32], remap: &[u32]) -> Vec<u32> {
    indices.iter().map(|&i| remap[i as usize]).collect()
}

pub fn remap_vertex_buffer(vertices: &[Vertex], remap: &[u32], unique: usize) -> Vec<Vertex> {
    let mut out = vec![Vertex::default(); unique];
    for (vertex, &target) in vertices.iter().zip(remap) {
        if target != UNMAPPED {
            out[target as usize] = *vertex;
        }
    }
    out
}

// -- post-transform cache ------------------------------------------------

const CACHE_DECAY_POWER: f32 = 1.5;
const LAST_TRIANGLE_SCORE: f32 = 0.75;
const VALENCE_BOOST_SCALE: f32 = 2.0;
const VALENCE_BOOST_POWER: f32 = 0.5;

fn vertex_score(cache_position: Option<usize>, live_triangles: u32, cache_size: usize) -> f32 {
    if live_triangles == 0 {
        return -1.0;
    }

    let cache_score = match cache_position {
        Some(position) if position < 3 => LAST_TRIANGLE_SCORE,
        Some(position) => {
            let scale = 1.0 / (cache_size - 3) as f32;
            (1.0 - (position - 3) as f32 * scale).powf(CACHE_DECAY_POWER)
        }
        None => 0.0,
    };
    cache_score + VALENCE_BOOST_SCALE * (live_triangles as f32).powf(-VALENCE_BOOST_POWER)
}

/// Greedy triangle reordering with an LRU cache model (Forsyth)
pub fn optimize_vertex_cache(indices: &[u32], vertex_count: usize, cache_size: usize) -> Vec<u32> {
    let triangle_count = indices.len() / 3;
    if triangle_count == 0 {
        return Vec::new();
    }

    // Triangle adjacency per vertex; live entries are kept at the front
    let mut live = vec![0u32; vertex_count];
    for &index in indices {
        live[index as usize] += 1;
    }
    let mut starts = vec![0usize; vertex_count];
    for v in 1..vertex_count {
        starts[v] = starts[v - 1] + live[v - 1] as usize;
    }
    let mut adjacency = vec![0u32; indices.len()];
    let mut fill = starts.clone();
    for (triangle, corners) in indices.chunks_exact(3).enumerate() {
        for &v in corners {
            adjacency[fill[v as usize]] = triangle as u32;
            fill[v as usize] += 1;
        }
    }

    let mut cache_position: Vec<Option<usize>> = vec![None; vertex_count];
    let mut vertex_scores: Vec<f32> = live
        .iter()
        .map(|&count| vertex_score(None, count, cache_size))
        .collect();
    let mut triangle_scores: Vec<f32> = indices
        .chunks_exact(3)
        .map(|corners| corners.iter().map(|&v| vertex_scores[v as usize]).sum())
        .collect();

    let mut emitted = vec![false; triangle_count];
    let mut cache: Vec<u32> = Vec::with_capacity(cache_size + 3);
    let mut next_cache: Vec<u32> = Vec::with_capacity(cache_size + 3);
    let mut output = Vec::with_capacity(indices.len());
    let mut input_cursor = 0;
    let mut candidate: Option<usize> = None;

    loop {
        let triangle = match candidate {
            Some(triangle) => triangle,
            None => {
                while input_cursor < triangle_count && emitted[input_cursor] {
                    input_cursor += 1;
                }
                if input_cursor == triangle_count {
                    break;
                }
                input_cursor
            }
        };

        emitted[triangle] = true;
        let corners = &indices[triangle * 3..triangle * 3 + 3];
        output.extend_from_slice(corners);

        for &v in corners {
            let v = v as usize;
            let start = starts[v];
            let count = live[v] as usize;
            let entries = &mut adjacency[start..start + count];
            if let Some(found) = entries.iter().position(|&t| t as usize == triangle) {
                entries.swap(found, count - 1);
                live[v] -= 1;
            }
        }

        next_cache.clear();
        for &v in corners {
            if !next_cache.contains(&v) {
                next_cache.push(v);
            }
        }
        next_cache.extend(cache.iter().copied().filter(|v| !corners.contains(v)));

        let evicted: Vec<u32> = next_cache.iter().skip(cache_size).copied().collect();
        next_cache.truncate(cache_size);
        std::mem::swap(&mut cache, &mut next_cache);

        for &v in &evicted {
            cache_position[v as usize] = None;
        }
        for (position, &v) in cache.iter().enumerate() {
            cache_position[v as usize] = Some(position);
        }

        for &v in cache.iter().chain(&evicted) {
            let v = v as usize;
            let score = vertex_score(cache_position[v], live[v], cache_size);
            let delta = score - vertex_scores[v];
            vertex_scores[v] = score;
            let start = starts[v];
            for &t in &adjacency[start..start + live[v] as usize] {
                triangle_scores[t as usize] += delta;
            }
        }

        candidate = None;
        let mut best_score = f32::MIN;
        for &v in &cache {
            let start = starts[v as usize];
            for &t in &adjacency[start..start + live[v as usize] as usize] {
                let score = triangle_scores[t as usize];
                if score > best_score {
                    best_score = score;
                    candidate = Some(t as usize);
                }
            }
        }
    }

    output
}

// -- overdraw ------------------------------------------------------------

/// FIFO cache simulation. A timestamp bump of `cache_size + 1` flushes it.
struct FifoCache {
    timestamps: Vec<usize>,
    now: usize,
    size: usize,
}

impl FifoCache {
    fn new(vertex_count: usize, size: usize) -> Self {
        Self {
            timestamps: vec![0; vertex_count],
            now: size + 1,
            size,
        }
    }

    fn flush(&mut self) {
        self.now += self.size + 1;
    }

    fn misses(&mut self, corners: &[u32]) -> usize {
        let mut misses = 0;
        for &v in corners {
            let v = v as usize;
            if self.now - self.timestamps[v] > self.size {
                self.timestamps[v] = self.now;
                self.now += 1;
                misses += 1;
            }
        }
        misses
    }
}

fn triangle_range(indices: &[u32], start: usize, end: usize) -> std::slice::ChunksExact<'_, u32> {
    indices[start * 3..end * 3].chunks_exact(3)
}

/// Triangle indices where every vertex misses the cache
fn hard_boundaries(indices: &[u32], vertex_count: usize, cache_size: usize) -> Vec<usize> {
    let mut cache = FifoCache::new(vertex_count, cache_size);
    indices
        .chunks_exact(3)
        .enumerate()
        .filter_map(|(triangle, corners)| {
            let misses = cache.misses(corners);
            (triangle == 0 || misses == 3).then_some(triangle)
        })
        .collect()
}

/// Split hard clusters wherever the running ACMR drops under the cluster's
/// own ACMR scaled by `threshold`
fn soft_boundaries(
    indices: &[u32],
    vertex_count: usize,
    hard: &[usize],
    cache_size: usize,
    threshold: f32,
) -> Vec<usize> {
    let triangle_count = indices.len() / 3;
    let mut cache = FifoCache::new(vertex_count, cache_size);
    let mut boundaries = Vec::with_capacity(hard.len());

    for (cluster, &start) in hard.iter().enumerate() {
        let end = hard.get(cluster + 1).copied().unwrap_or(triangle_count);
        cache.flush();
        let cluster_misses: usize = triangle_range(indices, start, end)
            .map(|corners| cache.misses(corners))
            .sum();
        let cluster_threshold = threshold * (cluster_misses as f32 / (end - start) as f32);

        boundaries.push(start);
        cache.flush();
        let mut running_misses = 0;
        let mut running_faces = 0;
        for (offset, corners) in triangle_range(indices, start, end).enumerate() {
            running_misses += cache.misses(corners);
            running_faces += 1;
            if running_misses as f32 / running_faces as f32 <= cluster_threshold {
                boundaries.push(start + offset + 1);
                cache.flush();
                running_misses = 0;
                running_faces = 0;
            }
        }

        // A boundary at `end` would open an empty cluster
        if boundaries.len() > 1 && boundaries.last() == Some(&end) {
            boundaries.pop();
        }
    }

    boundaries
}

/// Cluster the stream by cache behaviour, then draw outward-facing clusters
/// first so they occlude the rest
pub fn optimize_overdraw(
    indices: &[u32],
    vertices: &[Vertex],
    cache_size: usize,
    threshold: f32,
) -> Vec<u32> {
    let triangle_count = indices.len() / 3;
    if triangle_count == 0 {
        return Vec::new();
    }

    let hard = hard_boundaries(indices, vertices.len(), cache_size);
    let clusters = soft_boundaries(indices, vertices.len(), &hard, cache_size, threshold);

    let mesh_centroid = indices
        .iter()
        .fold(Vec3::ZERO, |sum, &i| sum + vertices[i as usize].position())
        / indices.len() as f32;

    let mut sort_keys: Vec<(usize, f32)> = clusters
        .iter()
        .enumerate()
        .map(|(cluster, &start)| {
            let end = clusters.get(cluster + 1).copied().unwrap_or(triangle_count);
            let mut centroid = Vec3::ZERO;
            let mut normal = Vec3::ZERO;
            let mut area = 0.0;
            for corners in indices[start * 3..end * 3].chunks_exact(3) {
                let p0 = vertices[corners[0] as usize].position();
                let p1 = vertices[corners[1] as usize].position();
                let p2 = vertices[corners[2] as usize].position();
                let face = (p1 - p0).cross(p2 - p0);
                let face_area = face.length();
                centroid += (p0 + p1 + p2) * (face_area / 3.0);
                normal += face;
                area += face_area;
            }
            if area > 0.0 {
                centroid /= area;
            }
            let key = (centroid - mesh_centroid).dot(normal.normalize_or_zero());
            (cluster, key)
        })
        .collect();

    // Stable, so clusters with equal keys keep their cache order
    sort_keys.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut output = Vec::with_capacity(indices.len());
    for (cluster, _) in sort_keys {
        let start = clusters[cluster];
        let end = clusters.get(cluster + 1).copied().unwrap_or(triangle_count);
        output.extend_from_slice(&indices[start * 3..end * 3]);
    }
    output
}

// -- fetch order ---------------------------------------------------------

/// Renumber vertices in order of first use; unreferenced vertices are dropped
pub fn optimize_vertex_fetch(indices: &mut [u32], vertices: &[Vertex]) -> Vec<Vertex> {
    let mut remap = vec![UNMAPPED; vertices.len()];
    let mut out = Vec::with_capacity(vertices.len());

    for index in indices.iter_mut() {
        let slot = &mut remap[*index as usize];
        if *slot == UNMAPPED {
            *slot = out.len() as u32;
            out.push(vertices[*index as usize]);
        }
        *index = *slot;
    }
    out
}

// -- clustering ----------------------------------------------------------

/// Upper bound on the meshlet count for a stream of `index_count` indices.
/// Each meshlet closed on the vertex limit still holds at least
/// `max_vertices - 2` vertices.
pub fn meshlets_bound(index_count: usize, max_vertices: usize, max_triangles: usize) -> usize {
    let by_vertices = index_count.div_ceil(max_vertices - 2);
    let by_triangles = (index_count / 3).div_ceil(max_triangles);
    by_vertices.max(by_triangles)
}

/// Triangle bytes a meshlet occupies, padded to a 4-byte boundary
pub fn padded_triangle_bytes(triangle_count: u32) -> u32 {
    (triangle_count * 3 + 3) & !3
}

/// Scratch buffers sized to `meshlets_bound`; only the first `count`
/// meshlets are meaningful
#[derive(Debug)]
pub struct MeshletScratch {
    pub meshlets: Vec<Meshlet>,
    pub vertices: Vec<u32>,
    pub triangles: Vec<u8>,
    pub count: usize,
}

/// Scan the stream in order, closing a meshlet when the next triangle would
/// overflow either limit
pub fn build_meshlets(
    indices: &[u32],
    vertex_count: usize,
    max_vertices: usize,
    max_triangles: usize,
) -> MeshletScratch {
    let bound = meshlets_bound(indices.len(), max_vertices, max_triangles);
    let mut scratch = MeshletScratch {
        meshlets: vec![Meshlet::default(); bound],
        vertices: vec![0; bound * max_vertices],
        triangles: vec![0; bound * max_triangles * 3],
        count: 0,
    };

    let mut local: Vec<Option<u8>> = vec![None; vertex_count];
    let mut current = Meshlet::default();

    for corners in indices.chunks_exact(3) {
        let new_vertices = corners
            .iter()
            .enumerate()
            .filter(|&(i, v)| local[*v as usize].is_none() && !corners[..i].contains(v))
            .count();

        if current.vertex_count as usize + new_vertices > max_vertices
            || current.triangle_count as usize >= max_triangles
        {
            let start = current.vertex_offset as usize;
            for &v in &scratch.vertices[start..start + current.vertex_count as usize] {
                local[v as usize] = None;
            }
            scratch.meshlets[scratch.count] = current;
            scratch.count += 1;
            current = Meshlet {
                vertex_offset: current.vertex_offset + current.vertex_count,
                triangle_offset: current.triangle_offset + padded_triangle_bytes(current.triangle_count),
                vertex_count: 0,
                triangle_count: 0,
            };
        }

        let base = current.triangle_offset as usize + current.triangle_count as usize * 3;
        for (corner, &v) in corners.iter().enumerate() {
            let id = match local[v as usize] {
                Some(id) => id,
                None => {
                    let id = current.vertex_count as u8;
                    local[v as usize] = Some(id);
                    scratch.vertices[(current.vertex_offset + current.vertex_count) as usize] = v;
                    current.vertex_count += 1;
                    id
                }
            };
            scratch.triangles[base + corner] = id;
        }
        current.triangle_count += 1;
    }

    if current.triangle_count > 0 {
        scratch.meshlets[scratch.count] = current;
        scratch.count += 1;
    }
    scratch
}

/// Trim scratch buffers to what the last meshlet actually uses, padding its
/// triangle range to 4 bytes
pub fn shrink_scratch(scratch: MeshletScratch) -> (Vec<Meshlet>, Vec<u32>, Vec<u8>) {
    let MeshletScratch { mut meshlets, mut vertices, mut triangles, count } = scratch;
    let Some(last) = count.checked_sub(1).map(|i| meshlets[i]) else {
        return (Vec::new(), Vec::new(), Vec::new());
    };

    meshlets.truncate(count);
    vertices.truncate((last.vertex_offset + last.vertex_count) as usize);
    triangles.truncate((last.triangle_offset + padded_triangle_bytes(last.triangle_count)) as usize);

    meshlets.shrink_to_fit();
    vertices.shrink_to_fit();
    triangles.shrink_to_fit();
    (meshlets, vertices, triangles)
}

// -- per-meshlet order ---------------------------------------------------

/// Chain triangles that share vertices, then number the meshlet's vertices in
/// order of first use
pub fn optimize_meshlet(meshlet_vertices: &mut [u32], triangles: &mut [u8]) {
    let mut remaining: Vec<[u8; 3]> = triangles
        .chunks_exact(3)
        .map(|t| [t[0], t[1], t[2]])
        .collect();
    if remaining.is_empty() {
        return;
    }

    let mut ordered = Vec::with_capacity(remaining.len());
    let mut last = remaining.remove(0);
    ordered.push(last);
    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_shared = 0;
        for (i, triangle) in remaining.iter().enumerate() {
            let shared = triangle.iter().filter(|v| last.contains(v)).count();
            if shared > best_shared {
                best = i;
                best_shared = shared;
            }
        }
        last = remaining.remove(best);
        ordered.push(last);
    }

    let mut renumbered: Vec<Option<u8>> = vec![None; meshlet_vertices.len()];
    let mut reordered = Vec::with_capacity(meshlet_vertices.len());
    for triangle in &mut ordered {
        for corner in triangle.iter_mut() {
            let old = *corner as usize;
            *corner = *renumbered[old].get_or_insert_with(|| {
                reordered.push(meshlet_vertices[old]);
                (reordered.len() - 1) as u8
            });
        }
    }
    for (old, &v) in meshlet_vertices.iter().enumerate() {
        if renumbered[old].is_none() {
            reordered.push(v);
        }
    }

    meshlet_vertices.copy_from_slice(&reordered);
    for (dst, triangle) in triangles.chunks_exact_mut(3).zip(&ordered) {
        dst.copy_from_slice(triangle);
    }
}
