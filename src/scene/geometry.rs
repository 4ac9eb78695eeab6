use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use log::{debug, warn};

/// Object-space vertex as laid out in the device vertex buffer.
///
/// `position` must stay the first field: the BLAS reads it with the vertex
/// stride and an `R32G32B32_SFLOAT` format.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
}

/// Unindexed triangle soup: every face corner is its own vertex and
/// `indices[i] == i`.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn triangle_count(&self) -> u32 {
        self.indices.len() as u32 / 3
    }
}

pub fn load_mesh(path: impl AsRef<Path>) -> Result<Mesh> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening mesh {}", path.display()))?;
    let mesh = parse_mesh(BufReader::new(file))
        .with_context(|| format!("loading mesh {}", path.display()))?;

    debug!(
        "loaded {}: {} vertices, {} triangles",
        path.display(),
        mesh.vertices.len(),
        mesh.triangle_count()
    );
    Ok(mesh)
}

/// Parses an OBJ stream, concatenating all models and triangulating faces.
/// Materials are ignored.
pub fn parse_mesh(mut reader: impl BufRead) -> Result<Mesh> {
    let mut source = String::new();
    reader.read_to_string(&mut source).context("reading OBJ")?;

    // tobj pads the normal indices of faces without `vn`, so mixed files can't
    // be told apart after loading
    let bare_faces = faces_without_normals(&source);

    let (models, _) = tobj::load_obj_buf(
        &mut source.as_bytes(),
        &tobj::LoadOptions {
            triangulate: true,
            single_index: false,
            ..Default::default()
        },
        |_| Ok(Default::default()),
    )?;

    let mut mesh = Mesh::default();
    for model in &models {
        let has_normals = append_model(&model.mesh, bare_faces == 0, &mut mesh)
            .with_context(|| format!("model {:?}", model.name))?;
        if !has_normals && bare_faces > 0 && !model.mesh.normals.is_empty() {
            warn!(
                "{bare_faces} faces have no normals, using flat face normals for model {:?}",
                model.name
            );
        } else if !has_normals {
            warn!(
                "model {:?} has no normals, using flat face normals",
                model.name
            );
        }
    }

    if mesh.indices.is_empty() {
        bail!("mesh contains no triangles");
    }

    Ok(mesh)
}

/// Returns whether the model's own normals were used.
fn append_model(model: &tobj::Mesh, trust_normals: bool, out: &mut Mesh) -> Result<bool> {
    let has_normals = trust_normals
        && !model.normals.is_empty()
        && model.normal_indices.len() == model.indices.len();
    let first_vertex = out.vertices.len();

    for (corner, &position_index) in model.indices.iter().enumerate() {
        let position = read_vec3(&model.positions, position_index)?;
        let normal = if has_normals {
            read_vec3(&model.normals, model.normal_indices[corner])?
        } else {
            Vec3::ZERO
        };

        out.indices.push(out.vertices.len() as u32);
        out.vertices.push(Vertex { position, normal });
    }

    if !has_normals {
        for triangle in out.vertices[first_vertex..].chunks_exact_mut(3) {
            let edge1 = triangle[1].position - triangle[0].position;
            let edge2 = triangle[2].position - triangle[0].position;
            let normal = edge1.cross(edge2).normalize_or_zero();
            triangle.iter_mut().for_each(|v| v.normal = normal);
        }
    }

    Ok(has_normals)
}

/// Counts `f` statements with at least one corner lacking a normal index.
fn faces_without_normals(source: &str) -> usize {
    source
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("f "))
        .filter(|corners| {
            corners
                .split_ascii_whitespace()
                .any(|corner| corner.splitn(3, '/').nth(2).map_or(true, str::is_empty))
        })
        .count()
}

fn read_vec3(data: &[f32], index: u32) -> Result<Vec3> {
    let start = index as usize * 3;
    data.get(start..start + 3)
        .map(Vec3::from_slice)
        .ok_or(anyhow!("attribute index {index} out of range"))
}
