// Triangle mesh data fed to the acceleration structure and the hit shader
//
// Vertices are uploaded as-is, so `Vertex` matches the std430 struct in
// raytrace.rchit: two vec4s, 32 bytes.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use gltf::mesh::util::ReadIndices;
use std::path::Path;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub normal: [f32; 4],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self {
            position: [position[0], position[1], position[2], 1.0],
            normal: [normal[0], normal[1], normal[2], 0.0],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Single triangle facing the default camera
    pub fn triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([-0.1, -0.1, 0.0], normal),
                Vertex::new([0.1, -0.1, 0.0], normal),
                Vertex::new([0.0, 0.1, 0.0], normal),
            ],
            indices: vec![0, 1, 2],
        }
    }

    /// Load every triangle primitive of a glTF file into one mesh
    ///
    /// Primitives without positions or normals are skipped. Positions get z
    /// flipped and normals are negated to match the renderer's handedness.
    pub fn load_gltf(path: &Path) -> Result<Self> {
        let (document, buffers, _images) =
            gltf::import(path).with_context(|| format!("Failed to load glTF {:?}", path))?;

        let mut mesh = Mesh::default();

        for gltf_mesh in document.meshes() {
            for prim in gltf_mesh.primitives() {
                if prim.mode() != gltf::mesh::Mode::Triangles {
                    log::warn!(
                        "Skipping {:?} primitive in mesh {:?}",
                        prim.mode(),
                        gltf_mesh.name().unwrap_or("unnamed")
                    );
                    continue;
                }

                let reader = prim.reader(|buffer| Some(&buffers[buffer.index()]));

                let (Some(positions), Some(normals)) = (reader.read_positions(), reader.read_normals())
                else {
                    log::warn!(
                        "Skipping primitive without positions or normals in mesh {:?}",
                        gltf_mesh.name().unwrap_or("unnamed")
                    );
                    continue;
                };

                let positions: Vec<[f32; 3]> = positions.collect();
                let normals: Vec<[f32; 3]> = normals.collect();

                let indices = reader
                    .read_indices()
                    .map(widen_indices)
                    .transpose()
                    .with_context(|| format!("Bad index data in {:?}", path))?;

                mesh.push_primitive(&positions, &normals, indices)?;
            }
        }

        mesh.validate()
            .with_context(|| format!("No usable triangles in {:?}", path))?;

        log::info!(
            "Loaded {:?}: {} vertices, {} triangles",
            path,
            mesh.vertices.len(),
            mesh.indices.len() / 3
        );
        Ok(mesh)
    }

    /// Append one primitive, rebasing its indices onto the vertices so far
    ///
    /// Without indices the vertices are taken as a plain triangle list.
    pub fn push_primitive(
        &mut self,
        positions: &[[f32; 3]],
        normals: &[[f32; 3]],
        indices: Option<Vec<u32>>,
    ) -> Result<()> {
        anyhow::ensure!(
            positions.len() == normals.len(),
            "Primitive has {} positions but {} normals",
            positions.len(),
            normals.len()
        );

        let indices = indices.unwrap_or_else(|| (0..positions.len() as u32).collect());
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            anyhow::bail!(
                "Index {} out of range for primitive with {} vertices",
                bad,
                positions.len()
            );
        }

        let base = self.vertices.len() as u32;
        self.vertices
            .extend(positions.iter().zip(normals).map(|(p, n)| {
                Vertex::new([p[0], p[1], -p[2]], [-n[0], -n[1], -n[2]])
            }));
        self.indices.extend(indices.into_iter().map(|i| i + base));

        Ok(())
    }

    /// At least one whole triangle is required to build anything
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.vertices.is_empty(), "Mesh has no vertices");
        anyhow::ensure!(
            self.indices.len() >= 3,
            "Mesh has {} indices, need at least one triangle",
            self.indices.len()
        );
        Ok(())
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// u16 and u32 indices widen to u32; u8 is not a supported width
fn widen_indices(indices: ReadIndices<'_>) -> Result<Vec<u32>> {
    match indices {
        ReadIndices::U16(iter) => Ok(iter.map(u32::from).collect()),
        ReadIndices::U32(iter) => Ok(iter.collect()),
        ReadIndices::U8(_) => anyhow::bail!("Unrecognized index type (u8)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_two_vec4() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let v = Vertex::new([1.0, 2.0, 3.0], [0.0, 1.0, 0.0]);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&v));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn builtin_triangle_is_valid() {
        let mesh = Mesh::triangle();
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn primitives_are_rebased_and_flipped() {
        let mut mesh = Mesh::default();
        let tri = [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [0.0, 1.0, 1.0]];
        let up = [[0.0, 0.0, 1.0]; 3];

        mesh.push_primitive(&tri, &up, Some(vec![0, 1, 2])).unwrap();
        mesh.push_primitive(&tri, &up, Some(vec![2, 1, 0])).unwrap();

        assert_eq!(mesh.vertices.len(), 6);
        assert_eq!(mesh.indices, vec![0, 1, 2, 5, 4, 3]);
        assert_eq!(mesh.vertices[0].position, [0.0, 0.0, -1.0, 1.0]);
        assert_eq!(mesh.vertices[0].normal, [-0.0, -0.0, -1.0, 0.0]);
    }

    #[test]
    fn missing_indices_become_triangle_list() {
        let mut mesh = Mesh::default();
        let positions = [[0.0; 3]; 6];
        let normals = [[0.0, 1.0, 0.0]; 6];
        mesh.push_primitive(&positions, &normals, None).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(mesh.triangle_count(), 2);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut mesh = Mesh::default();
        let positions = [[0.0; 3]; 3];
        let normals = [[0.0, 1.0, 0.0]; 3];
        assert!(mesh.push_primitive(&positions, &normals, Some(vec![0, 1, 3])).is_err());
        assert!(mesh.vertices.is_empty());
    }

    #[test]
    fn empty_mesh_fails_validation() {
        assert!(Mesh::default().validate().is_err());
    }

    // One triangle: positions, normals, then the index bytes (padded to 4)
    const U8_BUFFER: &str = "AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAECAA==";
    const U16_BUFFER: &str = "AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAABAAIAAAA=";

    const GLTF_TEMPLATE: &str = r#"{
        "asset": { "version": "2.0" },
        "buffers": [{ "byteLength": BYTE_LENGTH, "uri": "data:application/octet-stream;base64,DATA" }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 72, "byteLength": INDEX_LENGTH }
        ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
            { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC3" },
            { "bufferView": 2, "componentType": COMPONENT_TYPE, "count": 3, "type": "SCALAR" }
        ],
        "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0, "NORMAL": 1 }, "indices": 2 }] }]
    }"#;

    fn write_gltf(name: &str, component_type: u32, index_length: usize, data: &str) -> std::path::PathBuf {
        let byte_length = if index_length == 3 { 76 } else { 80 };
        let json = GLTF_TEMPLATE
            .replace("BYTE_LENGTH", &byte_length.to_string())
            .replace("INDEX_LENGTH", &index_length.to_string())
            .replace("COMPONENT_TYPE", &component_type.to_string())
            .replace("DATA", data);
        let path = std::env::temp_dir().join(format!("vkrt_{}_{}.gltf", name, std::process::id()));
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn u16_indices_are_widened() {
        let path = write_gltf("u16", 5123, 6, U16_BUFFER);
        let mesh = Mesh::load_gltf(&path);
        std::fs::remove_file(&path).ok();

        let mesh = mesh.unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.vertices[1].position, [1.0, 0.0, -0.0, 1.0]);
        assert_eq!(mesh.vertices[0].normal, [-0.0, -0.0, -1.0, 0.0]);
    }

    #[test]
    fn u8_indices_are_rejected() {
        let path = write_gltf("u8", 5121, 3, U8_BUFFER);
        let result = Mesh::load_gltf(&path);
        std::fs::remove_file(&path).ok();

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Unrecognized index type (u8)"));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        assert!(Mesh::load_gltf(Path::new("no/such/model.gltf")).is_err());
    }
}
