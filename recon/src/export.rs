use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbImage};
use log::debug;
use serde_json::{json, Value};

use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::fs::{create_file, write_file};

use crate::camera::{Vector2, Vector3};
use crate::mesh::Mesh;
use crate::point_cloud::PointCloud;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F534A;
const CHUNK_BIN: u32 = 0x004E4942;

const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

// Binary chunk under construction, every view aligned to four bytes.
#[derive(Default)]
struct BufferBuilder {
    data: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

impl BufferBuilder {
    fn push_view(&mut self, bytes: &[u8], target: Option<u32>) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        self.data.extend(std::iter::repeat(0).take(pad4(bytes.len())));
        let mut view = json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bytes.len(),
        });
        if let Some(target) = target {
            view["target"] = json!(target);
        }
        self.views.push(view);
        self.views.len() - 1
    }

    fn push_floats(&mut self, values: &[[f32; 3]], kind: &str) -> usize {
        let bytes: Vec<u8> = values
            .iter()
            .flatten()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let view = self.push_view(&bytes, Some(ARRAY_BUFFER));
        self.accessors.push(json!({
            "bufferView": view,
            "componentType": FLOAT,
            "count": values.len(),
            "type": kind,
        }));
        self.accessors.len() - 1
    }
}

fn to_f32(v: &Vector3) -> [f32; 3] {
    [v.x as f32, v.y as f32, v.z as f32]
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut png = vec![];
    let (w, h) = image.dimensions();
    PngEncoder::new(&mut png)
        .write_image(image.as_raw(), w, h, ColorType::Rgb8)
        .res(|| "failed to encode texture".to_string())?;
    Ok(png)
}

/// Encodes a glTF 2.0 binary container with a single mesh. Vertex
/// colors, texture coordinates and an embedded albedo are optional.
pub fn encode_glb(
    mesh: &Mesh,
    uvs: Option<&[Vector2]>,
    texture: Option<&RgbImage>,
) -> Result<Vec<u8>> {
    if mesh.vertices.is_empty() || mesh.faces.is_empty() {
        let desc = "cannot export an empty mesh".to_string();
        return Err(Error::new(EmptyGeometry, desc));
    }
    if let Some(uvs) = uvs {
        if uvs.len() != mesh.vertices.len() {
            let desc = format!(
                "{} uv coordinates for {} vertices",
                uvs.len(),
                mesh.vertices.len()
            );
            return Err(Error::new(InconsistentState, desc));
        }
    }

    let textured = texture.is_some() && uvs.is_some();
    let mut buf = BufferBuilder::default();
    let mut attributes = json!({});

    let positions: Vec<[f32; 3]> =
        mesh.vertices.iter().map(|p| to_f32(&p.coords)).collect();
    let position = buf.push_floats(&positions, "VEC3");
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in &positions {
        for k in 0..3 {
            min[k] = min[k].min(p[k]);
            max[k] = max[k].max(p[k]);
        }
    }
    buf.accessors[position]["min"] = json!(min);
    buf.accessors[position]["max"] = json!(max);
    attributes["POSITION"] = json!(position);

    if mesh.has_normals() {
        let normals: Vec<[f32; 3]> = mesh.normals.iter().map(to_f32).collect();
        attributes["NORMAL"] = json!(buf.push_floats(&normals, "VEC3"));
    }
    // The albedo would be modulated by vertex colors.
    if mesh.has_colors() && !textured {
        let colors: Vec<[f32; 3]> = mesh
            .colors
            .iter()
            .map(|c| to_f32(&c.map(|x| x.max(0.0).min(1.0))))
            .collect();
        attributes["COLOR_0"] = json!(buf.push_floats(&colors, "VEC3"));
    }
    if let Some(uvs) = uvs {
        // glTF puts the texture origin at the top left corner.
        let bytes: Vec<u8> = uvs
            .iter()
            .flat_map(|uv| [uv.x as f32, 1.0 - uv.y as f32])
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let view = buf.push_view(&bytes, Some(ARRAY_BUFFER));
        buf.accessors.push(json!({
            "bufferView": view,
            "componentType": FLOAT,
            "count": uvs.len(),
            "type": "VEC2",
        }));
        attributes["TEXCOORD_0"] = json!(buf.accessors.len() - 1);
    }

    let index_bytes: Vec<u8> = mesh
        .faces
        .iter()
        .flatten()
        .flat_map(|&i| (i as u32).to_le_bytes())
        .collect();
    let view = buf.push_view(&index_bytes, Some(ELEMENT_ARRAY_BUFFER));
    buf.accessors.push(json!({
        "bufferView": view,
        "componentType": UNSIGNED_INT,
        "count": mesh.faces.len() * 3,
        "type": "SCALAR",
    }));
    let indices = buf.accessors.len() - 1;

    let mut material = json!({
        "pbrMetallicRoughness": {
            "baseColorFactor": [1.0, 1.0, 1.0, 1.0],
            "metallicFactor": 0.0,
            "roughnessFactor": 1.0,
        },
        "doubleSided": true,
    });
    let mut gltf = json!({
        "asset": {"version": "2.0", "generator": "recon"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [{"mesh": 0}],
        "meshes": [{
            "primitives": [{
                "attributes": attributes,
                "indices": indices,
                "material": 0,
                "mode": 4,
            }],
        }],
    });

    if let Some(texture) = texture.filter(|_| textured) {
        let png = encode_png(texture)?;
        let view = buf.push_view(&png, None);
        material["pbrMetallicRoughness"]["baseColorTexture"] =
            json!({"index": 0});
        gltf["textures"] = json!([{"sampler": 0, "source": 0}]);
        gltf["samplers"] = json!([{
            "magFilter": 9729,
            "minFilter": 9729,
            "wrapS": 33071,
            "wrapT": 33071,
        }]);
        gltf["images"] = json!([{"bufferView": view, "mimeType": "image/png"}]);
    }

    gltf["materials"] = json!([material]);
    gltf["accessors"] = Value::Array(buf.accessors);
    gltf["bufferViews"] = Value::Array(buf.views);
    gltf["buffers"] = json!([{"byteLength": buf.data.len()}]);

    let mut json_bytes = serde_json::to_vec(&gltf)
        .res(|| "failed to serialize glTF document".to_string())?;
    json_bytes.extend(std::iter::repeat(b' ').take(pad4(json_bytes.len())));

    let total = 12 + 8 + json_bytes.len() + 8 + buf.data.len();
    let mut glb = Vec::with_capacity(total);
    glb.extend_from_slice(GLB_MAGIC);
    glb.extend_from_slice(&GLB_VERSION.to_le_bytes());
    glb.extend_from_slice(&(total as u32).to_le_bytes());
    glb.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    glb.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    glb.extend_from_slice(&json_bytes);
    glb.extend_from_slice(&(buf.data.len() as u32).to_le_bytes());
    glb.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    glb.extend_from_slice(&buf.data);
    Ok(glb)
}

pub fn write_glb(
    path: &Path,
    mesh: &Mesh,
    uvs: Option<&[Vector2]>,
    texture: Option<&RgbImage>,
) -> Result<()> {
    let glb = encode_glb(mesh, uvs, texture)?;
    write_file(path, &glb)?;
    debug!("wrote {} ({} bytes)", path.display(), glb.len());
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice = bytes.get(offset..offset + 4).ok_or_else(|| {
        Error::new(MalformedData, "truncated glb container".to_string())
    })?;
    let mut word = [0; 4];
    word.copy_from_slice(slice);
    Ok(u32::from_le_bytes(word))
}

/// Splits a binary glTF container into its JSON document and binary
/// chunk.
pub fn decode_glb(bytes: &[u8]) -> Result<(Value, Vec<u8>)> {
    if bytes.get(0..4) != Some(&GLB_MAGIC[..]) {
        let desc = "not a glb container".to_string();
        return Err(Error::new(MalformedData, desc));
    }
    if read_u32(bytes, 8)? as usize != bytes.len() {
        let desc = "glb length does not match its header".to_string();
        return Err(Error::new(MalformedData, desc));
    }

    let json_len = read_u32(bytes, 12)? as usize;
    let json_end = 20 + json_len;
    let document = bytes.get(20..json_end).ok_or_else(|| {
        Error::new(MalformedData, "truncated glb json chunk".to_string())
    })?;
    let document: Value = serde_json::from_slice(document)
        .res(|| "malformed glb json chunk".to_string())?;

    let bin = bytes.get(json_end + 8..).unwrap_or_default().to_vec();
    Ok((document, bin))
}

/// Writes a binary little-endian PLY with positions and, if present,
/// 8-bit colors.
pub fn write_ply(path: &Path, cloud: &PointCloud) -> Result<()> {
    let mut writer = BufWriter::new(create_file(path)?);
    let err = || format!("failed to write '{}'", path.display());

    let mut header = format!(
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n",
        cloud.len()
    );
    if cloud.has_colors() {
        header += "property uchar red\nproperty uchar green\n\
                   property uchar blue\n";
    }
    header += "end_header\n";
    writer.write_all(header.as_bytes()).res(err)?;

    let q = |c: f64| (c * 255.0).round().max(0.0).min(255.0) as u8;
    for (i, p) in cloud.points.iter().enumerate() {
        for f in to_f32(&p.coords) {
            writer.write_all(&f.to_le_bytes()).res(err)?;
        }
        if cloud.has_colors() {
            let c = cloud.colors[i];
            writer.write_all(&[q(c.x), q(c.y), q(c.z)]).res(err)?;
        }
    }
    writer.flush().res(err)?;
    debug!("wrote {} ({} points)", path.display(), cloud.len());
    Ok(())
}
