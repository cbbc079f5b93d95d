//! STL serialization.
//!
//! # Binary layout (little-endian)
//!
//! ```text
//! UINT8[80]    header, ignored by readers
//! UINT32       triangle count
//! foreach triangle
//!     REAL32[3] face normal
//!     REAL32[3] vertex 1
//!     REAL32[3] vertex 2
//!     REAL32[3] vertex 3
//!     UINT16    attribute byte count (0)
//! ```
//!
//! The normal written for each facet is recomputed from its corners; the
//! per-vertex shading normals of the mesh are not used.

use std::fmt::Write as _;
use std::io::Write;

use nalgebra::Point3;
use nalgebra::Vector3;
use thiserror::Error;

use crate::enums::StlFormat;
use crate::mesh::Mesh;
use crate::mesh::face_normal;

pub const HEADER_SIZE: usize = 80;
pub const TRIANGLE_SIZE: usize = 50;

const HEADER_LABEL: &[u8] = b"dicom-mesh binary STL";

#[derive(Debug, Error)]
pub enum StlError {
    #[error("Write failed at byte {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("STL data truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Mesh has {0} triangles, binary STL holds at most u32::MAX")]
    TooManyTriangles(usize),
}

/// Encoded size of a binary STL holding `triangles` facets
pub const fn binary_stl_size(triangles: usize) -> usize {
    HEADER_SIZE + 4 + TRIANGLE_SIZE * triangles
}

fn header() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..HEADER_LABEL.len()].copy_from_slice(HEADER_LABEL);
    header
}

fn triangle_count(mesh: &Mesh) -> Result<u32, StlError> {
    u32::try_from(mesh.triangle_count()).map_err(|_| StlError::TooManyTriangles(mesh.triangle_count()))
}

fn encode_triangle(corners: &[Point3<f64>; 3], out: &mut [u8; TRIANGLE_SIZE]) {
    let normal = face_normal(&corners[0], &corners[1], &corners[2]);
    let values = [
        normal.x, normal.y, normal.z,
        corners[0].x, corners[0].y, corners[0].z,
        corners[1].x, corners[1].y, corners[1].z,
        corners[2].x, corners[2].y, corners[2].z,
    ];
    for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&(value as f32).to_le_bytes());
    }
    out[48..].copy_from_slice(&0u16.to_le_bytes());
}

/// Encode a mesh as binary STL.
///
/// # Errors
///
/// Fails only if the mesh has more triangles than a `u32` can count.
pub fn write_binary_stl(mesh: &Mesh) -> Result<Vec<u8>, StlError> {
    let count = triangle_count(mesh)?;
    let mut bytes = Vec::with_capacity(binary_stl_size(mesh.triangle_count()));
    bytes.extend_from_slice(&header());
    bytes.extend_from_slice(&count.to_le_bytes());

    let mut record = [0u8; TRIANGLE_SIZE];
    for &triangle in &mesh.triangles {
        encode_triangle(&mesh.triangle_positions(triangle), &mut record);
        bytes.extend_from_slice(&record);
    }
    Ok(bytes)
}

/// Stream a mesh as binary STL, returning the number of bytes written.
pub fn write_binary_stl_to<W: Write>(mesh: &Mesh, mut writer: W) -> Result<u64, StlError> {
    let count = triangle_count(mesh)?;
    let mut offset = 0u64;
    let mut emit = |writer: &mut W, bytes: &[u8]| -> Result<(), StlError> {
        writer
            .write_all(bytes)
            .map_err(|source| StlError::Write { offset, source })?;
        offset += bytes.len() as u64;
        Ok(())
    };

    emit(&mut writer, &header())?;
    emit(&mut writer, &count.to_le_bytes())?;
    let mut record = [0u8; TRIANGLE_SIZE];
    for &triangle in &mesh.triangles {
        encode_triangle(&mesh.triangle_positions(triangle), &mut record);
        emit(&mut writer, &record)?;
    }
    writer
        .flush()
        .map_err(|source| StlError::Write { offset: binary_stl_size(mesh.triangle_count()) as u64, source })?;
    Ok(binary_stl_size(mesh.triangle_count()) as u64)
}

/// Format a mesh as ASCII STL under the given solid name.
pub fn write_ascii_stl(mesh: &Mesh, name: &str) -> String {
    // Roughly 250 bytes per facet
    let mut text = String::with_capacity(32 + mesh.triangle_count() * 256);
    let _ = writeln!(text, "solid {name}");
    for &triangle in &mesh.triangles {
        ascii_facet(&mesh.triangle_positions(triangle), &mut text);
    }
    let _ = writeln!(text, "endsolid {name}");
    text
}

fn ascii_facet(corners: &[Point3<f64>; 3], text: &mut String) {
    let n = face_normal(&corners[0], &corners[1], &corners[2]);
    let _ = writeln!(text, "  facet normal {} {} {}", n.x as f32, n.y as f32, n.z as f32);
    text.push_str("    outer loop\n");
    for p in corners {
        let _ = writeln!(text, "      vertex {} {} {}", p.x as f32, p.y as f32, p.z as f32);
    }
    text.push_str("    endloop\n");
    text.push_str("  endfacet\n");
}

/// Stream a mesh as ASCII STL one facet at a time, returning the number of
/// bytes written.
pub fn write_ascii_stl_to<W: Write>(mesh: &Mesh, name: &str, mut writer: W) -> Result<u64, StlError> {
    let mut offset = 0u64;
    let mut emit = |writer: &mut W, text: &str| -> Result<(), StlError> {
        writer
            .write_all(text.as_bytes())
            .map_err(|source| StlError::Write { offset, source })?;
        offset += text.len() as u64;
        Ok(())
    };

    let mut line = String::with_capacity(256);
    let _ = writeln!(line, "solid {name}");
    emit(&mut writer, &line)?;
    for &triangle in &mesh.triangles {
        line.clear();
        ascii_facet(&mesh.triangle_positions(triangle), &mut line);
        emit(&mut writer, &line)?;
    }
    line.clear();
    let _ = writeln!(line, "endsolid {name}");
    emit(&mut writer, &line)?;

    writer
        .flush()
        .map_err(|source| StlError::Write { offset, source })?;
    Ok(offset)
}

/// Encode in the requested format. `name` is only used by ASCII output.
pub fn write_stl(mesh: &Mesh, format: StlFormat, name: &str) -> Result<Vec<u8>, StlError> {
    match format {
        StlFormat::Binary => write_binary_stl(mesh),
        StlFormat::Ascii => Ok(write_ascii_stl(mesh, name).into_bytes()),
    }
}

/// Decode a binary STL into an unwelded mesh, three vertices per facet.
///
/// Facet normals are kept as the per-vertex normals of their corners.
pub fn read_binary_stl(bytes: &[u8]) -> Result<Mesh, StlError> {
    if bytes.len() < HEADER_SIZE + 4 {
        return Err(StlError::Truncated {
            expected: HEADER_SIZE + 4,
            got: bytes.len(),
        });
    }
    let mut count = [0u8; 4];
    count.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + 4]);
    let count = u32::from_le_bytes(count) as usize;
    let expected = binary_stl_size(count);
    if bytes.len() < expected {
        return Err(StlError::Truncated {
            expected,
            got: bytes.len(),
        });
    }

    let mut mesh = Mesh::with_capacity(count * 3, count);
    for (i, record) in bytes[HEADER_SIZE + 4..expected]
        .chunks_exact(TRIANGLE_SIZE)
        .enumerate()
    {
        let floats: Vec<f64> = record[..48]
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        let normal = Vector3::new(floats[0], floats[1], floats[2]);
        for corner in floats[3..].chunks_exact(3) {
            mesh.vertices.push(Point3::new(corner[0], corner[1], corner[2]));
            mesh.normals.push(normal);
        }
        let base = (i * 3) as u32;
        mesh.triangles.push([base, base + 1, base + 2]);
    }
    Ok(mesh)
}
