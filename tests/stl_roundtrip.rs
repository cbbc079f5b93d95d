use approx::assert_relative_eq;
use dicom_mesh::stl::{self, StlError};
use dicom_mesh::{IsosurfaceExtractor, MarchingCubesConfig, Mesh, Volume};

fn torus_volume() -> Volume {
    Volume::from_fn((28, 28, 16), (0.7, 0.7, 1.2), (-9.45, -9.45, -9.0), |x, y, z| {
        let px = x as f64 * 0.7 - 9.45;
        let py = y as f64 * 0.7 - 9.45;
        let pz = z as f64 * 1.2 - 9.0;
        let ring = (px.hypot(py) - 6.0).hypot(pz);
        (400.0 - 200.0 * ring).clamp(-1000.0, 1000.0) as i16
    })
    .unwrap()
}

#[test]
fn binary_round_trip_keeps_geometry() {
    let mesh = IsosurfaceExtractor::default()
        .extract(&torus_volume(), 0.0)
        .unwrap();
    assert!(mesh.triangle_count() > 100);

    let bytes = stl::write_binary_stl(&mesh).unwrap();
    let decoded = stl::read_binary_stl(&bytes).unwrap();
    assert_eq!(decoded.triangle_count(), mesh.triangle_count());

    for (t, original) in mesh.triangles.iter().enumerate() {
        let corners = mesh.triangle_positions(*original);
        for (k, corner) in corners.iter().enumerate() {
            let read = decoded.vertices[t * 3 + k];
            assert_relative_eq!(read, *corner, epsilon = 1e-5);
        }
    }
}

#[test]
fn welded_and_soup_meshes_encode_identically() {
    let volume = torus_volume();
    let welded = IsosurfaceExtractor::default().extract(&volume, 0.0).unwrap();
    let soup = IsosurfaceExtractor::new(MarchingCubesConfig {
        merge_points: false,
        ..MarchingCubesConfig::default()
    })
    .extract(&volume, 0.0)
    .unwrap();
    assert_eq!(
        stl::write_binary_stl(&welded).unwrap(),
        stl::write_binary_stl(&soup).unwrap()
    );
}

#[test]
fn decoded_soup_re_encodes_to_same_bytes() {
    let mesh = IsosurfaceExtractor::default()
        .extract(&torus_volume(), 0.0)
        .unwrap();
    let bytes = stl::write_binary_stl(&mesh).unwrap();
    let again = stl::write_binary_stl(&stl::read_binary_stl(&bytes).unwrap()).unwrap();
    assert_eq!(bytes.len(), again.len());
    assert_eq!(&bytes[..84], &again[..84]);
}

#[test]
fn ascii_and_binary_agree_on_facet_count() {
    let mesh = IsosurfaceExtractor::default()
        .extract(&torus_volume(), 0.0)
        .unwrap();
    let text = stl::write_ascii_stl(&mesh, "torus");
    assert_eq!(text.matches("endfacet").count(), mesh.triangle_count());

    let mut sink = Vec::new();
    let written = stl::write_ascii_stl_to(&mesh, "torus", &mut sink).unwrap();
    assert_eq!(written as usize, sink.len());
    assert_eq!(sink, text.into_bytes());
}

#[test]
fn file_output_matches_in_memory_encoding() {
    let mesh = IsosurfaceExtractor::default()
        .extract(&torus_volume(), 0.0)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torus.stl");
    let file = std::fs::File::create(&path).unwrap();
    stl::write_binary_stl_to(&mesh, std::io::BufWriter::new(file)).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), stl::write_binary_stl(&mesh).unwrap());
}

#[test]
fn count_field_must_match_payload() {
    let mut bytes = stl::write_binary_stl(&Mesh::new()).unwrap();
    bytes[80] = 1;
    assert!(matches!(
        stl::read_binary_stl(&bytes),
        Err(StlError::Truncated {
            expected: 134,
            got: 84
        })
    ));
}
