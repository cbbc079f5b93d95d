use std::collections::HashSet;
use std::path::PathBuf;

use dicom_mesh::series::UNKNOWN_ID;
use dicom_mesh::{DicomRecord, SeriesGrouper};

fn record(i: usize, patient: &str, study: &str, series: &str) -> DicomRecord {
    DicomRecord {
        path: PathBuf::from(format!("slice-{i:04}.dcm")),
        is_dicom: true,
        patient_id: Some(patient.to_string()),
        patient_name: Some(format!("DOE^{patient}")),
        study_instance_id: Some(study.to_string()),
        series_instance_id: Some(series.to_string()),
        series_description: Some("AXIAL 1.0".to_string()),
        ..DicomRecord::default()
    }
}

#[test]
fn distinct_triples_become_leaves() {
    let triples = [
        ("p1", "1.2.1", "1.2.1.1"),
        ("p1", "1.2.1", "1.2.1.2"),
        ("p1", "1.2.2", "1.2.2.1"),
        ("p2", "1.3.1", "1.3.1.1"),
        ("p3", "1.4.1", "1.4.1.1"),
    ];
    // Interleave so no group arrives contiguously
    let records: Vec<_> = (0..40)
        .map(|i| {
            let (p, st, se) = triples[(i * 3) % triples.len()];
            record(i, p, st, se)
        })
        .collect();

    let groups = SeriesGrouper::group(records.clone());
    assert_eq!(groups.series_count(), triples.len());
    assert_eq!(groups.record_count(), records.len());

    let leaves: HashSet<_> = groups.series().map(|(p, st, se, _)| (p, st, se)).collect();
    let expected: HashSet<_> = triples.iter().copied().collect();
    assert_eq!(leaves, expected);

    for (p, st, se, leaf) in groups.series() {
        assert!(leaf.iter().all(|r| r.patient_id.as_deref() == Some(p)
            && r.study_instance_id.as_deref() == Some(st)
            && r.series_instance_id.as_deref() == Some(se)));
        // Input order is kept inside a leaf
        assert!(leaf.windows(2).all(|w| w[0].path < w[1].path));
    }
}

#[test]
fn descriptive_fields_are_carried_unchanged() {
    let groups = SeriesGrouper::group(vec![record(7, "p", "s", "x")]);
    let leaf = groups.get("p", "s", "x").unwrap();
    assert_eq!(leaf[0].patient_name.as_deref(), Some("DOE^p"));
    assert_eq!(leaf[0].series_description.as_deref(), Some("AXIAL 1.0"));
}

#[test]
fn keys_keep_first_appearance_order() {
    let groups = SeriesGrouper::group(vec![
        record(0, "zeta", "s2", "b"),
        record(1, "alpha", "s1", "a"),
        record(2, "zeta", "s1", "c"),
        record(3, "zeta", "s2", "a"),
    ]);
    let patients: Vec<_> = groups.patients().iter().map(|p| p.patient_id.as_str()).collect();
    assert_eq!(patients, ["zeta", "alpha"]);

    let zeta = groups.patient("zeta").unwrap();
    let studies: Vec<_> = zeta.studies().iter().map(|s| s.study_instance_id.as_str()).collect();
    assert_eq!(studies, ["s2", "s1"]);
    let series: Vec<_> = zeta.studies()[0]
        .series()
        .iter()
        .map(|s| s.series_instance_id.as_str())
        .collect();
    assert_eq!(series, ["b", "a"]);
}

#[test]
fn empty_input_gives_empty_mapping() {
    let groups = SeriesGrouper::group(Vec::new());
    assert!(groups.is_empty());
    assert_eq!(groups.series_count(), 0);
    assert!(groups.largest_series().is_none());
}

#[test]
fn anonymous_records_share_unknown_group() {
    let anonymous = DicomRecord {
        path: PathBuf::from("anon.dcm"),
        is_dicom: true,
        ..DicomRecord::default()
    };
    let groups = SeriesGrouper::group(vec![
        anonymous.clone(),
        record(1, "", "", ""),
        DicomRecord::not_dicom("notes.txt"),
    ]);
    assert_eq!(groups.series_count(), 1);
    assert_eq!(groups.get(UNKNOWN_ID, UNKNOWN_ID, UNKNOWN_ID).unwrap().len(), 2);
}
