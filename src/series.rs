//! Grouping of DICOM files into patient / study / series.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom::object::OpenFileOptions;
use dicom_dictionary_std::tags;
use log::debug;
use log::warn;

/// Key used when a record lacks an identifier
pub const UNKNOWN_ID: &str = "unknown";

/// Metadata read from one file of a DICOM upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DicomRecord {
    pub path: PathBuf,
    /// `false` when the file could not be parsed as DICOM
    pub is_dicom: bool,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub series_description: Option<String>,
    pub study_instance_id: Option<String>,
    pub series_instance_id: Option<String>,
}

impl DicomRecord {
    /// A record for a file that could not be read as DICOM
    pub fn not_dicom(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Read the identifying tags of a DICOM file.
    ///
    /// Parsing stops before the pixel data. Files that fail to parse yield a
    /// record with `is_dicom == false`.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let object = match OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
        {
            Ok(object) => object,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                return Self::not_dicom(path);
            }
        };

        let text = |tag: Tag| read_text(&object, tag);
        Self {
            path: path.to_path_buf(),
            is_dicom: true,
            patient_id: text(tags::PATIENT_ID),
            patient_name: text(tags::PATIENT_NAME),
            patient_birth_date: text(tags::PATIENT_BIRTH_DATE),
            patient_sex: text(tags::PATIENT_SEX),
            study_date: text(tags::SERIES_DATE),
            study_time: text(tags::SERIES_TIME),
            series_description: text(tags::SERIES_DESCRIPTION),
            study_instance_id: text(tags::STUDY_INSTANCE_UID),
            series_instance_id: text(tags::SERIES_INSTANCE_UID),
        }
    }

    /// Read every regular file in `dir`, sorted by path.
    pub fn scan_directory(dir: impl AsRef<Path>) -> std::io::Result<Vec<DicomRecord>> {
        let mut paths: Vec<_> = fs::read_dir(dir.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let records: Vec<_> = paths.iter().map(Self::from_path).collect();
        debug!(
            "scanned {}: {} files, {} DICOM",
            dir.as_ref().display(),
            records.len(),
            records.iter().filter(|r| r.is_dicom).count()
        );
        Ok(records)
    }
}

fn read_text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches(['\0', ' ']);
    Some(value.to_string())
}

fn key(id: &Option<String>) -> &str {
    match id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => UNKNOWN_ID,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesGroup {
    pub series_instance_id: String,
    pub records: Vec<DicomRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyGroup {
    pub study_instance_id: String,
    series: Vec<SeriesGroup>,
    index: HashMap<String, usize>,
}

impl StudyGroup {
    fn new(study_instance_id: &str) -> Self {
        Self {
            study_instance_id: study_instance_id.to_string(),
            series: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Series in order of first appearance
    pub fn series(&self) -> &[SeriesGroup] {
        &self.series
    }

    pub fn get(&self, series_instance_id: &str) -> Option<&SeriesGroup> {
        self.index
            .get(series_instance_id)
            .map(|&i| &self.series[i])
    }

    fn push(&mut self, series_id: &str, record: DicomRecord) {
        let i = *self.index.entry(series_id.to_string()).or_insert_with(|| {
            self.series.push(SeriesGroup {
                series_instance_id: series_id.to_string(),
                records: Vec::new(),
            });
            self.series.len() - 1
        });
        self.series[i].records.push(record);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientGroup {
    pub patient_id: String,
    studies: Vec<StudyGroup>,
    index: HashMap<String, usize>,
}

impl PatientGroup {
    fn new(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            studies: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Studies in order of first appearance
    pub fn studies(&self) -> &[StudyGroup] {
        &self.studies
    }

    pub fn get(&self, study_instance_id: &str) -> Option<&StudyGroup> {
        self.index
            .get(study_instance_id)
            .map(|&i| &self.studies[i])
    }

    fn study_mut(&mut self, study_id: &str) -> &mut StudyGroup {
        let i = *self.index.entry(study_id.to_string()).or_insert_with(|| {
            self.studies.push(StudyGroup::new(study_id));
            self.studies.len() - 1
        });
        &mut self.studies[i]
    }
}

/// Patient → study → series mapping, each level ordered by first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesGroups {
    patients: Vec<PatientGroup>,
    index: HashMap<String, usize>,
}

impl SeriesGroups {
    pub fn patients(&self) -> &[PatientGroup] {
        &self.patients
    }

    pub fn patient(&self, patient_id: &str) -> Option<&PatientGroup> {
        self.index.get(patient_id).map(|&i| &self.patients[i])
    }

    /// Records of one series, `None` if any level is missing
    pub fn get(&self, patient_id: &str, study_id: &str, series_id: &str) -> Option<&[DicomRecord]> {
        self.patient(patient_id)?
            .get(study_id)?
            .get(series_id)
            .map(|series| series.records.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// Iterate `(patient, study, series, records)` leaves in order
    pub fn series(&self) -> impl Iterator<Item = (&str, &str, &str, &[DicomRecord])> {
        self.patients.iter().flat_map(|patient| {
            patient.studies.iter().flat_map(move |study| {
                study.series.iter().map(move |series| {
                    (
                        patient.patient_id.as_str(),
                        study.study_instance_id.as_str(),
                        series.series_instance_id.as_str(),
                        series.records.as_slice(),
                    )
                })
            })
        })
    }

    pub fn series_count(&self) -> usize {
        self.series().count()
    }

    pub fn record_count(&self) -> usize {
        self.series().map(|(_, _, _, records)| records.len()).sum()
    }

    /// The series with the most records; the first one wins a tie.
    pub fn largest_series(&self) -> Option<(&str, &str, &str, &[DicomRecord])> {
        self.series().fold(None, |best, leaf| match best {
            Some(best) if best.3.len() >= leaf.3.len() => Some(best),
            _ => Some(leaf),
        })
    }

    fn patient_mut(&mut self, patient_id: &str) -> &mut PatientGroup {
        let i = *self.index.entry(patient_id.to_string()).or_insert_with(|| {
            self.patients.push(PatientGroup::new(patient_id));
            self.patients.len() - 1
        });
        &mut self.patients[i]
    }
}

pub struct SeriesGrouper;

impl SeriesGrouper {
    /// Group records by patient, study and series.
    ///
    /// Records that are not DICOM are dropped; missing or empty identifiers
    /// are grouped under [`UNKNOWN_ID`].
    pub fn group(records: impl IntoIterator<Item = DicomRecord>) -> SeriesGroups {
        let mut groups = SeriesGroups::default();
        for record in records.into_iter().filter(|record| record.is_dicom) {
            let patient = key(&record.patient_id).to_string();
            let study = key(&record.study_instance_id).to_string();
            let series = key(&record.series_instance_id).to_string();
            groups
                .patient_mut(&patient)
                .study_mut(&study)
                .push(&series, record);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, patient: Option<&str>, study: Option<&str>, series: Option<&str>) -> DicomRecord {
        DicomRecord {
            path: PathBuf::from(name),
            is_dicom: true,
            patient_id: patient.map(str::to_string),
            study_instance_id: study.map(str::to_string),
            series_instance_id: series.map(str::to_string),
            ..DicomRecord::default()
        }
    }

    #[test]
    fn groups_by_all_three_ids_in_input_order() {
        let groups = SeriesGrouper::group(vec![
            record("a", Some("p2"), Some("s1"), Some("x")),
            record("b", Some("p1"), Some("s1"), Some("x")),
            record("c", Some("p2"), Some("s1"), Some("y")),
            record("d", Some("p2"), Some("s1"), Some("x")),
        ]);
        let ids: Vec<_> = groups.patients().iter().map(|p| p.patient_id.as_str()).collect();
        assert_eq!(ids, ["p2", "p1"]);

        let leaf: Vec<_> = groups
            .get("p2", "s1", "x")
            .unwrap()
            .iter()
            .map(|r| r.path.to_str().unwrap())
            .collect();
        assert_eq!(leaf, ["a", "d"]);
        assert_eq!(groups.series_count(), 3);
        assert_eq!(groups.record_count(), 4);
    }

    #[test]
    fn missing_and_empty_ids_become_unknown() {
        let groups = SeriesGrouper::group(vec![
            record("a", None, Some(""), None),
            record("b", Some(""), None, Some("")),
        ]);
        assert_eq!(groups.get(UNKNOWN_ID, UNKNOWN_ID, UNKNOWN_ID).unwrap().len(), 2);
    }

    #[test]
    fn non_dicom_records_are_excluded() {
        let groups = SeriesGrouper::group(vec![
            DicomRecord::not_dicom("readme.txt"),
            record("a", Some("p"), Some("s"), Some("x")),
        ]);
        assert_eq!(groups.record_count(), 1);
        assert!(SeriesGrouper::group(vec![DicomRecord::not_dicom("x")]).is_empty());
    }

    #[test]
    fn largest_series_prefers_first_on_tie() {
        let groups = SeriesGrouper::group(vec![
            record("a", Some("p"), Some("s"), Some("x")),
            record("b", Some("p"), Some("s"), Some("y")),
            record("c", Some("p"), Some("t"), Some("z")),
            record("d", Some("p"), Some("t"), Some("z")),
        ]);
        assert_eq!(groups.largest_series().unwrap().2, "z");

        let tie = SeriesGrouper::group(vec![
            record("a", Some("p"), Some("s"), Some("x")),
            record("b", Some("p"), Some("s"), Some("y")),
        ]);
        assert_eq!(tie.largest_series().unwrap().2, "x");
        assert!(SeriesGroups::default().largest_series().is_none());
    }

    #[test]
    fn unreadable_file_is_not_dicom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"not a dicom file").unwrap();

        let records = DicomRecord::scan_directory(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_dicom);
        assert_eq!(records[0].path, path);
    }
}
