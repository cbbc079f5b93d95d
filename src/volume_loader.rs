use crate::{
    enums::SortBy,
    series::DicomRecord,
    volume::{Volume, VolumeError},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use log::{debug, warn};
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Invalid volume: {0}")]
    Volume(#[from] VolumeError),
}

/// One decoded slice with the geometry read from its header
struct Slice {
    order: Option<f32>,
    position: Option<[f64; 3]>,
    image: Array2<i16>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load the volume of one series, skipping records that are not DICOM
    ///
    /// # Errors
    ///
    /// Returns error if a file cannot be read, no image decodes or the
    /// slices disagree in size
    pub fn load_series(records: &[DicomRecord], sort_by: SortBy) -> Result<Volume, VolumeLoaderError> {
        let paths: Vec<_> = records
            .iter()
            .filter(|record| record.is_dicom)
            .map(|record| record.path.as_path())
            .collect();
        Self::load_from_file_paths(&paths, sort_by)
    }

    /// Load a volume from file paths, reading files in parallel
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// Intensities are converted to Hounsfield Units through the modality
    /// LUT (rescale slope and intercept) and clamped to `i16`. Slices are
    /// ordered ascending, the voxel spacing comes from Pixel Spacing and the
    /// distance between the first two slice positions, and the origin is the
    /// position of the first slice.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut slices: Vec<_> = dicom_objects
            .iter()
            .filter_map(|dicom_object| Self::extract_slice(dicom_object, sort_by))
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        if slices.len() < dicom_objects.len() {
            warn!(
                "{} of {} DICOM objects had no usable image",
                dicom_objects.len() - slices.len(),
                dicom_objects.len()
            );
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let (pixel_x, pixel_y) = Self::get_pixel_spacing(dicom_objects).unwrap_or((1.0, 1.0));
        let slice_step = Self::get_slice_step(&slices)
            .or_else(|| Self::get_slice_thickness(dicom_objects))
            .unwrap_or(1.0);
        let origin = slices[0]
            .position
            .map_or((0.0, 0.0, 0.0), |[x, y, z]| (x, y, z));

        let volume_array = Self::build_volume_array(&slices);
        debug!(
            "loaded volume {:?} (depth, height, width), spacing ({pixel_x}, {pixel_y}, {slice_step})",
            volume_array.dim()
        );
        Ok(Volume::new(volume_array, (pixel_x, pixel_y, slice_step), origin)?)
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Slice> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position: Self::get_position(dicom_object),
            image,
        })
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                Some(pos.get(2).copied())
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match pos.as_slice() {
            &[x, y, z, ..] => Some([x, y, z]),
            _ => None,
        }
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<i16>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::Default)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| {
                arr.slice_move(s![0, .., .., 0])
                    .mapv(|hu| hu.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            })
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<i16> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<i16>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// Column and row spacing, as (x, y)
    fn get_pixel_spacing(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f64, f64)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float64()
                .ok()?;
            match pixel_spacing.as_slice() {
                &[row, column, ..] if row > 0.0 && column > 0.0 => Some((column, row)),
                _ => None,
            }
        })
    }

    /// Distance between the first two slice positions
    fn get_slice_step(slices: &[Slice]) -> Option<f64> {
        let [first, second] = [slices.first()?.position?, slices.get(1)?.position?];
        let step = (second[2] - first[2]).abs();
        (step > f64::EPSILON).then_some(step)
    }

    fn get_slice_thickness(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<f64> {
        dicom_objects.iter().find_map(|dicom_object| {
            let thickness = dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float64()
                .ok()?;
            (thickness > 0.0).then_some(thickness)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, Tag, VR, dicom_value};
    use dicom::object::FileMetaTableBuilder;
    use dicom_dictionary_std::uids;

    const ROWS: u16 = 2;
    const COLUMNS: u16 = 3;

    /// A 2x3 signed CT slice stored with intercept -1024
    fn ct_slice(z: &str, instance: &str, stored: [i16; 6], rows: u16) -> FileDicomObject<InMemDicomObject> {
        let mut obj = InMemDicomObject::new_empty();
        let mut put = |tag: Tag, vr: VR, value: PrimitiveValue| obj.put(DataElement::new(tag, vr, value));
        put(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE));
        put(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(format!("1.2.826.0.1.{instance}")));
        put(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance));
        put(tags::IMAGE_POSITION_PATIENT, VR::DS, dicom_value!(Strs, ["-10", "20", z]));
        put(tags::PIXEL_SPACING, VR::DS, dicom_value!(Strs, ["0.5", "0.75"]));
        put(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2.5"));
        put(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16));
        put(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2"));
        put(tags::ROWS, VR::US, PrimitiveValue::from(rows));
        put(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS));
        put(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16));
        put(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16));
        put(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16));
        put(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(1_u16));
        put(tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from("-1024"));
        put(tags::RESCALE_SLOPE, VR::DS, PrimitiveValue::from("1"));
        let pixels: Vec<u8> = stored
            .iter()
            .take(rows as usize * COLUMNS as usize)
            .flat_map(|v| v.to_le_bytes())
            .collect();
        put(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels));

        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(format!("1.2.826.0.1.{instance}"))
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
        )
        .unwrap()
    }

    #[test]
    fn slices_are_sorted_and_converted_to_hounsfield() {
        let objects = vec![
            ct_slice("5", "3", [1024 + 200; 6], ROWS),
            ct_slice("0", "1", [1024, 1024, 1024, 1024, 1024, 1324], ROWS),
            ct_slice("2.5", "2", [0; 6], ROWS),
        ];
        let volume =
            VolumeLoader::load_from_dicom_objects(&objects, SortBy::ImagePositionPatient).unwrap();

        assert_eq!(volume.dimensions(), (3, 2, 3));
        assert_eq!(volume.spacing(), (0.75, 0.5, 2.5));
        assert_eq!(volume.origin(), (-10.0, 20.0, 0.0));
        assert_eq!(volume.value(0, 0, 0), 0);
        assert_eq!(volume.value(2, 1, 0), 300);
        assert_eq!(volume.value(1, 1, 1), -1024);
        assert_eq!(volume.value(1, 0, 2), 200);
    }

    #[test]
    fn instance_number_order_is_honoured() {
        let objects = vec![
            ct_slice("0", "2", [1024 + 2; 6], ROWS),
            ct_slice("2.5", "1", [1024 + 1; 6], ROWS),
        ];
        let volume = VolumeLoader::load_from_dicom_objects(&objects, SortBy::InstanceNumber).unwrap();
        assert_eq!(volume.value(0, 0, 0), 1);
        assert_eq!(volume.value(0, 0, 1), 2);
        assert_eq!(volume.origin().2, 2.5);
    }

    #[test]
    fn mismatched_slices_are_rejected() {
        let objects = vec![
            ct_slice("0", "1", [1024; 6], ROWS),
            ct_slice("1", "2", [1024; 6], 1),
        ];
        assert!(matches!(
            VolumeLoader::load_from_dicom_objects(&objects, SortBy::ImagePositionPatient),
            Err(VolumeLoaderError::InconsistentDimensions)
        ));
    }

    #[test]
    fn nothing_to_load() {
        assert!(matches!(
            VolumeLoader::load_from_dicom_objects(&[], SortBy::None),
            Err(VolumeLoaderError::NoValidImages)
        ));
        assert!(matches!(
            VolumeLoader::load_series(&[DicomRecord::not_dicom("a.txt")], SortBy::None),
            Err(VolumeLoaderError::NoValidImages)
        ));
    }

    #[test]
    fn single_slice_falls_back_to_thickness() {
        let objects = vec![ct_slice("7", "1", [1024; 6], ROWS)];
        let volume = VolumeLoader::load_from_dicom_objects(&objects, SortBy::None).unwrap();
        assert_eq!(volume.spacing().2, 2.5);
        assert_eq!(volume.dimensions(), (3, 2, 1));
    }
}
