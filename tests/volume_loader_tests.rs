mod support;

use ndarray::Array3;
use segviz::{VolumeLoader, VolumeLoaderError, compute_metrics};

#[test]
fn nifti_labels_and_spacing_are_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case_pred.nii");
    let labels = support::liver_with_two_tumors();
    support::write_nifti(&path, &labels, [2.0, 2.0, 2.0]);

    let volume = VolumeLoader::load_from_nifti(&path).unwrap();
    assert_eq!(volume.dim(), (6, 6, 6));
    assert_eq!(volume.spacing(), (2.0, 2.0, 2.0));
    assert_eq!(volume.data()[[5, 0, 5]], 9);
    assert_eq!(volume.data()[[0, 0, 0]], 8);
    assert_eq!(volume.labels(), vec![8, 9]);
}

#[test]
fn compressed_nifti_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case_pred.nii.gz");
    support::write_nifti(&path, &support::liver_with_two_tumors(), [1.5, 1.5, 2.5]);

    let volume = VolumeLoader::load_from_nifti(&path).unwrap();
    assert_eq!(volume.dim(), (6, 6, 6));
    assert_eq!(volume.spacing(), (1.5, 1.5, 2.5));
    assert_eq!(volume.count(8), 27);
    assert_eq!(volume.count(9), 2);
    assert_eq!(VolumeLoader::file_stem(&path), "case_pred");
}

#[test]
fn axes_keep_their_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anisotropic.nii");
    let mut labels = Array3::<u8>::zeros((4, 3, 2));
    labels[[3, 0, 0]] = 1;
    labels[[0, 2, 1]] = 2;
    support::write_nifti(&path, &labels, [0.5, 0.75, 3.0]);

    let volume = VolumeLoader::load_from_nifti(&path).unwrap();
    assert_eq!(volume.dim(), (4, 3, 2));
    assert_eq!(volume.spacing(), (0.5, 0.75, 3.0));
    assert_eq!(volume.data()[[3, 0, 0]], 1);
    assert_eq!(volume.data()[[0, 2, 1]], 2);
}

#[test]
fn scenario_two_millimeter_liver_and_tumors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case_pred.nii");
    support::write_nifti(&path, &support::liver_with_two_tumors(), [2.0, 2.0, 2.0]);

    let metrics = compute_metrics(&VolumeLoader::load_from_nifti(&path).unwrap(), 8, 9);
    // 27 voxels x 0.008 ml = 0.216 ml
    assert_eq!(metrics.liver_volume_ml, 0.22);
    assert_eq!(metrics.tumor_count, 2);
    assert_eq!(metrics.tumors[0].id, 1);
    assert_eq!(metrics.tumors[1].id, 2);
    assert!(metrics.tumors.iter().all(|t| t.volume_ml == 0.01));
    assert_eq!(metrics.total_tumor_volume_ml, 0.02);
}

#[test]
fn zero_spacing_is_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flat.nii");
    support::write_nifti(&path, &Array3::<u8>::zeros((2, 2, 2)), [1.0, 0.0, 1.0]);

    let err = VolumeLoader::load_from_nifti(&path).unwrap_err();
    assert!(matches!(err, VolumeLoaderError::Volume(_)), "{err}");
}

#[test]
fn garbage_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.nii");
    std::fs::write(&path, b"definitely not a nifti header").unwrap();
    assert!(VolumeLoader::load_from_nifti(&path).is_err());
}
