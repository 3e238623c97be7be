//! End-to-end embedding of on-disk COCO fixtures with a deterministic backbone

mod common;

use approx::assert_abs_diff_eq;
use common::{write_coco_fixture, GridBackbone};
use ndarray::{s, Array3, Axis};
use std::sync::Arc;
use tempfile::TempDir;
use xprize_embed::{
    dataset::MISSING_LABEL, CocoSegmentationDataset, DinoV2InferConfig, DinoV2Inference,
    EmbedError, InMemoryDataset, InstanceLabels, LabeledDataset, PaddingSpec, PatchGridDims,
    PatchGridPreprocessor, ResultSet, Sample,
};

fn config(average: bool) -> DinoV2InferConfig {
    DinoV2InferConfig::builder()
        .average_non_masked_patches(average)
        .batch_size(2)
        .build()
        .unwrap()
}

fn open_fixture(temp: &TempDir) -> Arc<dyn LabeledDataset> {
    let coco = write_coco_fixture(temp.path());
    Arc::new(CocoSegmentationDataset::open(coco, temp.path()).unwrap())
}

#[test]
fn test_coco_instances_are_embedded_in_dataset_order() {
    let temp = TempDir::new().unwrap();
    let dataset = open_fixture(&temp);
    assert_eq!(dataset.len(), 2, "unannotated tile is skipped");

    let backbone = GridBackbone::new(6);
    let results = DinoV2Inference::new(&backbone, config(true))
        .unwrap()
        .infer(dataset)
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(backbone.calls(), 1, "two tiles fit in one batch");
    let records = results.records();

    // Polygon over patch (2, 2)
    let polygon = &records[0];
    assert_eq!(polygon.image_id, 1);
    assert_eq!(polygon.labels, 1);
    assert_eq!(polygon.area, 196.0);
    assert!(!polygon.iscrowd);
    assert!(polygon.tiles_paths.ends_with("tile_1.png"));
    assert_eq!(polygon.down_sampled_masks[2][2], 1.0);
    for (d, &value) in polygon.embeddings.iter().enumerate() {
        assert_abs_diff_eq!(value, GridBackbone::patch_value(12, d), epsilon = 1e-4);
    }

    // First pixel column: 1/14 occupancy in patch column 0
    let column = &records[1];
    assert_eq!(column.labels, MISSING_LABEL);
    assert!(column.iscrowd);
    assert_eq!(column.area, 70.0);
    assert_abs_diff_eq!(column.down_sampled_masks[3][0], 1.0 / 14.0, epsilon = 1e-6);
    for (d, &value) in column.embeddings.iter().enumerate() {
        assert_abs_diff_eq!(value, (10.0 + d as f32 / 100.0) / 14.0, epsilon = 1e-4);
    }

    // Compressed RLE filling pixel columns 14..28
    let rle = &records[2];
    assert_eq!(rle.image_id, 2);
    assert!(rle.tiles_paths.ends_with("tile_2.png"));
    assert!(rle.down_sampled_masks.iter().all(|row| row[1] == 1.0 && row[0] == 0.0));
    for (d, &value) in rle.embeddings.iter().enumerate() {
        assert_abs_diff_eq!(value, 11.0 + d as f32 / 100.0, epsilon = 1e-4);
    }
}

#[test]
fn test_whole_image_mode_repeats_class_token() {
    let temp = TempDir::new().unwrap();
    let dataset = open_fixture(&temp);
    let backbone = GridBackbone::new(4);
    let results = DinoV2Inference::new(&backbone, config(false))
        .unwrap()
        .infer(dataset)
        .unwrap();

    let records = results.records();
    assert_eq!(records[0].embeddings, records[1].embeddings);
    assert_eq!(records[0].embeddings.len(), 4);
}

#[test]
fn test_results_survive_jsonl_round_trip() {
    let temp = TempDir::new().unwrap();
    let dataset = open_fixture(&temp);
    let backbone = GridBackbone::new(3);
    let results = DinoV2Inference::new(&backbone, config(true))
        .unwrap()
        .infer(dataset)
        .unwrap();

    let path = temp.path().join("embeddings.jsonl");
    results.write_jsonl(&path).unwrap();
    let reloaded = ResultSet::read_jsonl(&path).unwrap();
    assert_eq!(reloaded, results);
    assert_eq!(reloaded.embedding_matrix().unwrap().dim(), (3, 3));
}

#[test]
fn test_unknown_profile_fails_before_inference() {
    let backbone = GridBackbone::new(4);
    let config = DinoV2InferConfig {
        mean_std_descriptor: "sentinel2".to_string(),
        ..DinoV2InferConfig::default()
    };
    assert!(matches!(
        DinoV2Inference::new(&backbone, config),
        Err(EmbedError::InvalidProfile(_))
    ));
    assert_eq!(backbone.calls(), 0);
}

#[test]
fn test_unaligned_tiles_are_padded_symmetrically() {
    // 30x44 pads to 42x56: 6/6 rows, 6/6 columns
    let mut masks = Array3::<u8>::zeros((1, 30, 44));
    masks.slice_mut(s![0, 0..8, 0..8]).fill(1);
    let mut dataset = InMemoryDataset::new();
    dataset.push(
        Sample {
            image: Array3::from_elem((3, 30, 44), 0.5),
            labels: InstanceLabels {
                masks,
                labels: vec![Some(7)],
                area: vec![64.0],
                iscrowd: vec![0],
                image_id: 9,
                polygons: None,
            },
        },
        "tile_9.tif".into(),
    );

    let backbone = GridBackbone::new(2);
    let results = DinoV2Inference::new(&backbone, config(true))
        .unwrap()
        .infer(Arc::new(dataset))
        .unwrap();

    let record = &results.records()[0];
    assert_eq!(record.down_sampled_masks.len(), 3);
    assert_eq!(record.down_sampled_masks[0].len(), 4);
    // Mask rows 6..14 and columns 6..14 of the padded tile fall in patch (0, 0)
    assert_abs_diff_eq!(record.down_sampled_masks[0][0], 64.0 / 196.0, epsilon = 1e-6);
    assert!(record.down_sampled_masks[1].iter().all(|&v| v == 0.0));
    assert_abs_diff_eq!(record.embeddings[1], 0.01 * 64.0 / 196.0, epsilon = 1e-6);
}

#[test]
fn test_centre_patches_of_aligned_tile() {
    // 70x70 needs no padding and yields a 5x5 grid; the mask fills patches
    // (1, 1), (1, 2), (2, 1) and (2, 2)
    let image = Array3::from_shape_fn((3, 70, 70), |(c, y, x)| {
        ((c + y + x) % 255) as f32 / 255.0
    });
    let preprocessed = PatchGridPreprocessor::new(14, true, false, "imagenet")
        .unwrap()
        .preprocess(image.view().insert_axis(Axis(0)))
        .unwrap();
    assert!(preprocessed.padding.is_zero());
    assert_eq!(preprocessed.padding, PaddingSpec::default());
    assert_eq!(
        preprocessed.grid,
        PatchGridDims {
            num_h: 5,
            num_w: 5
        }
    );

    let mut masks = Array3::<u8>::zeros((1, 70, 70));
    masks.slice_mut(s![0, 14..42, 14..42]).fill(1);
    let mut dataset = InMemoryDataset::new();
    dataset.push(
        Sample {
            image,
            labels: InstanceLabels {
                masks,
                labels: vec![Some(1)],
                area: vec![784.0],
                iscrowd: vec![0],
                image_id: 1,
                polygons: None,
            },
        },
        "tile_1.tif".into(),
    );

    let backbone = GridBackbone::new(3);
    let config = DinoV2InferConfig::builder()
        .mean_std_descriptor("imagenet")
        .average_non_masked_patches(true)
        .build()
        .unwrap();
    let results = DinoV2Inference::new(&backbone, config)
        .unwrap()
        .infer(Arc::new(dataset))
        .unwrap();

    let record = &results.records()[0];
    assert_eq!(record.down_sampled_masks.len(), 5);
    assert!(record.down_sampled_masks.iter().all(|row| row.len() == 5));
    assert_eq!(record.down_sampled_masks[1], vec![0.0, 1.0, 1.0, 0.0, 0.0]);
    assert_eq!(record.down_sampled_masks[2], vec![0.0, 1.0, 1.0, 0.0, 0.0]);
    assert!(record.down_sampled_masks[0].iter().all(|&v| v == 0.0));

    // Mean of patch tokens 6, 7, 11 and 12
    let expected: Vec<f32> = (0..3)
        .map(|d| {
            [6, 7, 11, 12]
                .iter()
                .map(|&n| GridBackbone::patch_value(n, d))
                .sum::<f32>()
                / 4.0
        })
        .collect();
    for (value, expected) in record.embeddings.iter().zip([9.0, 9.01, 9.02]) {
        assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
    }
    for (&value, &expected) in record.embeddings.iter().zip(&expected) {
        assert_abs_diff_eq!(value, expected, epsilon = 1e-5);
    }
}
