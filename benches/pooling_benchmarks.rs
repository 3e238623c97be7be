use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{s, Array3, Array4};
use xprize_embed::{masked_average_batch, MaskAligner, PaddingSpec, PatchGridPreprocessor};

/// Instance masks of a square tile, each a vertical band of the image
fn band_masks(instances: usize, side: usize) -> Array3<u8> {
    let mut masks = Array3::<u8>::zeros((instances, side, side));
    let band = (side / instances).max(1);
    for (i, mut mask) in masks.outer_iter_mut().enumerate() {
        let start = (i * band).min(side - 1);
        mask.slice_mut(s![.., start..(start + band).min(side)]).fill(1);
    }
    masks
}

fn benchmark_mask_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask_alignment");
    let aligner = MaskAligner::new(14);
    for side in [224usize, 518, 1000] {
        let masks = band_masks(32, side);
        let padding = PaddingSpec::for_dims(side, side, 14);
        group.bench_with_input(BenchmarkId::from_parameter(side), &masks, |b, masks| {
            b.iter(|| aligner.align(black_box(masks.view()), padding).unwrap());
        });
    }
    group.finish();
}

fn benchmark_masked_pooling(c: &mut Criterion) {
    let mut group = c.benchmark_group("masked_pooling");
    let aligner = MaskAligner::new(14);
    for (side, dim) in [(518usize, 384usize), (518, 768), (1000, 1024)] {
        let padding = PaddingSpec::for_dims(side, side, 14);
        let occupancy = aligner.align(band_masks(64, side).view(), padding).unwrap();
        let (_, num_h, num_w) = occupancy.dim();
        let features = Array3::from_shape_fn((num_h, num_w, dim), |(h, w, d)| {
            ((h * num_w + w) as f32).sin() + d as f32 * 1e-3
        });
        group.bench_function(format!("{side}px_{dim}d"), |b| {
            b.iter(|| {
                masked_average_batch(black_box(features.view()), black_box(occupancy.view()))
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn benchmark_preprocessing(c: &mut Criterion) {
    let preprocessor = PatchGridPreprocessor::new(14, true, false, "imagenet").unwrap();
    let images = Array4::<f32>::from_elem((4, 3, 1000, 1000), 0.4);
    c.bench_function("preprocess_4x1000px", |b| {
        b.iter(|| preprocessor.preprocess(black_box(images.view())).unwrap());
    });
}

criterion_group!(
    pooling_benches,
    benchmark_mask_alignment,
    benchmark_masked_pooling,
    benchmark_preprocessing
);
criterion_main!(pooling_benches);
