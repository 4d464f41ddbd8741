use burn::{backend::NdArray, prelude::*, tensor::Distribution};

use crate::config::{HyperParameters, TemporalFusion};
use crate::error::StcnvmError;
use crate::frames::{FrameModule, Frames};
use crate::models::{
    ConvGruConfig, DeformableFrameAlignConfig, FeatureFusionConfig, GlobalMatchConfig,
    PatchAttentionConfig, TrimapRefinerConfig,
};

type TestBackend = NdArray;

fn random<const D: usize>(shape: [usize; D]) -> Tensor<TestBackend, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

#[test]
fn test_hyperparameters_select_recurrent_cell() {
    let device = Default::default();
    let mut hyper =
        HyperParameters::from_args(["stcnvm", "--which_model", "attn_gru"]).unwrap();
    assert_eq!(hyper.temporal_fusion(), Ok(TemporalFusion::AttnGru));

    hyper.set("which_model", "focal_gru_fix").unwrap();
    let fusion = hyper.temporal_fusion().unwrap();
    assert_eq!(fusion, TemporalFusion::FocalGruResidual);
    assert!(hyper.to_string().contains(r#""which_model":"focal_gru_fix""#));

    let gru = ConvGruConfig::new(4)
        .with_fusion(fusion)
        .with_focal_window(3)
        .with_focal_level(2)
        .init::<TestBackend>(&device)
        .unwrap();
    let (out, _) = gru.forward_time_series(random([1, 2, 4, 8, 8]), None).unwrap();
    assert_eq!(out.dims(), [1, 2, 4, 8, 8]);
}

#[test]
fn test_unset_model_name_is_a_configuration_error() {
    let hyper = HyperParameters::default();

    match hyper.temporal_fusion() {
        Err(StcnvmError::InvalidConfiguration { reason }) => {
            assert!(reason.contains("NULL"));
        }
        other => panic!("Expected InvalidConfiguration error, got {other:?}"),
    }
}

#[test]
fn test_aligned_recurrence_streams_in_chunks() {
    let device = Default::default();
    let align = DeformableFrameAlignConfig::new(4)
        .init::<TestBackend>(&device)
        .unwrap();
    let gru = ConvGruConfig::new(4)
        .with_fusion(TemporalFusion::DeformableGru)
        .init::<TestBackend>(&device)
        .unwrap();
    let x = random([1, 4, 4, 6, 6]);

    let (aligned, _) = align.forward_time_series(x.clone(), None).unwrap();
    let (whole, _) = gru.forward_time_series(aligned, None).unwrap();

    // Carry the last frame and the hidden state from one chunk to the next.
    let mut carried_frame = None;
    let mut hidden = None;
    let mut chunks = Vec::new();
    for start in [0, 2] {
        let chunk = x.clone().narrow(1, start, 2);
        let (aligned, last) = align.forward_time_series(chunk, carried_frame).unwrap();
        let (out, h) = gru.forward_time_series(aligned, hidden).unwrap();
        carried_frame = Some(last);
        hidden = Some(h);
        chunks.push(out);
    }

    let diff = (whole - Tensor::cat(chunks, 1)).abs().max().into_scalar();
    assert!(diff < 1e-4, "chunked stream diverged by {diff}");
}

#[test]
fn test_patch_attention_output_feeds_fusion() {
    let device = Default::default();
    let attention = PatchAttentionConfig::new()
        .with_dim(8)
        .with_attn_dim(4)
        .with_heads(2)
        .with_patch_size(4)
        .init::<TestBackend>(&device)
        .unwrap();
    let fusion = FeatureFusionConfig::new(16, 8).init::<TestBackend>(&device);
    let query = random([2, 3, 8, 8, 8]);
    let key = random([2, 3, 8, 8, 8]);

    let (attended, attn) = attention
        .forward_time_series(query.clone(), Some(key), None)
        .unwrap();
    assert_eq!(attn.dims(), [2, 2, 12, 12]);

    let fused = fusion
        .forward_frames(Frames::Sequence(Tensor::cat(vec![query, attended], 2)))
        .unwrap();
    assert_eq!(fused.dims(), vec![2, 3, 8, 8, 8]);
}

#[test]
fn test_matching_scores_drive_trimap_refinement() {
    let device = Default::default();
    let matcher = GlobalMatchConfig::new().with_stride(2).init().unwrap();
    let refiner = TrimapRefinerConfig::new().init::<TestBackend>(&device);
    let features = random([1, 2, 6, 8, 8]);
    let fine = Tensor::<TestBackend, 5>::full([1, 2, 1, 16, 16], 0.5, &device);

    // A sequence matched against itself is decided everywhere, so the coarse
    // scores are only upsampled.
    let scores = matcher
        .forward_time_series(features.clone(), features.clone())
        .unwrap();
    let refined = refiner
        .forward_time_series(scores, fine.clone(), 3, false)
        .unwrap();
    let gap = refined.neg().add_scalar(1.0).abs().max().into_scalar();
    assert!(gap < 1e-4, "refinement replaced decided scores ({gap})");

    // Scores against unrelated features fall strictly inside (0, 1) and are
    // replaced by the fine prediction.
    let scores = matcher
        .forward_time_series(features, random([1, 2, 6, 8, 8]))
        .unwrap();
    let refined = refiner.forward_time_series(scores, fine, 0, false).unwrap();
    let diff = refined.sub_scalar(0.5).abs().max().into_scalar();
    assert_eq!(diff, 0.0);
}

#[test]
fn test_layout_mismatches_are_reported() {
    let device = Default::default();
    let gru = ConvGruConfig::new(4).init::<TestBackend>(&device).unwrap();

    let result = gru.forward(Frames::Single(random([1, 3, 8, 8])), None);
    assert!(matches!(
        result,
        Err(StcnvmError::InvalidConfiguration { .. })
    ));

    let matcher = GlobalMatchConfig::new().init().unwrap();
    let result =
        matcher.forward_time_series(random([1, 2, 4, 8, 8]), random([1, 3, 4, 8, 8]));
    assert!(matches!(
        result,
        Err(StcnvmError::InvalidTensorShape { .. })
    ));
}
