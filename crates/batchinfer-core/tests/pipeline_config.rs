use batchinfer_core::config::{
    gpu_share_units, ColorMode, ConfigError, Normalization, PipelineConfig, PoolPolicy,
    PoolPolicyError,
};

fn base() -> PipelineConfig {
    PipelineConfig::new("s3://bucket/imagenette/train/", "/tmp/predictions")
}

#[test]
fn default_config_is_valid() {
    assert_eq!(base().validate(), Ok(()));
    assert_eq!(base().tensor_shape(), [3, 224, 224]);
}

#[test]
fn crop_must_fit_decoded_image() {
    let mut cfg = base();
    cfg.crop_size = 300;
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::CropTooLarge { crop: 300, .. })
    ));
}

#[test]
fn zero_shards_rejected() {
    let mut cfg = base();
    cfg.num_shards = 0;
    assert_eq!(
        cfg.validate(),
        Err(ConfigError::Zero {
            field: "num_shards"
        })
    );
}

#[test]
fn normalization_must_match_color_mode() {
    let mut cfg = base();
    cfg.image.mode = ColorMode::Luma;
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::ChannelMismatch { channels: 1, .. })
    ));

    cfg.normalization = Normalization {
        mean: vec![0.5],
        std: vec![0.5],
    };
    assert_eq!(cfg.validate(), Ok(()));
    assert_eq!(cfg.tensor_shape(), [1, 224, 224]);
}

#[test]
fn non_positive_std_rejected() {
    let n = Normalization {
        mean: vec![0.0, 0.0, 0.0],
        std: vec![1.0, 0.0, 1.0],
    };
    assert_eq!(
        n.validate(ColorMode::Rgb),
        Err(ConfigError::NonPositiveStd {
            index: 1,
            value: 0.0
        })
    );
}

#[test]
fn output_range_follows_constants() {
    let n = Normalization::imagenet();
    let (lo, hi) = n.output_range(0).unwrap();
    assert!((lo - (-0.485 / 0.229)).abs() < 1e-6);
    assert!((hi - (0.515 / 0.229)).abs() < 1e-6);
    assert!(n.output_range(3).is_none());
}

#[test]
fn gpu_share_accounting() {
    assert_eq!(gpu_share_units(0.0), Ok(0));
    assert_eq!(gpu_share_units(0.25), Ok(250));
    assert_eq!(gpu_share_units(1.0), Ok(1000));
    assert_eq!(gpu_share_units(2.0), Ok(2000));
    assert!(gpu_share_units(1.5).is_err());
    assert!(gpu_share_units(-0.1).is_err());
    assert!(gpu_share_units(f64::NAN).is_err());
}

#[test]
fn pool_policy_parses_all_forms() {
    assert_eq!("2".parse::<PoolPolicy>(), Ok(PoolPolicy::Fixed(2)));
    assert_eq!("fixed:3".parse::<PoolPolicy>(), Ok(PoolPolicy::Fixed(3)));
    assert_eq!(
        "bounded:1:4".parse::<PoolPolicy>(),
        Ok(PoolPolicy::Bounded { min: 1, max: 4 })
    );
    assert_eq!(
        "Unbounded:2".parse::<PoolPolicy>(),
        Ok(PoolPolicy::Unbounded { min: 2 })
    );
    assert!(matches!(
        "elastic".parse::<PoolPolicy>(),
        Err(PoolPolicyError::Parse(_))
    ));
    assert_eq!(
        "bounded:4:1".parse::<PoolPolicy>(),
        Err(PoolPolicyError::MinAboveMax { min: 4, max: 1 })
    );
    assert_eq!("0".parse::<PoolPolicy>(), Err(PoolPolicyError::ZeroWorkers));
}

#[test]
fn pool_policy_bounds() {
    assert_eq!(PoolPolicy::Fixed(2).max_workers(16), 2);
    assert_eq!(PoolPolicy::Bounded { min: 1, max: 4 }.max_workers(16), 4);
    assert_eq!(PoolPolicy::Unbounded { min: 2 }.max_workers(8), 8);
    // The floor wins when resources cannot host the minimum.
    assert_eq!(PoolPolicy::Unbounded { min: 2 }.max_workers(1), 2);
    assert!(!PoolPolicy::Fixed(2).is_elastic());
    assert!(!PoolPolicy::Bounded { min: 2, max: 2 }.is_elastic());
    assert!(PoolPolicy::Unbounded { min: 1 }.is_elastic());
}

#[test]
fn pool_policy_display_parses_back() {
    for p in [
        PoolPolicy::Fixed(2),
        PoolPolicy::Bounded { min: 1, max: 3 },
        PoolPolicy::Unbounded { min: 1 },
    ] {
        assert_eq!(p.to_string().parse::<PoolPolicy>(), Ok(p));
    }
}
