use patch_dataset::{
    AugmentConfig, AugmentMode, AuxTarget, DatasetError, InMemoryLoader, OfflineAugmenter,
    OnlineAugmenter, PatchSampler, SamplerConfig, SamplingError, SliceIndex, SplitRole, Volume,
    VolumeLoader, VolumePair, VolumeSet,
};

fn pair_with_voxel(dims: [usize; 3], voxel: Option<[usize; 3]>) -> VolumePair {
    let n = dims.iter().product::<usize>();
    let image = Volume::new(dims, (0..n).map(|v| (v % 17) as f32).collect()).unwrap();
    let mut label = Volume::zeros(dims);
    if let Some([z, y, x]) = voxel {
        label.set(z, y, x, 1.0);
    }
    VolumePair {
        image,
        label,
        aux_label: None,
    }
}

fn single_voxel_set() -> VolumeSet {
    InMemoryLoader::new()
        .with(1, pair_with_voxel([4, 16, 16], Some([2, 5, 7])))
        .with(2, pair_with_voxel([4, 16, 16], None))
        .load(&[1, 2])
        .unwrap()
}

fn sampler(set: &VolumeSet, cfg: SamplerConfig) -> PatchSampler {
    PatchSampler::new(cfg, SliceIndex::build(set))
}

fn cfg(augment: AugmentMode) -> SamplerConfig {
    SamplerConfig {
        patch_size: [2, 8, 8],
        augment,
        seed: Some(7),
        ..Default::default()
    }
}

#[test]
fn negative_patches_hold_no_foreground() {
    let set = single_voxel_set();
    for mode in [AugmentMode::Online, AugmentMode::Offline] {
        let mut s = sampler(&set, cfg(mode));
        for _ in 0..40 {
            let patch = s.sample_negative(&set, SplitRole::Training).unwrap();
            assert_eq!(patch.dims(), [2, 8, 8]);
            assert!(!patch.is_positive());
        }
    }
}

#[test]
fn positive_patches_hold_foreground() {
    let set = single_voxel_set();
    for mode in [AugmentMode::Online, AugmentMode::Offline] {
        let mut s = sampler(&set, cfg(mode));
        for _ in 0..40 {
            let patch = s.sample_positive(&set, SplitRole::Validation).unwrap();
            assert_eq!(patch.dims(), [2, 8, 8]);
            assert_eq!(patch.label.positive_count(), 1);
        }
    }
}

#[test]
fn augmented_positive_patches_keep_foreground() {
    let set = single_voxel_set();
    let aug = AugmentConfig {
        flip_prob: 0.5,
        rot90_prob: 0.5,
        noise_prob: 0.5,
        ..Default::default()
    };
    let mut online = sampler(&set, cfg(AugmentMode::Online)).with_online(OnlineAugmenter::new(aug.clone()));
    let mut offline =
        sampler(&set, cfg(AugmentMode::Offline)).with_offline(OfflineAugmenter::new(aug, 4, 3));
    for _ in 0..20 {
        assert!(online.sample_positive(&set, SplitRole::Training).unwrap().is_positive());
        assert!(offline.sample_positive(&set, SplitRole::Training).unwrap().is_positive());
    }
}

#[test]
fn fully_positive_labels_exhaust_negative_retries() {
    let mut pair = pair_with_voxel([2, 8, 8], None);
    pair.label = pair.label.map(|_| 1.0);
    let set = VolumeSet::from_pairs(vec![5], vec![pair]);
    for mode in [AugmentMode::Online, AugmentMode::Offline] {
        let mut s = sampler(
            &set,
            SamplerConfig {
                max_retries: 8,
                ..cfg(mode)
            },
        );
        let err = s.sample_negative(&set, SplitRole::Training).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Sampling(SamplingError::NoNegativePatch { attempts: 8 })
        ));
    }
}

#[test]
fn positive_draw_without_foreground_fails_fast() {
    let set = VolumeSet::from_pairs(vec![1], vec![pair_with_voxel([2, 8, 8], None)]);
    let mut s = sampler(&set, cfg(AugmentMode::Online));
    assert!(matches!(
        s.sample_positive(&set, SplitRole::Training),
        Err(DatasetError::Sampling(SamplingError::NoPositiveImage))
    ));
    let empty = VolumeSet::default();
    assert!(matches!(
        s.sample(&empty, SplitRole::Training),
        Err(DatasetError::Sampling(SamplingError::EmptySet))
    ));
}

#[test]
fn foreground_in_the_last_slice_is_sampled() {
    let set = VolumeSet::from_pairs(vec![1], vec![pair_with_voxel([5, 8, 8], Some([4, 3, 3]))]);
    for mode in [AugmentMode::Online, AugmentMode::Offline] {
        let mut s = sampler(
            &set,
            SamplerConfig {
                patch_size: [2, 4, 4],
                ..cfg(mode)
            },
        );
        for _ in 0..10 {
            let patch = s.sample_positive(&set, SplitRole::Training).unwrap();
            assert_eq!(patch.label.positive_count(), 1);
            assert!(patch.label.slice_has_positive(1));
        }
    }
}

#[test]
fn positive_images_are_drawn_evenly() {
    let constant = |value: f32, positive_slices: &[usize]| {
        let dims = [8, 4, 4];
        let mut label = Volume::zeros(dims);
        for z in positive_slices {
            label.set(*z, 1, 1, 1.0);
        }
        VolumePair {
            image: Volume::new(dims, vec![value; 128]).unwrap(),
            label,
            aux_label: None,
        }
    };
    let set = VolumeSet::from_pairs(
        vec![1, 2],
        vec![constant(1.0, &[0, 1, 2, 3, 4, 5, 6, 7]), constant(2.0, &[3])],
    );
    let mut s = sampler(
        &set,
        SamplerConfig {
            patch_size: [1, 4, 4],
            ..cfg(AugmentMode::Online)
        },
    );
    let draws = 400;
    let from_sparse = (0..draws)
        .map(|_| s.sample_positive(&set, SplitRole::Training).unwrap())
        .filter(|patch| patch.image.data()[0] == 2.0)
        .count();
    assert!((120..=280).contains(&from_sparse), "{from_sparse} of {draws}");
}

#[test]
fn reseeding_replays_the_stream() {
    let set = single_voxel_set();
    let mut s = sampler(&set, cfg(AugmentMode::Online));
    s.reseed(11);
    let first = s.sample_batch(&set, 4, SplitRole::Training).unwrap();
    s.sample_batch(&set, 3, SplitRole::Training).unwrap();
    s.reseed(11);
    assert_eq!(s.sample_batch(&set, 4, SplitRole::Training).unwrap(), first);
}

#[test]
fn small_volumes_are_rescaled_to_patch_size() {
    let set = VolumeSet::from_pairs(vec![1], vec![pair_with_voxel([2, 4, 4], Some([1, 1, 2]))]);
    let mut s = sampler(&set, cfg(AugmentMode::Online));
    let positive = s.sample_positive(&set, SplitRole::Training).unwrap();
    assert_eq!(positive.dims(), [2, 8, 8]);
    assert!(positive.is_positive());
    assert!(positive.label.data().iter().all(|v| *v == 0.0 || *v == 1.0));
}

#[test]
fn artificial_positives_serve_training_only() {
    let set = VolumeSet::from_pairs(vec![1], vec![pair_with_voxel([2, 8, 8], None)]);
    let pool = [pair_with_voxel([2, 8, 8], Some([0, 3, 3]))];
    let config = SamplerConfig {
        artificial_fraction: 1.0,
        ..cfg(AugmentMode::Offline)
    };
    let mut s = sampler(&set, config).with_offline(OfflineAugmenter::default().with_artificial(pool));
    assert!(s.sample_positive(&set, SplitRole::Training).unwrap().is_positive());
    assert!(s.sample_positive(&set, SplitRole::Validation).is_err());
}

#[test]
fn seeded_samplers_repeat_their_draws() {
    let set = single_voxel_set();
    let mut a = sampler(&set, cfg(AugmentMode::Online));
    let mut b = sampler(&set, cfg(AugmentMode::Online));
    let pa = a.sample_batch(&set, 6, SplitRole::Training).unwrap();
    let pb = b.sample_batch(&set, 6, SplitRole::Training).unwrap();
    assert_eq!(pa, pb);
}

#[test]
fn aux_input_and_aux_target() {
    let set = single_voxel_set();
    let mut s = sampler(
        &set,
        SamplerConfig {
            aux_input: true,
            ..cfg(AugmentMode::Online)
        },
    );
    let patch = s.sample_positive(&set, SplitRole::Training).unwrap();
    assert_eq!(patch.aux_input.as_ref().map(Volume::dims), Some([2, 8, 8]));
    assert_eq!(patch.aux_label, patch.label);

    let mut missing = sampler(
        &set,
        SamplerConfig {
            aux_target: AuxTarget::AuxLabel,
            ..cfg(AugmentMode::Online)
        },
    );
    assert!(matches!(
        missing.sample_positive(&set, SplitRole::Training),
        Err(DatasetError::MissingAuxLabels)
    ));
}

#[test]
fn variable_patches_follow_network_multiples() {
    let set = VolumeSet::from_pairs(vec![1], vec![pair_with_voxel([2, 10, 14], Some([0, 4, 4]))]);
    let mut s = sampler(
        &set,
        SamplerConfig {
            variable_patch_size: true,
            unet_depth: 2,
            ..cfg(AugmentMode::Online)
        },
    );
    let patch = s.sample_positive(&set, SplitRole::Training).unwrap();
    assert_eq!(patch.dims(), [2, 12, 16]);
}
