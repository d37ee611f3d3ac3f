//! Segmentation losses over sigmoid outputs and the combined two-head objective.

use crate::config::LossKind;
use crate::metrics::StepMetrics;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::UNetOutput;
use patch_dataset::PatchBatch;

const EPS: f32 = 1e-7;
const DICE_SMOOTH: f64 = 1.0;

/// Mean binary cross-entropy; `positive_weight` scales the foreground term.
pub fn binary_cross_entropy<B: Backend, const D: usize>(
    pred: Tensor<B, D>,
    target: Tensor<B, D>,
    positive_weight: f64,
) -> Tensor<B, 1> {
    let pred = pred.clamp(EPS, 1.0 - EPS);
    let pos = target
        .clone()
        .mul(pred.clone().log())
        .mul_scalar(positive_weight);
    let neg = target
        .neg()
        .add_scalar(1.0)
        .mul(pred.neg().add_scalar(1.0).log());
    pos.add(neg).neg().mean()
}

/// Soft Dice loss over the whole batch.
pub fn dice_loss<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    let intersection = pred.clone().mul(target.clone()).sum();
    let total = pred.sum().add(target.sum());
    intersection
        .mul_scalar(2.0)
        .add_scalar(DICE_SMOOTH)
        .div(total.add_scalar(DICE_SMOOTH))
        .neg()
        .add_scalar(1.0)
}

/// Share of voxels where the thresholded prediction matches the label.
pub fn binary_accuracy<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> f64 {
    let pred = pred.into_data().to_vec::<f32>().unwrap_or_default();
    let target = target.into_data().to_vec::<f32>().unwrap_or_default();
    if pred.is_empty() {
        return 0.0;
    }
    let hits = pred
        .iter()
        .zip(&target)
        .filter(|(p, t)| (**p > 0.5) == (**t > 0.5))
        .count();
    hits as f64 / pred.len() as f64
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or(f32::NAN) as f64
}

/// Loss settings shared by training steps and validation checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objective {
    pub kind: LossKind,
    /// Foreground weight of the weighted cross-entropy.
    pub fn_class_weight: f64,
    pub main_weight: f64,
    pub aux_weight: f64,
}

impl Objective {
    pub fn head_loss<B: Backend>(&self, pred: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 1> {
        match self.kind {
            LossKind::BinaryCrossEntropy => binary_cross_entropy(pred, target, 1.0),
            LossKind::WeightedBinaryCrossEntropy => {
                binary_cross_entropy(pred, target, self.fn_class_weight)
            }
            LossKind::Dice => dice_loss(pred, target),
        }
    }

    /// Combined loss tensor plus its scalar metrics. Without an auxiliary head the
    /// main loss is the whole objective.
    pub fn evaluate<B: Backend>(
        &self,
        output: UNetOutput<B>,
        batch: &PatchBatch<B>,
    ) -> (Tensor<B, 1>, StepMetrics) {
        let main_accuracy = binary_accuracy(output.main.clone(), batch.labels.clone());
        let main_loss = self.head_loss(output.main, batch.labels.clone());
        let main_value = scalar(main_loss.clone());
        match output.aux {
            Some(aux) => {
                let aux_accuracy = binary_accuracy(aux.clone(), batch.aux_labels.clone());
                let aux_loss = self.head_loss(aux, batch.aux_labels.clone());
                let aux_value = scalar(aux_loss.clone());
                let total = main_loss
                    .mul_scalar(self.main_weight)
                    .add(aux_loss.mul_scalar(self.aux_weight));
                let metrics = StepMetrics {
                    loss: scalar(total.clone()),
                    main_loss: main_value,
                    main_accuracy,
                    aux_loss: Some(aux_value),
                    aux_accuracy: Some(aux_accuracy),
                };
                (total, metrics)
            }
            None => {
                let metrics = StepMetrics {
                    loss: main_value,
                    main_loss: main_value,
                    main_accuracy,
                    aux_loss: None,
                    aux_accuracy: None,
                };
                (main_loss, metrics)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn t(values: &[f32]) -> Tensor<TestBackend, 1> {
        Tensor::from_floats(values, &Default::default())
    }

    #[test]
    fn confident_correct_predictions_cost_little() {
        let good = scalar(binary_cross_entropy(t(&[0.999, 0.001]), t(&[1.0, 0.0]), 1.0));
        let bad = scalar(binary_cross_entropy(t(&[0.001, 0.999]), t(&[1.0, 0.0]), 1.0));
        assert!(good < 0.01);
        assert!(bad > 5.0);
    }

    #[test]
    fn positive_weight_scales_foreground_term_only() {
        let plain = scalar(binary_cross_entropy(t(&[0.5, 0.5]), t(&[1.0, 0.0]), 1.0));
        let weighted = scalar(binary_cross_entropy(t(&[0.5, 0.5]), t(&[1.0, 0.0]), 3.0));
        // ln 2 per voxel, foreground counted three times
        assert!((plain - std::f64::consts::LN_2).abs() < 1e-4);
        assert!((weighted - 2.0 * std::f64::consts::LN_2).abs() < 1e-4);
    }

    #[test]
    fn dice_is_zero_for_perfect_overlap() {
        assert!(scalar(dice_loss(t(&[1.0, 0.0, 1.0]), t(&[1.0, 0.0, 1.0]))).abs() < 1e-6);
        let disjoint = scalar(dice_loss(t(&[1.0, 0.0]), t(&[0.0, 1.0])));
        assert!((disjoint - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn accuracy_thresholds_at_half() {
        assert_eq!(binary_accuracy(t(&[0.9, 0.2, 0.6, 0.4]), t(&[1.0, 0.0, 0.0, 0.0])), 0.75);
    }
}
