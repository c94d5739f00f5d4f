use anyhow::{anyhow, Result};
use burn::prelude::*;
use ndarray::{Array1, Array3, Zip};

/// Running mean-IoU state over per-class pixel counts.
///
/// Labels outside `0..class_count` are excluded from every count, so
/// scoring the 6 semantic land-cover classes with `class_count = 6` never
/// lets the `unknown` class influence the mean.
pub struct MeanIouMetric {
    intersection: Array1<u64>,
    pred_count: Array1<u64>,
    truth_count: Array1<u64>,
    class_count: usize,
}

impl MeanIouMetric {
    pub fn new(class_count: usize) -> Self {
        Self {
            intersection: Array1::zeros(class_count),
            pred_count: Array1::zeros(class_count),
            truth_count: Array1::zeros(class_count),
            class_count,
        }
    }

    pub fn reset(&mut self) {
        self.intersection.fill(0);
        self.pred_count.fill(0);
        self.truth_count.fill(0);
    }

    /// Accumulate one batch of same-shaped label maps.
    pub fn update(&mut self, pred: &Array3<i64>, truth: &Array3<i64>) {
        assert_eq!(
            pred.shape(),
            truth.shape(),
            "prediction and ground-truth label maps must have the same shape"
        );

        let classes = self.class_count as i64;
        Zip::from(pred).and(truth).for_each(|&p, &t| {
            if (0..classes).contains(&p) {
                self.pred_count[p as usize] += 1;
            }
            if (0..classes).contains(&t) {
                self.truth_count[t as usize] += 1;
                if p == t {
                    self.intersection[t as usize] += 1;
                }
            }
        });
    }

    /// Mean IoU over classes with a non-zero union; 0.0 with no counts.
    pub fn get_score(&self) -> f64 {
        let mut sum = 0.0;
        let mut scored = 0usize;
        for class in 0..self.class_count {
            let union = self.pred_count[class] + self.truth_count[class] - self.intersection[class];
            if union > 0 {
                sum += self.intersection[class] as f64 / union as f64;
                scored += 1;
            }
        }
        if scored == 0 {
            0.0
        } else {
            sum / scored as f64
        }
    }

    pub fn print_score(&self) -> String {
        format!("{:.5}", self.get_score())
    }

    pub fn name(&self) -> &'static str {
        "mean_iou"
    }
}

/// One-shot mean IoU over a whole set of label maps.
pub fn mean_iou(pred: &Array3<i64>, truth: &Array3<i64>, class_count: usize) -> f64 {
    let mut metric = MeanIouMetric::new(class_count);
    metric.update(pred, truth);
    metric.get_score()
}

/// Read a `[batch, height, width]` label tensor back as a host array.
pub fn label_array<B: Backend>(labels: Tensor<B, 3, Int>) -> Result<Array3<i64>> {
    let [batch, height, width] = labels.dims();
    let values = labels
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow!("label tensor readback failed: {e:?}"))?;

    Ok(Array3::from_shape_vec((batch, height, width), values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn plane(values: Vec<i64>, height: usize, width: usize) -> Array3<i64> {
        Array3::from_shape_vec((1, height, width), values).unwrap()
    }

    #[test]
    fn zero_updates_score_zero() {
        let metric = MeanIouMetric::new(6);
        assert_eq!(metric.get_score(), 0.0);
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let mut metric = MeanIouMetric::new(6);
        let labels = plane(vec![0, 1, 2, 3], 2, 2);
        metric.update(&labels, &labels.clone());
        assert_eq!(metric.get_score(), 1.0);
    }

    #[test]
    fn half_overlap_single_class() {
        let mut metric = MeanIouMetric::new(6);
        // pred covers 2 pixels of class 0, truth covers 2, overlapping in 1:
        // IoU = 1 / (2 + 2 - 1) = 1/3.
        let pred = plane(vec![0, 0, 5, 5], 2, 2);
        let truth = plane(vec![0, 5, 0, 5], 2, 2);
        metric.update(&pred, &truth);
        let expected = (1.0 / 3.0 + 1.0 / 3.0) / 2.0;
        assert!((metric.get_score() - expected).abs() < 1e-12);
    }

    #[test]
    fn labels_outside_range_are_ignored() {
        let mut metric = MeanIouMetric::new(6);
        // Class 6 (unknown) appears in both maps but must not be scored.
        let pred = plane(vec![6, 6, 1, 1], 2, 2);
        let truth = plane(vec![6, 6, 1, 1], 2, 2);
        metric.update(&pred, &truth);
        assert_eq!(metric.get_score(), 1.0);

        let mut only_unknown = MeanIouMetric::new(6);
        only_unknown.update(&plane(vec![6], 1, 1), &plane(vec![6], 1, 1));
        assert_eq!(only_unknown.get_score(), 0.0);
    }

    #[test]
    fn zero_union_classes_are_excluded() {
        let mut metric = MeanIouMetric::new(6);
        // Only class 2 has any pixels; the other five must not drag the
        // mean toward zero.
        let labels = plane(vec![2, 2, 2, 2], 2, 2);
        metric.update(&labels, &labels.clone());
        assert_eq!(metric.get_score(), 1.0);
    }

    #[test]
    fn reset_clears_counts() {
        let mut metric = MeanIouMetric::new(6);
        let labels = plane(vec![0, 1, 2, 3], 2, 2);
        metric.update(&labels, &labels.clone());
        metric.reset();
        assert_eq!(metric.get_score(), 0.0);
    }

    #[test]
    fn incremental_updates_match_one_shot_score() {
        let first_pred = plane(vec![0, 1, 1, 2], 2, 2);
        let first_truth = plane(vec![0, 1, 2, 2], 2, 2);
        let second_pred = plane(vec![3, 3, 0, 1], 2, 2);
        let second_truth = plane(vec![3, 0, 0, 1], 2, 2);

        let mut metric = MeanIouMetric::new(6);
        metric.update(&first_pred, &first_truth);
        metric.update(&second_pred, &second_truth);

        let pred = ndarray::concatenate(
            ndarray::Axis(0),
            &[first_pred.view(), second_pred.view()],
        )
        .unwrap();
        let truth = ndarray::concatenate(
            ndarray::Axis(0),
            &[first_truth.view(), second_truth.view()],
        )
        .unwrap();

        assert_eq!(metric.get_score(), mean_iou(&pred, &truth, 6));
    }

    #[test]
    fn print_score_formats_the_mean() {
        let mut metric = MeanIouMetric::new(6);
        let labels = plane(vec![4, 4, 4, 4], 2, 2);
        metric.update(&labels, &labels.clone());
        assert_eq!(metric.print_score(), "1.00000");
        assert_eq!(metric.name(), "mean_iou");
    }

    #[test]
    fn label_array_round_trips_tensor_labels() {
        type B = burn::backend::NdArray<f32>;
        let device = Default::default();
        let labels = Tensor::<B, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1, 2, 3, 4, 5], [1, 2, 3]),
            &device,
        );
        let array = label_array(labels).unwrap();
        assert_eq!(array, array![[[0i64, 1, 2], [3, 4, 5]]]);
    }
}
