//! Feature normalization and target transforms
//!
//! Statistics are always fitted on the training events and then applied unchanged to the
//! validation events.

use crate::dataloader::{DataError, EventTable};

/// Per-feature standardization to zero mean and unit variance
#[derive(Debug, Clone, PartialEq)]
pub struct Standardizer {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Standardizer {
    pub fn fit(samples: &[Vec<f32>]) -> Result<Self, DataError> {
        let n_features = samples.first().map(Vec::len).unwrap_or(0);
        if n_features == 0 {
            return Err(DataError::EmptyTable);
        }
        for (row, sample) in samples.iter().enumerate() {
            check_row(row, sample, n_features)?;
        }
        let n = samples.len() as f64;
        let mut mean = vec![0.0f64; n_features];
        for sample in samples {
            for (m, &x) in mean.iter_mut().zip(sample) {
                *m += x as f64 / n;
            }
        }
        let mut var = vec![0.0f64; n_features];
        for sample in samples {
            for ((v, &m), &x) in var.iter_mut().zip(&mean).zip(sample) {
                *v += (x as f64 - m).powi(2) / n;
            }
        }
        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            // constant features (e.g. the beam energy split evenly) are only centered
            std: var
                .into_iter()
                .map(|v| if v > 0.0 { v.sqrt() as f32 } else { 1.0 })
                .collect(),
        })
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }

    pub fn transform_row(&self, sample: &[f32]) -> Result<Vec<f32>, DataError> {
        check_row(0, sample, self.mean.len())?;
        Ok(sample
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(x, (m, s))| (x - m) / s)
            .collect())
    }

    pub fn transform(&self, table: &EventTable) -> Result<EventTable, DataError> {
        let samples = table
            .samples()
            .iter()
            .enumerate()
            .map(|(row, s)| {
                check_row(row, s, self.mean.len())?;
                self.transform_row(s)
            })
            .collect::<Result<Vec<_>, _>>()?;
        EventTable::new(samples, table.targets().to_vec())
    }
}

/// Natural log of the targets followed by standardization
///
/// Cross sections span orders of magnitude, in log space they are well suited for a
/// Gaussian likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetTransform {
    mean: f32,
    std: f32,
}

impl TargetTransform {
    pub fn fit(targets: &[f32]) -> Result<Self, DataError> {
        let logs = log_targets(targets)?;
        let n = logs.len() as f64;
        let mean = logs.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var = logs.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;
        Ok(Self {
            mean: mean as f32,
            std: if var > 0.0 { var.sqrt() as f32 } else { 1.0 },
        })
    }

    pub fn forward(&self, targets: &[f32]) -> Result<Vec<f32>, DataError> {
        Ok(log_targets(targets)?
            .into_iter()
            .map(|x| (x - self.mean) / self.std)
            .collect())
    }

    /// Maps a transformed value back to the original scale
    pub fn inverse(&self, value: f32) -> f32 {
        (value * self.std + self.mean).exp()
    }

    /// Maps a width in transformed space to a relative width on the original scale,
    /// valid for small widths
    pub fn relative_width(&self, sigma: f32) -> f32 {
        sigma * self.std
    }

    pub fn transform(&self, table: &EventTable) -> Result<EventTable, DataError> {
        table.with_targets(self.forward(table.targets())?)
    }
}

fn check_row(row: usize, sample: &[f32], expected: usize) -> Result<(), DataError> {
    if sample.len() != expected {
        return Err(DataError::RowLengthMismatch {
            row,
            expected,
            got: sample.len(),
        });
    }
    Ok(())
}

fn log_targets(targets: &[f32]) -> Result<Vec<f32>, DataError> {
    if targets.is_empty() {
        return Err(DataError::EmptyTable);
    }
    targets
        .iter()
        .enumerate()
        .map(|(row, &value)| {
            if value > 0.0 {
                Ok(value.ln())
            } else {
                Err(DataError::NonPositiveTarget { row, value })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_standardizer() {
        let samples = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = Standardizer::fit(&samples).unwrap();
        assert_eq!(scaler.mean(), &[2.0, 5.0]);
        assert_eq!(scaler.std(), &[1.0, 1.0]);
        assert_eq!(scaler.transform_row(&[3.0, 5.0]).unwrap(), vec![1.0, 0.0]);

        let table = EventTable::new(samples, vec![1.0, 2.0]).unwrap();
        let scaled = scaler.transform(&table).unwrap();
        assert_eq!(scaled.samples(), &[vec![-1.0, 0.0], vec![1.0, 0.0]]);
        assert_eq!(scaled.targets(), table.targets());
    }

    #[test]
    fn test_standardizer_feature_mismatch() {
        let scaler = Standardizer::fit(&[vec![1.0, 2.0]]).unwrap();
        let table = EventTable::new(vec![vec![1.0]], vec![1.0]).unwrap();
        assert!(matches!(
            scaler.transform(&table),
            Err(DataError::RowLengthMismatch { .. })
        ));
        assert_eq!(Standardizer::fit(&[]), Err(DataError::EmptyTable));
    }

    #[test]
    fn test_standardizer_ragged_rows() {
        assert_eq!(
            Standardizer::fit(&[vec![1.0, 2.0], vec![3.0]]),
            Err(DataError::RowLengthMismatch {
                row: 1,
                expected: 2,
                got: 1
            })
        );
        let scaler = Standardizer::fit(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(
            scaler.transform_row(&[1.0]),
            Err(DataError::RowLengthMismatch {
                row: 0,
                expected: 2,
                got: 1
            })
        );
        assert!(scaler.transform_row(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_target_transform() {
        let targets = vec![1.0, std::f32::consts::E.powi(2)];
        let transform = TargetTransform::fit(&targets).unwrap();
        // logs are 0 and 2
        let forward = transform.forward(&targets).unwrap();
        assert_eq_float!(forward[0], -1.0, 1e-5);
        assert_eq_float!(forward[1], 1.0, 1e-5);
        assert_eq_float!(transform.inverse(forward[1]), targets[1], 1e-4);
        assert_eq_float!(transform.relative_width(0.1), 0.1, 1e-5);
    }

    #[test]
    fn test_target_transform_rejects_non_positive() {
        assert_eq!(
            TargetTransform::fit(&[1.0, 0.0]),
            Err(DataError::NonPositiveTarget { row: 1, value: 0.0 })
        );
    }
}
