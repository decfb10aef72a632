//! Dataset accessor and data loader

use rand::{RngCore, seq::SliceRandom};
use thiserror::Error;

use crate::values::Value;

/// Errors for event tables and data loaders
#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    #[error("A table needs at least one event with at least one feature")]
    EmptyTable,
    #[error("Flat data of length {len} cannot be split into rows of {n_features} features")]
    RaggedTable { len: usize, n_features: usize },
    #[error("Row {row} has {got} features, expected {expected}")]
    RowLengthMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("Targets must have the same length as the data")]
    TargetLengthMismatch { target_len: usize, data_len: usize },
    #[error("Log transform needs positive targets, got {value} at row {row}")]
    NonPositiveTarget { row: usize, value: f32 },
    #[error("Validation fraction must lie in (0, 1) and leave both splits non-empty, got {0}")]
    InvalidSplit(f32),
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error("Invalid event generator settings: {0}")]
    InvalidGenerator(String),
}

/// Events in memory, one feature vector and one scalar target per event
///
/// The table is never modified after construction, `get(i)` always returns the same pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    samples: Vec<Vec<f32>>,
    targets: Vec<f32>,
    n_features: usize,
}

impl EventTable {
    pub fn new(samples: Vec<Vec<f32>>, targets: Vec<f32>) -> Result<Self, DataError> {
        let n_features = samples.first().map(Vec::len).unwrap_or(0);
        if n_features == 0 {
            return Err(DataError::EmptyTable);
        }
        if let Some((row, sample)) = samples
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() != n_features)
        {
            return Err(DataError::RowLengthMismatch {
                row,
                expected: n_features,
                got: sample.len(),
            });
        }
        if samples.len() != targets.len() {
            return Err(DataError::TargetLengthMismatch {
                target_len: targets.len(),
                data_len: samples.len(),
            });
        }
        Ok(Self {
            samples,
            targets,
            n_features,
        })
    }

    /// Builds a table from row-major data of shape `(targets.len(), n_features)`
    pub fn from_flat(
        values: &[f32],
        n_features: usize,
        targets: Vec<f32>,
    ) -> Result<Self, DataError> {
        if n_features == 0 || values.is_empty() {
            return Err(DataError::EmptyTable);
        }
        if values.len() % n_features != 0 {
            return Err(DataError::RaggedTable {
                len: values.len(),
                n_features,
            });
        }
        let samples = values.chunks(n_features).map(<[f32]>::to_vec).collect();
        Self::new(samples, targets)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn get(&self, index: usize) -> Option<(&[f32], f32)> {
        Some((self.samples.get(index)?.as_slice(), self.targets[index]))
    }

    pub fn samples(&self) -> &[Vec<f32>] {
        &self.samples
    }

    pub fn targets(&self) -> &[f32] {
        &self.targets
    }

    /// A new table with only the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            samples: indices.iter().map(|&i| self.samples[i].clone()).collect(),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
            n_features: self.n_features,
        }
    }

    /// Same samples with new targets, e.g. after transforming them
    pub fn with_targets(&self, targets: Vec<f32>) -> Result<Self, DataError> {
        Self::new(self.samples.clone(), targets)
    }
}

/// Splits off a random validation set holding `val_fraction` of the events
pub fn train_val_split(
    table: &EventTable,
    val_fraction: f32,
    rng: &mut dyn RngCore,
) -> Result<(EventTable, EventTable), DataError> {
    let n_val = (table.len() as f32 * val_fraction).round() as usize;
    if !(val_fraction > 0.0 && val_fraction < 1.0) || n_val == 0 || n_val >= table.len() {
        return Err(DataError::InvalidSplit(val_fraction));
    }
    let mut indices = (0..table.len()).collect::<Vec<_>>();
    indices.shuffle(rng);
    let (val, train) = indices.split_at(n_val);
    Ok((table.select(train), table.select(val)))
}

/// Data loader, returns batches of samples and targets optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<Value>>,
    targets: Vec<Value>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(
        table: &EventTable,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::InvalidBatchSize);
        }
        let data = table
            .samples()
            .iter()
            .map(|d| d.iter().map(|v| Value::new(*v)).collect())
            .collect();
        let targets = table.targets().iter().map(|t| Value::new(*t)).collect();
        Ok(Self {
            data,
            targets,
            batch_size,
            shuffle,
            drop_last,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches yielded per pass over the data
    pub fn n_batches(&self) -> usize {
        if self.drop_last {
            self.data.len() / self.batch_size
        } else {
            self.data.len().div_ceil(self.batch_size)
        }
    }

    /// Iterates over the batches, shuffled with `rng` if the loader shuffles
    pub fn iter(&self, rng: &mut dyn RngCore) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            data: &self.data,
            targets: &self.targets,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of samples and targets until the end of the dataset
pub struct DataLoaderIterator<'a> {
    data: &'a [Vec<Value>],
    targets: &'a [Value],
    batch_size: usize,
    drop_last: bool,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

/// Rows of one batch and their targets
pub type Batch = (Vec<Vec<Value>>, Vec<Value>);

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.curr_iter);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = self.curr_iter + remaining.min(self.batch_size);
        let batch = &self.indices[self.curr_iter..end];
        let batch_data = batch.iter().map(|&i| self.data[i].clone()).collect();
        let batch_targets = batch.iter().map(|&i| self.targets[i].clone()).collect();
        self.curr_iter = end;
        Some((batch_data, batch_targets))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn table() -> EventTable {
        EventTable::new(
            vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
            vec![10.0, 20.0, 30.0],
        )
        .unwrap()
    }

    fn targets(batch: &Batch) -> Vec<f32> {
        batch.1.iter().map(Value::data).collect()
    }

    #[test]
    fn test_table_access() {
        let table = table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.n_features(), 2);
        assert_eq!(table.get(1), Some(([3.0, 4.0].as_slice(), 20.0)));
        assert_eq!(table.get(1), table.get(1));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn test_from_flat() {
        let table = EventTable::from_flat(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, vec![10.0, 20.0, 30.0])
            .unwrap();
        assert_eq!(table, self::table());

        assert_eq!(
            EventTable::from_flat(&[1.0, 2.0, 3.0], 2, vec![1.0]),
            Err(DataError::RaggedTable {
                len: 3,
                n_features: 2
            })
        );
        assert_eq!(
            EventTable::from_flat(&[1.0, 2.0], 2, vec![1.0, 2.0]),
            Err(DataError::TargetLengthMismatch {
                target_len: 2,
                data_len: 1
            })
        );
        assert_eq!(
            EventTable::from_flat(&[], 2, vec![]),
            Err(DataError::EmptyTable)
        );
    }

    #[test]
    fn test_ragged_rows() {
        let err = EventTable::new(vec![vec![1.0, 2.0], vec![1.0]], vec![0.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            DataError::RowLengthMismatch {
                row: 1,
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_dataloader_keeps_partial_batch() {
        let loader = DataLoader::new(&table(), 2, false, false).unwrap();
        assert_eq!(loader.n_batches(), 2);
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let batches = loader.iter(&mut rng).collect::<Vec<_>>();
        assert_eq!(batches.len(), 2);
        assert_eq!(targets(&batches[0]), vec![10.0, 20.0]);
        assert_eq!(targets(&batches[1]), vec![30.0]);
        assert_eq!(
            batches[0].0[1].iter().map(Value::data).collect::<Vec<_>>(),
            vec![3.0, 4.0]
        );
    }

    #[test]
    fn test_dataloader_drop_last() {
        let loader = DataLoader::new(&table(), 2, false, true).unwrap();
        assert_eq!(loader.n_batches(), 1);
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert_eq!(loader.iter(&mut rng).count(), 1);
        assert!(matches!(
            DataLoader::new(&table(), 0, false, false),
            Err(DataError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_dataloader_shuffle() {
        let loader = DataLoader::new(&table(), 3, true, false).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut a = targets(&loader.iter(&mut rng).next().unwrap());
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let b = targets(&loader.iter(&mut rng).next().unwrap());
        // seeded shuffles repeat, and every event appears exactly once
        assert_eq!(a, b);
        a.sort_by(f32::total_cmp);
        assert_eq!(a, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_train_val_split() {
        let samples = (0..10).map(|i| vec![i as f32]).collect();
        let table = EventTable::new(samples, (0..10).map(|i| i as f32).collect()).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let (train, val) = train_val_split(&table, 0.3, &mut rng).unwrap();
        assert_eq!(train.len(), 7);
        assert_eq!(val.len(), 3);

        let mut all = train
            .targets()
            .iter()
            .chain(val.targets())
            .copied()
            .collect::<Vec<_>>();
        all.sort_by(f32::total_cmp);
        assert_eq!(all, table.targets());
        for (sample, target) in train.samples().iter().zip(train.targets()) {
            assert_eq!(sample[0], *target);
        }

        assert!(train_val_split(&table, 0.0, &mut rng).is_err());
        assert!(train_val_split(&table, 1.0, &mut rng).is_err());
    }
}
