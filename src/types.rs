//! Per-instance inference results

use crate::error::{EmbedError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Embedding and provenance of one labeled instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Category id, `-1` when the annotation had none
    pub labels: i64,
    pub area: f32,
    pub iscrowd: bool,
    pub image_id: u64,
    /// Tile the instance was cut from
    pub tiles_paths: String,
    pub embeddings: Vec<f32>,
    /// Patch occupancy of the instance mask, `num_h` rows of `num_w` values
    pub down_sampled_masks: Vec<Vec<f32>>,
}

/// All records of a run, in dataset order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    records: Vec<ResultRecord>,
}

impl ResultSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the records of one batch
    pub fn extend<I: IntoIterator<Item = ResultRecord>>(&mut self, records: I) {
        self.records.extend(records);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultRecord> {
        self.records.iter()
    }

    /// Stack every embedding into an `(instances, D)` matrix
    ///
    /// # Errors
    /// - `ShapeMismatch` if records carry embeddings of different lengths
    pub fn embedding_matrix(&self) -> Result<Array2<f32>> {
        let dim = self.records.first().map_or(0, |r| r.embeddings.len());
        let mut matrix = Array2::<f32>::zeros((self.records.len(), dim));
        for (record, mut row) in self.records.iter().zip(matrix.outer_iter_mut()) {
            if record.embeddings.len() != dim {
                return Err(EmbedError::shape_mismatch(
                    "embedding length",
                    dim,
                    record.embeddings.len(),
                ));
            }
            row.iter_mut()
                .zip(&record.embeddings)
                .for_each(|(dst, &src)| *dst = src);
        }
        Ok(matrix)
    }

    /// Write one JSON object per line
    ///
    /// # Errors
    /// - File creation or write errors
    pub fn write_jsonl<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| EmbedError::file_io_error("create results file", path, &e))?;
        let mut writer = BufWriter::new(file);
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer
                .write_all(b"\n")
                .map_err(|e| EmbedError::file_io_error("write results file", path, &e))?;
        }
        writer
            .flush()
            .map_err(|e| EmbedError::file_io_error("flush results file", path, &e))?;
        log::info!("Wrote {} records to {}", self.records.len(), path.display());
        Ok(())
    }

    /// Read a file produced by [`ResultSet::write_jsonl`]
    ///
    /// # Errors
    /// - File read or JSON errors
    pub fn read_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| EmbedError::file_io_error("open results file", path, &e))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| EmbedError::file_io_error("read results file", path, &e))?;
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(Self { records })
    }
}

impl IntoIterator for ResultSet {
    type Item = ResultRecord;
    type IntoIter = std::vec::IntoIter<ResultRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl FromIterator<ResultRecord> for ResultSet {
    fn from_iter<I: IntoIterator<Item = ResultRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(label: i64, embedding: Vec<f32>) -> ResultRecord {
        ResultRecord {
            labels: label,
            area: 42.0,
            iscrowd: false,
            image_id: 7,
            tiles_paths: "tiles/tile_7.tif".to_string(),
            embeddings: embedding,
            down_sampled_masks: vec![vec![0.0, 0.5], vec![1.0, 0.0]],
        }
    }

    #[test]
    fn test_jsonl_uses_column_names() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("embeddings.jsonl");
        let results: ResultSet = vec![record(-1, vec![0.5, 1.5]), record(3, vec![0.0, 2.0])]
            .into_iter()
            .collect();
        results.write_jsonl(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        for column in [
            "labels",
            "area",
            "iscrowd",
            "image_id",
            "tiles_paths",
            "embeddings",
            "down_sampled_masks",
        ] {
            assert!(first.get(column).is_some(), "missing column {column}");
        }
        assert_eq!(first["labels"], -1);
        assert_eq!(ResultSet::read_jsonl(&path).unwrap(), results);
    }

    #[test]
    fn test_embedding_matrix() {
        let mut results = ResultSet::new();
        results.extend([record(1, vec![1.0, 2.0, 3.0]), record(2, vec![4.0, 5.0, 6.0])]);
        let matrix = results.embedding_matrix().unwrap();
        assert_eq!(matrix, ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));

        results.extend([record(3, vec![1.0])]);
        assert!(matches!(
            results.embedding_matrix(),
            Err(EmbedError::ShapeMismatch(_))
        ));
        assert_eq!(ResultSet::new().embedding_matrix().unwrap().dim(), (0, 0));
    }
}
