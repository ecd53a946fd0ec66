use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cell indices grouped by a categorical label (sample id, group, cluster).
///
/// Indices of the cells carrying `labels[i]` are stored contiguously in
/// `indices[offsets[i]..offsets[i + 1]]`. Every index appears exactly once, so
/// the groups always form a set partition of the labelled cells.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LabelClass {
    pub labels: Vec<String>,
    pub offsets: Vec<usize>,
    pub indices: Vec<usize>,
}

impl LabelClass {
    pub fn new(labels: Vec<String>, offsets: Vec<usize>, indices: Vec<usize>) -> Result<LabelClass, Error> {
        if labels.len() != offsets.len() {
            return Err(format_err!("Label and offsets length unequal"));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets.last().is_some_and(|&o| o > indices.len()) {
            return Err(format_err!("LabelClass offsets are not monotone"));
        }
        Ok(LabelClass {
            labels,
            offsets,
            indices,
        })
    }

    pub fn blank() -> LabelClass {
        LabelClass::default()
    }

    /// Group positions `0..values.len()` by value. Labels are ordered by first
    /// appearance, and indices within a label stay ascending.
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> LabelClass {
        let mut order: HashMap<&str, usize> = HashMap::new();
        let mut labels = Vec::new();
        let mut members: Vec<Vec<usize>> = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let v = v.as_ref();
            let slot = *order.entry(v).or_insert_with(|| {
                labels.push(v.to_string());
                members.push(Vec::new());
                labels.len() - 1
            });
            members[slot].push(i);
        }

        let mut offsets = Vec::with_capacity(labels.len());
        let mut indices = Vec::with_capacity(values.len());
        for m in members {
            offsets.push(indices.len());
            indices.extend(m);
        }
        LabelClass {
            labels,
            offsets,
            indices,
        }
    }

    /// Number of distinct labels.
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Total number of labelled cells.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Get the index of a label string. Returns None if the label string is not found.
    fn get_label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|x| x == label)
    }

    fn slice(&self, idx: usize) -> &[usize] {
        let offset = self.offsets[idx];
        if idx == self.offsets.len() - 1 {
            &self.indices[offset..]
        } else {
            &self.indices[offset..self.offsets[idx + 1]]
        }
    }

    /// Returns either the set of indices pointing to the given label or None is the label doesn't exist.
    pub fn get_indices(&self, label: &str) -> Option<&[usize]> {
        self.get_label_index(label).map(|idx| self.slice(idx))
    }

    /// Iterate over `(label, indices)` pairs in label order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> + '_ {
        self.labels
            .iter()
            .enumerate()
            .map(move |(i, l)| (l.as_str(), self.slice(i)))
    }

    /// Per-position label index, the inverse of the grouping. Positions not
    /// covered by any label get `usize::MAX`.
    pub fn codes(&self, n: usize) -> Vec<usize> {
        let mut codes = vec![usize::MAX; n];
        for (label_idx, (_, members)) in self.iter().enumerate() {
            for &m in members {
                if m < n {
                    codes[m] = label_idx;
                }
            }
        }
        codes
    }
}
