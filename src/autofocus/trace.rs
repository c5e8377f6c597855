use serde::{Deserialize, Serialize};

/// Ordered `(z, sharpness)` samples of one focus search.
///
/// The two sequences always have the same length; samples are only ever added.
/// During the coarse search new heights are appended above the highest sample
/// or prepended below the lowest, so that phase keeps the trace sorted by z.
/// Refinement samples are appended in the order they are taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusTrace {
    positions: Vec<f64>,
    scores: Vec<f64>,
}

impl FocusTrace {
    /// Append a sample after the last one.
    pub fn push_back(&mut self, z: f64, score: f64) {
        self.positions.push(z);
        self.scores.push(score);
    }

    /// Insert a sample before the first one.
    pub fn push_front(&mut self, z: f64, score: f64) {
        self.positions.insert(0, z);
        self.scores.insert(0, score);
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True before the first sample.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Sampled heights in microns.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Sharpness scores, parallel to [`positions`](Self::positions).
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Lowest height while the trace is sorted.
    pub fn first_position(&self) -> Option<f64> {
        self.positions.first().copied()
    }

    /// Highest height while the trace is sorted.
    pub fn last_position(&self) -> Option<f64> {
        self.positions.last().copied()
    }

    /// Highest-scoring sample as `(z, score)`; the earliest one wins ties.
    pub fn max(&self) -> Option<(f64, f64)> {
        self.positions
            .iter()
            .zip(&self.scores)
            .fold(None, |best: Option<(f64, f64)>, (&z, &score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((z, score)),
            })
    }
}
