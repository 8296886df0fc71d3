//! Affinity propagation over a precomputed similarity matrix.
//!
//! Points exchange "responsibility" and "availability" messages until a stable set of exemplars
//! emerges; every point is then assigned to its most similar exemplar. The number of clusters is
//! not fixed in advance but follows from the `preference` placed on the diagonal.

use super::distance::Matrix;
use super::{Error, InvalidDampingSnafu, NotConvergedSnafu};
use rand::{rngs::StdRng, Rng, SeedableRng};
use snafu::ensure;
use std::f64::consts::PI;

/// Parameters for affinity propagation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffinityPropagation {
    /// Weight given to the previous message when updating, in `[0.5, 1)`.
    pub damping: f64,
    /// Give up after this many iterations.
    pub max_iter: usize,
    /// Stop once the exemplars have not changed for this many iterations.
    pub convergence_iter: usize,
    /// Self-similarity of every point. Larger values produce more clusters. Defaults to the median
    /// similarity.
    pub preference: Option<f64>,
    /// Seed for the noise used to break ties between equally similar points.
    pub random_state: u64,
}

impl Default for AffinityPropagation {
    fn default() -> Self {
        Self {
            damping: 0.5,
            max_iter: 1000,
            convergence_iter: 15,
            preference: None,
            random_state: 0,
        }
    }
}

/// The result of clustering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clustering {
    /// The cluster of each point, numbered from 0 without gaps.
    pub labels: Vec<usize>,
    /// The exemplar of each cluster, by point index; cluster `k` is represented by `exemplars[k]`.
    pub exemplars: Vec<usize>,
    /// Number of message-passing iterations run.
    pub iterations: usize,
    /// Whether the exemplars stabilized before `max_iter`.
    pub converged: bool,
}

impl Clustering {
    /// The number of clusters.
    pub fn num_clusters(&self) -> usize {
        self.exemplars.len()
    }

    /// Indices of the points in cluster `k`, in ascending order.
    pub fn members(&self, k: usize) -> impl Iterator<Item = usize> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(move |(_, label)| **label == k)
            .map(|(i, _)| i)
    }

    fn trivial(labels: Vec<usize>, exemplars: Vec<usize>) -> Self {
        Self {
            labels,
            exemplars,
            iterations: 0,
            converged: true,
        }
    }
}

impl AffinityPropagation {
    /// Cluster points given their pairwise similarities.
    ///
    /// # Errors
    ///
    /// Fails if `damping` is out of range, or if no point ever becomes an exemplar.
    pub fn fit(&self, similarities: &Matrix) -> Result<Clustering, Error> {
        ensure!(
            (0.5..1.0).contains(&self.damping),
            InvalidDampingSnafu {
                damping: self.damping
            }
        );

        let n = similarities.len();
        if n == 0 {
            return Ok(Clustering::trivial(vec![], vec![]));
        }
        let preference = self
            .preference
            .unwrap_or_else(|| median(similarities.values()));

        if n == 1 || off_diagonal_equal(similarities) {
            // Nothing to choose between: either everyone is their own exemplar, or one point
            // represents them all.
            return Ok(if preference > similarities[(0, n - 1)] {
                Clustering::trivial((0..n).collect(), (0..n).collect())
            } else {
                Clustering::trivial(vec![0; n], vec![0])
            });
        }

        let mut s = similarities.clone();
        for i in 0..n {
            s[(i, i)] = preference;
        }
        self.add_noise(&mut s);

        let (is_exemplar, iterations, converged) = self.propagate(&s);
        let exemplars = (0..n).filter(|&i| is_exemplar[i]).collect::<Vec<_>>();
        ensure!(!exemplars.is_empty(), NotConvergedSnafu { iterations });
        if !converged {
            tracing::warn!("affinity propagation did not converge after {iterations} iterations");
        }

        Ok(Clustering {
            iterations,
            converged,
            ..assign(&s, exemplars)
        })
    }

    /// Perturb every entry very slightly so that ties between equal similarities are broken
    /// consistently.
    fn add_noise(&self, s: &mut Matrix) {
        let mut rng = StdRng::seed_from_u64(self.random_state);
        let n = s.len();
        for i in 0..n {
            for j in 0..n {
                let scale = f64::EPSILON * s[(i, j)] + f64::MIN_POSITIVE * 100.0;
                s[(i, j)] += scale * standard_normal(&mut rng);
            }
        }
    }

    /// Run message passing.
    ///
    /// Returns which points are exemplars after the last iteration, the number of iterations run,
    /// and whether the exemplar set converged.
    fn propagate(&self, s: &Matrix) -> (Vec<bool>, usize, bool) {
        let n = s.len();
        let damping = self.damping;
        let mut a = Matrix::zeros(n);
        let mut r = Matrix::zeros(n);
        let mut column = vec![0.0; n];
        let mut is_exemplar = vec![false; n];

        // The last `convergence_iter` exemplar decisions for each point.
        let window = self.convergence_iter.max(1);
        let mut history = vec![vec![false; window]; n];

        for it in 0..self.max_iter {
            // Responsibilities: how well suited k is to be i's exemplar, compared to the best
            // alternative.
            for i in 0..n {
                let mut best = 0;
                let mut first = f64::NEG_INFINITY;
                let mut second = f64::NEG_INFINITY;
                for k in 0..n {
                    let v = a[(i, k)] + s[(i, k)];
                    if v > first {
                        second = first;
                        first = v;
                        best = k;
                    } else if v > second {
                        second = v;
                    }
                }
                for k in 0..n {
                    let update = if k == best {
                        s[(i, k)] - second
                    } else {
                        s[(i, k)] - first
                    };
                    r[(i, k)] = damping * r[(i, k)] + (1.0 - damping) * update;
                }
            }

            // Availabilities: how much support k has from other points for being an exemplar.
            for (k, total) in column.iter_mut().enumerate() {
                *total = (0..n)
                    .map(|i| if i == k { r[(k, k)] } else { r[(i, k)].max(0.0) })
                    .sum();
            }
            for i in 0..n {
                for k in 0..n {
                    let update = if i == k {
                        column[k] - r[(k, k)]
                    } else {
                        (column[k] - r[(i, k)].max(0.0)).min(0.0)
                    };
                    a[(i, k)] = damping * a[(i, k)] + (1.0 - damping) * update;
                }
            }

            for i in 0..n {
                is_exemplar[i] = a[(i, i)] + r[(i, i)] > 0.0;
                history[i][it % window] = is_exemplar[i];
            }
            if it >= self.convergence_iter {
                let stable = history
                    .iter()
                    .all(|h| h.iter().all(|&e| e) || h.iter().all(|&e| !e));
                if stable && is_exemplar.iter().any(|&e| e) {
                    return (is_exemplar, it + 1, true);
                }
            }
        }

        (is_exemplar, self.max_iter, false)
    }
}

/// Assign points to exemplars, refine each cluster's exemplar, then reassign.
///
/// Labels are renumbered so that clusters are ordered by the index of their exemplar.
fn assign(s: &Matrix, mut exemplars: Vec<usize>) -> Clustering {
    let n = s.len();
    let nearest = |exemplars: &[usize]| {
        let mut c = (0..n)
            .map(|i| argmax(exemplars.iter().map(|&k| s[(i, k)])))
            .collect::<Vec<_>>();
        for (k, &e) in exemplars.iter().enumerate() {
            c[e] = k;
        }
        c
    };

    let c = nearest(&exemplars);
    for (k, exemplar) in exemplars.iter_mut().enumerate() {
        let members = (0..n).filter(|&i| c[i] == k).collect::<Vec<_>>();
        let best = argmax(
            members
                .iter()
                .map(|&j| members.iter().map(|&i| s[(i, j)]).sum::<f64>()),
        );
        *exemplar = members[best];
    }

    let c = nearest(&exemplars);
    let raw = c.iter().map(|&k| exemplars[k]).collect::<Vec<_>>();
    let mut centers = raw.clone();
    centers.sort_unstable();
    centers.dedup();
    let labels = raw
        .iter()
        .map(|e| centers.partition_point(|c| c < e))
        .collect();

    Clustering {
        labels,
        exemplars: centers,
        iterations: 0,
        converged: true,
    }
}

/// Index of the first maximum.
fn argmax(values: impl IntoIterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut max = f64::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > max {
            max = v;
            best = i;
        }
    }
    best
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn off_diagonal_equal(s: &Matrix) -> bool {
    let n = s.len();
    let first = s[(0, 1)];
    (0..n).all(|i| (0..n).all(|j| i == j || s[(i, j)] == first))
}

/// A sample from the standard normal distribution (Box-Muller).
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
