//! Edit distance between first lines, and the similarity matrices built from it.

use super::{CacheSnafu, CacheShapeSnafu, Error, IoSnafu};
use crate::db::FirstLine;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::{Index, IndexMut};
use std::path::Path;

/// Words shorter than this are too common to suggest two lines are related.
const SIGNIFICANT_WORD_LEN: usize = 4;

/// Lowercase a line, drop punctuation and split it into words.
pub fn normalize_line(line: &str) -> Vec<String> {
    line.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// The distance between two first lines.
///
/// Lines which share no significant word are as far apart as the longer of them. Otherwise, the
/// distance is the Levenshtein distance between the normalized lines.
pub fn line_distance(a: &str, b: &str) -> usize {
    word_distance(&normalize_line(a), &normalize_line(b))
}

fn word_distance(a: &[String], b: &[String]) -> usize {
    let joined_a = a.join(" ");
    let joined_b = b.join(" ");
    if significant_words(a).is_disjoint(&significant_words(b)) {
        joined_a.chars().count().max(joined_b.chars().count())
    } else {
        strsim::levenshtein(&joined_a, &joined_b)
    }
}

fn significant_words(words: &[String]) -> HashSet<&str> {
    words
        .iter()
        .filter(|word| word.chars().count() >= SIGNIFICANT_WORD_LEN)
        .map(String::as_str)
        .collect()
}

/// A square matrix of pairwise similarities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// An `n` by `n` matrix of zeros.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Build a matrix from its rows.
    ///
    /// # Panics
    ///
    /// Panics if the rows do not form a square matrix.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let n = rows.len();
        assert!(rows.iter().all(|row| row.len() == n), "matrix is not square");
        Self {
            n,
            data: rows.into_iter().flatten().collect(),
        }
    }

    /// The number of rows (and columns).
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether the matrix has no entries.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// All entries, in row-major order.
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// A single row.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.n + j]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.n + j]
    }
}

/// Pairwise similarities between first lines: the negated [`line_distance`].
///
/// The diagonal is zero.
pub fn similarity_matrix(lines: &[FirstLine]) -> Matrix {
    let n = lines.len();
    let words = lines
        .iter()
        .map(|line| normalize_line(&line.text))
        .collect::<Vec<_>>();

    tracing::info!("calculating distance matrix for {n} first lines");
    let mut matrix = Matrix::zeros(n);
    for i in 0..n {
        tracing::debug!("processing line {}/{n}: {}", i + 1, lines[i].text);
        for j in i + 1..n {
            let similarity = -(word_distance(&words[i], &words[j]) as f64);
            matrix[(i, j)] = similarity;
            matrix[(j, i)] = similarity;
        }
    }
    matrix
}

/// Load a similarity matrix from `cache`, or compute it and save it there.
///
/// # Errors
///
/// Fails if the cached matrix does not have one row per line, which usually means the cache is
/// stale.
pub fn load_or_compute(lines: &[FirstLine], cache: &Path) -> Result<Matrix, Error> {
    if cache.exists() {
        tracing::info!("loading distance matrix from {}", cache.display());
        let file = File::open(cache).context(IoSnafu { path: cache })?;
        let matrix: Matrix =
            serde_json::from_reader(BufReader::new(file)).context(CacheSnafu { path: cache })?;
        ensure!(
            matrix.len() == lines.len() && matrix.data.len() == matrix.n * matrix.n,
            CacheShapeSnafu {
                path: cache,
                expected: lines.len(),
                found: matrix.len(),
            }
        );
        return Ok(matrix);
    }

    let matrix = similarity_matrix(lines);
    let file = File::create(cache).context(IoSnafu { path: cache })?;
    serde_json::to_writer(BufWriter::new(file), &matrix).context(CacheSnafu { path: cache })?;
    tracing::info!("distance matrix saved to {}", cache.display());
    Ok(matrix)
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<FirstLine> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| FirstLine {
                id: i.to_string(),
                text: text.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_normalize_line() {
        assert_eq!(
            normalize_line("  The Bees of Hybla,  have -- besides! "),
            ["the", "bees", "of", "hybla", "have", "besides"]
        );
        assert!(normalize_line(" ,;: ").is_empty());
    }

    #[test]
    fn test_line_distance_shared_word() {
        // "bees" is shared, so this is an edit distance.
        assert_eq!(line_distance("The bees of Hybla", "the bees of Hibla!"), 1);
        assert_eq!(line_distance("Same line", "same, line"), 0);
    }

    #[test]
    fn test_line_distance_no_shared_word() {
        // Only short words in common: as far apart as the longer line.
        assert_eq!(line_distance("If it be so", "if it be not"), 12);
        assert_eq!(line_distance("", "Go and catch a falling star"), 27);
    }

    #[test]
    fn test_line_distance_symmetric() {
        let a = "If eighty-eight be past then thrive";
        let b = "If eightie eight be past then thryve";
        assert_eq!(line_distance(a, b), line_distance(b, a));
    }

    #[test]
    fn test_similarity_matrix() {
        let matrix = similarity_matrix(&lines(&["The bees of Hybla", "the bees of Hibla", "Go"]));
        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix[(0, 0)], 0.0);
        assert_eq!(matrix[(0, 1)], -1.0);
        assert_eq!(matrix[(1, 0)], -1.0);
        assert_eq!(matrix[(0, 2)], -17.0);
        assert_eq!(matrix.row(2), &[-17.0, -17.0, 0.0]);
    }

    #[test]
    fn test_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("dist_matrix.json");
        let first = lines(&["a line of verse", "a line of prose"]);

        let computed = load_or_compute(&first, &cache).unwrap();
        assert!(cache.exists());

        // The cache is used even if the lines have changed, as long as the shape matches.
        let cached = load_or_compute(&lines(&["x", "y"]), &cache).unwrap();
        assert_eq!(cached, computed);

        let err = load_or_compute(&lines(&["x"]), &cache).unwrap_err();
        assert!(matches!(
            err,
            Error::CacheShape {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }
}
