//! Grouping witnesses of the same poem by the similarity of their first lines.
//!
//! The same poem often survives in many manuscripts, each copy (or "witness") with its own
//! spelling and small variations. Witnesses are clustered by the edit distance between their
//! first lines using affinity propagation, which does not need the number of poems to be known in
//! advance. Large clusters can then be split further into subclusters.

use crate::db::{self, Connection, FirstLine};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

mod affinity;
mod distance;

pub use affinity::{AffinityPropagation, Clustering};
pub use distance::{line_distance, load_or_compute, normalize_line, similarity_matrix, Matrix};

/// Errors reported while clustering.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unable to access distance matrix cache {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("malformed distance matrix cache {}: {source}", path.display()))]
    Cache {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display(
        "distance matrix cache {} has {found} rows but there are {expected} first lines",
        path.display()
    ))]
    CacheShape {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[snafu(display("damping must be at least 0.5 and less than 1, got {damping}"))]
    InvalidDamping { damping: f64 },
    #[snafu(display("no exemplars emerged after {iterations} iterations"))]
    NotConverged { iterations: usize },
}

/// Cluster every first line in the database.
///
/// Writes a CSV with columns `Cluster`, `Index` (the record ID) and `First Line`, grouped by
/// cluster, and records each line's cluster in the [`clusters`](db::CLUSTERS) table so that
/// [`create_subclusters`] can refine it.
pub fn cluster_first_lines<W: Write>(
    conn: &mut Connection,
    model: &AffinityPropagation,
    cache: &Path,
    out: W,
) -> Result<Clustering, anyhow::Error> {
    let lines = db::first_lines(conn)?;
    let matrix = load_or_compute(&lines, cache)?;

    tracing::info!("clustering {} first lines", lines.len());
    let clustering = model.fit(&matrix)?;
    tracing::info!(
        "found {} clusters in {} iterations",
        clustering.num_clusters(),
        clustering.iterations
    );

    let mut csv = csv::Writer::from_writer(out);
    csv.write_record(["Cluster", "Index", "First Line"])?;
    for k in 0..clustering.num_clusters() {
        for i in clustering.members(k) {
            csv.write_record([&k.to_string(), &lines[i].id, &lines[i].text])?;
        }
    }
    csv.flush()?;

    db::replace_clusters(
        conn,
        clustering
            .labels
            .iter()
            .zip(&lines)
            .map(|(k, line)| (*k, line.id.as_str())),
    )?;
    Ok(clustering)
}

/// Split each stored cluster into subclusters.
///
/// Each cluster gets its own distance matrix cache, `dist_matrix_<cluster>.json` in `cache_dir`.
/// Writes a CSV with columns `Cluster`, `Subcluster`, `Witness ID` and `First Line`. Returns the
/// number of clusters processed.
pub fn create_subclusters<W: Write>(
    conn: &Connection,
    model: &AffinityPropagation,
    cache_dir: &Path,
    out: W,
) -> Result<usize, anyhow::Error> {
    let rows = db::clustered_first_lines(conn)?;
    tracing::info!("found {} clustered first lines", rows.len());

    let mut clusters: BTreeMap<usize, Vec<FirstLine>> = BTreeMap::new();
    for (cluster, line) in rows {
        clusters.entry(cluster).or_default().push(line);
    }
    tracing::info!("found {} clusters", clusters.len());

    let mut csv = csv::Writer::from_writer(out);
    csv.write_record(["Cluster", "Subcluster", "Witness ID", "First Line"])?;
    for (cluster, lines) in &clusters {
        tracing::info!(
            "processing cluster {cluster} with {} first lines",
            lines.len()
        );
        let cache = cache_dir.join(format!("dist_matrix_{cluster}.json"));
        let matrix = load_or_compute(lines, &cache)?;
        let clustering = model.fit(&matrix)?;
        tracing::info!(
            "subclustered cluster {cluster} into {} subclusters",
            clustering.num_clusters()
        );

        for k in 0..clustering.num_clusters() {
            for i in clustering.members(k) {
                csv.write_record([
                    &cluster.to_string(),
                    &k.to_string(),
                    &lines[i].id,
                    &lines[i].text,
                ])?;
            }
        }
    }
    csv.flush()?;
    Ok(clusters.len())
}
