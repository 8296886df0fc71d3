use anyhow::Error;
use async_std::task::sleep;
use clap::{Args, Parser};
use commonplace_book_explorer::{
    cluster::{self, AffinityPropagation},
    db::{self, ScrapeOptions},
    folger::{Client, LocalClient, Mirror, RetryPolicy, DEFAULT_SEARCH_URLS},
    init_logging,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

/// Scrape first lines from the Folger Union First Line Index into a local database, and cluster
/// them by poem.
#[derive(Parser)]
enum Command {
    /// Perform one-time setup of the database.
    Init {
        #[clap(flatten)]
        db: db::Options,
    },
    /// Scrape the records listed on search result pages.
    Pull {
        /// Search result pages to scrape.
        ///
        /// Defaults to the built-in list of manuscripts.
        #[clap(name = "URL")]
        urls: Vec<String>,

        /// Seconds to wait between requests.
        #[clap(short, long, env = "FOLGER_PAUSE", default_value = "1.0")]
        pause: f64,

        /// Scrape at most N rows of each search page.
        #[clap(short = 'n', long, env = "FOLGER_MAX_DETAILS", name = "N")]
        max_details: Option<usize>,

        /// Also save raw pages to DIR.
        #[clap(short, long, env = "FOLGER_OUT", name = "DIR")]
        out: Option<PathBuf>,

        #[clap(flatten)]
        http: HttpOptions,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Scrape every record with an ID between START and END (inclusive).
    Range {
        #[clap(default_value = "0")]
        start: u64,

        #[clap(default_value = "1000")]
        end: u64,

        /// Seconds to wait between requests.
        #[clap(short, long, env = "FOLGER_PAUSE", default_value = "2.5")]
        pause: f64,

        /// Also save raw pages to DIR.
        #[clap(short, long, env = "FOLGER_OUT", name = "DIR")]
        out: Option<PathBuf>,

        #[clap(flatten)]
        http: HttpOptions,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Update the database from Folger pages saved in local storage.
    Read {
        /// The path to the directory containing the saved pages.
        ///
        /// This should be a directory with the structure
        ///
        ///     DIR/
        ///         search/
        ///             <shelfmark>.html
        ///         detail/
        ///             <id>.html
        ///
        /// as written by `pull --out DIR`.
        #[clap(short, long, env = "FOLGER_DATA_DIR", name = "DIR")]
        dir: PathBuf,

        /// Search pages to read. Defaults to every search page in DIR.
        #[clap(name = "URL")]
        urls: Vec<String>,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Cluster all first lines in the database.
    Cluster {
        /// Where to write the clusters as CSV.
        #[clap(
            short,
            long,
            env = "COMMONPLACE_CLUSTERS_CSV",
            default_value = "clusters.csv"
        )]
        out: PathBuf,

        /// Distance matrix cache. Delete it after scraping new records.
        #[clap(
            long,
            env = "COMMONPLACE_MATRIX_CACHE",
            default_value = "dist_matrix.json"
        )]
        cache: PathBuf,

        #[clap(flatten)]
        model: ModelOptions,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Split each cluster found by `cluster` into subclusters.
    Subcluster {
        /// Where to write the subclusters as CSV.
        #[clap(
            short,
            long,
            env = "COMMONPLACE_SUBCLUSTERS_CSV",
            default_value = "subclusters.csv"
        )]
        out: PathBuf,

        /// Directory for the per-cluster distance matrix caches.
        #[clap(long, env = "COMMONPLACE_CACHE_DIR", default_value = ".")]
        cache_dir: PathBuf,

        #[clap(flatten)]
        model: ModelOptions,

        #[clap(flatten)]
        db: db::Options,
    },
}

/// Options for talking to the Folger site.
#[derive(Clone, Debug, Args)]
struct HttpOptions {
    /// Seconds before a request times out.
    #[clap(long, env = "FOLGER_TIMEOUT", default_value = "10")]
    timeout: f64,

    /// Attempts per request before giving up.
    #[clap(long, env = "FOLGER_MAX_RETRIES", default_value = "10")]
    max_retries: u32,

    /// Seconds to wait after the first failed attempt. The wait doubles after each failure.
    #[clap(long, env = "FOLGER_RETRY_DELAY", default_value = "1.0")]
    retry_delay: f64,
}

impl HttpOptions {
    fn client(&self) -> Result<Client, Error> {
        Ok(Client::new(seconds(self.timeout)?)?.with_retries(RetryPolicy {
            max_retries: self.max_retries,
            base_delay: seconds(self.retry_delay)?,
        }))
    }
}

/// Affinity propagation parameters.
#[derive(Clone, Debug, Args)]
struct ModelOptions {
    /// Damping factor, at least 0.5 and less than 1.
    #[clap(long, env = "COMMONPLACE_DAMPING", default_value = "0.5")]
    damping: f64,

    /// Maximum number of iterations.
    #[clap(long, env = "COMMONPLACE_MAX_ITER", default_value = "1000")]
    max_iter: usize,

    /// Stop after the clusters are unchanged for this many iterations.
    #[clap(long, env = "COMMONPLACE_CONVERGENCE_ITER", default_value = "15")]
    convergence_iter: usize,

    /// Self-similarity of each line. Higher values give more clusters. Defaults to the median
    /// similarity.
    #[clap(long, env = "COMMONPLACE_PREFERENCE", allow_negative_numbers = true)]
    preference: Option<f64>,

    /// Seed for tie-breaking noise.
    #[clap(long, env = "COMMONPLACE_RANDOM_STATE", default_value = "0")]
    random_state: u64,
}

impl From<ModelOptions> for AffinityPropagation {
    fn from(opt: ModelOptions) -> Self {
        Self {
            damping: opt.damping,
            max_iter: opt.max_iter,
            convergence_iter: opt.convergence_iter,
            preference: opt.preference,
            random_state: opt.random_state,
        }
    }
}

fn seconds(secs: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(secs)
        .map_err(|err| Error::msg(format!("invalid duration {secs}: {err}")))
}

fn scrape_options(
    pause: f64,
    max_details: Option<usize>,
    out: Option<PathBuf>,
) -> Result<ScrapeOptions, Error> {
    Ok(ScrapeOptions {
        pause: seconds(pause)?,
        max_details,
        mirror: out.map(Mirror::create).transpose()?,
    })
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();

    match Command::parse() {
        Command::Init { db } => {
            let conn = db.connect()?;
            db::setup(&conn)?;
        }
        Command::Pull {
            urls,
            pause,
            max_details,
            out,
            http,
            db,
        } => {
            let client = http.client()?;
            let opt = scrape_options(pause, max_details, out)?;
            let urls = if urls.is_empty() {
                DEFAULT_SEARCH_URLS.iter().map(|url| url.to_string()).collect()
            } else {
                urls
            };
            tracing::info!("{} search pages to scrape", urls.len());

            let conn = db.connect()?;
            db::setup(&conn)?;
            for url in &urls {
                let details = db::pull(&conn, &client, url, &opt).await?;
                tracing::info!("scraped {} details from {url}", details.len());
                sleep(opt.pause).await;
            }
            tracing::info!("all search pages have been processed");
        }
        Command::Range {
            start,
            end,
            pause,
            out,
            http,
            db,
        } => {
            let client = http.client()?;
            let opt = scrape_options(pause, None, out)?;

            let conn = db.connect()?;
            db::setup(&conn)?;
            let summary = db::pull_range(&conn, &client, start..=end, &opt).await?;
            tracing::info!(
                "inserted {}, skipped {}, empty {}, failed {}",
                summary.inserted,
                summary.skipped,
                summary.empty,
                summary.failed
            );
        }
        Command::Read { dir, urls, db } => {
            let client = LocalClient::open(dir);
            let urls = if urls.is_empty() {
                client.search_urls()?
            } else {
                urls
            };
            tracing::info!("{} search pages available", urls.len());

            let opt = ScrapeOptions {
                pause: Duration::ZERO,
                ..Default::default()
            };
            let conn = db.connect()?;
            db::setup(&conn)?;
            for url in &urls {
                db::pull(&conn, &client, url, &opt).await?;
            }
        }
        Command::Cluster {
            out,
            cache,
            model,
            db,
        } => {
            let mut conn = db.connect()?;
            db::setup(&conn)?;
            let file = BufWriter::new(File::create(&out)?);
            cluster::cluster_first_lines(&mut conn, &model.into(), &cache, file)?;
            tracing::info!("clustering complete, results saved to {}", out.display());
        }
        Command::Subcluster {
            out,
            cache_dir,
            model,
            db,
        } => {
            let conn = db.connect()?;
            db::setup(&conn)?;
            let file = BufWriter::new(File::create(&out)?);
            cluster::create_subclusters(&conn, &model.into(), &cache_dir, file)?;
            tracing::info!("subclustering complete, results saved to {}", out.display());
        }
    }

    Ok(())
}
