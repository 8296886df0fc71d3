//! The SQLite database holding scraped first-line records and their clusters.

use super::folger::{
    detail_id, detail_url, parse_detail_page, parse_search_page, Detail, Field, Folger, Mirror,
};
use anyhow::Error;
use async_std::task::sleep;
use clap::Args;
use rusqlite::{params, OptionalExtension};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Table holding one row per scraped record.
pub const DETAILS: &str = "details";

/// Table assigning each record to a top-level cluster.
pub const CLUSTERS: &str = "clusters";

/// Database connection options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Path to the SQLite database file.
    #[clap(
        long,
        env = "COMMONPLACE_DB_PATH",
        name = "DB",
        default_value = "folger_results.db"
    )]
    pub db_path: PathBuf,
}

impl Options {
    /// Open the database, creating the file if it doesn't exist.
    pub fn connect(&self) -> Result<Connection, Error> {
        tracing::debug!("opening database {}", self.db_path.display());
        Ok(Connection::open(&self.db_path)?)
    }
}

/// A connection to the database.
pub type Connection = rusqlite::Connection;

/// A record's first line, as read back from the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirstLine {
    /// The ID of the record (its "witness" of a poem).
    pub id: String,
    /// The text of the first line.
    pub text: String,
}

/// Create the tables, if they don't already exist.
pub fn setup(conn: &Connection) -> Result<(), Error> {
    let columns = Field::all()
        .map(|field| format!("\"{field}\" TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {DETAILS} ({columns}, PRIMARY KEY (id));
         CREATE TABLE IF NOT EXISTS {CLUSTERS} (cluster INTEGER NOT NULL, \"Index\" TEXT PRIMARY KEY);"
    ))?;
    Ok(())
}

/// Check whether a record has already been stored.
pub fn detail_exists(conn: &Connection, id: &str) -> Result<bool, Error> {
    Ok(conn
        .query_row(
            &format!("SELECT 1 FROM {DETAILS} WHERE id = ?1"),
            [id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Store a record, replacing any existing record with the same ID.
///
/// Every [`Field`] gets a value; fields the page did not provide are stored as empty strings.
pub fn insert_detail(conn: &Connection, detail: &Detail) -> Result<(), Error> {
    tracing::info!("inserting detail {}", detail.id);
    tracing::debug!(?detail, "detail contents");

    let fields = Field::all().collect::<Vec<_>>();
    let columns = fields
        .iter()
        .map(|field| format!("\"{field}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=fields.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("INSERT OR REPLACE INTO {DETAILS} ({columns}) VALUES ({placeholders})"),
        rusqlite::params_from_iter(fields.iter().map(|field| detail.field(*field))),
    )?;
    Ok(())
}

/// All first lines, ordered by their text.
pub fn first_lines(conn: &Connection) -> Result<Vec<FirstLine>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, \"First Line\" FROM {DETAILS} ORDER BY \"First Line\", id"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(FirstLine {
            id: row.get(0)?,
            text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Replace the stored top-level clustering.
pub fn replace_clusters<'a, I>(conn: &mut Connection, assignments: I) -> Result<(), Error>
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM {CLUSTERS}"), [])?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {CLUSTERS} (cluster, \"Index\") VALUES (?1, ?2)"
        ))?;
        for (cluster, id) in assignments {
            stmt.execute(params![cluster as i64, id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Every clustered first line with its cluster, ordered by cluster and then record ID.
pub fn clustered_first_lines(conn: &Connection) -> Result<Vec<(usize, FirstLine)>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLUSTERS}.cluster, {DETAILS}.id, {DETAILS}.\"First Line\"
         FROM {CLUSTERS}
         JOIN {DETAILS} ON {DETAILS}.id = {CLUSTERS}.\"Index\"
         ORDER BY {CLUSTERS}.cluster, {DETAILS}.id"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            cluster_index(row.get(0)?)?,
            FirstLine {
                id: row.get(1)?,
                text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            },
        ))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn cluster_index(cluster: i64) -> rusqlite::Result<usize> {
    usize::try_from(cluster).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, cluster))
}

/// Options controlling a scrape.
#[derive(Clone, Debug)]
pub struct ScrapeOptions {
    /// How long to wait between requests for detail pages.
    pub pause: Duration,
    /// Stop after this many rows of a search page.
    pub max_details: Option<usize>,
    /// Also save every fetched page here.
    pub mirror: Option<Mirror>,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(1),
            max_details: None,
            mirror: None,
        }
    }
}

/// Scrape the records listed on a search page into the database.
///
/// Records that are already stored are skipped without fetching them. Returns the newly scraped
/// records.
pub async fn pull<F: Folger>(
    conn: &Connection,
    folger: &F,
    url: &str,
    opt: &ScrapeOptions,
) -> Result<Vec<Detail>, Error> {
    tracing::info!("scraping Folger first lines from {url}");
    let html = folger.search_page(url).await?;
    if let Some(mirror) = &opt.mirror {
        mirror.save_search_page(url, &html)?;
    }

    let mut details = vec![];
    for (i, row) in parse_search_page(&html)?.into_iter().enumerate() {
        if opt.max_details.is_some_and(|max| i >= max) {
            tracing::info!("reached maximum of {i} details, stopping");
            break;
        }
        if let Some(url) = row.detail_url {
            let id = detail_id(&url);
            if detail_exists(conn, &id)? {
                tracing::info!("detail {id} already exists, skipping");
                continue;
            }
            let detail = scrape_detail(folger, &url, opt).await?;
            insert_detail(conn, &detail)?;
            details.push(detail);
        }
        sleep(opt.pause).await;
    }
    Ok(details)
}

/// What happened during a [`pull_range`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RangeSummary {
    /// Records scraped and stored.
    pub inserted: usize,
    /// IDs skipped because they were already stored.
    pub skipped: usize,
    /// IDs whose detail page had no data.
    pub empty: usize,
    /// IDs which could not be fetched or parsed.
    pub failed: usize,
}

/// Scrape every record in a range of IDs into the database.
///
/// Unlike [`pull`], a record which cannot be fetched or parsed does not stop the scrape: the failure
/// is logged and counted, and the next ID is tried. Failing to store a page, in the database or
/// the mirror, still aborts.
pub async fn pull_range<F: Folger>(
    conn: &Connection,
    folger: &F,
    ids: RangeInclusive<u64>,
    opt: &ScrapeOptions,
) -> Result<RangeSummary, Error> {
    tracing::info!(
        "scraping details with IDs from {} to {}",
        ids.start(),
        ids.end()
    );
    let mut summary = RangeSummary::default();
    for id in ids {
        let id = id.to_string();
        if detail_exists(conn, &id)? {
            tracing::info!("detail {id} already exists, skipping");
            summary.skipped += 1;
            continue;
        }
        let url = detail_url(&id);
        let page = match folger.detail_page(&url).await {
            Ok(html) => {
                save_detail_page(opt, &id, &html)?;
                parse_detail_page(&url, &html)
            }
            Err(err) => Err(err),
        };
        match page {
            Ok(detail) if detail.is_empty() => {
                tracing::warn!("no data found for detail {id}");
                summary.empty += 1;
            }
            Ok(detail) => {
                insert_detail(conn, &detail)?;
                summary.inserted += 1;
            }
            Err(err) => {
                tracing::error!("error scraping detail {id}: {err:#}");
                summary.failed += 1;
            }
        }
        sleep(opt.pause).await;
    }
    tracing::info!(?summary, "finished scraping");
    Ok(summary)
}

async fn scrape_detail<F: Folger>(
    folger: &F,
    url: &str,
    opt: &ScrapeOptions,
) -> Result<Detail, Error> {
    let html = folger.detail_page(url).await?;
    save_detail_page(opt, &detail_id(url), &html)?;
    parse_detail_page(url, &html)
}

fn save_detail_page(opt: &ScrapeOptions, id: &str, html: &str) -> Result<(), Error> {
    match &opt.mirror {
        Some(mirror) => mirror.save_detail_page(id, html),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{folger::LocalClient, init_logging};
    use std::path::Path;
    use std::time::Instant;

    /// The directory of HTML pages used as test data.
    pub(crate) fn test_data() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .join("db/test/data")
    }

    pub(crate) fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn).unwrap();
        conn
    }

    fn no_pause() -> ScrapeOptions {
        ScrapeOptions {
            pause: Duration::ZERO,
            ..Default::default()
        }
    }

    const RAWL: &str =
        "https://firstlines.folger.edu/advancedSearch.php?val1=rawl.+d.+1092&col1=shelfmark1&sort=lib1#results";

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_db();
        setup(&conn).unwrap();
        assert!(!detail_exists(&conn, "1").unwrap());
    }

    #[test]
    fn test_insert_or_replace() {
        let conn = test_db();
        let mut detail = Detail::new("7");
        detail.set("First Line", "Go and catch a falling star");
        detail.set("Not A Column", "dropped");
        insert_detail(&conn, &detail).unwrap();
        assert!(detail_exists(&conn, "7").unwrap());

        detail.set("First Line", "Goe and catch a falling starre");
        insert_detail(&conn, &detail).unwrap();
        assert_eq!(
            first_lines(&conn).unwrap(),
            [FirstLine {
                id: "7".into(),
                text: "Goe and catch a falling starre".into()
            }]
        );

        let shelfmark: String = conn
            .query_row("SELECT Shelfmark FROM details WHERE id = '7'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(shelfmark, "");
    }

    #[test]
    fn test_first_lines_ordered_by_text() {
        let conn = test_db();
        for (id, line) in [("1", "b"), ("2", "a"), ("3", "c"), ("0", "a")] {
            let mut detail = Detail::new(id);
            detail.set("First Line", line);
            insert_detail(&conn, &detail).unwrap();
        }
        let ids = first_lines(&conn)
            .unwrap()
            .into_iter()
            .map(|line| line.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["0", "2", "1", "3"]);
    }

    #[test]
    fn test_clusters() {
        let mut conn = test_db();
        for id in ["1", "2", "3"] {
            let mut detail = Detail::new(id);
            detail.set("First Line", format!("line {id}"));
            insert_detail(&conn, &detail).unwrap();
        }
        replace_clusters(&mut conn, [(1, "1"), (0, "3"), (1, "2")]).unwrap();
        let rows = clustered_first_lines(&conn).unwrap();
        assert_eq!(
            rows.iter()
                .map(|(c, line)| (*c, line.id.as_str()))
                .collect::<Vec<_>>(),
            [(0, "3"), (1, "1"), (1, "2")]
        );

        // Replacing drops the previous assignments.
        replace_clusters(&mut conn, [(0, "2")]).unwrap();
        assert_eq!(clustered_first_lines(&conn).unwrap().len(), 1);
    }

    #[async_std::test]
    async fn test_pull() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());

        let details = pull(&conn, &client, RAWL, &no_pause()).await.unwrap();
        let ids = details.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["80836", "80837", "80838"]);
        assert_eq!(
            details[0].field(Field::FirstLine),
            "The bees of Hybla have besides sweet honey smarting stings,"
        );
        assert_eq!(details[0].field(Field::Shelfmark), "Rawl. D. 1092");

        // Pulling again finds everything already stored.
        let details = pull(&conn, &client, RAWL, &no_pause()).await.unwrap();
        assert!(details.is_empty());
    }

    #[async_std::test]
    async fn test_pull_max_details() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());
        let opt = ScrapeOptions {
            max_details: Some(2),
            ..no_pause()
        };
        let details = pull(&conn, &client, RAWL, &opt).await.unwrap();
        assert_eq!(details.len(), 2);
        assert!(!detail_exists(&conn, "80838").unwrap());
    }

    #[async_std::test]
    async fn test_pull_range() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());
        let mut existing = Detail::new("80837");
        existing.set("First Line", "already here");
        insert_detail(&conn, &existing).unwrap();

        let summary = pull_range(&conn, &client, 80836..=80842, &no_pause())
            .await
            .unwrap();
        assert_eq!(
            summary,
            RangeSummary {
                inserted: 4,
                skipped: 1,
                empty: 1,
                failed: 1,
            }
        );
        assert!(!detail_exists(&conn, "80839").unwrap());
        assert!(detail_exists(&conn, "80841").unwrap());
    }

    #[async_std::test]
    async fn test_pull_pauses() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());
        for id in ["80836", "80837", "80838"] {
            insert_detail(&conn, &Detail::new(id)).unwrap();
        }
        let pause = Duration::from_millis(250);
        let opt = ScrapeOptions {
            pause,
            ..no_pause()
        };

        // Every linked row is already stored, so only the row without a link waits.
        let start = Instant::now();
        let details = pull(&conn, &client, RAWL, &opt).await.unwrap();
        let elapsed = start.elapsed();
        assert!(details.is_empty());
        assert!(elapsed >= pause, "{elapsed:?}");
        assert!(elapsed < 2 * pause, "{elapsed:?}");
    }

    #[async_std::test]
    async fn test_pull_range_mirror_failure() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());
        let dir = tempfile::tempdir().unwrap();
        let opt = ScrapeOptions {
            mirror: Some(Mirror::create(dir.path()).unwrap()),
            ..no_pause()
        };
        std::fs::remove_dir(dir.path().join("detail")).unwrap();

        // A page that cannot be saved aborts the walk instead of being counted as a failed fetch.
        pull_range(&conn, &client, 80836..=80838, &opt)
            .await
            .unwrap_err();
        assert!(!detail_exists(&conn, "80836").unwrap());
    }

    #[test]
    fn test_negative_cluster() {
        let conn = test_db();
        let mut detail = Detail::new("1");
        detail.set("First Line", "line 1");
        insert_detail(&conn, &detail).unwrap();
        conn.execute(
            "INSERT INTO clusters (cluster, \"Index\") VALUES (-1, '1')",
            [],
        )
        .unwrap();
        let err = clustered_first_lines(&conn).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::IntegralValueOutOfRange(0, -1))
        ));
    }

    #[async_std::test]
    async fn test_pull_writes_mirror() {
        init_logging();
        let conn = test_db();
        let client = LocalClient::open(test_data());
        let dir = tempfile::tempdir().unwrap();
        let opt = ScrapeOptions {
            mirror: Some(Mirror::create(dir.path()).unwrap()),
            ..no_pause()
        };
        pull(&conn, &client, RAWL, &opt).await.unwrap();

        // The mirror can be replayed into a fresh database.
        let replay = test_db();
        let mirrored = LocalClient::open(dir.path().into());
        let details = pull(&replay, &mirrored, RAWL, &no_pause()).await.unwrap();
        assert_eq!(details.len(), 3);
    }
}
