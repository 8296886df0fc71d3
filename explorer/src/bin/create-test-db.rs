use clap::Parser;
use commonplace_book_explorer::{
    db::{self, ScrapeOptions},
    folger::LocalClient,
    init_logging,
};
use std::path::PathBuf;
use std::time::Duration;

/// Set up a test database and seed it with a small amount of data for easy testing.
#[derive(Parser)]
struct Options {
    /// The path to the directory containing the test data.
    ///
    /// This should be a directory with the structure
    ///
    ///     DIR/
    ///         search/
    ///             <shelfmark>.html
    ///         detail/
    ///             <id>.html
    #[clap(
        short,
        long,
        env = "COMMONPLACE_TEST_DATA_DIR",
        name = "DIR",
        default_value = "db/test/data"
    )]
    dir: PathBuf,

    /// Path to the SQLite database file to seed.
    #[clap(long, env = "COMMONPLACE_TEST_DB_PATH", default_value = "test.db")]
    db_path: PathBuf,
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();

    let opt = Options::parse();
    let db_opt = db::Options {
        db_path: opt.db_path,
    };
    let conn = db_opt.connect()?;

    // Set up the schema.
    db::setup(&conn)?;

    // Insert test data.
    let client = LocalClient::open(opt.dir);
    let scrape = ScrapeOptions {
        pause: Duration::ZERO,
        ..Default::default()
    };
    for url in client.search_urls()? {
        let details = db::pull(&conn, &client, &url, &scrape).await?;
        tracing::info!("loaded {} details from {url}", details.len());
    }

    Ok(())
}
