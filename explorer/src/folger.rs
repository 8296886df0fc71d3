//! Facilities for pulling first-line records from the Folger Union First Line Index.

use anyhow::Error;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

mod client;
mod local;

pub use client::{Client, RetryPolicy};
pub use local::{LocalClient, Mirror};

/// Root of the Folger first-line site. Relative links in search results are resolved against it.
pub const BASE_URL: &str = "https://firstlines.folger.edu/";

/// A source of Folger pages.
///
/// Pages are returned as raw HTML so that callers can both parse them and keep a copy of what was
/// fetched.
#[async_trait]
pub trait Folger: Sync {
    /// Load an advanced-search results page.
    async fn search_page(&self, url: &str) -> Result<String, Error>;

    /// Load the detail page for a single record.
    async fn detail_page(&self, url: &str) -> Result<String, Error>;
}

/// A column of a first-line record.
///
/// The string form of each field is the label the Folger site uses for it, which is also the name
/// of the corresponding column in the database.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumString,
)]
pub enum Field {
    #[strum(serialize = "id")]
    Id,
    #[strum(serialize = "First Line")]
    FirstLine,
    #[strum(serialize = "Author (Last name, First)")]
    Author,
    #[strum(serialize = "Title")]
    Title,
    #[strum(serialize = "First Line (Transcribed)")]
    FirstLineTranscribed,
    #[strum(serialize = "Second Line")]
    SecondLine,
    #[strum(serialize = "Last Line")]
    LastLine,
    #[strum(serialize = "Library")]
    Library,
    #[strum(serialize = "Shelfmark")]
    Shelfmark,
    #[strum(serialize = "Folio")]
    Folio,
    #[strum(serialize = "Ref Nbr")]
    RefNbr,
    #[strum(serialize = "Number of Lines")]
    NumberOfLines,
    #[strum(serialize = "Verse/Stanza Form")]
    VerseForm,
    #[strum(serialize = "Publication Author/Editor")]
    PublicationAuthor,
    #[strum(serialize = "Publication Title")]
    PublicationTitle,
    #[strum(serialize = "Publication Date")]
    PublicationDate,
    #[strum(serialize = "Gender")]
    Gender,
    #[strum(serialize = "Musical Settings")]
    MusicalSettings,
    #[strum(serialize = "Names Mentioned")]
    NamesMentioned,
    #[strum(serialize = "Other Names")]
    OtherNames,
    #[strum(serialize = "Translations/Imitations")]
    Translations,
    #[strum(serialize = "Notes")]
    Notes,
}

impl Field {
    /// All fields, in column order.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// A first-line record scraped from a detail page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Detail {
    /// The record's ID in the Folger index.
    pub id: String,
    /// Every label/value pair found on the page, in document order.
    ///
    /// This may include labels which are not known [`Field`]s; those are kept here but not
    /// persisted.
    pub values: Vec<(String, String)>,
}

impl Detail {
    /// An empty record with the given ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: vec![],
        }
    }

    /// Set the value of `label`, replacing any previous value.
    pub fn set(&mut self, label: impl Into<String>, value: impl Into<String>) {
        let label = label.into();
        let value = value.into();
        match self.values.iter_mut().find(|(l, _)| *l == label) {
            Some((_, v)) => *v = value,
            None => self.values.push((label, value)),
        }
    }

    /// Look up the value of a label.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    /// The value of a known field, or `""` if the page did not provide it.
    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Id => &self.id,
            field => self.get(&field.to_string()).unwrap_or(""),
        }
    }

    /// Whether the page had no label/value rows at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A single row on a search results page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    /// Absolute URL of the record's detail page, if the row links to one.
    pub detail_url: Option<String>,
}

impl SearchResult {
    /// The ID of the linked record.
    pub fn detail_id(&self) -> Option<String> {
        self.detail_url.as_deref().map(detail_id)
    }
}

/// Extract a record ID from a detail page URL.
///
/// This is the text following the last `id=` up to the next `&`. A URL without `id=` is returned
/// unchanged (up to its first `&`).
pub fn detail_id(url: &str) -> String {
    let tail = url.rsplit("id=").next().unwrap_or(url);
    tail.split('&').next().unwrap_or(tail).to_string()
}

/// The detail page URL for a record ID.
pub fn detail_url(id: impl std::fmt::Display) -> String {
    format!("{BASE_URL}detail.php?id={id}")
}

/// Resolve a link found on a Folger page.
pub fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.into()
    } else {
        format!("{BASE_URL}{href}")
    }
}

/// Parse an advanced-search results page.
///
/// Each `div.resultsRow` yields one [`SearchResult`], in document order.
pub fn parse_search_page(html: &str) -> Result<Vec<SearchResult>, Error> {
    let document = Html::parse_document(html);
    let rows = selector("div.resultsRow")?;
    let links = selector("a[href]")?;

    Ok(document
        .select(&rows)
        .map(|row| SearchResult {
            detail_url: row
                .select(&links)
                .next()
                .and_then(|link| link.value().attr("href"))
                .map(absolute_url),
        })
        .collect())
}

/// Parse a record's detail page.
///
/// The record ID is taken from `url`. Every `div.detailRow` containing both a `span.detailLabel`
/// and a `span.detailCell` contributes one label/value pair; other rows are ignored.
pub fn parse_detail_page(url: &str, html: &str) -> Result<Detail, Error> {
    let document = Html::parse_document(html);
    let rows = selector("div.detailRow")?;
    let labels = selector("span.detailLabel")?;
    let cells = selector("span.detailCell")?;

    let mut detail = Detail::new(detail_id(url));
    for row in document.select(&rows) {
        let (Some(label), Some(value)) = (row.select(&labels).next(), row.select(&cells).next())
        else {
            continue;
        };
        let label = stripped_text(label);
        let label = label.trim_end_matches(':');
        let value = stripped_text(value)
            .replace("&nbsp;", " ")
            .replace("&amp;", "&");
        detail.set(label, value);
    }
    Ok(detail)
}

/// The text of an element with each text node trimmed, concatenated.
fn stripped_text(element: ElementRef) -> String {
    element.text().map(str::trim).collect()
}

fn selector(s: &str) -> Result<Selector, Error> {
    Selector::parse(s).map_err(|err| Error::msg(format!("invalid selector {s}: {err:?}")))
}

/// Search pages for the manuscripts surveyed by the project, one per shelfmark.
pub const DEFAULT_SEARCH_URLS: &[&str] = &[
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+44963&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+11811&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+15227&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+19268&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+22118&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=add.+22582&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=Add.+30982&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=Add.+44963&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=Add.+62134&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=Ashmole+47&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=Corpus+Christi+328&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=misc.+e.+13&col1=shelfmark1&lib_bod=Y&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=poet.+e.+30&col1=shelfmark1&lib_bod=Y&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=poet.+f.+16&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.a.97&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.a.148&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.a.170&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.a.319&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.a.322&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.b.43&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=harley+3511&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=harley+6931&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=lansdowne+777&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=malone+21&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=rawl.+d.+1092&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=rawl.+poet.+84&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=rawl.+poet.+116&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=rawl.+poet.+199&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=sloane+542&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=sloane+1446&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=sloane+1792&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=v.b.110&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=g1401b&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=w3686&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=K0501&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=L0643&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=MS+Eng+703&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=hm116&col1=shelfmark1&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=b.200&col1=shelfmark1&lib_yo=Y&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=b.205&col1=shelfmark1&lib_yo=Y&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=b.62&col1=shelfmark1&lib_yo=Y&sort=lib1#results",
    "https://firstlines.folger.edu/advancedSearch.php?val1=MS+240%2F7&col1=shelfmark1&sort=lib1#results",
];

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_detail_id() {
        assert_eq!(detail_id("https://firstlines.folger.edu/detail.php?id=80836"), "80836");
        assert_eq!(detail_id("detail.php?id=12&foo=bar"), "12");
        assert_eq!(detail_id("detail.php?x=1&id=7"), "7");
        assert_eq!(detail_id("no-id-here"), "no-id-here");
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            absolute_url("detail.php?id=1"),
            "https://firstlines.folger.edu/detail.php?id=1"
        );
        assert_eq!(absolute_url("http://example.com/x"), "http://example.com/x");
        assert_eq!(
            detail_url(42),
            "https://firstlines.folger.edu/detail.php?id=42"
        );
    }

    #[test]
    fn test_default_search_urls() {
        assert_eq!(DEFAULT_SEARCH_URLS.len(), 42);
        assert!(DEFAULT_SEARCH_URLS
            .iter()
            .all(|url| url.starts_with(BASE_URL) && url.contains("col1=shelfmark1")));
    }

    #[test]
    fn test_field_names() {
        let fields = Field::all().collect::<Vec<_>>();
        assert_eq!(fields.len(), 22);
        assert_eq!(fields[0], Field::Id);
        assert_eq!(fields[21], Field::Notes);
        assert_eq!(Field::Author.to_string(), "Author (Last name, First)");
        assert_eq!(
            Field::from_str("Verse/Stanza Form").unwrap(),
            Field::VerseForm
        );
    }

    #[test]
    fn test_parse_search_page() {
        let html = r#"
            <html><body>
            <div class="resultsRow row0" style="width:800px;">
              <a class="_blank" href="detail.php?id=80836" target="_blank">
              <span class="resultsCell">The bees of Hybla have besides sweet honey smarting stings,&nbsp;</span>
              </a>
            </div>
            <div class="resultsRow row1"><span>no link here</span></div>
            <div class="resultsRow row0">
              <a href="https://firstlines.folger.edu/detail.php?id=5&amp;x=1">x</a>
            </div>
            <div class="other"><a href="detail.php?id=99">ignored</a></div>
            </body></html>
        "#;
        let results = parse_search_page(html).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0].detail_url.as_deref(),
            Some("https://firstlines.folger.edu/detail.php?id=80836")
        );
        assert_eq!(results[0].detail_id().as_deref(), Some("80836"));
        assert_eq!(results[1].detail_url, None);
        assert_eq!(results[2].detail_id().as_deref(), Some("5"));
    }

    #[test]
    fn test_parse_detail_page() {
        let html = r#"
            <div class="detailRow row1">
              <span class="detailLabel">First Line:</span>
              <span class="detailCell">If eighty-eight be past then thrive&nbsp;</span>
            </div>
            <div class="detailRow row0">
              <span class="detailLabel">Author (Last name, First):</span>
              <span class="detailCell">&nbsp;</span>
            </div>
            <div class="detailRow row1">
              <span class="detailLabel">Notes:</span>
              <span class="detailCell">Love &amp;amp; <i>duty</i>&amp;nbsp;</span>
            </div>
            <div class="detailRow row0">
              <span class="detailLabel">Orphan:</span>
            </div>
        "#;
        let detail = parse_detail_page("https://firstlines.folger.edu/detail.php?id=17", html).unwrap();
        assert_eq!(detail.id, "17");
        assert_eq!(detail.get("First Line"), Some("If eighty-eight be past then thrive"));
        assert_eq!(detail.field(Field::Author), "");
        assert_eq!(detail.get("Author (Last name, First)"), Some(""));
        // Text nodes are stripped individually and joined without separators.
        assert_eq!(detail.get("Notes"), Some("Love &duty "));
        assert_eq!(detail.get("Orphan"), None);
        assert_eq!(detail.field(Field::Id), "17");
        assert_eq!(detail.field(Field::Shelfmark), "");
    }

    #[test]
    fn test_detail_set_replaces() {
        let mut detail = Detail::new("1");
        assert!(detail.is_empty());
        detail.set("Title", "a");
        detail.set("Title", "b");
        assert_eq!(detail.values, vec![("Title".to_string(), "b".to_string())]);
    }
}
