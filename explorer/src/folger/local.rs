//! A Folger client which reads from the local file system instead of the Folger site.
//!
//! A local mirror is a directory with the structure
//!
//! ```text
//! DIR/
//!     search/
//!         <shelfmark>.html
//!     detail/
//!         <id>.html
//! ```
//!
//! where `<shelfmark>` is the slugified `val1` parameter of the search URL. A [`Mirror`] writes
//! pages in this layout, and a [`LocalClient`] reads them back.

use super::{detail_id, Folger};
use anyhow::{Context, Error};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use surf::Url;

/// A Folger client which reads pages saved in a local mirror.
pub struct LocalClient {
    root: PathBuf,
}

impl LocalClient {
    /// Open a local mirror.
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    /// The search URL for each search page saved in this mirror.
    ///
    /// Saved pages don't record the URL they were fetched from, so the URLs are reconstructed from
    /// the file names. They resolve back to the same files when passed to
    /// [`search_page`](Folger::search_page).
    pub fn search_urls(&self) -> Result<Vec<String>, Error> {
        let dir = self.root.join("search");
        let mut urls = dir
            .read_dir()
            .with_context(|| format!("unable to read directory {}", dir.display()))?
            .filter_map(|dirent| match dirent {
                Ok(de) => {
                    let path = de.path();
                    if path.extension()? != "html" {
                        return None;
                    }
                    let key = path.file_stem()?.to_str()?.to_string();
                    Some(format!(
                        "{}advancedSearch.php?val1={key}&col1=shelfmark1",
                        super::BASE_URL
                    ))
                }
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", dir.display());
                    None
                }
            })
            .collect::<Vec<_>>();
        urls.sort();
        Ok(urls)
    }

    fn read(&self, path: PathBuf) -> Result<String, Error> {
        tracing::debug!("reading {}", path.display());
        fs::read_to_string(&path).with_context(|| format!("unable to read {}", path.display()))
    }
}

#[async_trait]
impl Folger for LocalClient {
    async fn search_page(&self, url: &str) -> Result<String, Error> {
        self.read(search_path(&self.root, url)?)
    }

    async fn detail_page(&self, url: &str) -> Result<String, Error> {
        self.read(detail_path(&self.root, &detail_id(url)))
    }
}

/// Saves fetched pages in the layout read by [`LocalClient`].
#[derive(Clone, Debug)]
pub struct Mirror {
    root: PathBuf,
}

impl Mirror {
    /// Write pages under `root`, creating it if necessary.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.join("search"))?;
        fs::create_dir_all(root.join("detail"))?;
        Ok(Self { root })
    }

    /// Save a search page fetched from `url`.
    pub fn save_search_page(&self, url: &str, html: &str) -> Result<(), Error> {
        write(search_path(&self.root, url)?, html)
    }

    /// Save the detail page for the record `id`.
    pub fn save_detail_page(&self, id: &str, html: &str) -> Result<(), Error> {
        write(detail_path(&self.root, id), html)
    }
}

fn write(path: PathBuf, contents: &str) -> Result<(), Error> {
    fs::write(&path, contents).with_context(|| format!("unable to write {}", path.display()))
}

fn search_path(root: &Path, url: &str) -> Result<PathBuf, Error> {
    Ok(root
        .join("search")
        .join(format!("{}.html", search_key(url)?)))
}

fn detail_path(root: &Path, id: &str) -> PathBuf {
    root.join("detail").join(format!("{}.html", slugify(id)))
}

/// The file name under which a search page is stored.
///
/// This is the slugified `val1` (shelfmark) parameter of the search URL, falling back to the whole
/// URL if it has no such parameter.
fn search_key(url: &str) -> Result<String, Error> {
    let parsed = Url::parse(url).with_context(|| format!("malformed search URL {url}"))?;
    let key = parsed
        .query_pairs()
        .find(|(param, _)| param == "val1")
        .map(|(_, value)| slugify(&value))
        .unwrap_or_else(|| slugify(url));
    if key.is_empty() {
        return Err(Error::msg(format!("search URL {url} has no usable key")));
    }
    Ok(key)
}

/// Lowercase `s` and collapse every run of non-alphanumeric characters into a single `-`.
fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
