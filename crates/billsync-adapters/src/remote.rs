//! Access to the legislature's published documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use billsync_core::BillId;
use billsync_storage::{
    history_directory, history_document_name, parse_bucket_directory, parse_history_document_name,
    BucketRange, FetchError, FtpFetcher, HttpFetcher, DEFAULT_BUCKET_SIZE,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::html_to_plain_text;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no remote directory configured for bill type {0}")]
    UnknownBillType(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// The remote affirmatively reported that the document does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_not_found())
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Raw history document bytes for `bill`.
    async fn fetch_history_document(&self, bill: &BillId) -> Result<Vec<u8>, SourceError>;

    /// Plain text of a bill text page; `None` when the page does not exist.
    async fn fetch_full_text(&self, url: &str) -> Result<Option<String>, SourceError>;

    /// Highest bill number published for `bill_type`, if any.
    async fn discover_last_number(&self, bill_type: &str) -> Result<Option<u32>, SourceError>;
}

/// Directory layout of the history archive, shared by the FTP site and
/// local mirrors of it.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    pub session: String,
    pub bucket_size: u32,
    type_dirs: HashMap<String, String>,
}

impl RemoteLayout {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            type_dirs: HashMap::new(),
        }
    }

    pub fn with_type_directory(mut self, bill_type: &str, directory: &str) -> Self {
        self.type_dirs
            .insert(bill_type.to_ascii_uppercase(), directory.to_string());
        self
    }

    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = bucket_size.max(1);
        self
    }

    fn type_directory(&self, bill_type: &str) -> Result<&str, SourceError> {
        self.type_dirs
            .get(&bill_type.to_ascii_uppercase())
            .map(String::as_str)
            .ok_or_else(|| SourceError::UnknownBillType(bill_type.to_string()))
    }

    /// `/bills/{session}/billhistory/{type_dir}`
    pub fn type_root(&self, bill_type: &str) -> Result<String, SourceError> {
        Ok(format!(
            "/bills/{}/billhistory/{}",
            self.session,
            self.type_directory(bill_type)?
        ))
    }

    /// Directory and file name of `bill`'s history document.
    pub fn history_location(&self, bill: &BillId) -> Result<(String, String), SourceError> {
        let type_dir = self.type_directory(&bill.bill_type)?;
        Ok((
            history_directory(&self.session, type_dir, bill, self.bucket_size),
            history_document_name(bill),
        ))
    }
}

/// Bucket directories of `bill_type` found in `names`, highest first.
fn buckets_descending(bill_type: &str, names: &[String]) -> Vec<(BucketRange, String)> {
    let mut buckets: Vec<(BucketRange, String)> = names
        .iter()
        .filter_map(|name| {
            let leaf = name.trim_end_matches('/').rsplit('/').next().unwrap_or(name);
            parse_bucket_directory(bill_type, leaf).map(|range| (range, leaf.to_string()))
        })
        .collect();
    buckets.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    buckets
}

fn highest_document(bill_type: &str, names: &[String]) -> Option<u32> {
    names
        .iter()
        .filter_map(|name| parse_history_document_name(bill_type, name))
        .max()
}

/// The legislature's anonymous FTP archive plus HTTP bill text pages.
pub struct LegislatureSource {
    layout: RemoteLayout,
    ftp: FtpFetcher,
    http: Arc<HttpFetcher>,
}

impl LegislatureSource {
    pub fn new(layout: RemoteLayout, ftp: FtpFetcher, http: Arc<HttpFetcher>) -> Self {
        Self { layout, ftp, http }
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }
}

#[async_trait]
impl RemoteSource for LegislatureSource {
    async fn fetch_history_document(&self, bill: &BillId) -> Result<Vec<u8>, SourceError> {
        let (directory, file_name) = self.layout.history_location(bill)?;
        Ok(self.ftp.retrieve(&directory, &file_name).await?)
    }

    async fn fetch_full_text(&self, url: &str) -> Result<Option<String>, SourceError> {
        match self.http.fetch_bytes(url).await {
            Ok(response) => Ok(Some(html_to_plain_text(&response.body))),
            Err(err) if err.is_not_found() => {
                debug!(%url, "bill text page not published");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn discover_last_number(&self, bill_type: &str) -> Result<Option<u32>, SourceError> {
        let root = self.layout.type_root(bill_type)?;
        let names = match self.ftp.list(&root).await {
            Ok(names) => names,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        for (range, bucket) in buckets_descending(bill_type, &names) {
            let directory = format!("{root}/{bucket}");
            let documents = match self.ftp.list(&directory).await {
                Ok(documents) => documents,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            if let Some(last) = highest_document(bill_type, &documents) {
                debug!(bill_type, bucket = %bucket, start = range.start, last, "discovered last bill number");
                return Ok(Some(last));
            }
        }
        Ok(None)
    }
}

/// A local copy of the archive with the same directory layout rooted at
/// `root`. Bill text pages are looked up by file name under `root/billtext`.
pub struct MirrorSource {
    root: PathBuf,
    layout: RemoteLayout,
}

impl MirrorSource {
    pub fn new(root: impl Into<PathBuf>, layout: RemoteLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    fn local_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    async fn read_names(&self, dir: &Path) -> Result<Option<Vec<String>>, SourceError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SourceError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };
        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => return Ok(Some(names)),
                Err(source) => {
                    return Err(SourceError::Io {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl RemoteSource for MirrorSource {
    async fn fetch_history_document(&self, bill: &BillId) -> Result<Vec<u8>, SourceError> {
        let (directory, file_name) = self.layout.history_location(bill)?;
        let path = self.local_path(&directory).join(&file_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::Fetch(FetchError::NotFound {
                    location: path.display().to_string(),
                }))
            }
            Err(source) => Err(SourceError::Io { path, source }),
        }
    }

    async fn fetch_full_text(&self, url: &str) -> Result<Option<String>, SourceError> {
        let Some(file_name) = url.rsplit('/').next().filter(|name| !name.is_empty()) else {
            warn!(%url, "bill text url has no file name");
            return Ok(None);
        };
        let path = self.root.join("billtext").join(file_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(html_to_plain_text(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SourceError::Io { path, source }),
        }
    }

    async fn discover_last_number(&self, bill_type: &str) -> Result<Option<u32>, SourceError> {
        let root = self.local_path(&self.layout.type_root(bill_type)?);
        let Some(names) = self.read_names(&root).await? else {
            return Ok(None);
        };
        for (_, bucket) in buckets_descending(bill_type, &names) {
            let Some(documents) = self.read_names(&root.join(&bucket)).await? else {
                continue;
            };
            if let Some(last) = highest_document(bill_type, &documents) {
                return Ok(Some(last));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RemoteLayout {
        RemoteLayout::new("89R")
            .with_type_directory("HB", "house_bills")
            .with_type_directory("sjr", "senate_joint_resolutions")
    }

    #[test]
    fn history_location_uses_bucket_directories() {
        let (dir, file) = layout().history_location(&BillId::new("HB", 100)).unwrap();
        assert_eq!(dir, "/bills/89R/billhistory/house_bills/HB00100_HB00198");
        assert_eq!(file, "HB 100.xml");
        let (dir, _) = layout().history_location(&BillId::new("SJR", 1)).unwrap();
        assert_eq!(dir, "/bills/89R/billhistory/senate_joint_resolutions/SJR00001_SJR00099");
    }

    #[test]
    fn unknown_bill_type_is_not_a_not_found() {
        let err = layout().history_location(&BillId::new("XYZ", 1)).unwrap_err();
        assert!(matches!(err, SourceError::UnknownBillType(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn buckets_sort_highest_first_and_ignore_other_types() {
        let names = vec![
            "HB00001_HB00099".to_string(),
            "/bills/89R/billhistory/house_bills/HB00199_HB00297/".to_string(),
            "HJR00001_HJR00099".to_string(),
            "HB00100_HB00198".to_string(),
            "readme.txt".to_string(),
        ];
        let buckets = buckets_descending("HB", &names);
        let starts: Vec<u32> = buckets.iter().map(|(r, _)| r.start).collect();
        assert_eq!(starts, vec![199, 100, 1]);
        assert_eq!(buckets[0].1, "HB00199_HB00297");
    }

    #[tokio::test]
    async fn mirror_reads_documents_and_reports_missing_ones() {
        let root = tempfile::tempdir().unwrap();
        let bucket = root
            .path()
            .join("bills/89R/billhistory/house_bills/HB00100_HB00198");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("HB 100.xml"), b"<billhistory/>").unwrap();
        std::fs::write(bucket.join("HB 131.xml"), b"<billhistory/>").unwrap();
        std::fs::create_dir_all(root.path().join("bills/89R/billhistory/house_bills/HB00199_HB00297"))
            .unwrap();

        let mirror = MirrorSource::new(root.path(), layout());
        let bytes = mirror
            .fetch_history_document(&BillId::new("HB", 100))
            .await
            .unwrap();
        assert_eq!(bytes, b"<billhistory/>");

        let err = mirror
            .fetch_history_document(&BillId::new("HB", 101))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // the empty highest bucket is skipped
        assert_eq!(mirror.discover_last_number("HB").await.unwrap(), Some(131));
        assert_eq!(mirror.discover_last_number("SJR").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mirror_full_text_is_optional() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("billtext")).unwrap();
        std::fs::write(
            root.path().join("billtext/HB00001I.htm"),
            b"<html><body><p>AN ACT</p><p>relating to parks.</p></body></html>",
        )
        .unwrap();
        let mirror = MirrorSource::new(root.path(), layout());
        let text = mirror
            .fetch_full_text("https://capitol.texas.gov/tlodocs/89R/billtext/html/HB00001I.htm")
            .await
            .unwrap();
        assert_eq!(text.as_deref(), Some("AN ACT\nrelating to parks."));
        let missing = mirror
            .fetch_full_text("https://capitol.texas.gov/tlodocs/89R/billtext/html/HB00002I.htm")
            .await
            .unwrap();
        assert_eq!(missing, None);
    }
}
