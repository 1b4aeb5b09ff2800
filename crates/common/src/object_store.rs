use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use flate2::read::GzDecoder;

use crate::config::{storage_credentials_from_env, storage_region_from_env, Storage, StorageCredentials};
use crate::types::{Exchange, LoadError, DATE_FORMAT};

/// Object key for one exchange's daily merged trade file. Bit-exact vendor
/// layout: the key is joined under the store root (fs directory or base URL).
pub fn blob_key(vendor: &str, product: &str, exchange: Exchange, date: NaiveDate) -> String {
    let date = date.format(DATE_FORMAT);
    let ex = exchange.as_str();
    format!(
        "{vendor}/{product}/{ex}/ingestion/{date}/data/merged/{ex}-{date}-NORMALIZEDMP-Data-1-of-1.csv.gz"
    )
}

#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub path: String,
    pub size_bytes: Option<i64>,
}

/// A retrieved blob, spooled to local disk so decompression can stream with
/// constant memory no matter how large the uncompressed payload is.
#[derive(Debug)]
pub struct SpooledBlob {
    key: String,
    source: BlobSource,
}

#[derive(Debug)]
enum BlobSource {
    File(std::fs::File),
    Spool(tempfile::NamedTempFile),
}

impl SpooledBlob {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Turn the spooled bytes into a streaming header-keyed record reader.
    pub fn into_reader(self) -> Result<RecordReader, LoadError> {
        let mut file = match self.source {
            BlobSource::File(f) => f,
            BlobSource::Spool(spool) => spool.into_file(),
        };
        file.seek(SeekFrom::Start(0))
            .map_err(|e| LoadError::transient(format!("rewind spool: {e}")))?;
        RecordReader::from_gzip_read(file)
    }
}

/// Streaming CSV reader over a gzip stream. Rows are pulled one at a time;
/// nothing is buffered beyond the decoder's window and one record.
pub struct RecordReader {
    headers: Vec<String>,
    inner: csv::Reader<Box<dyn Read + Send>>,
}

impl RecordReader {
    pub fn from_gzip_read<R: Read + Send + 'static>(read: R) -> Result<Self, LoadError> {
        let decoder = GzDecoder::new(std::io::BufReader::new(read));
        let mut inner = csv::Reader::from_reader(Box::new(decoder) as Box<dyn Read + Send>);
        let headers = inner
            .headers()
            .map_err(|e| LoadError::malformed(format!("header row: {e}")))?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self { headers, inner })
    }

    pub fn from_gzip_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        Self::from_gzip_read(std::io::Cursor::new(bytes.to_vec()))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Next data row, or `None` at end of stream. Decode failures carry the
    /// offending row's position so the operator can find it in the source.
    pub fn next_record(&mut self) -> Result<Option<csv::StringRecord>, LoadError> {
        let mut record = csv::StringRecord::new();
        match self.inner.read_record(&mut record) {
            Ok(true) => Ok(Some(record)),
            Ok(false) => Ok(None),
            Err(e) => {
                let line = e.position().map_or(0, csv::Position::line);
                Err(LoadError::malformed(format!("row at line {line}: {e}")))
            }
        }
    }
}

pub trait ObjectStore {
    /// Resolve path and size without retrieving bytes. `NotFound` when the
    /// `(exchange, date)` combination has no data.
    fn head(
        &self,
        exchange: Exchange,
        date: NaiveDate,
    ) -> impl std::future::Future<Output = Result<BlobMeta, LoadError>> + Send;

    /// Retrieve the gzipped bytes to a local spool.
    fn fetch(
        &self,
        exchange: Exchange,
        date: NaiveDate,
    ) -> impl std::future::Future<Output = Result<SpooledBlob, LoadError>> + Send;
}

/// Locally mounted mirror of the bucket: the same key layout under a root
/// directory. Serves local runs and the test suite.
pub struct FsObjectStore {
    root: PathBuf,
    vendor: String,
    product: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, vendor: &str, product: &str) -> Self {
        Self {
            root: root.into(),
            vendor: vendor.to_string(),
            product: product.to_string(),
        }
    }

    fn full_path(&self, exchange: Exchange, date: NaiveDate) -> (String, PathBuf) {
        let key = blob_key(&self.vendor, &self.product, exchange, date);
        (key.clone(), self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<BlobMeta, LoadError> {
        let (key, path) = self.full_path(exchange, date);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(BlobMeta {
                path: key,
                size_bytes: Some(meta.len() as i64),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::NotFound { path: key })
            }
            Err(e) => Err(LoadError::transient(format!("stat {key}: {e}"))),
        }
    }

    async fn fetch(&self, exchange: Exchange, date: NaiveDate) -> Result<SpooledBlob, LoadError> {
        let (key, path) = self.full_path(exchange, date);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(SpooledBlob {
                key,
                source: BlobSource::File(file),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::NotFound { path: key })
            }
            Err(e) => Err(LoadError::transient(format!("open {key}: {e}"))),
        }
    }
}

/// The object store's HTTP gateway. Requests carry the store credentials as
/// basic auth when present; a per-request timeout bounds every call.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    vendor: String,
    product: String,
    credentials: Option<StorageCredentials>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        vendor: &str,
        product: &str,
        timeout: std::time::Duration,
        credentials: Option<StorageCredentials>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            vendor: vendor.to_string(),
            product: product.to_string(),
            credentials,
        })
    }

    pub fn blob_url(&self, exchange: Exchange, date: NaiveDate) -> (String, String) {
        let key = blob_key(&self.vendor, &self.product, exchange, date);
        let url = format!("{}/{key}", self.base_url);
        (key, url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(creds) = &self.credentials {
            req = req.basic_auth(&creds.access_key_id, Some(&creds.secret_access_key));
        }
        req
    }
}

impl ObjectStore for HttpObjectStore {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<BlobMeta, LoadError> {
        let (key, url) = self.blob_url(exchange, date);
        let resp = self
            .request(reqwest::Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| LoadError::transient(format!("HEAD {key}: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound { path: key });
        }
        if !resp.status().is_success() {
            return Err(LoadError::transient(format!(
                "HEAD {key}: HTTP {}",
                resp.status()
            )));
        }
        Ok(BlobMeta {
            path: key,
            size_bytes: resp.content_length().map(|l| l as i64),
        })
    }

    async fn fetch(&self, exchange: Exchange, date: NaiveDate) -> Result<SpooledBlob, LoadError> {
        let (key, url) = self.blob_url(exchange, date);
        let mut resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| LoadError::transient(format!("GET {key}: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound { path: key });
        }
        if !resp.status().is_success() {
            return Err(LoadError::transient(format!(
                "GET {key}: HTTP {}",
                resp.status()
            )));
        }

        let mut spool = tempfile::NamedTempFile::new()
            .map_err(|e| LoadError::transient(format!("create spool: {e}")))?;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| LoadError::transient(format!("GET {key}: body: {e}")))?
        {
            spool
                .write_all(&chunk)
                .map_err(|e| LoadError::transient(format!("write spool: {e}")))?;
        }
        Ok(SpooledBlob {
            key,
            source: BlobSource::Spool(spool),
        })
    }
}

/// Backend chosen by configuration; workers stay generic over [`ObjectStore`].
pub enum AnyObjectStore {
    Fs(FsObjectStore),
    Http(HttpObjectStore),
}

impl AnyObjectStore {
    pub fn from_config(cfg: &Storage) -> Result<Self> {
        let location = match storage_region_from_env() {
            Some(region) => cfg.location.replace("{region}", &region),
            None => cfg.location.clone(),
        };
        match cfg.backend.as_str() {
            "fs" => Ok(Self::Fs(FsObjectStore::new(
                location,
                &cfg.vendor,
                &cfg.product,
            ))),
            "http" => Ok(Self::Http(HttpObjectStore::new(
                &location,
                &cfg.vendor,
                &cfg.product,
                std::time::Duration::from_secs(cfg.request_timeout_secs),
                storage_credentials_from_env(),
            )?)),
            other => anyhow::bail!("unknown storage backend: {other}"),
        }
    }
}

impl ObjectStore for AnyObjectStore {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<BlobMeta, LoadError> {
        match self {
            Self::Fs(store) => store.head(exchange, date).await,
            Self::Http(store) => store.head(exchange, date).await,
        }
    }

    async fn fetch(&self, exchange: Exchange, date: NaiveDate) -> Result<SpooledBlob, LoadError> {
        match self {
            Self::Fs(store) => store.fetch(exchange, date).await,
            Self::Http(store) => store.fetch(exchange, date).await,
        }
    }
}
