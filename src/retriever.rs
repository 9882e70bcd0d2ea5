use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::cancel::CancelToken;
use crate::config::HttpSettings;
use crate::error::IngestError;

pub const CHUNK_SIZE: usize = 64 * 1024;

pub type TransferObserver<'a> = &'a dyn Fn(u64, Option<u64>);

pub trait ArchiveSource: Send + Sync {
    // On error nothing is left at `destination` and an existing file is kept.
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        observer: TransferObserver<'_>,
        cancel: &CancelToken,
    ) -> Result<u64, IngestError>;
}

#[derive(Clone)]
pub struct HttpArchiveSource {
    client: Client,
}

impl HttpArchiveSource {
    pub fn new(settings: &HttpSettings) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("govdata-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::Configuration(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|err| IngestError::Configuration(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        observer: TransferObserver<'_>,
        cancel: &CancelToken,
    ) -> Result<u64, IngestError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| IngestError::Retrieval {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(IngestError::RetrievalStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let total = response.content_length();
        write_stream_atomic(url, response, total, destination, observer, cancel)
    }
}

pub fn write_stream_atomic<R: Read>(
    url: &str,
    mut reader: R,
    total: Option<u64>,
    destination: &Path,
    observer: TransferObserver<'_>,
    cancel: &CancelToken,
) -> Result<u64, IngestError> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let write_error = |err: std::io::Error| IngestError::Retrieval {
        url: url.to_string(),
        message: format!("write {}: {err}", destination.display()),
    };
    fs::create_dir_all(parent).map_err(write_error)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".download")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(write_error)?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    observer(0, total);
    loop {
        cancel.check()?;
        let read = reader.read(&mut buffer).map_err(|err| IngestError::Retrieval {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if read == 0 {
            break;
        }
        temp.write_all(&buffer[..read]).map_err(write_error)?;
        written += read as u64;
        observer(written, total);
    }

    if let Some(expected) = total {
        if written != expected {
            return Err(IngestError::Retrieval {
                url: url.to_string(),
                message: format!("truncated body: {written} of {expected} bytes"),
            });
        }
    }

    temp.as_file_mut().sync_all().map_err(write_error)?;
    temp.persist(destination)
        .map_err(|err| write_error(err.error))?;
    Ok(written)
}
