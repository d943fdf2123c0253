//! Anonymous FTP retrieval.
//!
//! suppaftp's client is blocking. Each session runs on tokio's blocking pool
//! over its own connection.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, info_span};

use crate::FetchError;

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "ftp.legis.state.tx.us".to_string(),
            port: 21,
            user: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FtpFetcher {
    config: FtpConfig,
}

impl FtpFetcher {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    /// Download `file_name` from `directory`. A 550 reply, whether for the
    /// directory or the file, is [`FetchError::NotFound`].
    pub async fn retrieve(&self, directory: &str, file_name: &str) -> Result<Vec<u8>, FetchError> {
        let config = self.config.clone();
        let directory = directory.to_string();
        let file_name = file_name.to_string();
        tokio::task::spawn_blocking(move || {
            let location = format!("{directory}/{file_name}");
            let span = info_span!("ftp_retrieve", host = %config.host, %location);
            let _guard = span.enter();

            let mut stream = open_session(&config, &location)?;
            let result = stream
                .cwd(&directory)
                .and_then(|_| stream.retr_as_buffer(&file_name))
                .map(|cursor| cursor.into_inner())
                .map_err(|err| classify_ftp_error(err, &location));
            let _ = stream.quit();
            if let Ok(bytes) = &result {
                debug!(bytes = bytes.len(), "ftp document retrieved");
            }
            result
        })
        .await
        .map_err(|e| FetchError::Task(e.to_string()))?
    }

    /// Names listed in `directory` (NLST). An absent directory is [`FetchError::NotFound`].
    pub async fn list(&self, directory: &str) -> Result<Vec<String>, FetchError> {
        let config = self.config.clone();
        let directory = directory.to_string();
        tokio::task::spawn_blocking(move || {
            let span = info_span!("ftp_list", host = %config.host, %directory);
            let _guard = span.enter();

            let mut stream = open_session(&config, &directory)?;
            let result = stream
                .nlst(Some(&directory))
                .map_err(|err| classify_ftp_error(err, &directory));
            let _ = stream.quit();
            result
        })
        .await
        .map_err(|e| FetchError::Task(e.to_string()))?
    }
}

fn open_session(config: &FtpConfig, location: &str) -> Result<FtpStream, FetchError> {
    let addr = resolve(config, location)?;
    let mut stream = FtpStream::connect_timeout(addr, config.timeout)
        .map_err(|err| classify_ftp_error(err, location))?;
    stream
        .login(config.user.as_str(), config.password.as_str())
        .map_err(|err| classify_ftp_error(err, location))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|err| classify_ftp_error(err, location))?;
    Ok(stream)
}

fn resolve(config: &FtpConfig, location: &str) -> Result<SocketAddr, FetchError> {
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| FetchError::Ftp {
            location: location.to_string(),
            message: format!("cannot resolve {}:{}", config.host, config.port),
        })
}

fn classify_ftp_error(err: FtpError, location: &str) -> FetchError {
    match &err {
        FtpError::UnexpectedResponse(response) if is_not_found_reply(&response.status) => {
            FetchError::NotFound {
                location: location.to_string(),
            }
        }
        _ => FetchError::Ftp {
            location: location.to_string(),
            message: err.to_string(),
        },
    }
}

/// 550: requested action not taken, file unavailable.
pub(crate) fn is_not_found_reply(status: &Status) -> bool {
    matches!(status, Status::FileUnavailable)
}
