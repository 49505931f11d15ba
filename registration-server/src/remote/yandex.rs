use super::{FolderStatus, RemoteError, RemoteStorage};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Client for the Yandex.Disk REST API (`/resources`, `/resources/upload`,
/// `/resources/download`). Uploads and downloads go through short-lived
/// links returned by the API.
#[derive(Clone)]
pub struct YandexDisk {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct Link {
    href: String,
}

impl YandexDisk {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn link(&self, request: reqwest::RequestBuilder) -> Result<String, RemoteError> {
        let resp = expect_success(request.send().await?).await?;
        let link: Link = resp
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("missing link: {e}")))?;
        Ok(link.href)
    }
}

fn auth(token: &str) -> String {
    format!("OAuth {token}")
}

async fn expect_success(resp: Response) -> Result<Response, RemoteError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    Err(status_error(resp).await)
}

async fn status_error(resp: Response) -> RemoteError {
    let status = resp.status().as_u16();
    let mut message = resp.text().await.unwrap_or_default();
    if message.len() > 200 {
        let cut = (0..=200).rev().find(|&i| message.is_char_boundary(i)).unwrap_or(0);
        message.truncate(cut);
    }
    RemoteError::Status { status, message }
}

#[async_trait]
impl RemoteStorage for YandexDisk {
    async fn exists(&self, token: &str, path: &str) -> Result<bool, RemoteError> {
        let resp = self
            .http
            .get(self.url("/resources"))
            .header("Authorization", auth(token))
            .query(&[("path", path)])
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(resp).await),
        }
    }

    async fn create_folder(&self, token: &str, path: &str) -> Result<FolderStatus, RemoteError> {
        let resp = self
            .http
            .put(self.url("/resources"))
            .header("Authorization", auth(token))
            .query(&[("path", path)])
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(FolderStatus::Created),
            StatusCode::CONFLICT => Ok(FolderStatus::AlreadyExists),
            _ => Err(status_error(resp).await),
        }
    }

    async fn upload_handle(
        &self,
        token: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<String, RemoteError> {
        let overwrite = if overwrite { "true" } else { "false" };
        self.link(
            self.http
                .get(self.url("/resources/upload"))
                .header("Authorization", auth(token))
                .query(&[("path", path), ("overwrite", overwrite)]),
        )
        .await
    }

    async fn put_bytes(&self, url: &str, body: Bytes) -> Result<(), RemoteError> {
        let resp = self.http.put(url).body(body).send().await?;
        expect_success(resp).await.map(|_| ())
    }

    async fn download_handle(&self, token: &str, path: &str) -> Result<String, RemoteError> {
        self.link(
            self.http
                .get(self.url("/resources/download"))
                .header("Authorization", auth(token))
                .query(&[("path", path)]),
        )
        .await
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes, RemoteError> {
        let resp = expect_success(self.http.get(url).send().await?).await?;
        Ok(resp.bytes().await?)
    }
}
