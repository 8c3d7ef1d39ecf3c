//! Progress push to the HTTP controller

use crate::core::progress::{DownloadProgress, StatusUpdate};
use crate::error::ArchiveError;
use crate::report::ProgressSink;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts progress and status records to the controller. Never retries;
/// the next event supersedes a lost one.
pub struct ProgressReporter {
    client: Client,
    base: Url,
}

impl ProgressReporter {
    pub fn new(controller_url: &str) -> Result<Self, ArchiveError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(client, controller_url)
    }

    pub fn with_client(client: Client, controller_url: &str) -> Result<Self, ArchiveError> {
        let mut base = Url::parse(controller_url)?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { client, base })
    }

    /// Controller URL with `segments` appended, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ArchiveError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn progress_url(&self, video_id: &str) -> Result<Url, ArchiveError> {
        self.endpoint(&["progress", video_id])
    }

    fn status_url(&self, video_id: &str) -> Result<Url, ArchiveError> {
        self.endpoint(&["videos", video_id, "status"])
    }

    async fn post<T: Serialize + Sync>(&self, url: Url, body: &T) -> Result<(), ArchiveError> {
        let response = self.client.post(url.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        debug!("Posted to {}", url);
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn publish(&self, progress: &DownloadProgress, _force: bool) -> Result<(), ArchiveError> {
        let url = self.progress_url(&progress.video_id)?;
        self.post(url, progress).await
    }

    async fn publish_status(&self, update: &StatusUpdate) -> Result<(), ArchiveError> {
        let url = self.status_url(&update.video_id)?;
        self.post(url, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::DownloadStatus;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_progress_post() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/progress/vid")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "video_id": "vid",
                "status": "downloading",
                "downloaded": 10,
                "total": 40,
            })))
            .with_status(200)
            .create_async()
            .await;

        let reporter = ProgressReporter::new(&format!("{}/", server.url())).unwrap();
        let progress = DownloadProgress::new("vid", "w1", DownloadStatus::Downloading).with_bytes(10, 40);
        reporter.publish(&progress, false).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_post() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/videos/vid/status")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "status": "error",
                "error": "boom",
            })))
            .with_status(204)
            .create_async()
            .await;

        let reporter = ProgressReporter::new(&server.url()).unwrap();
        let mut update = StatusUpdate::new("vid", "w1", DownloadStatus::Error);
        update.error = Some("boom".to_string());
        reporter.publish_status(&update).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/progress/vid")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let reporter = ProgressReporter::new(&server.url()).unwrap();
        let progress = DownloadProgress::new("vid", "w1", DownloadStatus::Downloading);
        let result = reporter.publish(&progress, true).await;

        assert!(matches!(result, Err(ArchiveError::HttpStatus { status: 500, .. })));
        mock.assert_async().await;
    }

    #[test]
    fn test_endpoints_escape_the_id() {
        let reporter = ProgressReporter::new("http://ctl.local/api/?debug=1").unwrap();

        assert_eq!(
            reporter.progress_url("a/b?c#d").unwrap().as_str(),
            "http://ctl.local/api/progress/a%2Fb%3Fc%23d"
        );
        assert_eq!(
            reporter.status_url("vid").unwrap().as_str(),
            "http://ctl.local/api/videos/vid/status"
        );
    }

    #[test]
    fn test_invalid_controller_url() {
        assert!(matches!(
            ProgressReporter::new("not a url"),
            Err(ArchiveError::Url(_))
        ));
        assert!(matches!(
            ProgressReporter::new("mailto:ops@example.com"),
            Err(ArchiveError::Url(_))
        ));
    }
}
