use crate::config::Config;
use crate::error::ScanError;
use crate::types::{PlateCandidate, RecognizerResponse, Upload};
use log::{debug, info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

/// Client for the external plate reader.
pub struct PlateRecognizer {
    client: reqwest::Client,
    url: Url,
    token: String,
    retry_backoff: Duration,
}

impl PlateRecognizer {
    /// Fails if no provider token is configured.
    pub fn from_config(config: &Config) -> Result<PlateRecognizer, ScanError> {
        let token = config
            .plate_token
            .clone()
            .ok_or(ScanError::Configuration("PLATE_TOKEN"))?;
        let client = reqwest::Client::builder()
            .timeout(config.plate_timeout)
            .build()
            .map_err(|e| ScanError::UpstreamUnavailable(e.to_string()))?;
        Ok(PlateRecognizer {
            client,
            url: config.plate_url.clone(),
            token,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Submits one frame. A 429 is retried exactly once after the backoff;
    /// anything else is final.
    pub async fn recognize(
        &self,
        upload: &Upload,
        regions: &[String],
        camera_id: &str,
    ) -> Result<Vec<PlateCandidate>, ScanError> {
        let mut response = self.send(upload, regions, camera_id).await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                "Plate recognizer rate limited us; retrying once in {:?}",
                self.retry_backoff
            );
            tokio::time::sleep(self.retry_backoff).await;
            response = self.send(upload, regions, camera_id).await?;
        }

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!("Plate recognizer rejected frame with {}: {}", status, body);
            return Err(ScanError::UpstreamRejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RecognizerResponse = response
            .json()
            .await
            .map_err(|e| ScanError::UpstreamMalformed(e.to_string()))?;
        info!(
            "Plate recognizer returned {} candidate(s)",
            parsed.results.len()
        );
        Ok(parsed.results)
    }

    async fn send(
        &self,
        upload: &Upload,
        regions: &[String],
        camera_id: &str,
    ) -> Result<reqwest::Response, ScanError> {
        // Multipart forms are consumed by send, so each attempt builds its own.
        let part = Part::bytes(upload.data.to_vec())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .map_err(|e| ScanError::Validation(format!("invalid content type: {}", e)))?;
        let mut form = Form::new().part("upload", part);
        for region in regions {
            form = form.text("regions", region.clone());
        }
        if !camera_id.is_empty() {
            form = form.text("camera_id", camera_id.to_string());
        }

        debug!("Posting {} bytes to {}", upload.data.len(), self.url);
        self.client
            .post(self.url.clone())
            .header("Authorization", format!("Token {}", self.token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ScanError::UpstreamUnavailable(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use warp::Filter;

    /// In-process stand-in for the plate reader. Replies are played back in
    /// order; the last one repeats once the script runs out.
    pub struct FakeRecognizer {
        pub addr: SocketAddr,
        pub calls: Arc<AtomicUsize>,
        pub last_request: Arc<Mutex<Option<(String, String)>>>,
    }

    pub fn spawn_fake(script: Vec<(u16, &'static str)>) -> FakeRecognizer {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(Mutex::new(None));
        let counter = calls.clone();
        let seen = last_request.clone();
        let route = warp::post()
            .and(warp::path!("v1" / "plate-reader"))
            .and(warp::header::<String>("authorization"))
            .and(warp::body::bytes())
            .map(move |auth: String, body: Bytes| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                *seen.lock().unwrap() = Some((auth, String::from_utf8_lossy(&body).into_owned()));
                let (status, reply) = script[n.min(script.len() - 1)];
                warp::reply::with_status(
                    reply,
                    warp::http::StatusCode::from_u16(status).unwrap(),
                )
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        FakeRecognizer {
            addr,
            calls,
            last_request,
        }
    }

    pub fn test_config(url: &str) -> Config {
        Config::from_lookup(|key| match key {
            "PLATE_TOKEN" => Some("test-token".to_string()),
            "PLATE_URL" => Some(url.to_string()),
            "PLATE_RETRY_BACKOFF_MS" => Some("10".to_string()),
            "PLATE_TIMEOUT_SECS" => Some("5".to_string()),
            _ => None,
        })
        .unwrap()
    }

    pub fn fake_url(fake: &FakeRecognizer) -> String {
        format!("http://{}/v1/plate-reader/", fake.addr)
    }

    pub fn jpeg() -> Upload {
        Upload {
            file_name: "gate.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            data: Bytes::from_static(b"\xff\xd8\xff\xe0fake-jpeg"),
        }
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let mut config = test_config("http://127.0.0.1:9/v1/plate-reader/");
        config.plate_token = None;
        assert!(matches!(
            PlateRecognizer::from_config(&config),
            Err(ScanError::Configuration("PLATE_TOKEN"))
        ));
    }

    #[tokio::test]
    async fn sends_token_regions_and_camera() {
        let fake = spawn_fake(vec![(200, r#"{"results":[{"plate":"abc123","score":0.9}]}"#)]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let results = recognizer
            .recognize(&jpeg(), &["bo".to_string(), "pe".to_string()], "gate-1")
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].plate.as_deref(), Some("abc123"));
        let (auth, body) = fake.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(auth, "Token test-token");
        assert!(body.contains("name=\"upload\"; filename=\"gate.jpg\""));
        assert!(body.contains("fake-jpeg"));
        assert_eq!(body.matches("name=\"regions\"").count(), 2);
        assert!(body.contains("gate-1"));
    }

    #[tokio::test]
    async fn omits_empty_camera_id() {
        let fake = spawn_fake(vec![(201, r#"{"results":[]}"#)]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let results = recognizer
            .recognize(&jpeg(), &["bo".to_string()], "")
            .await
            .unwrap();

        assert!(results.is_empty());
        let (_, body) = fake.last_request.lock().unwrap().clone().unwrap();
        assert!(!body.contains("camera_id"));
    }

    #[tokio::test]
    async fn retries_once_after_rate_limit() {
        let fake = spawn_fake(vec![
            (429, "slow down"),
            (200, r#"{"results":[{"plate":"xyz999","score":0.95}]}"#),
        ]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let results = recognizer.recognize(&jpeg(), &[], "").await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_is_final() {
        let fake = spawn_fake(vec![(429, "slow down"), (429, "still slow")]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let err = recognizer.recognize(&jpeg(), &[], "").await.unwrap_err();

        match err {
            ScanError::UpstreamRejected { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "still slow");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_statuses_are_not_retried() {
        let fake = spawn_fake(vec![(403, "bad token")]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let err = recognizer.recognize(&jpeg(), &[], "").await.unwrap_err();

        assert!(matches!(err, ScanError::UpstreamRejected { status: 403, .. }));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let fake = spawn_fake(vec![(200, "<html>oops</html>")]);
        let recognizer = PlateRecognizer::from_config(&test_config(&fake_url(&fake))).unwrap();

        let err = recognizer.recognize(&jpeg(), &[], "").await.unwrap_err();

        assert!(matches!(err, ScanError::UpstreamMalformed(_)));
    }

    #[tokio::test]
    async fn unreachable_recognizer_is_unavailable() {
        // Bind then drop a listener so the port is known to be closed.
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);
        let url = format!("http://{}/v1/plate-reader/", addr);
        let recognizer = PlateRecognizer::from_config(&test_config(&url)).unwrap();

        let err = recognizer.recognize(&jpeg(), &[], "").await.unwrap_err();

        assert!(matches!(err, ScanError::UpstreamUnavailable(_)));
        assert_eq!(err.status(), warp::http::StatusCode::BAD_GATEWAY);
    }
}
