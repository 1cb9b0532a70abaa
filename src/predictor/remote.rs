use std::io::Cursor;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::blocking::{multipart, Client};
use tracing::{debug, info};

use crate::errors::{Result, SegError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Prediction service reached over HTTP.
///
/// Posts the whole image and receives an already colorized PNG, so the
/// tiled engine is bypassed entirely. No retries.
pub struct RemotePredictor {
    api_url: String,
    timeout: Duration,
    client: Client,
}

impl RemotePredictor {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| network_failure(api_url, timeout, e))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/predict/", self.api_url)
    }

    /// `POST {api_url}/predict/?patch_size=..&subdivisions=..` with the image
    /// as multipart field `file`.
    pub fn predict_image(
        &self,
        image: &DynamicImage,
        patch_size: usize,
        subdivisions: usize,
    ) -> Result<RgbImage> {
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        let png = png.into_inner();

        let endpoint = self.endpoint();
        info!(url = %endpoint, bytes = png.len(), "posting image to prediction service");

        let part = multipart::Part::bytes(png)
            .file_name("image.png")
            .mime_str("image/png")
            .map_err(|e| network_failure(&endpoint, self.timeout, e))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&endpoint)
            .query(&[("patch_size", patch_size), ("subdivisions", subdivisions)])
            .multipart(form)
            .send()
            .map_err(|e| network_failure(&endpoint, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SegError::NetworkFailure {
                url: endpoint,
                reason: format!("server answered {status}"),
                source: None,
            });
        }

        let body = response
            .bytes()
            .map_err(|e| network_failure(&endpoint, self.timeout, e))?;
        debug!(bytes = body.len(), "received prediction");

        let result = image::load_from_memory(&body).map_err(|e| SegError::NetworkFailure {
            url: endpoint.clone(),
            reason: "response is not a decodable image".to_string(),
            source: Some(Box::new(e)),
        })?;
        Ok(result.into_rgb8())
    }
}

fn network_failure(url: &str, timeout: Duration, err: reqwest::Error) -> SegError {
    let reason = if err.is_timeout() {
        format!("request timed out after {}s", timeout.as_secs())
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        "request failed".to_string()
    };
    SegError::NetworkFailure {
        url: url.to_string(),
        reason,
        source: Some(Box::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ignores_trailing_slash() -> Result<()> {
        let remote = RemotePredictor::new("http://localhost:8000/", DEFAULT_TIMEOUT)?;
        assert_eq!(remote.endpoint(), "http://localhost:8000/predict/");
        Ok(())
    }

    #[test]
    fn refused_connection_is_a_network_failure() -> Result<()> {
        // bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let remote = RemotePredictor::new(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(5),
        )?;
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        assert!(matches!(
            remote.predict_image(&image, 256, 2),
            Err(SegError::NetworkFailure { .. })
        ));
        Ok(())
    }
}
