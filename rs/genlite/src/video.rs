//! HTTP client for the remote video generation workers behind an [`crate::endpoint::EndpointPool`].

use std::time::Duration;

use serde::Serialize;

use crate::endpoint::Lease;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, Serialize)]
struct Inputs<'a> {
    prompt: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct Parameters<'a> {
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    num_frames: u32,
    num_inference_steps: u32,
    guidance_scale: f64,
    seed: u64,
    double_num_frames: bool,
    fps: u32,
    super_resolution: bool,
    grain_amount: u32,
}

#[derive(Debug, Clone, Serialize)]
struct Metadata {
    is_thumbnail: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Payload<'a> {
    inputs: Inputs<'a>,
    parameters: Parameters<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

/// The parameters for a single clip generation call, already clamped by [`crate::role::RoleConfig`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_frames: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub seed: u64,
    pub framerate: u32,
    /// Side-channel flag on the request body: the thumbnail variant reuses
    /// the full generation call with fixed dimensions.
    pub is_thumbnail: bool,
}

/// Thin HTTP client posting to the Hugging Face-style inference endpoint
/// protocol. The worker URL itself comes from the leased [`Lease`].
#[derive(Clone)]
pub struct VideoWorker {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl VideoWorker {
    pub fn new(auth_token: Option<String>) -> Self {
        VideoWorker {
            client: reqwest::Client::new(),
            auth_token,
        }
    }

    /// POST a generation request to `lease`'s endpoint, reporting success or
    /// failure (with timeout classification) back to the pool through the
    /// lease before returning.
    #[tracing::instrument(skip_all, fields(endpoint = lease.id, request_id = %request_id))]
    pub async fn generate(&self, lease: &Lease, request: &GenerationRequest, request_id: &str) -> Result<String> {
        let payload = Payload {
            inputs: Inputs { prompt: &request.prompt },
            parameters: Parameters {
                negative_prompt: &request.negative_prompt,
                width: request.width,
                height: request.height,
                num_frames: request.num_frames,
                num_inference_steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                seed: request.seed,
                double_num_frames: false,
                fps: request.framerate,
                super_resolution: false,
                grain_amount: 0,
            },
            metadata: request.is_thumbnail.then_some(Metadata { is_thumbnail: true }),
        };

        let mut builder = self
            .client
            .post(&lease.url)
            .header("Accept", "application/json")
            .header("X-Request-ID", request_id)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload);

        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                tracing::error!(request_id, "generation request timed out");
                lease.report_failure(true);
                return Err(Error::GenerationTimeout);
            }
            Err(err) => {
                tracing::error!(request_id, error = %err, "generation request failed");
                lease.report_failure(false);
                return Err(Error::GenerationFailed(err.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(request_id, %status, body, "endpoint returned an error");
            lease.report_failure(false);
            if body.contains("paused") {
                return Ok(String::new());
            }
            return Err(Error::GenerationFailed(format!("HTTP {status}: {body}")));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(request_id, error = %err, "could not parse endpoint response");
                lease.report_failure(false);
                return Err(Error::GenerationFailed(err.to_string()));
            }
        };

        if let Some(error) = body.get("error") {
            let message = error.as_str().unwrap_or("unknown error").to_string();
            tracing::error!(request_id, error = %message, "endpoint reported an error");
            lease.report_failure(false);
            if message.to_lowercase().contains("paused") {
                return Ok(String::new());
            }
            return Err(Error::GenerationFailed(message));
        }

        let video = body.get("video").and_then(|v| v.as_str());
        let Some(video) = video else {
            tracing::error!(request_id, "no video data in response");
            lease.report_failure(false);
            return Err(Error::GenerationFailed("no video data in response".into()));
        };

        lease.report_success();
        Ok(video.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape_matches_the_worker_protocol() {
        let request = GenerationRequest {
            prompt: "a cat".into(),
            negative_prompt: "blurry".into(),
            width: 1152,
            height: 640,
            num_frames: 81,
            num_inference_steps: 4,
            guidance_scale: 3.0,
            seed: 42,
            framerate: 25,
            is_thumbnail: false,
        };
        let payload = Payload {
            inputs: Inputs { prompt: &request.prompt },
            parameters: Parameters {
                negative_prompt: &request.negative_prompt,
                width: request.width,
                height: request.height,
                num_frames: request.num_frames,
                num_inference_steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                seed: request.seed,
                double_num_frames: false,
                fps: request.framerate,
                super_resolution: false,
                grain_amount: 0,
            },
            metadata: request.is_thumbnail.then_some(Metadata { is_thumbnail: true }),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["inputs"]["prompt"], "a cat");
        assert_eq!(json["parameters"]["fps"], 25);
        assert_eq!(json["parameters"]["double_num_frames"], false);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn thumbnail_request_sets_metadata_side_channel() {
        let request = GenerationRequest {
            prompt: "a cat".into(),
            negative_prompt: "".into(),
            width: 512,
            height: 288,
            num_frames: 65,
            num_inference_steps: 4,
            guidance_scale: 3.0,
            seed: 1,
            framerate: 25,
            is_thumbnail: true,
        };
        let payload = Payload {
            inputs: Inputs { prompt: &request.prompt },
            parameters: Parameters {
                negative_prompt: &request.negative_prompt,
                width: request.width,
                height: request.height,
                num_frames: request.num_frames,
                num_inference_steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                seed: request.seed,
                double_num_frames: false,
                fps: request.framerate,
                super_resolution: false,
                grain_amount: 0,
            },
            metadata: request.is_thumbnail.then_some(Metadata { is_thumbnail: true }),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["metadata"]["is_thumbnail"], true);
    }
}
