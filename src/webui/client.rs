use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{GenError, Result};
use crate::http::WebClient;
use crate::types::GenerationRequest;

/// The submit call blocks server-side until every image is ready, so it gets
/// a long timeout; the progress poll runs on a separate short one.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of the server's progress endpoint.
///
/// Consulted both before submission (busy check) and during generation for
/// UI feedback. Never used for completion detection — the submit call's
/// return is the completion signal in this family.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressCheck {
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub eta_relative: f32,
    #[serde(default)]
    pub current_image: Option<String>,
    #[serde(default)]
    pub state: Value,
}

impl ProgressCheck {
    /// Whether a job is running on the server right now.
    pub fn is_busy(&self) -> bool {
        self.progress > 0.0
            || self
                .state
                .get("job_count")
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                > 0
    }
}

/// Images produced by one blocking submit, already base64-decoded.
#[derive(Debug, Clone)]
pub struct GenerationResults {
    pub images: Vec<Vec<u8>>,
    pub seed: i64,
    pub info: Value,
}

/// Adapter for an A1111/WebUI-compatible server.
///
/// Submit-and-block: one HTTP call per job, carrying source image and mask
/// inline as base64. Extension tags stay in the prompt text — this family
/// parses `<lora:...>` syntax itself.
#[derive(Clone)]
pub struct WebUiClient {
    web: WebClient,
}

impl WebUiClient {
    pub fn new(web: WebClient) -> Self {
        Self { web }
    }

    pub fn base_url(&self) -> &str {
        self.web.base_url()
    }

    // ── Progress / busy check ───────────────────────────────────────

    pub async fn progress(&self) -> Result<ProgressCheck> {
        self.web
            .get_json(
                "sdapi/v1/progress",
                &[("skip_current_image", "true")],
                POLL_TIMEOUT,
            )
            .await
    }

    /// Fail fast when the server already has a job running. Best-effort
    /// only: another client can still submit between this check and our
    /// submit — the backend offers nothing to close that window with.
    pub async fn ensure_idle(&self) -> Result<()> {
        if self.progress().await?.is_busy() {
            return Err(GenError::JobAlreadyRunning);
        }
        Ok(())
    }

    // ── Generation ──────────────────────────────────────────────────

    fn base_payload(req: &GenerationRequest) -> Value {
        let mut payload = json!({
            "prompt": req.prompt,
            "negative_prompt": req.negative_prompt,
            "width": req.width,
            "height": req.height,
            "batch_size": req.batch_size,
            "n_iter": req.batch_count,
            "steps": req.steps,
            "cfg_scale": req.guidance_scale,
            "sampler_name": req.sampler,
            "scheduler": req.scheduler,
            "seed": req.seed.unwrap_or(-1),
        });
        if !req.checkpoint.is_empty() {
            payload["override_settings"] = json!({
                "sd_model_checkpoint": req.checkpoint,
            });
        }
        let units: Vec<Value> = req
            .control_units
            .iter()
            .map(|u| {
                json!({
                    "module": u.preprocessor,
                    "model": u.model,
                    "weight": u.strength,
                    "image": u.image,
                })
            })
            .collect();
        if !units.is_empty() {
            payload["alwayson_scripts"] = json!({
                "controlnet": { "args": units },
            });
        }
        payload
    }

    /// Text-to-image: blocks until the server has rendered every batch.
    pub async fn txt2img(&self, req: &GenerationRequest) -> Result<GenerationResults> {
        let payload = Self::base_payload(req);
        self.submit("sdapi/v1/txt2img", payload).await
    }

    /// Image-to-image / inpainting. `source_png` rides along inline;
    /// `mask_png` (white = editable) switches the server into inpaint mode.
    pub async fn img2img(
        &self,
        req: &GenerationRequest,
        source_png: &[u8],
        mask_png: Option<&[u8]>,
    ) -> Result<GenerationResults> {
        let mut payload = Self::base_payload(req);
        payload["init_images"] = json!([BASE64.encode(source_png)]);
        payload["denoising_strength"] = json!(req.denoising_strength);
        if let Some(mask) = mask_png {
            payload["mask"] = json!(BASE64.encode(mask));
            // Keep unmasked content as-is and let the blend happen editor-side.
            payload["inpainting_fill"] = json!(1);
            payload["inpainting_mask_invert"] = json!(0);
        }
        self.submit("sdapi/v1/img2img", payload).await
    }

    async fn submit(&self, path: &str, payload: Value) -> Result<GenerationResults> {
        let resp = self.web.post_json(path, &payload, SUBMIT_TIMEOUT).await?;
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: format!("failed to parse {} response", path),
            source: e,
        })?;

        let encoded = json
            .get("images")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GenError::InvalidResponse("response missing images".into()))?;
        let mut images = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let data = entry
                .as_str()
                .ok_or_else(|| GenError::InvalidResponse("image entry is not a string".into()))?;
            // Some servers prefix a data-URL header.
            let data = data.rsplit(',').next().unwrap_or(data);
            let bytes = BASE64
                .decode(data)
                .map_err(|e| GenError::InvalidResponse(format!("bad image base64: {}", e)))?;
            images.push(bytes);
        }

        // `info` is a JSON document serialized into a string field.
        let info: Value = json
            .get("info")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null);
        let seed = info.get("seed").and_then(|v| v.as_i64()).unwrap_or(-1);

        debug!("{} returned {} image(s), seed {}", path, images.len(), seed);
        Ok(GenerationResults { images, seed, info })
    }

    // ── Cancellation ────────────────────────────────────────────────

    pub async fn interrupt(&self) -> Result<()> {
        self.web
            .post_json("sdapi/v1/interrupt", &json!({}), Duration::from_secs(5))
            .await?;
        Ok(())
    }

    // ── Capability discovery ────────────────────────────────────────

    pub async fn sd_models(&self) -> Result<Vec<String>> {
        let entries: Vec<Value> = self
            .web
            .get_json("sdapi/v1/sd-models", &[], POLL_TIMEOUT)
            .await?;
        Ok(string_field(&entries, "title"))
    }

    pub async fn samplers(&self) -> Result<Vec<String>> {
        let entries: Vec<Value> = self
            .web
            .get_json("sdapi/v1/samplers", &[], POLL_TIMEOUT)
            .await?;
        Ok(string_field(&entries, "name"))
    }

    pub async fn schedulers(&self) -> Result<Vec<String>> {
        let entries: Vec<Value> = self
            .web
            .get_json("sdapi/v1/schedulers", &[], POLL_TIMEOUT)
            .await?;
        Ok(string_field(&entries, "name"))
    }

    pub async fn loras(&self) -> Result<Vec<String>> {
        let entries: Vec<Value> = self
            .web
            .get_json("sdapi/v1/loras", &[], POLL_TIMEOUT)
            .await?;
        Ok(string_field(&entries, "name"))
    }

    pub async fn hypernetworks(&self) -> Result<Vec<String>> {
        let entries: Vec<Value> = self
            .web
            .get_json("sdapi/v1/hypernetworks", &[], POLL_TIMEOUT)
            .await?;
        Ok(string_field(&entries, "name"))
    }

    /// ControlNet extension endpoints; both return empty when the extension
    /// is not installed.
    pub async fn controlnet_modules(&self) -> Result<Vec<String>> {
        let resp = self
            .web
            .get_unchecked("controlnet/module_list", &[], POLL_TIMEOUT)
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: "failed to parse controlnet module list".into(),
            source: e,
        })?;
        Ok(string_list(json.get("module_list")))
    }

    pub async fn controlnet_models(&self) -> Result<Vec<String>> {
        let resp = self
            .web
            .get_unchecked("controlnet/model_list", &[], POLL_TIMEOUT)
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: "failed to parse controlnet model list".into(),
            source: e,
        })?;
        Ok(string_list(json.get("model_list")))
    }
}

fn string_field(entries: &[Value], field: &str) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.get(field).and_then(|v| v.as_str()).map(String::from))
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EditMode;

    #[test]
    fn test_busy_when_progress_nonzero() {
        let check: ProgressCheck =
            serde_json::from_str(r#"{"progress": 0.4, "eta_relative": 12.5}"#).unwrap();
        assert!(check.is_busy());
    }

    #[test]
    fn test_busy_when_job_count_positive() {
        let check: ProgressCheck = serde_json::from_str(
            r#"{"progress": 0.0, "eta_relative": 0.0, "state": {"job_count": 1}}"#,
        )
        .unwrap();
        assert!(check.is_busy());
    }

    #[test]
    fn test_idle_progress() {
        let check: ProgressCheck = serde_json::from_str(
            r#"{"progress": 0.0, "eta_relative": 0.0, "current_image": null, "state": {"job_count": 0}}"#,
        )
        .unwrap();
        assert!(!check.is_busy());
    }

    #[test]
    fn test_payload_carries_generation_parameters() {
        let req = GenerationRequest {
            prompt: "a fox".into(),
            negative_prompt: "blurry".into(),
            width: 640,
            height: 512,
            batch_size: 2,
            batch_count: 3,
            steps: 30,
            guidance_scale: 6.0,
            sampler: "DPM++ 2M".into(),
            scheduler: "Karras".into(),
            seed: Some(99),
            checkpoint: "dreamshaper_8.safetensors [abc123]".into(),
            edit_mode: EditMode::Txt2Img,
            ..GenerationRequest::default()
        };
        let payload = WebUiClient::base_payload(&req);
        assert_eq!(payload["prompt"], "a fox");
        assert_eq!(payload["n_iter"], 3);
        assert_eq!(payload["batch_size"], 2);
        assert_eq!(payload["seed"], 99);
        assert_eq!(
            payload["override_settings"]["sd_model_checkpoint"],
            "dreamshaper_8.safetensors [abc123]"
        );
    }

    #[test]
    fn test_payload_seed_defaults_to_minus_one() {
        let req = GenerationRequest::default();
        let payload = WebUiClient::base_payload(&req);
        assert_eq!(payload["seed"], -1);
        assert!(payload.get("override_settings").is_none());
        assert!(payload.get("alwayson_scripts").is_none());
    }

    #[test]
    fn test_payload_includes_controlnet_units() {
        let mut req = GenerationRequest::default();
        req.control_units = vec![crate::types::ControlNetUnit {
            preprocessor: "depth_midas".into(),
            model: "control_depth".into(),
            strength: 0.7,
            image: Some("aGVsbG8=".into()),
        }];
        let payload = WebUiClient::base_payload(&req);
        let args = &payload["alwayson_scripts"]["controlnet"]["args"];
        assert_eq!(args.as_array().unwrap().len(), 1);
        assert_eq!(args[0]["module"], "depth_midas");
        assert_eq!(args[0]["weight"], 0.7);
    }

    #[test]
    fn test_extension_tags_stay_in_prompt() {
        let req = GenerationRequest {
            prompt: "a castle <lora:foo:0.8>".into(),
            ..GenerationRequest::default()
        };
        let payload = WebUiClient::base_payload(&req);
        assert_eq!(payload["prompt"], "a castle <lora:foo:0.8>");
    }
}
