use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbaImage;
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::compose;
use crate::error::{GenError, Result};
use crate::http::WebClient;
use crate::params::{keys, ParameterProvider};
use crate::runner::EventEmitter;
use crate::types::{EditMode, GenerationRequest};

use super::{resolve_url, GeneratorShared, GeneratorState, UrlPrompter};

const DEFAULT_LOCAL_URL: &str = "http://localhost:5555";
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Where the GLID-3-XL process runs. The two differ only in the default URL
/// and the availability message — the editor shell owns spawning a local
/// process; this generator only talks to its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlidMode {
    LocalProcess,
    RemoteServer,
}

/// Generator for a GLID-3-XL inpainting server.
///
/// Single blocking REST call carrying the source and mask inline as base64;
/// the model is inpainting-only, so text-to-image and plain image-to-image
/// requests are rejected up front.
pub struct Glid3XlGenerator {
    shared: Arc<GeneratorShared>,
    mode: GlidMode,
    client: Mutex<Option<WebClient>>,
}

impl Glid3XlGenerator {
    pub fn new(params: Arc<dyn ParameterProvider>, mode: GlidMode) -> Self {
        Self {
            shared: GeneratorShared::new(params),
            mode,
            client: Mutex::new(None),
        }
    }

    pub fn local(params: Arc<dyn ParameterProvider>) -> Self {
        Self::new(params, GlidMode::LocalProcess)
    }

    pub fn remote(params: Arc<dyn ParameterProvider>) -> Self {
        Self::new(params, GlidMode::RemoteServer)
    }

    pub fn mode(&self) -> GlidMode {
        self.mode
    }

    pub(crate) fn shared(&self) -> &GeneratorShared {
        &self.shared
    }

    fn client(&self) -> Result<WebClient> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(GenError::NotConnected)
    }

    fn default_url(&self) -> &'static str {
        match self.mode {
            GlidMode::LocalProcess => DEFAULT_LOCAL_URL,
            // Remote servers have no sensible default; force a prompt.
            GlidMode::RemoteServer => "",
        }
    }

    pub async fn is_available(&self) -> (bool, Option<String>) {
        let url = match self
            .shared
            .params
            .get_str(keys::SERVER_URL)
            .filter(|u| !u.is_empty())
        {
            Some(u) => u,
            None if self.mode == GlidMode::LocalProcess => DEFAULT_LOCAL_URL.to_string(),
            None => {
                return (
                    false,
                    Some("no GLID-3-XL server address is configured".into()),
                )
            }
        };
        match probe(url).await {
            Ok(()) => (true, None),
            Err(detail) => (false, Some(detail)),
        }
    }

    pub async fn connect(&self, prompter: &dyn UrlPrompter) -> Result<bool> {
        self.shared.set_state(GeneratorState::Connecting);
        let url = match resolve_url(&self.shared, prompter, self.default_url(), probe).await {
            Some(url) => url,
            None => {
                self.shared.set_state(GeneratorState::Disconnected);
                return Ok(false);
            }
        };
        let web = WebClient::new(url)?;
        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(web);
        }
        // The GLID server exposes no discoverable model lists.
        self.shared.clear_caps();
        self.shared.set_state(GeneratorState::Ready);
        Ok(true)
    }

    pub async fn disconnect(&self) {
        if let Ok(mut slot) = self.client.lock() {
            *slot = None;
        }
        self.shared.clear_caps();
        self.shared.set_state(GeneratorState::Disconnected);
    }

    pub async fn generate(
        &self,
        emitter: &EventEmitter,
        source: Option<&RgbaImage>,
        mask: Option<&RgbaImage>,
    ) -> Result<()> {
        let client = self.client()?;
        let _guard = self.shared.begin_job()?;
        let req = GenerationRequest::from_provider(&*self.shared.params);

        if req.edit_mode != EditMode::Inpaint {
            return Err(GenError::UnsupportedOperation(format!(
                "{} (the GLID-3-XL backend is inpainting-only)",
                req.edit_mode.as_str()
            )));
        }
        let source = source.ok_or_else(|| {
            GenError::UnsupportedOperation("inpainting without a source image".into())
        })?;
        let mask = mask.ok_or(GenError::EmptyMask)?;
        if compose::mask_is_empty(mask) {
            return Err(GenError::EmptyMask);
        }

        let seed = match req.seed {
            Some(s) => s,
            None => rand::rng().random_range(0..i64::MAX),
        };
        let source_png = compose::encode_png(source)?;
        let mask_png = compose::encode_png(&compose::alpha_to_luma(mask))?;

        let payload = json!({
            "prompt": req.prompt,
            "negative": req.negative_prompt,
            "batch_size": req.batch_size,
            "num_batches": req.batch_count,
            "width": req.width,
            "height": req.height,
            "seed": seed,
            "edit": BASE64.encode(&source_png),
            "mask": BASE64.encode(&mask_png),
        });

        emitter.status("Waiting for GLID-3-XL", None);
        let resp = client.post_json("", &payload, SUBMIT_TIMEOUT).await?;
        let body: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: "failed to parse GLID-3-XL response".into(),
            source: e,
        })?;
        if self.shared.cancel_requested() {
            return Err(GenError::Cancelled);
        }

        self.shared.params.set(keys::LAST_SEED, Value::from(seed));

        let images = body
            .get("images")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GenError::InvalidResponse("response missing images".into()))?;
        for (index, entry) in images.iter().enumerate() {
            let encoded = entry
                .as_str()
                .ok_or_else(|| GenError::InvalidResponse("image entry is not a string".into()))?;
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| GenError::InvalidResponse(format!("bad image base64: {}", e)))?;
            let img = compose::decode_png(&bytes)?;
            emitter.image(img, index);
            // Yield between decodes so cancellation and status delivery stay
            // responsive on large batches.
            sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    pub async fn cancel(&self) {
        self.shared.request_cancel();
        debug!("GLID-3-XL exposes no interrupt endpoint; the running call finishes server-side");
    }
}

async fn probe(url: String) -> std::result::Result<(), String> {
    let web = WebClient::new(url).map_err(|e| e.to_string())?;
    // Any HTTP response at all means the process is up.
    web.get_unchecked("", &[], Duration::from_secs(5))
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}
