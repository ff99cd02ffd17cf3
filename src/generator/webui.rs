use std::sync::{Arc, Mutex};

use image::RgbaImage;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backoff::PollBackoff;
use crate::compose;
use crate::error::{GenError, Result};
use crate::http::WebClient;
use crate::params::{keys, ParameterProvider};
use crate::runner::EventEmitter;
use crate::types::{CapabilitySet, EditMode, GenerationRequest};
use crate::webui::WebUiClient;

use super::{
    batch_progress_text, clear_options, publish_options, resolve_url, GeneratorShared,
    GeneratorState, UrlPrompter,
};

const DEFAULT_URL: &str = "http://localhost:7860";

/// Synchronous-result generator for A1111/WebUI-compatible servers.
///
/// One blocking submit per job; a concurrent poll of the progress endpoint
/// feeds the UI while the submit call is in flight.
pub struct WebUiGenerator {
    shared: Arc<GeneratorShared>,
    client: Mutex<Option<WebUiClient>>,
}

impl WebUiGenerator {
    pub fn new(params: Arc<dyn ParameterProvider>) -> Self {
        Self {
            shared: GeneratorShared::new(params),
            client: Mutex::new(None),
        }
    }

    pub(crate) fn shared(&self) -> &GeneratorShared {
        &self.shared
    }

    fn client(&self) -> Result<WebUiClient> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(GenError::NotConnected)
    }

    fn credentials(&self) -> (Option<String>, Option<String>) {
        (
            self.shared.params.get_str(keys::SERVER_USERNAME),
            self.shared.params.get_str(keys::SERVER_PASSWORD),
        )
    }

    fn build_client(&self, url: String) -> Result<WebUiClient> {
        let mut web = WebClient::new(url)?;
        if let (Some(user), Some(pass)) = self.credentials() {
            web = web.with_credentials(user, pass);
        }
        Ok(WebUiClient::new(web))
    }

    pub async fn is_available(&self) -> (bool, Option<String>) {
        let url = self
            .shared
            .params
            .get_str(keys::SERVER_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let client = match self.build_client(url) {
            Ok(c) => c,
            Err(e) => return (false, Some(e.to_string())),
        };
        match client.progress().await {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        }
    }

    pub async fn connect(&self, prompter: &dyn UrlPrompter) -> Result<bool> {
        self.shared.set_state(GeneratorState::Connecting);

        let (username, password) = self.credentials();
        let probe = move |url: String| {
            let username = username.clone();
            let password = password.clone();
            async move {
                let mut web = WebClient::new(url).map_err(|e| e.to_string())?;
                if let (Some(user), Some(pass)) = (username, password) {
                    web = web.with_credentials(user, pass);
                }
                WebUiClient::new(web)
                    .progress()
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
        };

        let url = match resolve_url(&self.shared, prompter, DEFAULT_URL, probe).await {
            Some(url) => url,
            None => {
                self.shared.set_state(GeneratorState::Disconnected);
                return Ok(false);
            }
        };

        let client = self.build_client(url)?;
        match self.load_capabilities(&client).await {
            Ok(()) => {
                if let Ok(mut slot) = self.client.lock() {
                    *slot = Some(client);
                }
                self.shared.set_state(GeneratorState::Ready);
                Ok(true)
            }
            Err(e) => {
                self.shared.set_state(GeneratorState::Disconnected);
                Err(e)
            }
        }
    }

    async fn load_capabilities(&self, client: &WebUiClient) -> Result<()> {
        let caps = CapabilitySet {
            checkpoints: client.sd_models().await?,
            configs: Vec::new(),
            samplers: client.samplers().await?,
            schedulers: client.schedulers().await?,
            loras: client.loras().await?,
            hypernetworks: client.hypernetworks().await?,
            controlnet_preprocessors: client.controlnet_modules().await?,
            controlnet_models: client.controlnet_models().await?,
        };
        publish_options(&*self.shared.params, &caps);
        self.shared.set_caps(caps);
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Ok(mut slot) = self.client.lock() {
            *slot = None;
        }
        self.shared.clear_caps();
        clear_options(&*self.shared.params);
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

        // Fail fast when someone else's job is already running server-side.
        client.ensure_idle().await?;

        let poller = self.spawn_progress_poller(&client, emitter, req.batch_count);

        let submit = async {
            match req.edit_mode {
                EditMode::Txt2Img => client.txt2img(&req).await,
                EditMode::Img2Img => {
                    let source = source.ok_or_else(|| {
                        GenError::UnsupportedOperation(
                            "image-to-image without a source image".into(),
                        )
                    })?;
                    let png = compose::encode_png(source)?;
                    client.img2img(&req, &png, None).await
                }
                EditMode::Inpaint => {
                    let source = source.ok_or_else(|| {
                        GenError::UnsupportedOperation("inpainting without a source image".into())
                    })?;
                    let mask = mask.ok_or(GenError::EmptyMask)?;
                    if compose::mask_is_empty(mask) {
                        return Err(GenError::EmptyMask);
                    }
                    let png = compose::encode_png(source)?;
                    let mask_png = compose::encode_png(&compose::alpha_to_luma(mask))?;
                    client.img2img(&req, &png, Some(&mask_png)).await
                }
            }
        }
        .await;

        let _ = poller.0.send(());
        let _ = poller.1.await;

        let results = submit?;
        if self.shared.cancel_requested() {
            return Err(GenError::Cancelled);
        }
        if results.seed >= 0 {
            self.shared
                .params
                .set(keys::LAST_SEED, Value::from(results.seed));
        }

        for (index, bytes) in results.images.iter().enumerate() {
            let img = compose::decode_png(bytes)?;
            emitter.image(img, index);
        }
        Ok(())
    }

    /// Advisory progress poll running beside the blocking submit. Stops
    /// silently once the connection-error budget runs out — completion is
    /// the submit call's business, not this loop's.
    fn spawn_progress_poller(
        &self,
        client: &WebUiClient,
        emitter: &EventEmitter,
        batch_count: u32,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let client = client.clone();
        let emitter = emitter.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = PollBackoff::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(backoff.delay()) => {
                        match client.progress().await {
                            Ok(p) => {
                                backoff.on_success();
                                let count = batch_count.max(1);
                                let scaled = p.progress.clamp(0.0, 1.0) * count as f32;
                                let batch = (scaled.floor() as u32).min(count - 1);
                                let within = (scaled - batch as f32).clamp(0.0, 1.0);
                                let (text, pct) = batch_progress_text(batch, count, within);
                                emitter.status(text, Some(pct));
                            }
                            Err(e) if e.is_connection() => {
                                if !backoff.on_error() {
                                    warn!("progress polling abandoned after repeated connection errors");
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("progress polling stopped: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });
        (stop_tx, handle)
    }

    pub async fn cancel(&self) {
        self.shared.request_cancel();
        if let Ok(client) = self.client() {
            let _ = client.interrupt().await;
        }
    }
}
