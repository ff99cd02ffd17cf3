use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbaImage;
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::backoff::PollBackoff;
use crate::comfy::{build_workflow, ComfyClient};
use crate::compose;
use crate::error::{GenError, Result};
use crate::http::WebClient;
use crate::params::{keys, ParameterProvider};
use crate::runner::EventEmitter;
use crate::types::{
    CapabilitySet, EditMode, GenerationRequest, ImageRef, JobStatus, QueuedJob,
};

use super::{
    batch_progress_text, clear_options, publish_options, resolve_url, GeneratorShared,
    GeneratorState, UrlPrompter,
};

const DEFAULT_URL: &str = "http://localhost:8188";
const SOURCE_UPLOAD_NAME: &str = "generation_source.png";
const MASK_UPLOAD_NAME: &str = "generation_mask.png";

/// Queue-and-poll generator for ComfyUI-compatible servers.
///
/// `batch_count` maps to sequential prompt submissions (the queue family has
/// no server-side batch-count), each seeded with `base_seed + batch`.
pub struct ComfyUiGenerator {
    shared: Arc<GeneratorShared>,
    client: Mutex<Option<ComfyClient>>,
    current_job: Mutex<Option<QueuedJob>>,
}

impl ComfyUiGenerator {
    pub fn new(params: Arc<dyn ParameterProvider>) -> Self {
        Self {
            shared: GeneratorShared::new(params),
            client: Mutex::new(None),
            current_job: Mutex::new(None),
        }
    }

    pub(crate) fn shared(&self) -> &GeneratorShared {
        &self.shared
    }

    fn client(&self) -> Result<ComfyClient> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(GenError::NotConnected)
    }

    fn set_current_job(&self, job: Option<QueuedJob>) {
        if let Ok(mut current) = self.current_job.lock() {
            *current = job;
        }
    }

    fn current_job(&self) -> Option<QueuedJob> {
        self.current_job.lock().ok().and_then(|j| j.clone())
    }

    pub async fn is_available(&self) -> (bool, Option<String>) {
        let url = self
            .shared
            .params
            .get_str(keys::SERVER_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        match probe(url).await {
            Ok(()) => (true, None),
            Err(detail) => (false, Some(detail)),
        }
    }

    pub async fn connect(&self, prompter: &dyn UrlPrompter) -> Result<bool> {
        self.shared.set_state(GeneratorState::Connecting);
        let url = match resolve_url(&self.shared, prompter, DEFAULT_URL, probe).await {
            Some(url) => url,
            None => {
                self.shared.set_state(GeneratorState::Disconnected);
                return Ok(false);
            }
        };

        let client = ComfyClient::new(WebClient::new(url)?);
        let result = self.load_capabilities(&client).await;
        match result {
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

    async fn load_capabilities(&self, client: &ComfyClient) -> Result<()> {
        let caps = CapabilitySet {
            checkpoints: client.checkpoints().await?,
            configs: client.checkpoint_configs().await?,
            samplers: client.samplers().await?,
            schedulers: client.schedulers().await?,
            loras: client.loras().await?,
            hypernetworks: client.hypernetworks().await?,
            controlnet_preprocessors: Vec::new(),
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
        self.set_current_job(None);
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

        // Media becomes named server-side assets before the workflow is built.
        let source_ref = match (req.edit_mode.uses_source(), source) {
            (true, Some(img)) => Some(client.upload_image(img, SOURCE_UPLOAD_NAME).await?),
            (true, None) => {
                return Err(GenError::UnsupportedOperation(format!(
                    "{} without a source image",
                    req.edit_mode.as_str()
                )))
            }
            (false, _) => None,
        };

        let mask_ref = if req.edit_mode == EditMode::Inpaint {
            let mask = mask.ok_or(GenError::EmptyMask)?;
            if compose::mask_is_empty(mask) {
                return Err(GenError::EmptyMask);
            }
            match source_ref.as_ref() {
                Some(src) => Some(client.upload_mask(mask, MASK_UPLOAD_NAME, src).await?),
                None => return Err(GenError::EmptyMask),
            }
        } else {
            None
        };

        let control_refs = self.upload_control_images(&client, &req).await?;

        let base_seed = match req.seed {
            Some(s) => s,
            None => rand::rng().random_range(0..i64::MAX),
        };
        let caps = self.shared.caps();
        let mut image_index = 0usize;

        for batch in 0..req.batch_count {
            if self.shared.cancel_requested() {
                return Err(GenError::Cancelled);
            }

            let mut batch_req = req.clone();
            batch_req.seed = Some(base_seed.wrapping_add(batch as i64));
            let (workflow, seed) = build_workflow(
                &batch_req,
                &caps,
                source_ref.as_ref(),
                mask_ref.as_ref(),
                &control_refs,
            )?;

            let job = client.queue_prompt(&workflow, seed).await?;
            self.shared
                .params
                .set(keys::LAST_SEED, Value::from(job.seed));
            self.set_current_job(Some(job.clone()));

            // Advisory websocket progress; completion comes from polling.
            let (stop_tx, stop_rx) = oneshot::channel();
            let listener = {
                let ws_client = client.clone();
                let ws_emitter = emitter.clone();
                let task_id = job.task_id.clone();
                let batch_count = req.batch_count;
                tokio::spawn(async move {
                    ws_client
                        .progress_updates(&task_id, stop_rx, |p| {
                            let (text, pct) =
                                batch_progress_text(batch, batch_count, p.fraction());
                            ws_emitter.status(text, Some(pct));
                        })
                        .await;
                })
            };

            let outcome = self.poll_until_terminal(&client, &job, emitter).await;

            let _ = stop_tx.send(());
            let _ = listener.await;
            self.set_current_job(None);

            let outputs = outcome?;
            for output in outputs {
                let bytes = client.download_image(&output).await?;
                let img = compose::decode_png(&bytes)?;
                emitter.image(img, image_index);
                image_index += 1;
            }
        }
        Ok(())
    }

    async fn upload_control_images(
        &self,
        client: &ComfyClient,
        req: &GenerationRequest,
    ) -> Result<Vec<Option<ImageRef>>> {
        let mut refs = Vec::with_capacity(req.control_units.len());
        for (i, unit) in req.control_units.iter().enumerate() {
            match &unit.image {
                Some(encoded) => {
                    let bytes = BASE64.decode(encoded).map_err(|e| {
                        GenError::InvalidResponse(format!("bad ControlNet image base64: {}", e))
                    })?;
                    let img = compose::decode_png(&bytes)?;
                    let name = format!("control_{}.png", i);
                    refs.push(Some(client.upload_image(&img, &name).await?));
                }
                None => refs.push(None),
            }
        }
        Ok(refs)
    }

    /// Poll the history/queue endpoints with backoff until the job reaches
    /// a terminal state. Connection errors retry with doubling intervals;
    /// everything else escalates immediately.
    async fn poll_until_terminal(
        &self,
        client: &ComfyClient,
        job: &QueuedJob,
        emitter: &EventEmitter,
    ) -> Result<Vec<ImageRef>> {
        let mut backoff = PollBackoff::new();
        loop {
            tokio::time::sleep(backoff.delay()).await;
            match client.check_queue_entry(job).await {
                Ok(status) => {
                    backoff.on_success();
                    match status {
                        JobStatus::Finished { outputs } => return Ok(outputs),
                        JobStatus::Failed { error } => {
                            return Err(if self.shared.cancel_requested() {
                                GenError::Cancelled
                            } else {
                                GenError::GenerationFailed(error)
                            })
                        }
                        JobStatus::NotFound => {
                            return Err(if self.shared.cancel_requested() {
                                GenError::Cancelled
                            } else {
                                GenError::GenerationFailed(
                                    "job disappeared from the server queue".into(),
                                )
                            })
                        }
                        JobStatus::Pending { queue_index } => {
                            emitter.status(
                                format!("Queued at position {}", queue_index + 1),
                                None,
                            );
                        }
                        JobStatus::Active => {}
                    }
                }
                Err(e) if e.is_connection() => {
                    if !backoff.on_error() {
                        return Err(e);
                    }
                    debug!(
                        "poll error {} of 10, next attempt in {:?}",
                        backoff.consecutive_errors(),
                        backoff.delay()
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn cancel(&self) {
        self.shared.request_cancel();
        let client = match self.client() {
            Ok(c) => c,
            Err(_) => return,
        };
        let job = match self.current_job() {
            Some(j) => j,
            None => return,
        };
        // Pending jobs are pulled from the queue; an executing one gets an
        // interrupt. The poll loop observes the resulting terminal state.
        match client.check_queue_entry(&job).await {
            Ok(JobStatus::Pending { .. }) => {
                let _ = client.cancel_pending(&job.task_id).await;
            }
            _ => {
                let _ = client.interrupt().await;
            }
        }
    }
}

async fn probe(url: String) -> std::result::Result<(), String> {
    let web = WebClient::new(url).map_err(|e| e.to_string())?;
    let client = ComfyClient::new(web);
    match client.health().await {
        Ok(true) => Ok(()),
        Ok(false) => Err("server responded but reported an unhealthy status".into()),
        Err(e) => Err(e.to_string()),
    }
}

