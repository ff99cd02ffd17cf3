//! Generator strategy objects — one per backend, all behind a closed enum.

pub mod comfy;
pub mod glid;
pub mod mock;
pub mod null;
pub mod webui;

pub use comfy::ComfyUiGenerator;
pub use glid::{Glid3XlGenerator, GlidMode};
pub use mock::{MockGenerator, MockScript};
pub use null::NullGenerator;
pub use webui::WebUiGenerator;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use image::RgbaImage;

use crate::error::{GenError, Result};
use crate::params::{keys, ParameterProvider};
use crate::runner::EventEmitter;
use crate::types::CapabilitySet;

/// Connection/job lifecycle of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Disconnected,
    Connecting,
    Ready,
    Generating,
    Cancelling,
}

/// Interactive seam used by `connect` to (re-)ask for a backend URL.
///
/// `previous` is the rejected value (possibly empty on the first ask) and
/// `error` the probe failure message when there was one. Returning `None`
/// aborts the connect attempt; otherwise `connect` keeps looping.
pub trait UrlPrompter: Send + Sync {
    fn request_url(&self, previous: &str, error: Option<&str>) -> Option<String>;
}

/// State shared by every generator variant: the injected parameter provider,
/// the lifecycle state, the capability caches, and the one-job-at-a-time
/// guard.
pub(crate) struct GeneratorShared {
    pub(crate) params: Arc<dyn ParameterProvider>,
    state: Mutex<GeneratorState>,
    caps: RwLock<CapabilitySet>,
    job_active: AtomicBool,
    cancel_requested: AtomicBool,
}

impl GeneratorShared {
    pub(crate) fn new(params: Arc<dyn ParameterProvider>) -> Arc<Self> {
        Arc::new(Self {
            params,
            state: Mutex::new(GeneratorState::Disconnected),
            caps: RwLock::new(CapabilitySet::default()),
            job_active: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> GeneratorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(GeneratorState::Disconnected)
    }

    pub(crate) fn set_state(&self, state: GeneratorState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    pub(crate) fn caps(&self) -> CapabilitySet {
        self.caps
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_caps(&self, caps: CapabilitySet) {
        if let Ok(mut c) = self.caps.write() {
            *c = caps;
        }
    }

    pub(crate) fn clear_caps(&self) {
        if let Ok(mut c) = self.caps.write() {
            c.clear();
        }
    }

    /// Claim the single job slot. A second claim while one is held fails
    /// with [`GenError::JobAlreadyRunning`] — never queued, never dropped.
    pub(crate) fn begin_job(self: &Arc<Self>) -> Result<JobGuard> {
        if self.job_active.swap(true, Ordering::SeqCst) {
            return Err(GenError::JobAlreadyRunning);
        }
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.set_state(GeneratorState::Generating);
        Ok(JobGuard {
            shared: Arc::clone(self),
        })
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn request_cancel(&self) {
        if self.state() == GeneratorState::Generating {
            self.set_state(GeneratorState::Cancelling);
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_generating(&self) -> bool {
        self.job_active.load(Ordering::SeqCst)
    }
}

/// Releases the job slot and returns the state machine to `Ready` however
/// the job ends — success, error, or cancellation.
pub(crate) struct JobGuard {
    shared: Arc<GeneratorShared>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.shared.job_active.store(false, Ordering::SeqCst);
        self.shared.set_state(GeneratorState::Ready);
    }
}

/// Resolve the backend URL for `connect`: try the configured value, and on
/// every probe failure re-ask the prompter, looping until a URL passes or
/// the prompter aborts. The accepted URL is written back to the provider.
pub(crate) async fn resolve_url<F, Fut>(
    shared: &GeneratorShared,
    prompter: &dyn UrlPrompter,
    default_url: &str,
    probe: F,
) -> Option<String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = std::result::Result<(), String>>,
{
    let mut url = shared
        .params
        .get_str(keys::SERVER_URL)
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| default_url.to_string());
    let mut last_error: Option<String> = None;

    loop {
        if !url.is_empty() {
            match probe(url.clone()).await {
                Ok(()) => {
                    shared
                        .params
                        .set(keys::SERVER_URL, serde_json::Value::String(url.clone()));
                    return Some(url);
                }
                Err(e) => last_error = Some(e),
            }
        }
        match prompter.request_url(&url, last_error.as_deref()) {
            Some(next) => url = next,
            None => return None,
        }
    }
}

/// Push discovered option lists into the provider so the UI can populate
/// its dropdowns; cleared again on disconnect.
pub(crate) fn publish_options(params: &dyn ParameterProvider, caps: &CapabilitySet) {
    params.set_options(
        keys::MODEL,
        caps.checkpoints
            .iter()
            .map(|m| serde_json::Value::from(m.as_str()))
            .collect(),
    );
    params.set_options(
        keys::SAMPLER,
        caps.samplers
            .iter()
            .map(|s| serde_json::Value::from(s.as_str()))
            .collect(),
    );
    params.set_options(
        keys::SCHEDULER,
        caps.schedulers
            .iter()
            .map(|s| serde_json::Value::from(s.as_str()))
            .collect(),
    );
}

pub(crate) fn clear_options(params: &dyn ParameterProvider) {
    params.set_options(keys::MODEL, Vec::new());
    params.set_options(keys::SAMPLER, Vec::new());
    params.set_options(keys::SCHEDULER, Vec::new());
}

/// Compose a progress line for one batch within the whole job. The returned
/// percentage is cumulative across all batches, not batch-local.
pub(crate) fn batch_progress_text(
    batch_index: u32,
    batch_count: u32,
    fraction_in_batch: f32,
) -> (String, f32) {
    let count = batch_count.max(1);
    let overall =
        ((batch_index as f32 + fraction_in_batch.clamp(0.0, 1.0)) / count as f32) * 100.0;
    let text = if count > 1 {
        format!(
            "Batch {} of {}, {:.0}%",
            batch_index + 1,
            count,
            overall
        )
    } else {
        format!("{:.0}%", overall)
    };
    (text, overall)
}

/// The closed set of pluggable backends. Exactly one generator is active
/// process-wide at a time; the surrounding controller swaps variants through
/// `connect`/`disconnect`, never through runtime type inspection.
pub enum Generator {
    WebUi(WebUiGenerator),
    Comfy(ComfyUiGenerator),
    Glid(Glid3XlGenerator),
    Null(NullGenerator),
    Mock(MockGenerator),
}

impl Generator {
    /// Cheap reachability probe. Returns a human-readable detail string on
    /// failure.
    pub async fn is_available(&self) -> (bool, Option<String>) {
        match self {
            Generator::WebUi(g) => g.is_available().await,
            Generator::Comfy(g) => g.is_available().await,
            Generator::Glid(g) => g.is_available().await,
            Generator::Null(g) => g.is_available().await,
            Generator::Mock(g) => g.is_available().await,
        }
    }

    /// Full handshake: resolve the URL (re-prompting through `prompter`
    /// until accepted or aborted), then populate the capability caches.
    /// Returns `false` when the prompter aborted.
    pub async fn connect(&self, prompter: &dyn UrlPrompter) -> Result<bool> {
        match self {
            Generator::WebUi(g) => g.connect(prompter).await,
            Generator::Comfy(g) => g.connect(prompter).await,
            Generator::Glid(g) => g.connect(prompter).await,
            Generator::Null(g) => g.connect(prompter).await,
            Generator::Mock(g) => g.connect(prompter).await,
        }
    }

    /// Release the webservice handle and clear the capability caches.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        match self {
            Generator::WebUi(g) => g.disconnect().await,
            Generator::Comfy(g) => g.disconnect().await,
            Generator::Glid(g) => g.disconnect().await,
            Generator::Null(g) => g.disconnect().await,
            Generator::Mock(g) => g.disconnect().await,
        }
    }

    /// Run one generation job end-to-end on the calling (worker) task.
    /// Touches the UI only through `emitter`.
    pub async fn generate(
        &self,
        emitter: &EventEmitter,
        source: Option<&RgbaImage>,
        mask: Option<&RgbaImage>,
    ) -> Result<()> {
        match self {
            Generator::WebUi(g) => g.generate(emitter, source, mask).await,
            Generator::Comfy(g) => g.generate(emitter, source, mask).await,
            Generator::Glid(g) => g.generate(emitter, source, mask).await,
            Generator::Null(g) => g.generate(emitter, source, mask).await,
            Generator::Mock(g) => g.generate(emitter, source, mask).await,
        }
    }

    /// Best-effort interrupt of the in-flight job.
    pub async fn cancel(&self) {
        match self {
            Generator::WebUi(g) => g.cancel().await,
            Generator::Comfy(g) => g.cancel().await,
            Generator::Glid(g) => g.cancel().await,
            Generator::Null(g) => g.cancel().await,
            Generator::Mock(g) => g.cancel().await,
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.shared().caps()
    }

    pub fn state(&self) -> GeneratorState {
        self.shared().state()
    }

    pub fn is_generating(&self) -> bool {
        self.shared().is_generating()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Generator::WebUi(_) => "webui",
            Generator::Comfy(_) => "comfyui",
            Generator::Glid(_) => "glid-3-xl",
            Generator::Null(_) => "none",
            Generator::Mock(_) => "mock",
        }
    }

    fn shared(&self) -> &GeneratorShared {
        match self {
            Generator::WebUi(g) => g.shared(),
            Generator::Comfy(g) => g.shared(),
            Generator::Glid(g) => g.shared(),
            Generator::Null(g) => g.shared(),
            Generator::Mock(g) => g.shared(),
        }
    }
}
