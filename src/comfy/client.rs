use std::time::Duration;

use futures_util::StreamExt;
use image::RgbaImage;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::compose;
use crate::error::{GenError, Result};
use crate::http::WebClient;
use crate::types::{ImageRef, JobStatus, ProgressUpdate, QueuedJob};

/// Adapter for a ComfyUI-compatible server.
///
/// Media is treated as named server-side assets: images and masks are
/// uploaded first, then referenced by filename from the workflow document.
/// Job completion is detected by polling `/history` and `/queue`; the
/// websocket progress stream is advisory only.
#[derive(Clone)]
pub struct ComfyClient {
    web: WebClient,
    client_id: String,
}

/// One row of a queue snapshot: `[task_number, task_id, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub task_number: u64,
    pub task_id: String,
}

/// Parsed `/queue` response.
#[derive(Debug, Clone, Default)]
pub struct QueueInfo {
    pub running: Vec<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

/// Parsed `/history/{id}` entry.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub status: String,
    pub completed: bool,
    pub outputs: Vec<ImageRef>,
}

impl ComfyClient {
    /// Wrap a web client session. A fresh client id keys the websocket
    /// progress stream for this session.
    pub fn new(web: WebClient) -> Self {
        Self {
            web,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base_url(&self) -> &str {
        self.web.base_url()
    }

    /// Cheap reachability probe via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .web
            .get_unchecked("system_stats", &[], Duration::from_secs(5))
            .await?;
        Ok(resp.status().is_success())
    }

    // ── Uploads ─────────────────────────────────────────────────────

    /// Upload the generation-area image. Returns the server-side reference
    /// the workflow document uses to name it.
    pub async fn upload_image(&self, image: &RgbaImage, filename: &str) -> Result<ImageRef> {
        let bytes = compose::encode_png(image)?;
        self.upload("upload/image", bytes, filename, None).await
    }

    /// Upload the inpainting mask against an already-uploaded source image.
    ///
    /// The server treats transparent pixels as editable while the editor
    /// marks editable pixels opaque, so the alpha channel is inverted here —
    /// exactly once, at this upload boundary.
    pub async fn upload_mask(
        &self,
        mask: &RgbaImage,
        filename: &str,
        source: &ImageRef,
    ) -> Result<ImageRef> {
        let inverted = compose::invert_alpha(mask);
        let bytes = compose::encode_png(&inverted)?;
        let original_ref = serde_json::to_string(source)?;
        self.upload("upload/mask", bytes, filename, Some(original_ref))
            .await
    }

    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        filename: &str,
        original_ref: Option<String>,
    ) -> Result<ImageRef> {
        let name = filename.to_string();
        let resp = self
            .web
            .post_multipart(
                path,
                || {
                    let mut form = reqwest::multipart::Form::new()
                        .text("type", "input")
                        .text("subfolder", "")
                        .text("overwrite", "true")
                        .part(
                            "image",
                            reqwest::multipart::Part::bytes(bytes.clone())
                                .file_name(name.clone()),
                        );
                    if let Some(ref original) = original_ref {
                        form = form.text("original_ref", original.clone());
                    }
                    form
                },
                Duration::from_secs(30),
            )
            .await?;

        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: format!("failed to parse {} response", path),
            source: e,
        })?;
        let filename = json
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GenError::InvalidResponse("upload response missing name".into()))?;
        Ok(ImageRef {
            filename: filename.to_string(),
            subfolder: json
                .get("subfolder")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            kind: json
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("input")
                .to_string(),
        })
    }

    // ── Job submission ──────────────────────────────────────────────

    /// Queue a workflow for execution.
    pub async fn queue_prompt(&self, workflow: &Value, seed: i64) -> Result<QueuedJob> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });
        let resp = self
            .web
            .post_json("prompt", &body, Duration::from_secs(30))
            .await?;
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: "failed to parse /prompt response".into(),
            source: e,
        })?;

        if let Some(errors) = json.get("node_errors").and_then(|v| v.as_object()) {
            if !errors.is_empty() {
                return Err(GenError::InvalidResponse(format!(
                    "workflow node errors: {}",
                    serde_json::to_string(errors).unwrap_or_default()
                )));
            }
        }

        let task_id = json
            .get("prompt_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GenError::InvalidResponse("response missing prompt_id".into()))?;
        let task_number = json.get("number").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(QueuedJob {
            task_id: task_id.to_string(),
            task_number,
            seed,
        })
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Fetch the current running/pending queue snapshots.
    pub async fn queue_info(&self) -> Result<QueueInfo> {
        let json: Value = self
            .web
            .get_json("queue", &[], Duration::from_secs(5))
            .await?;
        Ok(QueueInfo {
            running: parse_queue_entries(json.get("queue_running")),
            pending: parse_queue_entries(json.get("queue_pending")),
        })
    }

    /// Fetch the history entry for a task. `None` until the server has one.
    pub async fn history(&self, task_id: &str) -> Result<Option<HistoryEntry>> {
        let path = format!("history/{}", task_id);
        let resp = self
            .web
            .get_unchecked(&path, &[], Duration::from_secs(10))
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: "failed to parse history response".into(),
            source: e,
        })?;
        let entry = match json.get(task_id) {
            Some(e) => e,
            None => return Ok(None),
        };
        Ok(Some(parse_history_entry(entry)))
    }

    /// Classify where a submitted job currently sits, merging the history
    /// and queue snapshots.
    pub async fn check_queue_entry(&self, job: &QueuedJob) -> Result<JobStatus> {
        let history = self.history(&job.task_id).await?;
        if let Some(status) = classify_history(history.as_ref()) {
            return Ok(status);
        }
        let queue = self.queue_info().await?;
        Ok(classify_queue(job, &queue))
    }

    // ── Results ─────────────────────────────────────────────────────

    /// Download an output image by its reference. Returns raw bytes.
    pub async fn download_image(&self, img: &ImageRef) -> Result<Vec<u8>> {
        let resp = self
            .web
            .get(
                "view",
                &[
                    ("filename", img.filename.as_str()),
                    ("subfolder", img.subfolder.as_str()),
                    ("type", img.kind.as_str()),
                ],
                Duration::from_secs(30),
            )
            .await?;
        let bytes = resp.bytes().await.map_err(|e| GenError::Connection {
            context: format!("failed to read image {}", img.filename),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Interrupt the currently-executing job.
    pub async fn interrupt(&self) -> Result<()> {
        self.web
            .post_json("interrupt", &serde_json::json!({}), Duration::from_secs(5))
            .await?;
        Ok(())
    }

    /// Remove a still-pending job from the queue.
    pub async fn cancel_pending(&self, task_id: &str) -> Result<()> {
        let body = serde_json::json!({ "delete": [task_id] });
        self.web
            .post_json("queue", &body, Duration::from_secs(5))
            .await?;
        Ok(())
    }

    // ── Model discovery ─────────────────────────────────────────────

    pub async fn checkpoints(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "CheckpointLoaderSimple",
            "/CheckpointLoaderSimple/input/required/ckpt_name/0",
        )
        .await
    }

    pub async fn checkpoint_configs(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "CheckpointLoader",
            "/CheckpointLoader/input/required/config_name/0",
        )
        .await
    }

    pub async fn samplers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/sampler_name/0")
            .await
    }

    pub async fn schedulers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/scheduler/0")
            .await
    }

    pub async fn loras(&self) -> Result<Vec<String>> {
        self.object_info_list("LoraLoader", "/LoraLoader/input/required/lora_name/0")
            .await
    }

    pub async fn hypernetworks(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "HypernetworkLoader",
            "/HypernetworkLoader/input/required/hypernetwork_name/0",
        )
        .await
    }

    pub async fn controlnet_models(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "ControlNetLoader",
            "/ControlNetLoader/input/required/control_net_name/0",
        )
        .await
    }

    async fn object_info_list(&self, node: &str, pointer: &str) -> Result<Vec<String>> {
        let path = format!("object_info/{}", node);
        let resp = self
            .web
            .get_unchecked(&path, &[], Duration::from_secs(10))
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let json: Value = resp.json().await.map_err(|e| GenError::Connection {
            context: format!("failed to parse {} object_info", node),
            source: e,
        })?;
        Ok(json
            .pointer(pointer)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Streaming progress ──────────────────────────────────────────

    /// Listen on the websocket for `progress` events belonging to `task_id`
    /// and forward them until the job's poll loop signals `stop`.
    ///
    /// Advisory only: completion is never decided here, and any socket
    /// failure simply ends the stream.
    pub async fn progress_updates<F>(
        &self,
        task_id: &str,
        mut stop: oneshot::Receiver<()>,
        mut on_progress: F,
    ) where
        F: FnMut(ProgressUpdate),
    {
        let ws_url = format!(
            "{}/ws?clientId={}",
            self.web
                .base_url()
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            self.client_id
        );

        let (mut ws, _) = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok(c) => c,
            Err(e) => {
                debug!("progress socket unavailable: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut stop => break,
                msg = ws.next() => {
                    let text = match msg {
                        Some(Ok(m)) if m.is_text() => m.into_text().unwrap_or_default(),
                        Some(Ok(_)) => continue,
                        _ => break,
                    };
                    let json: Value = match serde_json::from_str(&text) {
                        Ok(j) => j,
                        Err(_) => continue,
                    };
                    if json.get("type").and_then(|v| v.as_str()) != Some("progress") {
                        continue;
                    }
                    let data = match json.get("data") {
                        Some(d) => d,
                        None => continue,
                    };
                    // Skip progress belonging to another client's prompt.
                    let pid = data.get("prompt_id").and_then(|v| v.as_str());
                    if pid.is_some() && pid != Some(task_id) {
                        continue;
                    }
                    let value = data.get("value").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    let max = data.get("max").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                    on_progress(ProgressUpdate { value, max });
                }
            }
        }
    }
}

fn parse_queue_entries(value: Option<&Value>) -> Vec<QueueEntry> {
    value
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    Some(QueueEntry {
                        task_number: row.first()?.as_u64()?,
                        task_id: row.get(1)?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_history_entry(entry: &Value) -> HistoryEntry {
    let status = entry
        .pointer("/status/status_str")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let completed = entry
        .pointer("/status/completed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut outputs = Vec::new();
    if let Some(nodes) = entry.get("outputs").and_then(|o| o.as_object()) {
        for node_output in nodes.values() {
            if let Some(images) = node_output.get("images").and_then(|i| i.as_array()) {
                for img in images {
                    if let Some(filename) = img.get("filename").and_then(|f| f.as_str()) {
                        outputs.push(ImageRef {
                            filename: filename.to_string(),
                            subfolder: img
                                .get("subfolder")
                                .and_then(|s| s.as_str())
                                .unwrap_or("")
                                .to_string(),
                            kind: img
                                .get("type")
                                .and_then(|t| t.as_str())
                                .unwrap_or("output")
                                .to_string(),
                        });
                    }
                }
            }
        }
    }

    HistoryEntry {
        status,
        completed,
        outputs,
    }
}

/// Terminal classification from the history entry alone, when possible.
fn classify_history(history: Option<&HistoryEntry>) -> Option<JobStatus> {
    let entry = history?;
    if entry.status == "error" {
        return Some(JobStatus::Failed {
            error: "the server reported a generation error".into(),
        });
    }
    if entry.completed {
        return Some(JobStatus::Finished {
            outputs: entry.outputs.clone(),
        });
    }
    None
}

/// Classification against the queue snapshots. The pending index counts only
/// entries submitted before this job — later arrivals do not push it back.
fn classify_queue(job: &QueuedJob, queue: &QueueInfo) -> JobStatus {
    if queue.running.iter().any(|e| e.task_id == job.task_id) {
        return JobStatus::Active;
    }
    if queue.pending.iter().any(|e| e.task_id == job.task_id) {
        let queue_index = queue
            .pending
            .iter()
            .filter(|e| e.task_number < job.task_number)
            .count();
        return JobStatus::Pending { queue_index };
    }
    JobStatus::NotFound
}

/// Pure form of [`ComfyClient::check_queue_entry`] for snapshot data.
pub fn classify_queue_entry(
    job: &QueuedJob,
    history: Option<&HistoryEntry>,
    queue: &QueueInfo,
) -> JobStatus {
    classify_history(history).unwrap_or_else(|| classify_queue(job, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, number: u64) -> QueuedJob {
        QueuedJob {
            task_id: id.to_string(),
            task_number: number,
            seed: 1,
        }
    }

    fn history(status: &str, completed: bool, images: usize) -> HistoryEntry {
        HistoryEntry {
            status: status.to_string(),
            completed,
            outputs: (0..images)
                .map(|i| ImageRef {
                    filename: format!("out_{}.png", i),
                    subfolder: String::new(),
                    kind: "output".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_completed_history_is_finished() {
        let h = history("success", true, 2);
        let status = classify_queue_entry(&job("a", 5), Some(&h), &QueueInfo::default());
        match status {
            JobStatus::Finished { outputs } => assert_eq!(outputs.len(), 2),
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn test_error_history_is_failed() {
        let h = history("error", false, 0);
        let status = classify_queue_entry(&job("a", 5), Some(&h), &QueueInfo::default());
        assert!(matches!(status, JobStatus::Failed { .. }));
    }

    #[test]
    fn test_running_snapshot_is_active() {
        let queue = QueueInfo {
            running: vec![QueueEntry {
                task_number: 5,
                task_id: "a".into(),
            }],
            pending: vec![],
        };
        let status = classify_queue_entry(&job("a", 5), None, &queue);
        assert_eq!(status, JobStatus::Active);
    }

    #[test]
    fn test_pending_index_counts_only_earlier_tasks() {
        let queue = QueueInfo {
            running: vec![],
            pending: vec![
                QueueEntry {
                    task_number: 3,
                    task_id: "earlier".into(),
                },
                QueueEntry {
                    task_number: 5,
                    task_id: "ours".into(),
                },
                QueueEntry {
                    task_number: 9,
                    task_id: "later".into(),
                },
            ],
        };
        let status = classify_queue_entry(&job("ours", 5), None, &queue);
        assert_eq!(status, JobStatus::Pending { queue_index: 1 });
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let status = classify_queue_entry(&job("ghost", 1), None, &QueueInfo::default());
        assert_eq!(status, JobStatus::NotFound);
    }

    #[test]
    fn test_incomplete_history_falls_through_to_queue() {
        let h = history("running", false, 0);
        let queue = QueueInfo {
            running: vec![QueueEntry {
                task_number: 5,
                task_id: "a".into(),
            }],
            pending: vec![],
        };
        let status = classify_queue_entry(&job("a", 5), Some(&h), &queue);
        assert_eq!(status, JobStatus::Active);
    }

    #[test]
    fn test_parse_queue_entries() {
        let json: Value = serde_json::from_str(
            r#"{
            "queue_running": [[7, "run-id", {}]],
            "queue_pending": [[8, "pend-1"], [9, "pend-2"]]
        }"#,
        )
        .unwrap();
        let running = parse_queue_entries(json.get("queue_running"));
        let pending = parse_queue_entries(json.get("queue_pending"));
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_number, 7);
        assert_eq!(running[0].task_id, "run-id");
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_parse_history_entry_walks_all_output_nodes() {
        let json: Value = serde_json::from_str(
            r#"{
            "status": {"status_str": "success", "completed": true},
            "outputs": {
                "9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]},
                "12": {"images": [{"filename": "b.png", "subfolder": "batch", "type": "output"}]}
            }
        }"#,
        )
        .unwrap();
        let entry = parse_history_entry(&json);
        assert!(entry.completed);
        assert_eq!(entry.outputs.len(), 2);
        assert!(entry.outputs.iter().any(|i| i.filename == "a.png"));
        assert!(entry.outputs.iter().any(|i| i.subfolder == "batch"));
    }

    #[test]
    fn test_malformed_queue_rows_are_skipped() {
        let json: Value = serde_json::from_str(
            r#"{"queue_pending": [[1, "ok"], ["bad"], [2], 3]}"#,
        )
        .unwrap();
        let pending = parse_queue_entries(json.get("queue_pending"));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "ok");
    }
}
