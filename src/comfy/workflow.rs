use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{GenError, Result};
use crate::prompt::{extract_extension_tags, file_stem, resolve_extension_refs};
use crate::types::{CapabilitySet, EditMode, ExtensionKind, GenerationRequest, ImageRef};

const FILENAME_PREFIX: &str = "generated";
const INPAINT_MASK_GROW: u32 = 8;

/// Incrementally-numbered node-graph document under construction.
struct GraphBuilder {
    nodes: Map<String, Value>,
    next_id: u32,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            nodes: Map::new(),
            next_id: 1,
        }
    }

    /// Add a node, returning its id for wiring.
    fn add(&mut self, class_type: &str, inputs: Value) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.nodes.insert(
            id.clone(),
            json!({
                "class_type": class_type,
                "inputs": inputs,
            }),
        );
        id
    }

    fn build(self) -> Value {
        Value::Object(self.nodes)
    }
}

/// A `[node_id, output_slot]` connection value.
fn link(id: &str, slot: u32) -> Value {
    json!([id, slot])
}

/// Pick the checkpoint config to load with: an exact cached filename first,
/// then a config whose stem matches the checkpoint's stem, else none.
pub fn resolve_model_config(
    explicit: Option<&str>,
    checkpoint: &str,
    configs: &[String],
) -> Option<String> {
    if let Some(name) = explicit {
        if let Some(exact) = configs.iter().find(|c| c.as_str() == name) {
            return Some(exact.clone());
        }
    }
    let stem = file_stem(checkpoint);
    configs.iter().find(|c| file_stem(c) == stem).cloned()
}

/// Build the node-graph request document for one generation job.
///
/// Pure: reads only the request, the cached capability lists, and the
/// already-uploaded image references — all uploads happen before this runs.
/// Returns the document together with the resolved seed (random when the
/// request leaves it to the server).
pub fn build_workflow(
    req: &GenerationRequest,
    caps: &CapabilitySet,
    source: Option<&ImageRef>,
    mask: Option<&ImageRef>,
    control_images: &[Option<ImageRef>],
) -> Result<(Value, i64)> {
    let checkpoint = if req.checkpoint.is_empty() {
        caps.checkpoints
            .first()
            .cloned()
            .ok_or_else(|| GenError::GenerationFailed("no checkpoint model available".into()))?
    } else {
        req.checkpoint.clone()
    };

    let parsed_pos = extract_extension_tags(&req.prompt, 1.0);
    let parsed_neg = extract_extension_tags(&req.negative_prompt, -1.0);
    let mut refs = parsed_pos.refs;
    refs.extend(req.extension_models.iter().cloned());
    refs.extend(parsed_neg.refs);
    let refs = resolve_extension_refs(refs, &caps.loras, &caps.hypernetworks);

    let seed = match req.seed {
        Some(s) => s,
        None => rand::rng().random_range(0..i64::MAX),
    };

    let mut graph = GraphBuilder::new();

    let loader = match resolve_model_config(req.model_config.as_deref(), &checkpoint, &caps.configs)
    {
        Some(config) => graph.add(
            "CheckpointLoader",
            json!({
                "config_name": config,
                "ckpt_name": checkpoint,
            }),
        ),
        None => graph.add(
            "CheckpointLoaderSimple",
            json!({
                "ckpt_name": checkpoint,
            }),
        ),
    };

    let mut model = link(&loader, 0);
    let mut clip = link(&loader, 1);
    let vae = link(&loader, 2);

    for r in &refs {
        match r.kind {
            ExtensionKind::Lora => {
                let node = graph.add(
                    "LoraLoader",
                    json!({
                        "lora_name": r.name,
                        "strength_model": r.strength,
                        "strength_clip": r.clip_strength,
                        "model": model,
                        "clip": clip,
                    }),
                );
                model = link(&node, 0);
                clip = link(&node, 1);
            }
            ExtensionKind::Hypernetwork => {
                let node = graph.add(
                    "HypernetworkLoader",
                    json!({
                        "hypernetwork_name": r.name,
                        "strength": r.strength,
                        "model": model,
                    }),
                );
                model = link(&node, 0);
            }
        }
    }

    let positive_encode = graph.add(
        "CLIPTextEncode",
        json!({
            "text": parsed_pos.text,
            "clip": clip.clone(),
        }),
    );
    let negative_encode = graph.add(
        "CLIPTextEncode",
        json!({
            "text": parsed_neg.text,
            "clip": clip,
        }),
    );
    let mut positive = link(&positive_encode, 0);
    let negative = link(&negative_encode, 0);

    for (unit, uploaded) in req.control_units.iter().zip(control_images) {
        let image_ref = match uploaded {
            Some(r) => r,
            None => {
                warn!(
                    "skipping ControlNet unit \"{}\" with no conditioning image",
                    unit.model
                );
                continue;
            }
        };
        if !caps.controlnet_models.iter().any(|m| m == &unit.model) {
            warn!("skipping unknown ControlNet model \"{}\"", unit.model);
            continue;
        }
        let load = graph.add(
            "LoadImage",
            json!({
                "image": image_ref.filename,
            }),
        );
        let loader = graph.add(
            "ControlNetLoader",
            json!({
                "control_net_name": unit.model,
            }),
        );
        let apply = graph.add(
            "ControlNetApply",
            json!({
                "conditioning": positive,
                "control_net": link(&loader, 0),
                "image": link(&load, 0),
                "strength": unit.strength,
            }),
        );
        positive = link(&apply, 0);
    }

    let latent = match req.edit_mode {
        EditMode::Txt2Img => graph.add(
            "EmptyLatentImage",
            json!({
                "width": req.width,
                "height": req.height,
                "batch_size": req.batch_size,
            }),
        ),
        EditMode::Img2Img => {
            let source = source.ok_or_else(|| {
                GenError::UnsupportedOperation("image-to-image without a source image".into())
            })?;
            let load = graph.add(
                "LoadImage",
                json!({
                    "image": source.filename,
                }),
            );
            let encode = graph.add(
                "VAEEncode",
                json!({
                    "pixels": link(&load, 0),
                    "vae": vae,
                }),
            );
            repeat_for_batch(&mut graph, encode, req.batch_size)
        }
        EditMode::Inpaint => {
            let source = source.ok_or_else(|| {
                GenError::UnsupportedOperation("inpainting without a source image".into())
            })?;
            let mask = mask.ok_or(GenError::EmptyMask)?;
            let load = graph.add(
                "LoadImage",
                json!({
                    "image": source.filename,
                }),
            );
            let load_mask = graph.add(
                "LoadImageMask",
                json!({
                    "image": mask.filename,
                    "channel": "alpha",
                }),
            );
            let encode = graph.add(
                "VAEEncodeForInpaint",
                json!({
                    "pixels": link(&load, 0),
                    "vae": vae,
                    "mask": link(&load_mask, 0),
                    "grow_mask_by": INPAINT_MASK_GROW,
                }),
            );
            repeat_for_batch(&mut graph, encode, req.batch_size)
        }
    };

    // Denoising strength only means something when there is a source to
    // diverge from.
    let denoise = if req.edit_mode == EditMode::Txt2Img {
        1.0
    } else {
        req.denoising_strength
    };

    let sampler = graph.add(
        "KSampler",
        json!({
            "seed": seed,
            "steps": req.steps,
            "cfg": req.guidance_scale,
            "sampler_name": req.sampler,
            "scheduler": req.scheduler,
            "denoise": denoise,
            "model": model,
            "positive": positive,
            "negative": negative,
            "latent_image": link(&latent, 0),
        }),
    );
    let decode = graph.add(
        "VAEDecode",
        json!({
            "samples": link(&sampler, 0),
            "vae": link(&loader, 2),
        }),
    );
    graph.add(
        "SaveImage",
        json!({
            "filename_prefix": FILENAME_PREFIX,
            "images": link(&decode, 0),
        }),
    );

    Ok((graph.build(), seed))
}

fn repeat_for_batch(graph: &mut GraphBuilder, latent: String, batch_size: u32) -> String {
    if batch_size <= 1 {
        return latent;
    }
    graph.add(
        "RepeatLatentBatch",
        json!({
            "samples": link(&latent, 0),
            "amount": batch_size,
        }),
    )
}
