//! Workflow template engine.
//!
//! A workflow is the JSON graph a ComfyUI worker executes: an object
//! mapping node-id strings to `{class_type, inputs, _meta: {title}}`
//! entries. The template is loaded once, node roles are resolved once from
//! the `_meta.title` labels, and every batch item gets its own instantiated
//! copy with the input image, prompts, and seeds rewritten.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Seed sentinel. ComfyUI interprets `-1` as "pick a fresh random seed",
/// so every instantiation produces different noise.
pub const RANDOM_SEED: i64 = -1;

/// Keywords that mark a prompt holder's current text as a negative prompt.
/// Used to disambiguate prompt holders that share a label pattern.
const NEGATIVE_KEYWORDS: &[&str] = &[
    "blurry",
    "low quality",
    "worst quality",
    "bad",
    "ugly",
    "deformed",
];

// ---------------------------------------------------------------------------
// Node roles
// ---------------------------------------------------------------------------

/// Functional role a node plays in the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Image loader rewired to the uploaded input.
    InputImage,
    /// Positive prompt text holder.
    PositivePrompt,
    /// Negative prompt text holder.
    NegativePrompt,
    /// Checkpoint model loader.
    CheckpointLoader,
    /// Main sampler (takes `noise_seed`).
    MainSampler,
    /// Refinement pass (takes `seed`).
    Refiner,
    /// Save node for the unrefined image.
    Output,
    /// Save node for the refined image.
    OutputRefined,
}

/// Role → node-id table, resolved once per template.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    map: HashMap<NodeRole, String>,
}

impl RoleMap {
    /// Resolve roles from a workflow's `_meta.title` labels.
    ///
    /// Unknown titles are ignored; a role missing from the template is
    /// simply absent from the map.
    pub fn resolve(nodes: &Map<String, Value>) -> Self {
        let mut map = HashMap::new();

        // Prompt holders are collected first and disambiguated below.
        let mut prompt_candidates: Vec<(String, String, String)> = Vec::new();

        for (node_id, node) in nodes {
            let Some(title) = node_title(node) else {
                continue;
            };
            match title {
                "INPUT_IMAGE" => {
                    map.insert(NodeRole::InputImage, node_id.clone());
                }
                "POSITIVE" | "NEGATIVE" => {
                    let text = node_text(node).unwrap_or_default();
                    prompt_candidates.push((node_id.clone(), title.to_string(), text));
                }
                "Load Checkpoint" => {
                    map.insert(NodeRole::CheckpointLoader, node_id.clone());
                }
                "KSampler (Advanced)" => {
                    map.insert(NodeRole::MainSampler, node_id.clone());
                }
                "Detailer (SEGS)" => {
                    map.insert(NodeRole::Refiner, node_id.clone());
                }
                "OUTPUT" => {
                    map.insert(NodeRole::Output, node_id.clone());
                }
                "OUTPUT_REFINED" => {
                    map.insert(NodeRole::OutputRefined, node_id.clone());
                }
                _ => {}
            }
        }

        if let Some((positive, negative)) = assign_prompt_roles(&prompt_candidates) {
            map.insert(NodeRole::PositivePrompt, positive);
            if let Some(negative) = negative {
                map.insert(NodeRole::NegativePrompt, negative);
            }
        }

        Self { map }
    }

    /// Node id resolved for a role, if the template has one.
    pub fn node_id(&self, role: NodeRole) -> Option<&str> {
        self.map.get(&role).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Split prompt-holder candidates into (positive, optional negative).
///
/// Direct title assignment wins when the labels are unambiguous (exactly
/// one `POSITIVE` and one `NEGATIVE`). Otherwise each candidate's current
/// text is scanned for negative keywords; the first keyword match becomes
/// the negative holder and the first non-match the positive. If no keyword
/// matches anywhere, the first candidate is taken as positive and the next
/// as negative. That fallback is arbitrary but matches observed templates.
fn assign_prompt_roles(
    candidates: &[(String, String, String)],
) -> Option<(String, Option<String>)> {
    if candidates.is_empty() {
        return None;
    }

    let positives: Vec<_> = candidates.iter().filter(|(_, t, _)| t == "POSITIVE").collect();
    let negatives: Vec<_> = candidates.iter().filter(|(_, t, _)| t == "NEGATIVE").collect();
    if positives.len() == 1 && negatives.len() == 1 {
        return Some((positives[0].0.clone(), Some(negatives[0].0.clone())));
    }

    let negative = candidates
        .iter()
        .find(|(_, _, text)| contains_negative_keyword(text))
        .map(|(id, _, _)| id.clone());
    let positive = candidates
        .iter()
        .find(|(_, _, text)| !contains_negative_keyword(text))
        .map(|(id, _, _)| id.clone());

    match (positive, negative) {
        (Some(p), n) => Some((p, n)),
        (None, Some(_)) => {
            // Every candidate looked negative; the first one still has to
            // hold the positive prompt.
            Some((
                candidates[0].0.clone(),
                candidates.get(1).map(|(id, _, _)| id.clone()),
            ))
        }
        (None, None) => None,
    }
}

fn contains_negative_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEGATIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn node_title(node: &Value) -> Option<&str> {
    node.pointer("/_meta/title").and_then(Value::as_str)
}

fn node_text(node: &Value) -> Option<String> {
    node.pointer("/inputs/text")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Optional overrides for the main sampler node.
#[derive(Debug, Clone, Default)]
pub struct SamplerSettings {
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
}

/// Optional overrides for the refiner node.
#[derive(Debug, Clone, Default)]
pub struct RefinerSettings {
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub denoise: Option<f64>,
    pub cycles: Option<u32>,
}

/// Per-item parameters applied during instantiation.
#[derive(Debug, Clone)]
pub struct InstantiateParams<'a> {
    /// Server-side name of the uploaded input image.
    pub input_image: &'a str,
    pub positive_prompt: &'a str,
    pub negative_prompt: &'a str,
    /// Checkpoint model file name override.
    pub checkpoint: Option<&'a str>,
    pub sampler: Option<&'a SamplerSettings>,
    pub refiner: Option<&'a RefinerSettings>,
}

/// A parsed workflow template with resolved node roles.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    nodes: Map<String, Value>,
    roles: RoleMap,
}

impl WorkflowTemplate {
    /// Parse a workflow from a JSON value. The value must be an object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let Value::Object(nodes) = value else {
            return Err(CoreError::Template(
                "workflow root must be a JSON object".to_string(),
            ));
        };
        let roles = RoleMap::resolve(&nodes);
        tracing::debug!(
            node_count = nodes.len(),
            resolved_roles = roles.len(),
            "Workflow template loaded",
        );
        Ok(Self { nodes, roles })
    }

    /// Load a workflow template from a JSON file on disk.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Template(format!("invalid workflow JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn roles(&self) -> &RoleMap {
        &self.roles
    }

    /// The template's current positive/negative prompt text, used as
    /// defaults when a batch request does not override them.
    pub fn default_prompts(&self) -> (String, String) {
        let text_of = |role| {
            self.roles
                .node_id(role)
                .and_then(|id| self.nodes.get(id))
                .and_then(node_text)
                .unwrap_or_default()
        };
        (
            text_of(NodeRole::PositivePrompt),
            text_of(NodeRole::NegativePrompt),
        )
    }

    /// Build a per-item workflow instance.
    ///
    /// The shared template is never mutated; roles absent from the template
    /// are silently skipped. Seed fields are always reset to
    /// [`RANDOM_SEED`] so repeated runs of the same input diverge.
    pub fn instantiate(&self, params: &InstantiateParams<'_>) -> Value {
        let mut nodes = self.nodes.clone();

        self.set_input(&mut nodes, NodeRole::InputImage, "image", params.input_image.into());
        self.set_input(
            &mut nodes,
            NodeRole::PositivePrompt,
            "text",
            params.positive_prompt.into(),
        );
        self.set_input(
            &mut nodes,
            NodeRole::NegativePrompt,
            "text",
            params.negative_prompt.into(),
        );

        if let Some(checkpoint) = params.checkpoint {
            self.set_input(&mut nodes, NodeRole::CheckpointLoader, "ckpt_name", checkpoint.into());
        }

        self.set_input(&mut nodes, NodeRole::MainSampler, "noise_seed", RANDOM_SEED.into());
        if let Some(sampler) = params.sampler {
            if let Some(steps) = sampler.steps {
                self.set_input(&mut nodes, NodeRole::MainSampler, "steps", steps.into());
            }
            if let Some(cfg) = sampler.cfg {
                self.set_input(&mut nodes, NodeRole::MainSampler, "cfg", cfg.into());
            }
            if let Some(ref name) = sampler.sampler_name {
                self.set_input(&mut nodes, NodeRole::MainSampler, "sampler_name", name.as_str().into());
            }
            if let Some(ref scheduler) = sampler.scheduler {
                self.set_input(&mut nodes, NodeRole::MainSampler, "scheduler", scheduler.as_str().into());
            }
        }

        self.set_input(&mut nodes, NodeRole::Refiner, "seed", RANDOM_SEED.into());
        if let Some(refiner) = params.refiner {
            if let Some(steps) = refiner.steps {
                self.set_input(&mut nodes, NodeRole::Refiner, "steps", steps.into());
            }
            if let Some(cfg) = refiner.cfg {
                self.set_input(&mut nodes, NodeRole::Refiner, "cfg", cfg.into());
            }
            if let Some(ref name) = refiner.sampler_name {
                self.set_input(&mut nodes, NodeRole::Refiner, "sampler_name", name.as_str().into());
            }
            if let Some(ref scheduler) = refiner.scheduler {
                self.set_input(&mut nodes, NodeRole::Refiner, "scheduler", scheduler.as_str().into());
            }
            if let Some(denoise) = refiner.denoise {
                self.set_input(&mut nodes, NodeRole::Refiner, "denoise", denoise.into());
            }
            if let Some(cycles) = refiner.cycles {
                self.set_input(&mut nodes, NodeRole::Refiner, "cycle", cycles.into());
            }
        }

        Value::Object(nodes)
    }

    /// Set `inputs.{key}` on the node resolved for `role`, if any.
    fn set_input(&self, nodes: &mut Map<String, Value>, role: NodeRole, key: &str, value: Value) {
        let Some(node_id) = self.roles.node_id(role) else {
            return;
        };
        if let Some(inputs) = nodes
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(key.to_string(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_template() -> WorkflowTemplate {
        let value = json!({
            "1": {
                "class_type": "LoadImage",
                "inputs": { "image": "placeholder.png" },
                "_meta": { "title": "INPUT_IMAGE" }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "base.safetensors" },
                "_meta": { "title": "Load Checkpoint" }
            },
            "10": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "a detailed portrait" },
                "_meta": { "title": "POSITIVE" }
            },
            "15": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "blurry, low quality" },
                "_meta": { "title": "NEGATIVE" }
            },
            "12": {
                "class_type": "KSamplerAdvanced",
                "inputs": { "noise_seed": 42, "steps": 20, "cfg": 7.5 },
                "_meta": { "title": "KSampler (Advanced)" }
            },
            "46": {
                "class_type": "DetailerForEachDebug",
                "inputs": { "seed": 7, "denoise": 0.4, "cycle": 1 },
                "_meta": { "title": "Detailer (SEGS)" }
            },
            "20": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "out" },
                "_meta": { "title": "OUTPUT" }
            },
            "52": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "out_refined" },
                "_meta": { "title": "OUTPUT_REFINED" }
            }
        });
        WorkflowTemplate::from_value(value).unwrap()
    }

    fn basic_params<'a>() -> InstantiateParams<'a> {
        InstantiateParams {
            input_image: "uploaded.png",
            positive_prompt: "hello",
            negative_prompt: "ugly",
            checkpoint: None,
            sampler: None,
            refiner: None,
        }
    }

    #[test]
    fn resolves_all_roles() {
        let template = sample_template();
        let roles = template.roles();
        assert_eq!(roles.node_id(NodeRole::InputImage), Some("1"));
        assert_eq!(roles.node_id(NodeRole::CheckpointLoader), Some("4"));
        assert_eq!(roles.node_id(NodeRole::PositivePrompt), Some("10"));
        assert_eq!(roles.node_id(NodeRole::NegativePrompt), Some("15"));
        assert_eq!(roles.node_id(NodeRole::MainSampler), Some("12"));
        assert_eq!(roles.node_id(NodeRole::Refiner), Some("46"));
        assert_eq!(roles.node_id(NodeRole::Output), Some("20"));
        assert_eq!(roles.node_id(NodeRole::OutputRefined), Some("52"));
    }

    #[test]
    fn rejects_non_object_root() {
        assert!(matches!(
            WorkflowTemplate::from_value(json!([1, 2, 3])),
            Err(CoreError::Template(_))
        ));
    }

    #[test]
    fn prompt_holders_disambiguated_by_keywords() {
        // Both holders carry the same label; keyword scan must split them.
        let value = json!({
            "10": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "a sunny meadow" },
                "_meta": { "title": "POSITIVE" }
            },
            "11": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "worst quality, deformed" },
                "_meta": { "title": "POSITIVE" }
            }
        });
        let template = WorkflowTemplate::from_value(value).unwrap();
        assert_eq!(template.roles().node_id(NodeRole::PositivePrompt), Some("10"));
        assert_eq!(template.roles().node_id(NodeRole::NegativePrompt), Some("11"));
    }

    #[test]
    fn prompt_fallback_without_keywords() {
        // No keyword matches anywhere; first candidate wins positive.
        let value = json!({
            "10": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "first" },
                "_meta": { "title": "POSITIVE" }
            },
            "11": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "second" },
                "_meta": { "title": "POSITIVE" }
            }
        });
        let template = WorkflowTemplate::from_value(value).unwrap();
        assert_eq!(template.roles().node_id(NodeRole::PositivePrompt), Some("10"));
    }

    #[test]
    fn instantiate_rewrites_inputs_and_seeds() {
        let template = sample_template();
        let params = InstantiateParams {
            checkpoint: Some("other.safetensors"),
            ..basic_params()
        };
        let instance = template.instantiate(&params);

        assert_eq!(
            instance.pointer("/1/inputs/image").and_then(Value::as_str),
            Some("uploaded.png")
        );
        assert_eq!(
            instance.pointer("/10/inputs/text").and_then(Value::as_str),
            Some("hello")
        );
        assert_eq!(
            instance.pointer("/15/inputs/text").and_then(Value::as_str),
            Some("ugly")
        );
        assert_eq!(
            instance.pointer("/4/inputs/ckpt_name").and_then(Value::as_str),
            Some("other.safetensors")
        );
        assert_eq!(
            instance.pointer("/12/inputs/noise_seed").and_then(Value::as_i64),
            Some(RANDOM_SEED)
        );
        assert_eq!(
            instance.pointer("/46/inputs/seed").and_then(Value::as_i64),
            Some(RANDOM_SEED)
        );
        // Untouched fields survive.
        assert_eq!(
            instance.pointer("/12/inputs/steps").and_then(Value::as_u64),
            Some(20)
        );
    }

    #[test]
    fn instantiate_applies_setting_overrides() {
        let template = sample_template();
        let sampler = SamplerSettings {
            steps: Some(30),
            cfg: Some(5.0),
            ..Default::default()
        };
        let refiner = RefinerSettings {
            denoise: Some(0.25),
            cycles: Some(2),
            ..Default::default()
        };
        let params = InstantiateParams {
            sampler: Some(&sampler),
            refiner: Some(&refiner),
            ..basic_params()
        };
        let instance = template.instantiate(&params);

        assert_eq!(
            instance.pointer("/12/inputs/steps").and_then(Value::as_u64),
            Some(30)
        );
        assert_eq!(
            instance.pointer("/12/inputs/cfg").and_then(Value::as_f64),
            Some(5.0)
        );
        assert_eq!(
            instance.pointer("/46/inputs/denoise").and_then(Value::as_f64),
            Some(0.25)
        );
        assert_eq!(
            instance.pointer("/46/inputs/cycle").and_then(Value::as_u64),
            Some(2)
        );
    }

    #[test]
    fn instantiate_never_mutates_template() {
        let template = sample_template();
        let before = template.instantiate(&basic_params());
        let params = InstantiateParams {
            input_image: "other.png",
            positive_prompt: "changed",
            negative_prompt: "changed",
            checkpoint: Some("x.safetensors"),
            sampler: None,
            refiner: None,
        };
        let _ = template.instantiate(&params);
        let after = template.instantiate(&basic_params());
        assert_eq!(before, after);
    }

    #[test]
    fn missing_roles_skipped_silently() {
        // Template with only an input node; everything else absent.
        let value = json!({
            "1": {
                "class_type": "LoadImage",
                "inputs": { "image": "placeholder.png" },
                "_meta": { "title": "INPUT_IMAGE" }
            }
        });
        let template = WorkflowTemplate::from_value(value).unwrap();
        let instance = template.instantiate(&basic_params());
        assert_eq!(
            instance.pointer("/1/inputs/image").and_then(Value::as_str),
            Some("uploaded.png")
        );
        assert_eq!(instance.as_object().unwrap().len(), 1);
    }

    #[test]
    fn default_prompts_read_from_template() {
        let template = sample_template();
        let (positive, negative) = template.default_prompts();
        assert_eq!(positive, "a detailed portrait");
        assert_eq!(negative, "blurry, low quality");
    }
}
