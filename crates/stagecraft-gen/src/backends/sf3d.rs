//! StableFast3D backend on a local ComfyUI server
//!
//! Image-to-3D: the reference image is uploaded to the ComfyUI input
//! folder, a StableFast3D workflow is queued via `POST /prompt`, and
//! `GET /history/{prompt_id}` is polled until the run completes. Output
//! meshes are served back through `/view`.

use crate::backend::{GenerationBackend, GenerationRequest, QueryResponse, StatusCode};
use crate::config::{Sf3dConfig, TransportConfig, SF3D};
use async_trait::async_trait;
use serde_json::Value;
use stagecraft_core::{Result, StagecraftError};
use std::path::Path;
use tracing::debug;

const FOREGROUND_RATIO: f64 = 0.85;
const TEXTURE_RESOLUTION: u32 = 1024;
const REMESH: &str = "triangle";
const VERTEX_COUNT: i64 = -1;

pub struct Sf3dBackend {
    config: Sf3dConfig,
    client: reqwest::Client,
    client_id: String,
    template: Option<Value>,
}

impl Sf3dBackend {
    pub fn new(config: Sf3dConfig, transport: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(transport.request_timeout())
            .build()
            .map_err(|e| StagecraftError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let template = match &config.workflow_template {
            Some(path) => Some(load_template(path)?),
            None => None,
        };

        Ok(Self {
            config,
            client,
            client_id: uuid::Uuid::new_v4().to_string(),
            template,
        })
    }

    fn base_url(&self) -> Result<String> {
        self.config
            .base_url()
            .ok_or_else(|| StagecraftError::Configuration("sf3d endpoint not configured".to_string()))
    }

    /// Put the reference image into the ComfyUI input folder and return the
    /// name the server stored it under.
    async fn upload_image(&self, request: &GenerationRequest) -> Result<String> {
        let (bytes, file_name) = if let Some(path) = &request.image_path {
            let bytes = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("{}.png", request.object_id));
            (bytes, name)
        } else if let Some(url) = &request.image_url {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| StagecraftError::Transport(format!("fetch reference image: {}", e)))?;
            let bytes = ensure_success(response, "fetch reference image")
                .await?
                .bytes()
                .await
                .map_err(|e| StagecraftError::Transport(format!("fetch reference image: {}", e)))?;
            (bytes.to_vec(), format!("{}.png", request.object_id))
        } else {
            return Err(StagecraftError::JobFailed {
                backend: SF3D.to_string(),
                code: "MissingInput".to_string(),
                message: format!(
                    "sf3d is image-to-3D and object '{}' has no reference image",
                    request.object_id
                ),
            });
        };

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("image/png")
            .map_err(|e| StagecraftError::Transport(format!("upload image: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.base_url()?))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("upload image: {}", e)))?;
        let body: Value = ensure_success(response, "upload image")
            .await?
            .json()
            .await
            .map_err(|e| StagecraftError::Transport(format!("upload image: {}", e)))?;

        Ok(body
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.to_string())
            .unwrap_or(file_name))
    }
}

#[async_trait]
impl GenerationBackend for Sf3dBackend {
    fn name(&self) -> &str {
        SF3D
    }

    fn check_config(&self) -> Result<()> {
        self.config.check()
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        let image_name = self.upload_image(request).await?;
        let template = self.template.clone().unwrap_or_else(default_workflow);
        let workflow = build_workflow(template, &image_name, &request.object_id)?;

        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url()?))
            .json(&body)
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("sf3d submit: {}", e)))?;
        let text = ensure_success(response, "sf3d submit")
            .await?
            .text()
            .await
            .map_err(|e| StagecraftError::Transport(format!("sf3d submit: {}", e)))?;

        let prompt_id = parse_submit(&text)?;
        debug!(prompt_id = %prompt_id, image = %image_name, "Queued sf3d workflow");
        Ok(prompt_id)
    }

    async fn query(&self, job_id: &str) -> Result<QueryResponse> {
        let base = self.base_url()?;
        let response = self
            .client
            .get(format!("{}/history/{}", base, job_id))
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("sf3d history: {}", e)))?;
        let history: Value = ensure_success(response, "sf3d history")
            .await?
            .json()
            .await
            .map_err(|e| StagecraftError::Transport(format!("sf3d history: {}", e)))?;
        Ok(parse_history(job_id, &history, &base))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("download {}: {}", uri, e)))?;
        let status = response.status();
        if !status.is_success() && !status.is_server_error() {
            return Err(StagecraftError::Download(format!("download {}: HTTP {}", uri, status)));
        }
        let bytes = ensure_success(response, "download")
            .await?
            .bytes()
            .await
            .map_err(|e| StagecraftError::Transport(format!("download {}: {}", uri, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Map non-2xx responses to `Transport`, keeping the body for debugging
async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(StagecraftError::Transport(format!(
            "{} failed ({}): {}",
            what,
            status.as_u16(),
            body
        )));
    }
    Ok(response)
}

fn load_template(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StagecraftError::Configuration(format!("Cannot read sf3d workflow template {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        StagecraftError::Configuration(format!("Invalid sf3d workflow template {}: {}", path.display(), e))
    })
}

/// Built-in StableFast3D graph in ComfyUI API format
pub fn default_workflow() -> Value {
    serde_json::json!({
        "1": {
            "class_type": "LoadImage",
            "inputs": { "image": "input.png", "upload": "image" }
        },
        "7": {
            "class_type": "StableFast3DLoader",
            "inputs": {}
        },
        "8": {
            "class_type": "StableFast3DSampler",
            "inputs": {
                "model": ["7", 0],
                "image": ["1", 0],
                "mask": ["1", 1],
                "foreground_ratio": FOREGROUND_RATIO,
                "texture_resolution": TEXTURE_RESOLUTION,
                "remesh": REMESH,
                "vertex_count": VERTEX_COUNT
            }
        },
        "9": {
            "class_type": "StableFast3DSave",
            "inputs": { "mesh": ["8", 0], "filename_prefix": "sf3d_output" }
        }
    })
}

/// Patch a workflow template for one object. Nodes are located by
/// `class_type`, so templates may use any node ids.
pub fn build_workflow(mut workflow: Value, image_name: &str, object_id: &str) -> Result<Value> {
    let nodes = workflow.as_object_mut().ok_or_else(|| {
        StagecraftError::Configuration("sf3d workflow template must be a JSON object".to_string())
    })?;

    let mut found = (false, false, false);
    for node in nodes.values_mut() {
        let class = node
            .get("class_type")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(|i| i.as_object_mut()) else {
            continue;
        };
        match class.as_str() {
            "LoadImage" => {
                inputs.insert("image".to_string(), Value::from(image_name));
                inputs.insert("upload".to_string(), Value::from("image"));
                found.0 = true;
            }
            "StableFast3DSampler" => {
                inputs.insert("foreground_ratio".to_string(), Value::from(FOREGROUND_RATIO));
                inputs.insert("texture_resolution".to_string(), Value::from(TEXTURE_RESOLUTION));
                inputs.insert("remesh".to_string(), Value::from(REMESH));
                inputs.insert("vertex_count".to_string(), Value::from(VERTEX_COUNT));
                found.1 = true;
            }
            "StableFast3DSave" => {
                inputs.insert("filename_prefix".to_string(), Value::from(format!("sf3d_{}", object_id)));
                found.2 = true;
            }
            _ => {}
        }
    }

    let missing = [
        (found.0, "LoadImage"),
        (found.1, "StableFast3DSampler"),
        (found.2, "StableFast3DSave"),
    ]
    .iter()
    .filter(|(ok, _)| !ok)
    .map(|(_, name)| *name)
    .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(StagecraftError::Configuration(format!(
            "sf3d workflow template lacks node(s): {}",
            missing.join(", ")
        )));
    }

    Ok(workflow)
}

/// Extract `prompt_id` from a `/prompt` response
pub fn parse_submit(text: &str) -> Result<String> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| StagecraftError::Transport(format!("Invalid sf3d submit response: {}", e)))?;

    if let Some(errors) = value.get("node_errors").and_then(|e| e.as_object()) {
        if !errors.is_empty() {
            return Err(StagecraftError::JobFailed {
                backend: SF3D.to_string(),
                code: "NodeErrors".to_string(),
                message: Value::Object(errors.clone()).to_string(),
            });
        }
    }

    value
        .get("prompt_id")
        .and_then(|p| p.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| StagecraftError::Transport(format!("No prompt_id in sf3d response: {}", text)))
}

/// Normalize a `/history/{prompt_id}` response
pub fn parse_history(prompt_id: &str, history: &Value, base_url: &str) -> QueryResponse {
    let Some(entry) = history.get(prompt_id) else {
        return QueryResponse::with_status(StatusCode::Pending);
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str())
        .unwrap_or("");
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(|c| c.as_bool())
        .unwrap_or(false);

    if status_str == "error" {
        return QueryResponse::failure("ExecutionError", &execution_error_message(entry));
    }

    let done = (completed && (status_str == "success" || status_str.is_empty()))
        || (status.is_none() && entry.get("outputs").is_some());
    if !done {
        return QueryResponse::with_status(StatusCode::Running);
    }

    let uris = glb_outputs(entry, base_url);
    if uris.is_empty() {
        return QueryResponse::failure("NoOutput", "workflow completed without producing a .glb file");
    }
    QueryResponse::success(uris)
}

fn glb_outputs(entry: &Value, base_url: &str) -> Vec<String> {
    let mut uris = Vec::new();
    let Some(outputs) = entry.get("outputs").and_then(|o| o.as_object()) else {
        return uris;
    };
    for node_output in outputs.values() {
        let Some(files) = node_output.get("files").and_then(|f| f.as_array()) else {
            continue;
        };
        for file in files {
            let Some(filename) = file.get("filename").and_then(|f| f.as_str()) else {
                continue;
            };
            if !filename.to_ascii_lowercase().ends_with(".glb") {
                continue;
            }
            let subfolder = file.get("subfolder").and_then(|s| s.as_str()).unwrap_or("");
            let kind = file.get("type").and_then(|t| t.as_str()).unwrap_or("output");
            if let Ok(mut url) = reqwest::Url::parse(&format!("{}/view", base_url)) {
                url.query_pairs_mut()
                    .append_pair("filename", filename)
                    .append_pair("subfolder", subfolder)
                    .append_pair("type", kind);
                uris.push(url.to_string());
            }
        }
    }
    uris
}

fn execution_error_message(entry: &Value) -> String {
    entry
        .get("status")
        .and_then(|s| s.get("messages"))
        .and_then(|m| m.as_array())
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                let pair = m.as_array()?;
                if pair.first()?.as_str()? != "execution_error" {
                    return None;
                }
                pair.get(1)?
                    .get("exception_message")
                    .and_then(|e| e.as_str())
                    .map(|s| s.trim().to_string())
            })
        })
        .unwrap_or_else(|| "ComfyUI reported an execution error".to_string())
}
