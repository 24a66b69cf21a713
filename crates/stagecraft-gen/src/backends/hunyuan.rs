//! Tencent Hunyuan 3D backend
//!
//! Uses the AI3D cloud API: `SubmitHunyuanTo3DJob` returns a `JobId`
//! (valid for 24 hours) and `QueryHunyuanTo3DJob` is polled until `Status`
//! is `DONE` or `FAIL`. Requests are signed with TC3-HMAC-SHA256.

use crate::backend::{GenerationBackend, GenerationRequest, QueryResponse, StatusCode};
use crate::config::{HunyuanConfig, TransportConfig, HUNYUAN};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use stagecraft_core::{hex_encode, Result, StagecraftError};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SUBMIT_ACTION: &str = "SubmitHunyuanTo3DJob";
const QUERY_ACTION: &str = "QueryHunyuanTo3DJob";
const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";

pub struct HunyuanBackend {
    config: HunyuanConfig,
    client: reqwest::Client,
}

impl HunyuanBackend {
    pub fn new(config: HunyuanConfig, transport: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(transport.request_timeout())
            .build()
            .map_err(|e| StagecraftError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn service(&self) -> &str {
        self.config.endpoint.split('.').next().unwrap_or("ai3d")
    }

    async fn call(&self, action: &str, payload: &Value) -> Result<Value> {
        let (secret_id, secret_key) = match (&self.config.secret_id, &self.config.secret_key) {
            (Some(id), Some(key)) => (id.as_str(), key.as_str()),
            _ => {
                return Err(StagecraftError::Configuration(
                    "hunyuan credentials not configured".to_string(),
                ))
            }
        };

        let body = payload.to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let authorization = sign_request(
            secret_id,
            secret_key,
            &self.config.endpoint,
            self.service(),
            action,
            &body,
            timestamp,
        )?;

        debug!(action, "Calling hunyuan API");
        let response = self
            .client
            .post(format!("https://{}", self.config.endpoint))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", &self.config.endpoint)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", &self.config.api_version)
            .header("X-TC-Region", &self.config.region)
            .body(body)
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("hunyuan {}: {}", action, e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StagecraftError::Transport(format!(
                "hunyuan {} returned HTTP {}",
                action, status
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| StagecraftError::Transport(format!("hunyuan {}: {}", action, e)))?;
        unwrap_response(&text)
    }
}

#[async_trait]
impl GenerationBackend for HunyuanBackend {
    fn name(&self) -> &str {
        HUNYUAN
    }

    fn check_config(&self) -> Result<()> {
        self.config.check()
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        let payload = build_submit_payload(request)?;
        let response = self.call(SUBMIT_ACTION, &payload).await?;
        response
            .get("JobId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                StagecraftError::Transport(format!("Unexpected hunyuan submit response: {}", response))
            })
    }

    async fn query(&self, job_id: &str) -> Result<QueryResponse> {
        let payload = serde_json::json!({ "JobId": job_id });
        let response = self.call(QUERY_ACTION, &payload).await?;
        Ok(parse_query(&response))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| StagecraftError::Transport(format!("download {}: {}", uri, e)))?;
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StagecraftError::Transport(format!("download {}: HTTP {}", uri, status)));
        }
        if !status.is_success() {
            return Err(StagecraftError::Download(format!("download {}: HTTP {}", uri, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StagecraftError::Transport(format!("download {}: {}", uri, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Build the `SubmitHunyuanTo3DJob` body. Exactly one input is sent, image
/// URL taking precedence over the prompt.
pub fn build_submit_payload(request: &GenerationRequest) -> Result<Value> {
    let mut payload = serde_json::json!({
        "EnablePBR": true,
        "ResultFormat": "GLB",
    });
    if let Some(url) = request.image_url.as_deref().filter(|u| !u.is_empty()) {
        payload["ImageUrl"] = Value::String(url.to_string());
    } else if !request.prompt.trim().is_empty() {
        payload["Prompt"] = Value::String(request.full_prompt());
    } else {
        return Err(StagecraftError::Validation(format!(
            "Object '{}' has neither a prompt nor an image URL",
            request.object_id
        )));
    }
    Ok(payload)
}

/// Compute the TC3-HMAC-SHA256 `Authorization` header value
pub fn sign_request(
    secret_id: &str,
    secret_key: &str,
    host: &str,
    service: &str,
    action: &str,
    body: &str,
    timestamp: i64,
) -> Result<String> {
    let date = chrono::DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| StagecraftError::Validation(format!("Invalid timestamp {}", timestamp)))?
        .format("%Y-%m-%d")
        .to_string();

    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{}\nhost:{}\nx-tc-action:{}\n\n{}\n{}",
        CONTENT_TYPE,
        host,
        action.to_lowercase(),
        SIGNED_HEADERS,
        sha256_hex(body.as_bytes()),
    );

    let scope = format!("{}/{}/tc3_request", date, service);
    let string_to_sign = format!(
        "TC3-HMAC-SHA256\n{}\n{}\n{}",
        timestamp,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = hmac_sha256(format!("TC3{}", secret_key).as_bytes(), date.as_bytes())?;
    let secret_service = hmac_sha256(&secret_date, service.as_bytes())?;
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request")?;
    let signature = hex_encode(&hmac_sha256(&secret_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        secret_id, scope, SIGNED_HEADERS, signature
    ))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StagecraftError::Configuration(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

/// Strip the `{"Response": ...}` envelope, turning API errors into typed
/// errors. `AuthFailure*` codes mean the credentials are wrong.
pub fn unwrap_response(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| StagecraftError::Transport(format!("Invalid hunyuan response JSON: {}", e)))?;
    let response = value
        .get("Response")
        .cloned()
        .ok_or_else(|| StagecraftError::Transport(format!("hunyuan response has no envelope: {}", text)))?;

    if let Some(error) = response.get("Error") {
        let code = error.get("Code").and_then(|c| c.as_str()).unwrap_or("Unknown");
        let message = error
            .get("Message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        if code.starts_with("AuthFailure") {
            return Err(StagecraftError::Configuration(format!(
                "hunyuan rejected credentials: [{}] {}",
                code, message
            )));
        }
        if code == "RequestLimitExceeded" || code.starts_with("InternalError") {
            return Err(StagecraftError::Transport(format!("hunyuan: [{}] {}", code, message)));
        }
        return Err(StagecraftError::JobFailed {
            backend: HUNYUAN.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    Ok(response)
}

/// Normalize a `QueryHunyuanTo3DJob` response body
pub fn parse_query(response: &Value) -> QueryResponse {
    let status = match response.get("Status").and_then(|s| s.as_str()).unwrap_or("") {
        "WAIT" => StatusCode::Pending,
        "RUN" => StatusCode::Running,
        "DONE" => StatusCode::Success,
        "FAIL" => StatusCode::Failure,
        other => StatusCode::Unknown(other.to_string()),
    };

    let result_uris = response
        .get("ResultFile3Ds")
        .and_then(|f| f.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.get("Url").and_then(|u| u.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let non_empty = |key: &str| {
        response
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    QueryResponse {
        status,
        result_uris,
        error_code: non_empty("ErrorCode"),
        error_message: non_empty("ErrorMessage"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_done() {
        let json = r#"{
            "Response": {
                "Status": "DONE",
                "ErrorCode": "",
                "ErrorMessage": "",
                "ResultFile3Ds": [
                    {"Type": "GLB", "Url": "https://cos.example.com/job/model.glb", "PreviewImageUrl": "https://cos.example.com/p.png"}
                ],
                "RequestId": "req-1"
            }
        }"#;
        let response = unwrap_response(json).unwrap();
        let parsed = parse_query(&response);
        assert_eq!(parsed.status, StatusCode::Success);
        assert_eq!(parsed.result_uris, vec!["https://cos.example.com/job/model.glb"]);
        assert!(parsed.error_code.is_none());
    }

    #[test]
    fn test_parse_query_statuses() {
        for (raw, expected) in [
            ("WAIT", StatusCode::Pending),
            ("RUN", StatusCode::Running),
            ("FAIL", StatusCode::Failure),
            ("PAUSED", StatusCode::Unknown("PAUSED".to_string())),
        ] {
            let parsed = parse_query(&serde_json::json!({ "Status": raw }));
            assert_eq!(parsed.status, expected);
        }
    }

    #[test]
    fn test_parse_query_failure_message() {
        let parsed = parse_query(&serde_json::json!({
            "Status": "FAIL",
            "ErrorCode": "FailedOperation.InnerError",
            "ErrorMessage": "model generation failed"
        }));
        assert_eq!(parsed.error_code.as_deref(), Some("FailedOperation.InnerError"));
        assert_eq!(parsed.error_message.as_deref(), Some("model generation failed"));
    }

    #[test]
    fn test_auth_failure_is_configuration_error() {
        let json = r#"{"Response":{"Error":{"Code":"AuthFailure.SignatureFailure","Message":"bad sig"},"RequestId":"r"}}"#;
        assert!(matches!(
            unwrap_response(json).unwrap_err(),
            StagecraftError::Configuration(_)
        ));
    }

    #[test]
    fn test_other_api_error_is_job_failed() {
        let json = r#"{"Response":{"Error":{"Code":"InvalidParameter","Message":"bad prompt"}}}"#;
        match unwrap_response(json).unwrap_err() {
            StagecraftError::JobFailed { backend, code, .. } => {
                assert_eq!(backend, "hunyuan");
                assert_eq!(code, "InvalidParameter");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_submit_payload_prefers_image_url() {
        let mut request = GenerationRequest::new("chair_1", "a chair");
        let payload = build_submit_payload(&request).unwrap();
        assert_eq!(payload["Prompt"], "a chair");
        assert_eq!(payload["ResultFormat"], "GLB");

        request.image_url = Some("https://img.example.com/chair.png".to_string());
        let payload = build_submit_payload(&request).unwrap();
        assert_eq!(payload["ImageUrl"], "https://img.example.com/chair.png");
        assert!(payload.get("Prompt").is_none());

        let empty = GenerationRequest::new("x", " ");
        assert!(build_submit_payload(&empty).is_err());
    }

    #[test]
    fn test_signature_shape_and_determinism() {
        let sign = |body: &str| {
            sign_request("AKIDtest", "secret", "ai3d.tencentcloudapi.com", "ai3d", SUBMIT_ACTION, body, 1_700_000_000)
                .unwrap()
        };
        let auth = sign(r#"{"Prompt":"a chair"}"#);
        assert!(auth.starts_with("TC3-HMAC-SHA256 Credential=AKIDtest/2023-11-14/ai3d/tc3_request, "));
        assert!(auth.contains("SignedHeaders=content-type;host;x-tc-action"));

        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(auth, sign(r#"{"Prompt":"a chair"}"#));
        assert_ne!(auth, sign(r#"{"Prompt":"a table"}"#));
    }
}
