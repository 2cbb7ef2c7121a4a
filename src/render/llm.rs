use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::errors::LlmError;
use crate::render::prompt::{self, GenerateRequest};

const GENERATE_TEMPERATURE: f32 = 0.2;
const REPAIR_TEMPERATURE: f32 = 0.1;

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:python)?\r?\n([\s\S]*?)```").unwrap());

/// Reduce a model reply to code: the first fenced block, or the whole
/// reply when there is none.
pub fn extract_code(reply: &str) -> String {
    match FENCED_CODE.captures(reply).and_then(|c| c.get(1)) {
        Some(block) => block.as_str().trim().to_string(),
        None => reply.trim().to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Ollama,
    OpenAi,
    Template,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Template => "template",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "template" => Ok(Self::Template),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

/// Text completion backend. One implementation per provider.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: Option<f32>) -> Result<String, LlmError>;

    fn provider(&self) -> &'static str;

    fn model(&self) -> &str;
}

/// Build the backend selected by `llm.provider`.
pub fn build_backend(config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, LlmError> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;

    let backend: Arc<dyn LlmBackend> = match config.provider {
        LlmProvider::Ollama => Arc::new(OllamaBackend::new(
            http,
            &config.ollama_base_url,
            &config.ollama_model,
        )),
        LlmProvider::OpenAi => {
            if config.openai_api_key.is_none() {
                warn!("OPENAI_API_KEY is not set; generation will use the fallback template");
            }
            Arc::new(OpenAiBackend::new(
                http,
                &config.openai_base_url,
                &config.openai_model,
                config.openai_api_key.clone(),
            ))
        }
        LlmProvider::Template => Arc::new(TemplateBackend),
    };
    Ok(backend)
}

async fn read_error(response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    LlmError::BadStatus { status, body }
}

// ── Ollama ───────────────────────────────────────────────────────────

pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct OllamaReply {
    #[serde(default)]
    response: String,
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn complete(&self, prompt: &str, temperature: Option<f32>) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(t) = temperature {
            body["options"] = json!({ "temperature": t });
        }

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }

        let reply: OllamaReply = response.json().await?;
        if reply.response.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(reply.response)
    }

    fn provider(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ── OpenAI ───────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    async fn post(&self, api_key: &str, body: &Value) -> Result<reqwest::Response, LlmError> {
        Ok(self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?)
    }
}

/// Concatenated `output_text` parts of a Responses API reply.
fn responses_output_text(reply: &Value) -> String {
    reply["output"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter(|part| part["type"] == "output_text")
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join("")
}

/// Some models reject sampling parameters outright.
fn rejects_temperature(status: u16, body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    status == 400 && body.contains("temperature") && body.contains("unsupported")
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, prompt: &str, temperature: Option<f32>) -> Result<String, LlmError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::Unavailable("openai".to_string()));
        };

        let mut body = json!({ "model": self.model, "input": prompt });
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }

        let mut response = self.post(api_key, &body).await?;
        if !response.status().is_success() {
            let err = read_error(response).await;
            match &err {
                LlmError::BadStatus { status, body: text }
                    if temperature.is_some() && rejects_temperature(*status, text) =>
                {
                    debug!(model = %self.model, "model rejected temperature; retrying without it");
                    if let Some(obj) = body.as_object_mut() {
                        obj.remove("temperature");
                    }
                    response = self.post(api_key, &body).await?;
                    if !response.status().is_success() {
                        return Err(read_error(response).await);
                    }
                }
                _ => return Err(err),
            }
        }

        let reply: Value = response.json().await?;
        let text = responses_output_text(&reply);
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    fn provider(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ── Template ─────────────────────────────────────────────────────────

/// Offline backend. Always unavailable, so callers receive the placeholder
/// scene and a warning.
pub struct TemplateBackend;

#[async_trait]
impl LlmBackend for TemplateBackend {
    async fn complete(&self, _prompt: &str, _temperature: Option<f32>) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("template".to_string()))
    }

    fn provider(&self) -> &'static str {
        "template"
    }

    fn model(&self) -> &str {
        "template"
    }
}

// ── Code assistant ───────────────────────────────────────────────────

/// Repair capability consumed by the render pipeline. Implementations must
/// return the original code when they cannot produce a repair.
#[async_trait]
pub trait CodeRepair: Send + Sync {
    async fn repair(&self, code: &str, diagnostic: &str) -> String;
}

/// Code generation, repair and revision on top of an `LlmBackend`. None of
/// these operations fail: backend errors yield a safe fallback.
#[derive(Clone)]
pub struct CodeAssistant {
    backend: Arc<dyn LlmBackend>,
}

impl CodeAssistant {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    pub fn provider(&self) -> &'static str {
        self.backend.provider()
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Returns the generated code and any warnings about how it was produced.
    pub async fn generate_code(&self, request: &GenerateRequest) -> (String, Vec<String>) {
        let prompt = prompt::generation_prompt(request);
        match self.backend.complete(&prompt, Some(GENERATE_TEMPERATURE)).await {
            Ok(reply) => (extract_code(&reply), Vec::new()),
            Err(e) => {
                warn!(provider = self.provider(), error = %e, "generation failed; using fallback template");
                (
                    prompt::placeholder_scene(&request.topic),
                    vec![format!(
                        "LLM unavailable ({}), using fallback template",
                        self.provider()
                    )],
                )
            }
        }
    }

    pub async fn fix_code(&self, code: &str, diagnostic: &str) -> String {
        let prompt = prompt::repair_prompt(code, diagnostic);
        match self.backend.complete(&prompt, Some(REPAIR_TEMPERATURE)).await {
            Ok(reply) => extract_code(&reply),
            Err(e) => {
                warn!(provider = self.provider(), error = %e, "repair failed; keeping original code");
                code.to_string()
            }
        }
    }

    pub async fn revise_code(&self, code: &str, instruction: &str) -> String {
        let prompt = prompt::revise_prompt(code, instruction);
        match self.backend.complete(&prompt, Some(GENERATE_TEMPERATURE)).await {
            Ok(reply) => extract_code(&reply),
            Err(e) => {
                warn!(provider = self.provider(), error = %e, "revision failed; keeping original code");
                code.to_string()
            }
        }
    }
}

#[async_trait]
impl CodeRepair for CodeAssistant {
    async fn repair(&self, code: &str, diagnostic: &str) -> String {
        self.fix_code(code, diagnostic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::prompt::{LevelPreset, StylePreset};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn request() -> GenerateRequest {
        GenerateRequest {
            topic: "Prime \"numbers\"".to_string(),
            duration_seconds: 30,
            style: StylePreset::Minimal,
            level: LevelPreset::School,
            additional_instructions: String::new(),
        }
    }

    /// Serve `router` on an ephemeral port; returns the base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    struct Canned(Result<String, ()>);

    #[async_trait]
    impl LlmBackend for Canned {
        async fn complete(&self, _prompt: &str, _temperature: Option<f32>) -> Result<String, LlmError> {
            self.0.clone().map_err(|_| LlmError::EmptyResponse)
        }

        fn provider(&self) -> &'static str {
            "canned"
        }

        fn model(&self) -> &str {
            "canned-1"
        }
    }

    fn assistant(reply: Result<&str, ()>) -> CodeAssistant {
        CodeAssistant::new(Arc::new(Canned(reply.map(str::to_string))))
    }

    #[test]
    fn test_extract_code_prefers_first_fence() {
        let reply = "Here you go:\n```python\nprint(1)\n```\nand\n```\nprint(2)\n```";
        assert_eq!(extract_code(reply), "print(1)");
        assert_eq!(extract_code("```\nx = 1\n```"), "x = 1");
        assert_eq!(extract_code("  bare code \n"), "bare code");
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("OpenAI".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAi);
        assert_eq!(" ollama ".parse::<LlmProvider>().unwrap(), LlmProvider::Ollama);
        assert!(matches!(
            "claude".parse::<LlmProvider>(),
            Err(LlmError::UnknownProvider(p)) if p == "claude"
        ));
    }

    #[test]
    fn test_responses_output_text() {
        let reply = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "```python\n"},
                    {"type": "output_text", "text": "x = 1\n```"}
                ]}
            ]
        });
        assert_eq!(responses_output_text(&reply), "```python\nx = 1\n```");
        assert_eq!(responses_output_text(&json!({})), "");
    }

    #[tokio::test]
    async fn test_generate_code_success_has_no_warnings() {
        let (code, warnings) = assistant(Ok("```python\nfrom manim import *\n```"))
            .generate_code(&request())
            .await;
        assert_eq!(code, "from manim import *");
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_generate_code_falls_back_with_warning() {
        let (code, warnings) = assistant(Err(())).generate_code(&request()).await;
        assert!(code.contains("class GeneratedScene(Scene)"));
        assert!(code.contains("Prime 'numbers'"));
        assert_eq!(warnings, vec!["LLM unavailable (canned), using fallback template".to_string()]);
    }

    #[tokio::test]
    async fn test_fix_and_revise_keep_original_on_failure() {
        let a = assistant(Err(()));
        assert_eq!(a.fix_code("orig", "boom").await, "orig");
        assert_eq!(a.revise_code("orig", "bluer").await, "orig");
        assert_eq!(a.repair("orig", "boom").await, "orig");
    }

    #[tokio::test]
    async fn test_template_backend_always_falls_back() {
        let a = CodeAssistant::new(Arc::new(TemplateBackend));
        let (_, warnings) = a.generate_code(&request()).await;
        assert_eq!(warnings, vec!["LLM unavailable (template), using fallback template".to_string()]);
    }

    #[tokio::test]
    async fn test_ollama_backend_posts_generate_payload() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/api/generate",
                post(|State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().push(body);
                    Json(json!({"response": "```python\nx = 1\n```"}))
                }),
            )
            .with_state(seen.clone());
        let base = serve(router).await;

        let backend = OllamaBackend::new(reqwest::Client::new(), &format!("{}/", base), "deepseek-coder:6.7b");
        let reply = backend.complete("draw a circle", Some(0.2)).await.unwrap();
        assert_eq!(extract_code(&reply), "x = 1");

        let body = seen.lock().unwrap()[0].clone();
        assert_eq!(body["model"], "deepseek-coder:6.7b");
        assert_eq!(body["prompt"], "draw a circle");
        assert_eq!(body["stream"], false);
        assert!(body["options"]["temperature"].is_number());
    }

    #[tokio::test]
    async fn test_ollama_backend_empty_reply_is_error() {
        let router = Router::new().route("/api/generate", post(|| async { Json(json!({"response": "  "})) }));
        let base = serve(router).await;

        let backend = OllamaBackend::new(reqwest::Client::new(), &base, "m");
        assert!(matches!(backend.complete("p", None).await, Err(LlmError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_openai_backend_retries_without_temperature() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/responses",
                post(|State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    let has_temperature = body.get("temperature").is_some();
                    seen.lock().unwrap().push(body);
                    if has_temperature {
                        (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": {"message": "Unsupported parameter: 'temperature'"}})),
                        )
                    } else {
                        (
                            StatusCode::OK,
                            Json(json!({"output": [{"type": "message", "content": [
                                {"type": "output_text", "text": "done"}
                            ]}]})),
                        )
                    }
                }),
            )
            .with_state(seen.clone());
        let base = serve(router).await;

        let backend = OpenAiBackend::new(reqwest::Client::new(), &base, "gpt-5-mini", Some("sk-test".into()));
        let reply = backend.complete("p", Some(0.2)).await.unwrap();
        assert_eq!(reply, "done");

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].get("temperature").is_some());
        assert!(calls[1].get("temperature").is_none());
        assert_eq!(calls[1]["input"], "p");
    }

    #[tokio::test]
    async fn test_openai_backend_without_key_is_unavailable() {
        let backend = OpenAiBackend::new(reqwest::Client::new(), "http://127.0.0.1:9", "gpt-5-mini", None);
        assert!(matches!(backend.complete("p", None).await, Err(LlmError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_openai_backend_other_errors_propagate() {
        let router = Router::new().route(
            "/responses",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid key") }),
        );
        let base = serve(router).await;

        let backend = OpenAiBackend::new(reqwest::Client::new(), &base, "m", Some("bad".into()));
        match backend.complete("p", Some(0.2)).await {
            Err(LlmError::BadStatus { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid key");
            }
            other => panic!("expected BadStatus, got {:?}", other.map(|_| ())),
        }
    }
}
