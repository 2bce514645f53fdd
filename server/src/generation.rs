//! Text generation backends and the prompt/verdict helpers around them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instance::InstanceSnapshot;

const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:3b";
const MAX_STATEMENT_CHARS: usize = 1000;
pub const MIN_STATEMENT_CHARS: usize = 3;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Builds the backend list for one instance from its snapshot.
pub trait BackendFactory: Send + Sync {
    fn build(&self, snapshot: &InstanceSnapshot) -> Vec<Arc<dyn GenerationBackend>>;
}

/// Backends tried in priority order; the first validated answer wins.
#[derive(Clone, Default)]
pub struct GenerationChain {
    backends: Vec<Arc<dyn GenerationBackend>>,
}

impl GenerationChain {
    pub fn new(backends: Vec<Arc<dyn GenerationBackend>>) -> Self {
        Self { backends }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        if self.backends.is_empty() {
            return Err(Error::Upstream("no generation backend configured".into()));
        }
        let mut last_err = None;
        for backend in &self.backends {
            match backend.generate(prompt).await {
                Ok(raw) => match validate_response(&raw) {
                    Some(answer) => {
                        info!(backend = backend.name(), len = answer.len(), "validated response");
                        return Ok(answer);
                    }
                    None => {
                        warn!(backend = backend.name(), preview = %preview(&raw), "invalid format, discarding");
                        last_err = Some(Error::Upstream(format!("{} returned an invalid answer", backend.name())));
                    }
                },
                Err(err) => {
                    warn!(backend = backend.name(), %err, "generation backend failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Upstream("all generation backends failed".into())))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    #[serde(default)]
    response: String,
}

/// Ollama `/api/generate` client, non-streaming.
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    name: String,
}

impl OllamaBackend {
    pub fn new(client: reqwest::Client, url: &str, model: &str) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self { name: format!("ollama:{model}@{url}"), client, url, model: model.to_string() }
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": 80, "temperature": 0.3, "top_p": 0.5, "stop": ["<END>"] }
        });
        let resp = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("ollama request to {} failed: {e}", self.url)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("ollama at {} returned {status}", self.url)));
        }
        let reply: OllamaReply = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("ollama reply from {} unreadable: {e}", self.url)))?;
        Ok(reply.response.trim().to_string())
    }
}

/// Pairs `OLLAMA_URLS[i]` with `OLLAMA_MODELS[i]`, falling back to the first model.
pub struct OllamaFactory {
    client: reqwest::Client,
}

impl OllamaFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Upstream(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl BackendFactory for OllamaFactory {
    fn build(&self, snapshot: &InstanceSnapshot) -> Vec<Arc<dyn GenerationBackend>> {
        let urls = snapshot.list("OLLAMA_URLS");
        let mut models = snapshot.list("OLLAMA_MODELS");
        if models.is_empty() {
            models.push(DEFAULT_OLLAMA_MODEL.to_string());
        }
        urls.iter()
            .enumerate()
            .map(|(i, url)| {
                let model = models.get(i).unwrap_or(&models[0]);
                Arc::new(OllamaBackend::new(self.client.clone(), url, model)) as Arc<dyn GenerationBackend>
            })
            .collect()
    }
}

/// Strip links, mentions, and channel refs, collapse whitespace, cap length.
pub fn clean_statement(text: &str) -> String {
    static URL: OnceLock<Regex> = OnceLock::new();
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let url = URL.get_or_init(|| Regex::new(r"https?://\S+").expect("static regex"));
    let mention = MENTION.get_or_init(|| Regex::new(r"<(?:@[!&]?|#)[0-9]+>").expect("static regex"));
    let text = url.replace_all(text, "");
    let text = mention.replace_all(&text, "");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_STATEMENT_CHARS).collect()
}

pub fn build_prompt(statement: &str, personality: Option<&str>, lore: &[String]) -> String {
    let voice = match personality {
        Some("grug") => "You are Grug, a caveman. Speak short, simple caveman words.",
        Some("big_rob") => "You are Big Rob, a norf FC lad. Speak plain and blunt.",
        _ => "You are a friendly assistant with your own evolving personality.",
    };
    let mut prompt = String::from(voice);
    if !lore.is_empty() {
        prompt.push_str("\nYou remember: ");
        prompt.push_str(&lore.join(" "));
    }
    prompt.push_str(
        "\n\nYou MUST be ACCURATE about real world facts.\n\
         Stay in character but only use personality for HOW you explain, not WHAT you conclude.\n\
         Format: TRUE/FALSE - character explanation.\nEnd with <END>.\n\n",
    );
    prompt.push_str(&format!("Statement: \"{statement}\"\nAnswer:"));
    prompt
}

/// Normalize a raw model reply into `"TRUE - ..."` / `"FALSE - ..."`, or reject it.
pub fn validate_response(raw: &str) -> Option<String> {
    static VERDICT: OnceLock<Regex> = OnceLock::new();
    let verdict = VERDICT
        .get_or_init(|| Regex::new(r"(?is)\b(TRUE|FALSE)\b\s*[-–—:]?\s*(.*)").expect("static regex"));
    let head = raw.split("<END>").next().unwrap_or("").trim();
    let caps = verdict.captures(head)?;
    let word = caps.get(1)?.as_str().to_ascii_uppercase();
    let explanation = caps.get(2)?.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
    if explanation.is_empty() {
        return None;
    }
    let mut answer = format!("{word} - {explanation}");
    if !answer.ends_with(['.', '!', '?']) {
        answer.push('.');
    }
    (answer.split_whitespace().count() >= 4 && answer.len() >= 20).then_some(answer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    TooShort,
    RateLimited,
    Unavailable,
}

pub fn fallback_reply(personality: Option<&str>, kind: FallbackKind) -> &'static str {
    match (kind, personality) {
        (FallbackKind::TooShort, _) => "FALSE - Statement too short to verify.",
        (FallbackKind::RateLimited, Some("grug")) => "Grug need rest. Wait little.",
        (FallbackKind::RateLimited, Some("big_rob")) => "slow down mate, too much carlin last nite, simple as",
        (FallbackKind::RateLimited, _) => "Please wait a moment.",
        (FallbackKind::Unavailable, Some("grug")) => "Grug brain hurt. Grug think later.",
        (FallbackKind::Unavailable, Some("big_rob")) => "brain's gone proper fuzzy, ask us again in a bit",
        (FallbackKind::Unavailable, _) => "Sorry, I can't answer that right now. Please try again later.",
    }
}

fn preview(s: &str) -> String {
    s.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config_store::TemplateSettings;
    use crate::instance::InstanceConfig;

    struct Scripted {
        name: &'static str,
        reply: Result<String>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str, reply: &str) -> Arc<Self> {
            Arc::new(Self { name, reply: Ok(reply.to_string()), calls: AtomicUsize::new(0) })
        }
        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, reply: Err(Error::Upstream("down".into())), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(Error::Upstream(e.to_string())),
            }
        }
    }

    #[test]
    fn validates_verdict_format() {
        assert_eq!(
            validate_response("true: mammoth big and hairy beast <END> junk").as_deref(),
            Some("TRUE - mammoth big and hairy beast.")
        );
        assert_eq!(
            validate_response("FALSE - sky not green, sky blue!").as_deref(),
            Some("FALSE - sky not green, sky blue!")
        );
        assert_eq!(validate_response("FALSE - no."), None);
        assert_eq!(validate_response("Grug not know."), None);
    }

    #[test]
    fn cleans_links_and_mentions() {
        assert_eq!(
            clean_statement("<@!123>  fire   is hot https://example.com/x <#42>"),
            "fire is hot"
        );
        assert_eq!(clean_statement(&"a".repeat(1500)).len(), 1000);
    }

    #[test]
    fn prompt_carries_lore_and_statement() {
        let p = build_prompt("fire hot", Some("grug"), &["Grug hunt mammoth.".to_string()]);
        assert!(p.contains("caveman"));
        assert!(p.contains("Grug hunt mammoth."));
        assert!(p.ends_with("Statement: \"fire hot\"\nAnswer:"));
    }

    #[tokio::test]
    async fn chain_falls_through_to_next_backend() {
        let first = Scripted::failing("first");
        let second = Scripted::ok("second", "garbage without verdict");
        let third = Scripted::ok("third", "TRUE - fire very hot, Grug know <END>");
        let chain = GenerationChain::new(vec![first.clone(), second.clone(), third.clone()]);
        assert_eq!(chain.generate("p").await.unwrap(), "TRUE - fire very hot, Grug know.");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_reports_upstream_when_all_fail() {
        let chain = GenerationChain::new(vec![Scripted::failing("a"), Scripted::failing("b")]);
        assert!(matches!(chain.generate("p").await, Err(Error::Upstream(_))));
        assert!(matches!(GenerationChain::default().generate("p").await, Err(Error::Upstream(_))));
    }

    fn snapshot(overrides: &[(&str, &str)]) -> InstanceSnapshot {
        let cfg = InstanceConfig::new(
            "Grug",
            "main",
            "evolution_bot",
            overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
        .unwrap();
        let template = TemplateSettings {
            name: "t".into(),
            description: String::new(),
            personality: None,
            load_embedder: true,
            custom_env: BTreeMap::new(),
        };
        InstanceSnapshot::build(&cfg, &BTreeMap::new(), &template, "tok".into(), Path::new("/tmp"))
    }

    #[test]
    fn factory_pairs_urls_with_models() {
        let factory = OllamaFactory::new(Duration::from_secs(5)).unwrap();
        let backends = factory.build(&snapshot(&[
            ("OLLAMA_URLS", "http://a:11434, http://b:11434/"),
            ("OLLAMA_MODELS", "m1"),
        ]));
        let names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["ollama:m1@http://a:11434", "ollama:m1@http://b:11434"]);
        assert!(factory.build(&snapshot(&[])).is_empty());
    }

    /// One-shot HTTP responder good enough for a single reqwest call.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn ollama_backend_reads_response_field() {
        let url = serve_once("200 OK", r#"{"response":"  TRUE - mammoth is big, Grug see. "}"#).await;
        let backend = OllamaBackend::new(reqwest::Client::new(), &url, "m1");
        assert_eq!(backend.generate("p").await.unwrap(), "TRUE - mammoth is big, Grug see.");
    }

    #[tokio::test]
    async fn ollama_error_status_is_upstream() {
        let url = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let backend = OllamaBackend::new(reqwest::Client::new(), &url, "m1");
        assert!(matches!(backend.generate("p").await, Err(Error::Upstream(_))));
    }
}
