//! Machine translation of post fields before replication.
//!
//! A [`Translator`] wraps a [`TranslationClient`] with the text handling that
//! keeps posts intact:
//!
//! - shortcodes (`[gallery ids="1,2"]`, `[note]...[/note]`) are swapped for
//!   `%%SHORTCODE%%N` placeholders before the text leaves the process and
//!   restored afterwards
//! - `<span>` wrappers are stripped, keeping their inner text
//! - an answer that is empty, or identical to the input, counts as a failed
//!   attempt; after `max_attempts` the cleaned original text is returned
//!
//! Translation never fails the caller.

use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;

use crate::activity::ActivityLog;
use crate::config::{TranslationConfig, TranslationProvider};
use crate::error::{Error, Result};

const PLACEHOLDER: &str = "%%SHORTCODE%%";
const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u32 = 2000;

/// Text-generation interface used for translation.
pub trait TranslationClient: Send + Sync {
    fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Create the default HTTP-backed translation client.
pub fn create_translation_client(config: &TranslationConfig) -> Result<Box<dyn TranslationClient>> {
    Ok(Box::new(HttpTranslationClient::new(config)?))
}

/// Which post field is being translated; selects the instruction wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationContext {
    Title,
    Body,
    Default,
}

/// Human-readable name for a locale code, falling back to the code itself.
pub fn language_name(code: &str) -> &str {
    match code {
        "pt_BR" => "Brazilian Portuguese",
        "pt_PT" => "European Portuguese",
        "en_US" => "American English",
        "en_GB" => "British English",
        "es_ES" => "Spanish (Spain)",
        "fr_FR" => "French (France)",
        "de_DE" => "German (Germany)",
        other => other,
    }
}

pub struct Translator {
    client: Box<dyn TranslationClient>,
    source_language: String,
    target_language: String,
    max_attempts: u32,
    activity: Option<ActivityLog>,
    opening_tag: Regex,
    span: Regex,
}

impl Translator {
    pub fn new(client: Box<dyn TranslationClient>, config: &TranslationConfig) -> Result<Self> {
        Ok(Self {
            client,
            source_language: config.source_language.clone(),
            target_language: config.target_language.clone(),
            max_attempts: config.max_attempts.max(1),
            activity: None,
            opening_tag: Regex::new(r"\[([A-Za-z0-9_-]+)[^\]]*\]")
                .map_err(|e| Error::Translation(e.to_string()))?,
            span: Regex::new(r"(?is)<span\b[^>]*>(.*?)</span>")
                .map_err(|e| Error::Translation(e.to_string()))?,
        })
    }

    /// Build a translator backed by the configured HTTP provider.
    pub fn from_config(config: &TranslationConfig) -> Result<Self> {
        Self::new(create_translation_client(config)?, config)
    }

    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Whether source and target differ, i.e. whether translating does anything.
    pub fn is_active(&self) -> bool {
        self.source_language != self.target_language
    }

    pub fn translate(&self, text: &str, context: TranslationContext) -> String {
        if !self.is_active() || text.trim().is_empty() {
            return text.to_string();
        }

        let (protected, shortcodes) = self.protect_shortcodes(text);
        let cleaned = self.span.replace_all(&protected, "$1").into_owned();

        let system = self.instruction(context);
        let prompt = format!("{}\n\n{}", system, cleaned);

        let mut translated = None;
        for attempt in 1..=self.max_attempts {
            match self.client.complete(&system, &prompt) {
                Ok(answer) => {
                    let answer = answer.trim();
                    if !answer.is_empty() && answer.to_lowercase() != cleaned.trim().to_lowercase() {
                        translated = Some(answer.to_string());
                        break;
                    }
                    tracing::debug!(attempt, ?context, "Translation came back unchanged");
                }
                Err(e) => self.warn(attempt, context, &e),
            }
        }

        let text = translated.unwrap_or(cleaned);
        restore_shortcodes(&text, &shortcodes)
    }

    fn instruction(&self, context: TranslationContext) -> String {
        let source = language_name(&self.source_language);
        let target = language_name(&self.target_language);
        let fluency = format!("You are fluent in both {source} and {target}.");
        match context {
            TranslationContext::Title => format!(
                "{fluency} Translate the following title from {source} to {target}, maintaining its tone and intent."
            ),
            TranslationContext::Body => format!(
                "{fluency} Translate the following content from {source} to {target}, preserving meaning and context. Leave {PLACEHOLDER} placeholders untouched and return only the translation."
            ),
            TranslationContext::Default => {
                format!("{fluency} Translate the following text from {source} to {target}.")
            }
        }
    }

    /// Replace shortcodes with numbered placeholders.
    ///
    /// An opening tag with a matching `[/tag]` later in the text is protected
    /// together with everything up to the first such closing tag.
    fn protect_shortcodes(&self, text: &str) -> (String, Vec<String>) {
        let mut out = String::with_capacity(text.len());
        let mut shortcodes = Vec::new();
        let mut cursor = 0;

        while let Some(caps) = self.opening_tag.captures_at(text, cursor) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let closing = format!("[/{}]", name.as_str());
            let end = text[whole.end()..]
                .find(&closing)
                .map(|offset| whole.end() + offset + closing.len())
                .unwrap_or(whole.end());

            out.push_str(&text[cursor..whole.start()]);
            out.push_str(&format!("{}{}", PLACEHOLDER, shortcodes.len()));
            shortcodes.push(text[whole.start()..end].to_string());
            cursor = end;
        }

        out.push_str(&text[cursor..]);
        (out, shortcodes)
    }

    fn warn(&self, attempt: u32, context: TranslationContext, error: &Error) {
        let message = format!("Translation attempt {attempt} failed");
        let context = json!({ "context": format!("{:?}", context), "error": error.to_string() });
        match &self.activity {
            Some(activity) => activity.error(&message, context),
            None => tracing::warn!(%context, "{message}"),
        }
    }
}

/// Put protected shortcodes back, highest index first so `%%SHORTCODE%%1`
/// never clobbers the prefix of `%%SHORTCODE%%10`.
fn restore_shortcodes(text: &str, shortcodes: &[String]) -> String {
    let mut restored = text.to_string();
    for (index, original) in shortcodes.iter().enumerate().rev() {
        restored = restored.replace(&format!("{}{}", PLACEHOLDER, index), original);
    }
    restored
}

struct HttpTranslationClient {
    model: String,
    provider: TranslationProvider,
    endpoint: String,
    api_key: Option<String>,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpTranslationClient {
    fn new(config: &TranslationConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string());
        let api_key = match config.provider {
            TranslationProvider::Ollama => None,
            TranslationProvider::Claude => config
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            TranslationProvider::OpenAI => config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        };

        if matches!(
            config.provider,
            TranslationProvider::Claude | TranslationProvider::OpenAI
        ) && api_key.is_none()
        {
            return Err(Error::Config(
                "translation.api_key (or provider env var) is required".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Translation(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Translation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            runtime,
            http,
        })
    }

    async fn post(&self, url: String, headers: HeaderMap, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Translation(format!("request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Translation(format!("read body failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Translation(format!(
                "provider returned {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

impl TranslationClient for HttpTranslationClient {
    fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let base = self.endpoint.trim_end_matches('/');
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        self.runtime.block_on(async {
            match self.provider {
                TranslationProvider::Ollama => {
                    let json = self
                        .post(
                            format!("{}/api/generate", base),
                            headers,
                            json!({
                                "model": self.model,
                                "system": system,
                                "prompt": prompt,
                                "stream": false,
                                "options": { "temperature": TEMPERATURE },
                            }),
                        )
                        .await?;
                    json.get("response")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::Translation("ollama response missing `response`".to_string())
                        })
                }
                TranslationProvider::Claude => {
                    headers.insert(
                        "x-api-key",
                        HeaderValue::from_str(self.api_key.as_deref().unwrap_or_default())
                            .map_err(|e| Error::Translation(format!("invalid api key header: {e}")))?,
                    );
                    headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
                    let json = self
                        .post(
                            format!("{}/v1/messages", base),
                            headers,
                            json!({
                                "model": self.model,
                                "max_tokens": MAX_TOKENS,
                                "temperature": TEMPERATURE,
                                "system": system,
                                "messages": [{ "role": "user", "content": prompt }],
                            }),
                        )
                        .await?;
                    json.get("content")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("text"))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::Translation("claude response missing content[0].text".to_string())
                        })
                }
                TranslationProvider::OpenAI => {
                    headers.insert(
                        AUTHORIZATION,
                        HeaderValue::from_str(&format!(
                            "Bearer {}",
                            self.api_key.as_deref().unwrap_or_default()
                        ))
                        .map_err(|e| Error::Translation(format!("invalid auth header: {e}")))?,
                    );
                    let json = self
                        .post(
                            format!("{}/v1/chat/completions", base),
                            headers,
                            json!({
                                "model": self.model,
                                "temperature": TEMPERATURE,
                                "max_tokens": MAX_TOKENS,
                                "messages": [
                                    { "role": "system", "content": system },
                                    { "role": "user", "content": prompt }
                                ]
                            }),
                        )
                        .await?;
                    json.get("choices")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("message"))
                        .and_then(|v| v.get("content"))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::Translation(
                                "openai response missing choices[0].message.content".to_string(),
                            )
                        })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted client: pops answers in order and records prompts.
    struct ScriptedClient {
        answers: Mutex<Vec<Result<String>>>,
        prompts: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    impl TranslationClient for ScriptedClient {
        fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Err(Error::Translation("no scripted answer".to_string()))
            } else {
                answers.remove(0)
            }
        }
    }

    fn config(source: &str, target: &str) -> TranslationConfig {
        TranslationConfig {
            provider: TranslationProvider::Ollama,
            model: "test".to_string(),
            endpoint: None,
            api_key: None,
            timeout_secs: 5,
            max_attempts: 3,
            source_language: source.to_string(),
            target_language: target.to_string(),
        }
    }

    fn translator(
        answers: Vec<Result<String>>,
    ) -> (Translator, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let client = ScriptedClient {
            answers: Mutex::new(answers),
            prompts: Arc::clone(&prompts),
            calls: Arc::clone(&calls),
        };
        let translator = Translator::new(Box::new(client), &config("pt_BR", "en_US")).unwrap();
        (translator, prompts, calls)
    }

    #[test]
    fn test_same_language_is_a_no_op() {
        let client = ScriptedClient {
            answers: Mutex::new(vec![]),
            prompts: Arc::new(Mutex::new(vec![])),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let calls = Arc::clone(&client.calls);
        let translator = Translator::new(Box::new(client), &config("en_US", "en_US")).unwrap();

        assert_eq!(translator.translate("Olá", TranslationContext::Title), "Olá");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shortcodes_are_protected_and_restored() {
        let (translator, prompts, _) = translator(vec![Ok(
            "Hello %%SHORTCODE%%0 world %%SHORTCODE%%1".to_string(),
        )]);

        let text = r#"Olá [gallery ids="1,2"] mundo [note]não traduzir[/note]"#;
        let out = translator.translate(text, TranslationContext::Body);

        assert_eq!(
            out,
            r#"Hello [gallery ids="1,2"] world [note]não traduzir[/note]"#
        );
        let sent = prompts.lock().unwrap()[0].clone();
        assert!(!sent.contains("gallery"));
        assert!(!sent.contains("não traduzir"));
    }

    #[test]
    fn test_many_placeholders_restore_without_prefix_clash() {
        let text: String = (0..12).map(|i| format!("[t{i}] ")).collect();
        let translated: String = (0..12).map(|i| format!("{PLACEHOLDER}{i} x ")).collect();
        let (translator, _, _) = translator(vec![Ok(translated)]);

        let out = translator.translate(&text, TranslationContext::Default);
        for i in 0..12 {
            assert!(out.contains(&format!("[t{i}] x")), "missing t{i} in {out}");
        }
    }

    #[test]
    fn test_spans_are_stripped() {
        let (translator, prompts, _) = translator(vec![Ok("Hello world".to_string())]);
        translator.translate(
            r#"<p><span class="x">Olá</span> <SPAN>mundo</SPAN></p>"#,
            TranslationContext::Body,
        );
        let sent = prompts.lock().unwrap()[0].clone();
        assert!(sent.ends_with("<p>Olá mundo</p>"));
    }

    #[test]
    fn test_retries_then_falls_back_to_cleaned_text() {
        let (translator, _, calls) = translator(vec![
            Err(Error::Translation("down".to_string())),
            Ok("   ".to_string()),
            // Same as the input apart from case.
            Ok("OLÁ %%SHORTCODE%%0".to_string()),
        ]);

        let out = translator.translate("<span>olá</span> [b]x[/b]", TranslationContext::Title);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out, "olá [b]x[/b]");
    }

    #[test]
    fn test_second_attempt_can_succeed() {
        let (translator, _, calls) = translator(vec![
            Err(Error::Translation("timeout".to_string())),
            Ok("Good morning".to_string()),
        ]);
        assert_eq!(
            translator.translate("Bom dia", TranslationContext::Title),
            "Good morning"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unclosed_shortcode_protects_only_the_tag() {
        let (translator, prompts, _) = translator(vec![Ok("done".to_string())]);
        translator.translate("a [btn url=\"/x\"] b", TranslationContext::Default);
        let sent = prompts.lock().unwrap()[0].clone();
        assert!(sent.ends_with("a %%SHORTCODE%%0 b"));
    }

    #[test]
    fn test_language_names() {
        assert_eq!(language_name("pt_BR"), "Brazilian Portuguese");
        assert_eq!(language_name("it_IT"), "it_IT");
    }

    #[test]
    fn test_hosted_providers_need_a_key() {
        let mut config = config("pt_BR", "en_US");
        config.provider = TranslationProvider::Claude;
        std::env::remove_var("ANTHROPIC_API_KEY");
        assert!(HttpTranslationClient::new(&config).is_err());
    }
}
