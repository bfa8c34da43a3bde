use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;

use langdag_core::config::{MockConfig, MockMode};
use langdag_core::error::Result;
use langdag_core::traits::Provider;
use langdag_core::types::*;

const LOREM_SENTENCES: &[&str] = &[
    "The quick brown fox jumps over the lazy dog.",
    "Lorem ipsum dolor sit amet, consectetur adipiscing elit.",
    "Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.",
    "Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris.",
    "Duis aute irure dolor in reprehenderit in voluptate velit esse cillum.",
    "Excepteur sint occaecat cupidatat non proident, sunt in culpa.",
    "Nemo enim ipsam voluptatem quia voluptas sit aspernatur aut odit.",
    "Neque porro quisquam est, qui dolorem ipsum quia dolor sit amet.",
];

const DEFAULT_FIXED_RESPONSE: &str = "This is a mock response.";

/// Offline provider for demos and tests. Never touches the network.
pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    pub fn echo() -> Self {
        Self::new(MockConfig {
            mode: MockMode::Echo,
            ..MockConfig::default()
        })
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(MockConfig {
            mode: MockMode::Fixed,
            fixed_response: Some(text.into()),
            ..MockConfig::default()
        })
    }

    fn generate(&self, req: &CompletionRequest) -> String {
        match self.config.mode {
            MockMode::Echo => echo_last_user(req),
            MockMode::Fixed => self
                .config
                .fixed_response
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_FIXED_RESPONSE.to_string()),
            MockMode::Random => random_response(),
        }
    }

    fn response(&self, req: &CompletionRequest, text: String) -> CompletionResponse {
        let output_tokens = text.split_whitespace().count() as u64;
        CompletionResponse {
            id: generate_id(),
            model: req.model.clone(),
            content: vec![ContentBlock::Text { text }],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage {
                input_tokens: estimate_tokens(req),
                output_tokens,
            },
        }
    }

    async fn initial_delay(&self) {
        if self.config.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
        }
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "mock-fast".into(),
                name: "Mock Fast".into(),
                context_window: 200_000,
                max_output: 8192,
            },
            ModelInfo {
                id: "mock-slow".into(),
                name: "Mock Slow".into(),
                context_window: 200_000,
                max_output: 8192,
            },
        ]
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            self.initial_delay().await;
            let text = self.generate(&request);
            Ok(self.response(&request, text))
        })
    }

    fn stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, ProviderEvent>>> {
        Box::pin(async move {
            self.initial_delay().await;

            let text = self.generate(&request);
            let chunks = word_chunks(&text);
            let done = self.response(&request, text);
            let chunk_delay = Duration::from_millis(self.config.chunk_delay_ms);

            let deltas = stream::iter(chunks).then(move |chunk| async move {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                ProviderEvent::Delta(chunk)
            });

            let events = stream::once(async { ProviderEvent::Start })
                .chain(deltas)
                .chain(stream::once(async move { ProviderEvent::Done(done) }));

            Ok(Box::pin(events) as BoxStream<'_, ProviderEvent>)
        })
    }
}

/// Split into words, keeping a trailing space on all but the last.
fn word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, w)| if i < last { format!("{w} ") } else { w.to_string() })
        .collect()
}

fn echo_last_user(req: &CompletionRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_else(|| "No user message to echo.".to_string())
}

fn random_response() -> String {
    let mut rng = rand::thread_rng();
    let count = rng.gen_range(3..8);
    (0..count)
        .map(|_| LOREM_SENTENCES[rng.gen_range(0..LOREM_SENTENCES.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn estimate_tokens(req: &CompletionRequest) -> u64 {
    let total: usize = req
        .messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .sum();
    if total == 0 { 10 } else { total as u64 }
}

fn generate_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("msg_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            model: "mock-fast".into(),
            messages: vec![
                Message::user("earlier"),
                Message::assistant("reply"),
                Message::user(text),
            ],
            system: None,
            max_tokens: 64,
            temperature: None,
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_echo_streams_word_by_word() {
        let provider = MockProvider::echo();
        let events: Vec<_> = provider
            .stream(request("hello brave new world"))
            .await
            .unwrap()
            .collect()
            .await;

        assert!(matches!(events.first(), Some(ProviderEvent::Start)));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ProviderEvent::Delta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello brave new world");

        match events.last() {
            Some(ProviderEvent::Done(resp)) => {
                assert_eq!(resp.text(), "hello brave new world");
                assert_eq!(resp.usage.output_tokens, 4);
                assert_eq!(resp.usage.input_tokens, 6);
                assert_eq!(resp.model, "mock-fast");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fixed_and_default_fixed() {
        let resp = MockProvider::fixed("pong").complete(request("ping")).await.unwrap();
        assert_eq!(resp.text(), "pong");

        let blank = MockProvider::new(MockConfig {
            mode: MockMode::Fixed,
            ..MockConfig::default()
        });
        let resp = blank.complete(request("ping")).await.unwrap();
        assert_eq!(resp.text(), DEFAULT_FIXED_RESPONSE);
    }

    #[tokio::test]
    async fn test_random_uses_lorem() {
        let provider = MockProvider::new(MockConfig::default());
        let resp = provider.complete(request("anything")).await.unwrap();
        let text = resp.text();
        assert!(LOREM_SENTENCES.iter().any(|s| text.contains(s)));
        assert!(resp.id.starts_with("msg_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_delay_applies() {
        let provider = MockProvider::new(MockConfig {
            mode: MockMode::Echo,
            chunk_delay_ms: 100,
            ..MockConfig::default()
        });
        let start = tokio::time::Instant::now();
        let events: Vec<_> = provider
            .stream(request("a b c"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 5);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_word_chunks() {
        assert_eq!(word_chunks("a b  c"), vec!["a ", "b ", "c"]);
        assert!(word_chunks("").is_empty());
    }
}
