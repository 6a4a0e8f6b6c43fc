use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{GenerationOptions, ModelInfo, ProviderError, TextGenerator, TextStream};
use crate::config::OllamaConfig;

const STREAM_BUFFER: usize = 64;

/// Client for a local Ollama server.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    selected_model: RwLock<Option<String>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Deserialize)]
struct TagDetails {
    #[serde(default)]
    family: Option<String>,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            selected_model: RwLock::new(config.default_model.clone()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Parse one NDJSON line. `Ok(None)` for blank lines.
fn parse_line(line: &str) -> Result<Option<GenerateChunk>, ProviderError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::Stream(format!("bad chunk: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::ApiError(error));
    }
    Ok(Some(chunk))
}

/// Splits a byte stream into complete lines, holding back the partial tail.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned())
        }
    }
}

enum Forward {
    Continue,
    Done,
    Stop,
}

async fn forward_line(tx: &mpsc::Sender<Result<String, ProviderError>>, line: &str) -> Forward {
    match parse_line(line) {
        Ok(Some(chunk)) => {
            if !chunk.response.is_empty() && tx.send(Ok(chunk.response)).await.is_err() {
                return Forward::Stop;
            }
            if chunk.done {
                Forward::Done
            } else {
                Forward::Continue
            }
        }
        Ok(None) => Forward::Continue,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            Forward::Stop
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate_text(&self, prompt: &str, options: GenerationOptions) -> Result<TextStream, ProviderError> {
        let model = self.selected_model().ok_or(ProviderError::ModelNotSelected)?;
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: &model,
            prompt,
            stream: true,
            options: GenerateOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                num_predict: options.num_predict,
            },
        };

        debug!(model = %model, url = %url, "Sending generate request");
        let response = self.client.post(&url).json(&request).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::ModelNotFound(model));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError(format!("HTTP {}: {}", status, text)));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut bytes = response.bytes_stream();

        // The reader owns the response; it exits as soon as the consumer
        // drops its end, which drops the connection with it.
        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Generation stream dropped by consumer");
                        return;
                    }
                    next = bytes.next() => next,
                };

                match next {
                    Some(Ok(chunk)) => {
                        for line in buffer.push(&chunk) {
                            match forward_line(&tx, &line).await {
                                Forward::Continue => {}
                                Forward::Done | Forward::Stop => return,
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Generation stream failed: {}", e);
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                    None => {
                        if let Some(line) = buffer.finish() {
                            match forward_line(&tx, &line).await {
                                Forward::Done | Forward::Stop => return,
                                Forward::Continue => {}
                            }
                        }
                        let _ = tx
                            .send(Err(ProviderError::Stream("stream ended before completion".to_string())))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ProviderError::ApiError(format!(
                "Failed to list models: {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse models: {}", e)))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
                family: m.details.and_then(|d| d.family),
            })
            .collect())
    }

    async fn select_model(&self, name: &str) -> Result<(), ProviderError> {
        let models = self.list_models().await?;
        // "llama3" matches "llama3:latest"
        let found = models
            .iter()
            .find(|m| m.name == name || m.name.split(':').next() == Some(name))
            .map(|m| m.name.clone())
            .ok_or_else(|| ProviderError::ModelNotFound(name.to_string()))?;

        *self.selected_model.write() = Some(found);
        Ok(())
    }

    fn selected_model(&self) -> Option<String> {
        self.selected_model.read().clone()
    }

    async fn check_availability(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama unavailable at {}: {}", self.base_url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    async fn read_request(socket: &mut TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while data.len() < end + 4 + length {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                data.extend_from_slice(&buf[..n]);
            }
            return;
        }
    }

    /// Serves one `/api/generate` call with a close-delimited NDJSON body.
    /// With `hold_open` the connection stays up after `parts` until the
    /// client hangs up, which is reported on the returned channel.
    async fn ndjson_server(parts: Vec<&'static str>, hold_open: bool) -> (OllamaClient, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            for part in parts {
                socket.write_all(part.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
            }
            if hold_open {
                let mut buf = [0u8; 64];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            }
            let _ = closed_tx.send(());
        });

        let client = OllamaClient::new(&OllamaConfig {
            base_url: format!("http://{}", addr),
            default_model: Some("llama3".to_string()),
            request_timeout_secs: 10,
        })
        .unwrap();
        (client, closed_rx)
    }

    async fn collect(stream: TextStream) -> Vec<Result<String, ProviderError>> {
        stream.collect().await
    }

    #[test]
    fn test_line_buffer_holds_partial_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"response\":\"he").is_empty());
        let lines = buffer.push(b"llo\"}\n{\"done\":true}\n{\"resp");
        assert_eq!(lines.len(), 2);
        assert_eq!(buffer.finish().as_deref(), Some("{\"resp"));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_parse_line() {
        let chunk = parse_line("{\"response\":\"hi\",\"done\":false}\n").unwrap().unwrap();
        assert_eq!(chunk.response, "hi");
        assert!(!chunk.done);

        assert!(parse_line("   ").unwrap().is_none());
        assert!(matches!(
            parse_line("{\"error\":\"model 'x' not found\"}"),
            Err(ProviderError::ApiError(_))
        ));
        assert!(matches!(parse_line("not json"), Err(ProviderError::Stream(_))));
    }

    #[tokio::test]
    async fn test_generate_requires_selected_model() {
        let client = OllamaClient::new(&OllamaConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            default_model: None,
            request_timeout_secs: 1,
        })
        .unwrap();

        assert!(matches!(
            client.generate_text("hello", GenerationOptions::default()).await,
            Err(ProviderError::ModelNotSelected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let client = OllamaClient::new(&OllamaConfig {
            base_url: "http://127.0.0.1:9/".to_string(),
            default_model: Some("llama3".to_string()),
            request_timeout_secs: 1,
        })
        .unwrap();

        assert_eq!(client.base_url(), "http://127.0.0.1:9");
        assert!(!client.check_availability().await);
    }

    #[tokio::test]
    async fn test_stream_ends_cleanly_after_done() {
        let (client, _closed) = ndjson_server(
            vec![
                "{\"response\":\"Hel\",\"done\":false}\n{\"resp",
                "onse\":\"lo\",\"done\":false}\n",
                "{\"response\":\"\",\"done\":true}\n",
            ],
            false,
        )
        .await;

        let items = collect(client.generate_text("hi", GenerationOptions::default()).await.unwrap()).await;
        let text: Vec<String> = items.into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(text.concat(), "Hello");
    }

    #[tokio::test]
    async fn test_truncated_body_yields_one_error() {
        let (client, _closed) = ndjson_server(vec!["{\"response\":\"par\",\"done\":false}\n{\"respo"], false).await;

        let mut stream = client.generate_text("hi", GenerationOptions::default()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "par");
        assert!(matches!(stream.next().await, Some(Err(ProviderError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_connection() {
        let (client, closed) = ndjson_server(vec!["{\"response\":\"first\",\"done\":false}\n"], true).await;

        let mut stream = client.generate_text("hi", GenerationOptions::default()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("server never saw the connection close")
            .unwrap();
    }
}
