use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::dispatch::{Adapter, AdapterResult, Dispatcher, GENERATION_TIMEOUT, InvocationRequest};
use crate::error::LlmError;
use crate::sink::OutputSink;
use crate::text::{concat_path, ensure_trailing_newline};

pub const PROVIDER: &str = "bing";

pub const CREATIVE_MODEL: &str = "bing-creative";
pub const PRECISE_MODEL: &str = "bing-precise";
pub const BALANCED_MODEL: &str = "bing-balanced";

/// SignalR record separator; every hub message ends with one.
const RECORD_SEPARATOR: char = '\u{1e}';

/// First message on a fresh hub connection.
const HANDSHAKE: &str = r#"{"protocol":"json","version":1}"#;

const SIGNATURE_HEADER: &str = "x-sydney-conversationsignature";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationStyle {
    Creative,
    Balanced,
    Precise,
}

impl ConversationStyle {
    /// `bing-creative` and `bing-precise` select their mode; every other name
    /// in the family is balanced.
    pub fn from_model(model: &str) -> Self {
        match model {
            CREATIVE_MODEL => Self::Creative,
            PRECISE_MODEL => Self::Precise,
            _ => Self::Balanced,
        }
    }

    pub fn option_sets(&self) -> &'static [&'static str] {
        match self {
            Self::Creative => &[
                "nlu_direct_response_filter",
                "deepleo",
                "disable_emoji_spoken_text",
                "h3imaginative",
                "dv3sugg",
            ],
            Self::Balanced => &[
                "nlu_direct_response_filter",
                "deepleo",
                "disable_emoji_spoken_text",
                "galileo",
                "dv3sugg",
            ],
            Self::Precise => &[
                "nlu_direct_response_filter",
                "deepleo",
                "disable_emoji_spoken_text",
                "h3precise",
                "dv3sugg",
            ],
        }
    }
}

/// Authenticated conversation handle. Created once per process, never
/// persisted. Each prompt opens its own hub connection.
pub struct BingSession {
    hub_url: String,
    cookie: HeaderValue,
    conversation_id: String,
    client_id: String,
    signature: String,
    invocations: AtomicU32,
}

impl std::fmt::Debug for BingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BingSession")
            .field("hub_url", &self.hub_url)
            .field("conversation_id", &self.conversation_id)
            .field("cookie", &"[REDACTED]")
            .field("signature", &"[REDACTED]")
            .field("invocations", &self.invocations)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedConversation {
    conversation_id: String,
    client_id: String,
    conversation_signature: Option<String>,
    result: Option<HubResult>,
}

#[derive(Deserialize)]
struct HubResult {
    value: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct HubFrame {
    #[serde(rename = "type")]
    frame_type: u8,
    item: Option<HubItem>,
}

#[derive(Deserialize)]
struct HubItem {
    #[serde(default)]
    messages: Vec<HubMessage>,
    result: Option<HubResult>,
}

#[derive(Deserialize)]
struct HubMessage {
    author: String,
    text: Option<String>,
}

impl BingSession {
    pub async fn create(base_url: &str, hub_url: &str, cookie: &str) -> Result<Self, LlmError> {
        let cookie = HeaderValue::from_str(&format!("_U={cookie}")).map_err(|_| {
            LlmError::invalid(
                "BING_COOKIE",
                "The value contains characters that are not allowed in an HTTP header.\n\
                 Copy the `_U` cookie from the browser again and export it:\n  \
                 export BING_COOKIE=<value>",
            )
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie.clone());

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(GENERATION_TIMEOUT)
            .build()?;

        let response = client
            .get(concat_path(base_url, "/turing/conversation/create"))
            .send()
            .await?;
        let status = response.status();
        let header_signature = response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(upstream(
                format!("conversation create failed: {}", body.trim()),
                Some(status.as_u16()),
            ));
        }

        let created: CreatedConversation = serde_json::from_str(&body)
            .map_err(|e| LlmError::SchemaParse(format!("conversation create: {e}")))?;

        if let Some(result) = &created.result
            && result.value.as_deref().is_some_and(|v| v != "Success")
        {
            let message = result
                .message
                .clone()
                .unwrap_or_else(|| "conversation create rejected".to_string());
            return Err(upstream(message, None));
        }

        let signature = created
            .conversation_signature
            .or(header_signature)
            .ok_or_else(|| upstream("missing conversation signature".to_string(), None))?;

        tracing::info!(conversation = %created.conversation_id, "bing session created");

        Ok(Self {
            hub_url: hub_url.to_string(),
            cookie,
            conversation_id: created.conversation_id,
            client_id: created.client_id,
            signature,
            invocations: AtomicU32::new(0),
        })
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Send one prompt as a single turn and return the bot reply with the
    /// raw final frame.
    pub async fn ask(
        &self,
        prompt: &str,
        style: ConversationStyle,
    ) -> Result<(String, serde_json::Value), LlmError> {
        let invocation = self.invocations.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "arguments": [{
                "source": "cib",
                "optionsSets": style.option_sets(),
                "isStartOfSession": invocation == 0,
                "message": {
                    "author": "user",
                    "inputMethod": "Keyboard",
                    "text": prompt,
                    "messageType": "Chat",
                },
                "conversationSignature": self.signature,
                "participant": { "id": self.client_id },
                "conversationId": self.conversation_id,
            }],
            "invocationId": invocation.to_string(),
            "target": "chat",
            "type": 4,
        });
        tracing::debug!(?style, invocation, hub = %self.hub_url, "chat hub invocation");

        tokio::time::timeout(GENERATION_TIMEOUT, self.exchange(&body))
            .await
            .map_err(|_| {
                upstream(format!("no reply after {}s", GENERATION_TIMEOUT.as_secs()), None)
            })?
    }

    /// One hub connection: handshake, a single invocation, then frames until
    /// the final one arrives.
    async fn exchange(
        &self,
        invocation: &serde_json::Value,
    ) -> Result<(String, serde_json::Value), LlmError> {
        let mut request = self.hub_url.as_str().into_client_request().map_err(hub_error)?;
        request.headers_mut().insert(COOKIE, self.cookie.clone());
        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(hub_error)?;

        ws.send(Message::Text(format!("{HANDSHAKE}{RECORD_SEPARATOR}")))
            .await
            .map_err(hub_error)?;
        let ack = next_text(&mut ws)
            .await?
            .ok_or_else(|| upstream("hub closed during handshake".to_string(), None))?;
        if let Some(error) = frames(&ack).find_map(|f| f["error"].as_str().map(str::to_string)) {
            return Err(upstream(format!("hub handshake rejected: {error}"), None));
        }

        ws.send(Message::Text(format!("{invocation}{RECORD_SEPARATOR}")))
            .await
            .map_err(hub_error)?;

        let mut transcript = String::new();
        while let Some(text) = next_text(&mut ws).await? {
            transcript.push_str(&text);
            if frames(&text).any(|f| f["type"] == 2 || f["type"] == 7) {
                break;
            }
        }

        if let Err(e) = ws.close(None).await {
            tracing::debug!("hub close: {e}");
        }
        parse_hub_response(&transcript)
    }
}

/// Next text message; `None` once the hub closes. Pings are answered by the
/// stream itself.
async fn next_text<S>(ws: &mut S) -> Result<Option<String>, LlmError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = ws.next().await {
        match message.map_err(hub_error)? {
            Message::Text(text) => return Ok(Some(text)),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn frames(body: &str) -> impl Iterator<Item = serde_json::Value> + '_ {
    body.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .filter_map(|f| serde_json::from_str(f).ok())
}

/// Pick the final (`type: 2`) frame out of record-separated hub output.
pub fn parse_hub_response(body: &str) -> Result<(String, serde_json::Value), LlmError> {
    let all: Vec<serde_json::Value> = frames(body).collect();
    let Some(raw) = all.iter().find(|v| v["type"] == 2).cloned() else {
        // Completion (3) and close (7) frames carry the hub's own error text.
        if let Some(error) = all
            .iter()
            .filter(|v| v["type"] == 3 || v["type"] == 7)
            .find_map(|v| v["error"].as_str())
        {
            return Err(upstream(error.to_string(), None));
        }
        return Err(LlmError::SchemaParse("no final frame in hub response".to_string()));
    };

    let frame = HubFrame::deserialize(&raw)
        .map_err(|e| LlmError::SchemaParse(format!("hub frame: {e}")))?;
    debug_assert_eq!(frame.frame_type, 2);
    let item = frame
        .item
        .ok_or_else(|| LlmError::SchemaParse("final frame has no item".to_string()))?;

    if let Some(result) = &item.result
        && result.value.as_deref().is_some_and(|v| v != "Success")
    {
        let message = result
            .message
            .clone()
            .or_else(|| result.value.clone())
            .unwrap_or_default();
        return Err(upstream(message, None));
    }

    let text = item
        .messages
        .into_iter()
        .rev()
        .find(|m| m.author == "bot")
        .and_then(|m| m.text)
        .ok_or_else(|| upstream("no bot message in response".to_string(), None))?;

    Ok((text, raw))
}

/// Upgrade refusals keep their HTTP status; anything else is a transport failure.
fn hub_error(e: tungstenite::Error) -> LlmError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let message = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| status.to_string());
            upstream(message, Some(status.as_u16()))
        }
        other => upstream(format!("chat hub: {other}"), None),
    }
}

fn upstream(message: String, status: Option<u16>) -> LlmError {
    LlmError::Upstream {
        provider: PROVIDER.to_string(),
        message,
        status,
    }
}

pub struct SessionDispatch<'a> {
    ctx: &'a Dispatcher,
}

impl<'a> SessionDispatch<'a> {
    pub fn new(ctx: &'a Dispatcher) -> Self {
        Self { ctx }
    }
}

impl Adapter for SessionDispatch<'_> {
    async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError> {
        let session = self.ctx.session().await?;
        let style = ConversationStyle::from_model(&req.model);

        if !req.quiet {
            sink.frame(&ensure_trailing_newline(&format!("User: {}", req.prompt)));
            sink.frame("Bing: ");
        }

        let (text, raw) = session.ask(&req.prompt, style).await?;
        sink.write(&ensure_trailing_newline(&text));
        Ok(AdapterResult { text, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_mapping() {
        let style = ConversationStyle::from_model;
        assert_eq!(style(CREATIVE_MODEL), ConversationStyle::Creative);
        assert_eq!(style(PRECISE_MODEL), ConversationStyle::Precise);
        assert_eq!(style(BALANCED_MODEL), ConversationStyle::Balanced);
        assert_eq!(style("bing-anything"), ConversationStyle::Balanced);
    }

    #[test]
    fn hub_response_takes_last_bot_message_of_final_frame() {
        let done = json!({
            "type": 2,
            "invocationId": "0",
            "item": {
                "messages": [
                    {"author": "user", "text": "hi"},
                    {"author": "bot", "text": "Hello there"}
                ],
                "result": {"value": "Success"}
            }
        });
        let body = format!(
            "{}\u{1e}{done}\u{1e}{}\u{1e}",
            r#"{"type":1,"target":"update","arguments":[{"messages":[{"text":"partial"}]}]}"#,
            r#"{"type":3,"invocationId":"0"}"#,
        );
        let (text, raw) = parse_hub_response(&body).unwrap();
        assert_eq!(text, "Hello there");
        assert_eq!(raw["type"], 2);
    }

    #[test]
    fn hub_response_throttled_is_upstream_error() {
        let body = json!({
            "type": 2,
            "item": {
                "messages": [],
                "result": {"value": "Throttled", "message": "Request is throttled."}
            }
        })
        .to_string();
        match parse_hub_response(&body).unwrap_err() {
            LlmError::Upstream { message, .. } => assert_eq!(message, "Request is throttled."),
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[test]
    fn hub_response_without_final_frame_is_parse_error() {
        let err = parse_hub_response("{\"type\":1}\u{1e}").unwrap_err();
        assert!(matches!(err, LlmError::SchemaParse(_)));
    }

    #[test]
    fn hub_close_frame_error_is_upstream_error() {
        let body = "{\"type\":7,\"error\":\"Connection closed with an error.\"}\u{1e}";
        let err = parse_hub_response(body).unwrap_err();
        assert!(
            matches!(err, LlmError::Upstream { ref message, .. } if message.contains("closed")),
            "{err:?}"
        );
    }

    #[test]
    fn frames_skip_blank_and_garbage_records() {
        let body = "{}\u{1e}\u{1e} \u{1e}not json\u{1e}{\"type\":6}\u{1e}";
        let parsed: Vec<_> = frames(body).collect();
        assert_eq!(parsed, vec![json!({}), json!({"type": 6})]);
    }
}
