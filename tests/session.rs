use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use llm::config::Config;
use llm::dispatch::{Dispatcher, InvocationRequest};
use llm::error::LlmError;
use llm::sink::BufferSink;

const RS: &str = "\u{1e}";

async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let len = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{extra_headers}\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

const CREATED: &str = r#"{"conversationId":"conv-1","clientId":"client-1","conversationSignature":"sig-1","result":{"value":"Success","message":null}}"#;

/// Answer the conversation-create request on the next connection.
async fn serve_create(listener: &TcpListener, status: &str, headers: &str, body: &str) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let request = read_request(&mut socket).await;
    socket
        .write_all(http_response(status, headers, body).as_bytes())
        .await
        .unwrap();
    request
}

/// Hub frames for one successful answer, one record per websocket message.
fn hub_reply(text: &str) -> Vec<String> {
    let update = serde_json::json!({
        "type": 1,
        "target": "update",
        "arguments": [{"messages": [{"text": "typing"}]}]
    });
    let done = serde_json::json!({
        "type": 2,
        "invocationId": "0",
        "item": {
            "messages": [
                {"author": "user", "text": "ignored"},
                {"author": "bot", "text": text}
            ],
            "result": {"value": "Success"}
        }
    });
    vec![
        format!("{update}{RS}"),
        format!("{done}{RS}"),
        format!("{{\"type\":3,\"invocationId\":\"0\"}}{RS}"),
    ]
}

/// What the client sent over one hub connection.
struct HubExchange {
    path: String,
    cookie: Option<String>,
    handshake: String,
    invocation: serde_json::Value,
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return text,
            Message::Close(_) => panic!("client closed early"),
            _ => {}
        }
    }
}

/// Accept one websocket connection, acknowledge the handshake, take the
/// invocation and answer with `frames`.
async fn serve_hub(listener: &TcpListener, frames: Vec<String>) -> HubExchange {
    let (socket, _) = listener.accept().await.unwrap();
    let mut path = String::new();
    let mut cookie = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(socket, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        cookie = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok::<_, ErrorResponse>(resp)
    })
    .await
    .unwrap();

    let handshake = next_text(&mut ws).await;
    ws.send(Message::Text(format!("{{}}{RS}"))).await.unwrap();

    let invocation = next_text(&mut ws).await;
    let invocation = serde_json::from_str(invocation.trim_end_matches(RS)).unwrap();

    // The client may hang up right after the final frame.
    for frame in frames {
        let _ = ws.send(Message::Text(frame)).await;
    }
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
    }

    HubExchange {
        path,
        cookie,
        handshake,
        invocation,
    }
}

fn dispatcher(port: u16, cookie: Option<&str>) -> Dispatcher {
    Dispatcher::new(Config {
        bing_cookie: cookie.map(str::to_string),
        bing_base_url: format!("http://127.0.0.1:{port}"),
        bing_hub_url: format!("ws://127.0.0.1:{port}/sydney/ChatHub"),
        ..Config::default()
    })
}

fn make_req(model: &str, prompt: &str, quiet: bool) -> InvocationRequest {
    InvocationRequest {
        prompt: prompt.to_string(),
        model: model.to_string(),
        temperature: 0.0,
        max_tokens: None,
        system_prompt: String::new(),
        quiet,
        verbose: false,
    }
}

fn options(exchange: &HubExchange) -> Vec<String> {
    exchange.invocation["arguments"][0]["optionsSets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

// --------------------------------------------------------------------------
// Credentials
// --------------------------------------------------------------------------

#[tokio::test]
async fn missing_cookie_is_configuration_error_without_network() {
    let ctx = dispatcher(9, None);
    let mut sink = BufferSink::default();

    let err = ctx
        .invoke(&make_req("bing-creative", "hi", false), &mut sink)
        .await
        .unwrap_err();

    assert!(err.is_configuration(), "{err:?}");
    assert_eq!(err.exit_code(), 2);
    let msg = err.user_message();
    assert!(msg.contains("BING_COOKIE"));
    assert!(msg.contains("_U"), "remediation should say which cookie to copy");
    assert!(!ctx.has_session());
    assert!(sink.output.is_empty());
}

#[tokio::test]
async fn unusable_cookie_is_configuration_error_that_says_it_is_set() {
    let ctx = dispatcher(9, Some("abc\ndef"));
    let mut sink = BufferSink::default();

    let err = ctx
        .invoke(&make_req("bing-creative", "hi", true), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::InvalidCredential { .. }), "{err:?}");
    assert!(err.is_configuration());
    assert_eq!(err.exit_code(), 2);
    let msg = err.user_message();
    assert!(msg.starts_with("BING_COOKIE is set"), "{msg}");
    assert!(!msg.contains("not set"), "{msg}");
    assert!(!ctx.has_session());
}

#[tokio::test]
async fn rejected_cookie_is_upstream_error() {
    let (listener, port) = mock_listener().await;
    let rejected = r#"{"conversationId":"","clientId":"","result":{"value":"UnauthorizedRequest","message":"Sorry, you need to login first to access this service."}}"#;
    let server = tokio::spawn(async move {
        serve_create(&listener, "200 OK", "", rejected).await;
    });

    let ctx = dispatcher(port, Some("stale"));
    let mut sink = BufferSink::default();
    let err = ctx
        .invoke(&make_req("bing-creative", "hi", true), &mut sink)
        .await
        .unwrap_err();

    match err {
        LlmError::Upstream {
            provider, message, ..
        } => {
            assert_eq!(provider, "bing");
            assert!(message.contains("login first"));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
    assert!(!ctx.has_session());
    server.await.unwrap();
}

// --------------------------------------------------------------------------
// Session lifecycle and hub exchange
// --------------------------------------------------------------------------

#[tokio::test]
async fn session_created_once_and_reused() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        let create = serve_create(&listener, "200 OK", "", CREATED).await;
        let first = serve_hub(&listener, hub_reply("First answer")).await;
        let second = serve_hub(&listener, hub_reply("Second answer\n")).await;
        (create, first, second)
    });

    let ctx = dispatcher(port, Some("cookie-abc"));
    let mut sink = BufferSink::default();

    let first = ctx
        .invoke(&make_req("bing-creative", "one", true), &mut sink)
        .await
        .unwrap();
    assert!(ctx.has_session());
    let second = ctx
        .invoke(&make_req("bing-precise", "two", true), &mut sink)
        .await
        .unwrap();

    assert_eq!(first.text, "First answer");
    assert_eq!(second.text, "Second answer\n");
    assert_eq!(sink.output, "First answer\nSecond answer\n");
    assert_eq!(ctx.session().await.unwrap().invocations(), 2);

    let (create, first_hub, second_hub) = server.await.unwrap();
    assert!(create.starts_with("GET /turing/conversation/create "));
    assert!(create.to_lowercase().contains("cookie: _u=cookie-abc"));

    assert_eq!(first_hub.path, "/sydney/ChatHub");
    assert_eq!(first_hub.cookie.as_deref(), Some("_U=cookie-abc"));
    let handshake = format!("{{\"protocol\":\"json\",\"version\":1}}{RS}");
    assert_eq!(first_hub.handshake, handshake);
    assert_eq!(first_hub.invocation["type"], 4);
    assert_eq!(first_hub.invocation["target"], "chat");
    let args = &first_hub.invocation["arguments"][0];
    assert_eq!(args["isStartOfSession"], true);
    assert_eq!(args["message"]["text"], "one");
    assert_eq!(args["conversationId"], "conv-1");
    assert_eq!(args["conversationSignature"], "sig-1");
    assert_eq!(args["participant"]["id"], "client-1");
    assert!(options(&first_hub).contains(&"h3imaginative".to_string()));

    let args = &second_hub.invocation["arguments"][0];
    assert_eq!(args["isStartOfSession"], false);
    assert_eq!(args["message"]["text"], "two");
    assert_eq!(args["conversationId"], "conv-1");
    assert!(options(&second_hub).contains(&"h3precise".to_string()));
}

#[tokio::test]
async fn transcript_framing_when_not_quiet() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        serve_create(&listener, "200 OK", "", CREATED).await;
        serve_hub(&listener, hub_reply("Hello there")).await
    });

    let ctx = dispatcher(port, Some("c"));
    let mut sink = BufferSink::default();
    ctx.invoke(&make_req("bing-balanced", "hi", false), &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.output, "User: hi\nBing: Hello there\n");

    let hub = server.await.unwrap();
    assert!(options(&hub).contains(&"galileo".to_string()));
}

#[tokio::test]
async fn signature_may_come_from_header() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        let body = r#"{"conversationId":"conv-2","clientId":"client-2","result":{"value":"Success"}}"#;
        let header = "X-Sydney-ConversationSignature: sig-header\r\n";
        serve_create(&listener, "200 OK", header, body).await;
        serve_hub(&listener, hub_reply("ok")).await
    });

    let ctx = dispatcher(port, Some("c"));
    let mut sink = BufferSink::default();
    ctx.invoke(&make_req("bing-creative", "hi", true), &mut sink)
        .await
        .unwrap();

    let hub = server.await.unwrap();
    assert_eq!(
        hub.invocation["arguments"][0]["conversationSignature"],
        "sig-header"
    );
}

#[tokio::test]
async fn throttled_final_frame_is_upstream_error() {
    let (listener, port) = mock_listener().await;
    let throttled = serde_json::json!({
        "type": 2,
        "item": {
            "messages": [],
            "result": {"value": "Throttled", "message": "Request is throttled."}
        }
    });
    let server = tokio::spawn(async move {
        serve_create(&listener, "200 OK", "", CREATED).await;
        serve_hub(&listener, vec![format!("{throttled}{RS}")]).await;
    });

    let ctx = dispatcher(port, Some("c"));
    let mut sink = BufferSink::default();
    let err = ctx
        .invoke(&make_req("bing-creative", "hi", true), &mut sink)
        .await
        .unwrap_err();

    match err {
        LlmError::Upstream { message, .. } => assert_eq!(message, "Request is throttled."),
        other => panic!("expected Upstream, got {other:?}"),
    }
    assert!(sink.output.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn hub_refusing_the_upgrade_is_upstream_error() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        serve_create(&listener, "200 OK", "", CREATED).await;
        serve_create(&listener, "503 Service Unavailable", "", "overloaded").await
    });

    let ctx = dispatcher(port, Some("c"));
    let mut sink = BufferSink::default();
    let err = ctx
        .invoke(&make_req("bing-creative", "hi", true), &mut sink)
        .await
        .unwrap_err();

    assert!(
        matches!(err, LlmError::Upstream { status: Some(503), .. }),
        "{err:?}"
    );
    let upgrade = server.await.unwrap();
    assert!(upgrade.starts_with("GET /sydney/ChatHub "));
    assert!(upgrade.to_lowercase().contains("upgrade: websocket"));
}
