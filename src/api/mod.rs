//! HTTP control surface for the bridge.
//!
//! A small blocking HTTP/1.1 server on its own thread. Requests are served one at a
//! time; every route translates directly into a [`ConnectionManager`] call and answers
//! JSON. Operational failures answer `200` with `success:false`; malformed requests
//! answer `400`. Bodies must carry `Content-Length`; chunked uploads get `411`.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broker::ConnectionManager;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const SERVICE_NAME: &str = "MQTT Bridge";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiServer {
    cfg: ApiConfig,
    manager: ConnectionManager,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, manager: ConnectionManager) -> Self {
        Self { cfg, manager }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid HTTP listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind control surface on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let manager = self.manager;
        let join = std::thread::Builder::new()
            .name("bridge-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &manager, shutdown_thread) {
                    log::error!("control surface stopped: {}", err);
                }
            })
            .context("failed to spawn control surface thread")?;

        log::info!("control surface listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    manager: &ConnectionManager,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, manager) {
                    log::warn!("control request from {} failed: {:#}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, manager: &ConnectionManager) -> Result<()> {
    stream.set_nonblocking(false)?;
    let response = match read_request(&mut stream) {
        Ok(request) => {
            log::debug!(
                "{} {} ({} body bytes, agent: {})",
                request.method,
                request.path,
                request.body.len(),
                request
                    .headers
                    .get("user-agent")
                    .map(String::as_str)
                    .unwrap_or("-")
            );
            route(manager, &request)
        }
        Err(ReadError::TooLarge) => Response::json(413, json!({"error": "request_too_large"})),
        Err(ReadError::LengthRequired) => Response::json(411, json!({"error": "length_required"})),
        Err(ReadError::Malformed(reason)) => {
            log::debug!("malformed request: {}", reason);
            Response::json(400, json!({"error": "bad_request"}))
        }
        Err(ReadError::Io(err)) => {
            return Err(anyhow::Error::new(err).context("failed to read request"))
        }
    };
    write_response(&mut stream, &response)
}

/// Map one parsed request to its response.
pub(crate) fn route(manager: &ConnectionManager, request: &HttpRequest) -> Response {
    let allowed: &[&str] = match request.path.as_str() {
        "/" | "/status" | "/health" => &["GET"],
        "/connect" | "/disconnect" | "/set-client" | "/publish" => &["POST"],
        _ if request.method == "OPTIONS" => &[],
        _ => return Response::json(404, json!({"error": "not_found"})),
    };
    if request.method == "OPTIONS" {
        return Response::preflight();
    }
    if !allowed.contains(&request.method.as_str()) {
        return Response::json(405, json!({"error": "method_not_allowed"}));
    }

    match request.path.as_str() {
        "/" => root(manager),
        "/health" => Response::json(200, json!({"status": "healthy", "service": SERVICE_NAME})),
        "/status" => status(manager),
        "/connect" => connect(manager),
        "/disconnect" => {
            let status = manager.disconnect();
            Response::json(
                200,
                json!({
                    "success": true,
                    "status": status.state(),
                    "error": status.error(),
                }),
            )
        }
        "/set-client" => set_client(manager, &request.body),
        "/publish" => publish(manager, &request.body),
        _ => Response::json(404, json!({"error": "not_found"})),
    }
}

fn root(manager: &ConnectionManager) -> Response {
    let endpoints: Vec<Value> = [
        ("GET", "/status", "Get current connection status"),
        ("POST", "/connect", "Connect to MQTT broker"),
        ("POST", "/disconnect", "Disconnect from MQTT broker"),
        ("POST", "/set-client", "Set active client ID"),
        ("POST", "/publish", "Publish message to MQTT broker"),
        ("GET", "/health", "Liveness probe"),
    ]
    .iter()
    .map(|(method, path, description)| {
        json!({"method": method, "path": path, "description": description})
    })
    .collect();
    Response::json(
        200,
        json!({
            "service": SERVICE_NAME,
            "status": manager.connection_status().state(),
            "endpoints": endpoints,
        }),
    )
}

fn status(manager: &ConnectionManager) -> Response {
    let snapshot = manager.status();
    let broker = manager.broker();
    Response::json(
        200,
        json!({
            "status": snapshot.status.state(),
            "error": snapshot.status.error(),
            "connected": snapshot.connected,
            "active_client_id": snapshot.active_client_id,
            "publish_topic": snapshot.publish_topic,
            "config": {
                "host": broker.host,
                "port": broker.port,
                "base_topic": broker.base_topic,
            },
        }),
    )
}

fn connect(manager: &ConnectionManager) -> Response {
    let body = match manager.connect() {
        Ok(status) => json!({
            "success": true,
            "status": status.state(),
            "error": status.error(),
        }),
        Err(err) => json!({
            "success": false,
            "status": manager.connection_status().state(),
            "error": err.to_string(),
        }),
    };
    Response::json(200, body)
}

fn set_client(manager: &ConnectionManager, body: &[u8]) -> Response {
    let client_id = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| match value.get("clientId") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            _ => None,
        });
    match client_id {
        Some(id) => {
            let active = manager.set_active_client_id(id);
            Response::json(200, json!({"success": true, "active_client_id": active}))
        }
        None => Response::json(
            400,
            json!({"success": false, "error": "Client ID is required"}),
        ),
    }
}

fn publish(manager: &ConnectionManager, body: &[u8]) -> Response {
    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(value) if !is_empty_payload(&value) => value,
        _ => {
            return Response::json(
                400,
                json!({"success": false, "error": "Payload is required"}),
            )
        }
    };
    match manager.publish(&payload) {
        Ok(()) => Response::json(200, json!({"success": true, "error": null})),
        Err(err) => Response::json(200, json!({"success": false, "error": err.to_string()})),
    }
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) body: Option<Value>,
}

impl Response {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn preflight() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

#[derive(Debug)]
enum ReadError {
    TooLarge,
    /// Chunked or otherwise encoded bodies; only `Content-Length` is supported.
    LengthRequired,
    Malformed(&'static str),
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, ReadError> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(ReadError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ReadError::Malformed("missing method"))?;
    let raw_path = parts.next().ok_or(ReadError::Malformed("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    if headers.contains_key("transfer-encoding") {
        return Err(ReadError::LengthRequired);
    }
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES.saturating_sub(header_end) {
        return Err(ReadError::TooLarge);
    }

    let mut body = data.split_off(header_end);
    if body.len() < content_length
        && headers
            .get("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed("body shorter than content-length"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_uppercase(),
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let body = match &response.body {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };
    let mut header = format!(
        "{status_line}\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        len = body.len()
    );
    if response.body.is_some() {
        header.push_str("Content-Type: application/json\r\n");
    } else {
        header.push_str(
            "Access-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\n",
        );
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}
