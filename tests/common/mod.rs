//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use spotlight::classfile::{AttributeInfo, ClassFile, CodeAttribute, ConstantPool, MemberInfo};
use spotlight::sync::{AgentIdentity, ControlPlane, Subscription, SyncError};
use spotlight::Tracer;

pub const PUBLIC: u16 = 0x0001;
pub const STATIC: u16 = 0x0008;

// ─────────────────────────────────────────────────────────────────────────────
// Class files
// ─────────────────────────────────────────────────────────────────────────────

/// Builds small class files method by method.
pub struct ClassBuilder {
    pool: ConstantPool,
    name: String,
    methods: Vec<MemberInfo>,
}

impl ClassBuilder {
    pub fn new(internal_name: &str) -> Self {
        Self {
            pool: ConstantPool::new(),
            name: internal_name.to_string(),
            methods: Vec::new(),
        }
    }

    pub fn method(self, flags: u16, name: &str, descriptor: &str, max_stack: u16, code: &[u8]) -> Self {
        let body = CodeAttribute {
            max_stack,
            max_locals: 4,
            code: code.to_vec(),
            exception_table: vec![],
            attributes: vec![],
        };
        self.method_with(flags, name, descriptor, body)
    }

    /// Attribute whose name is interned in this class's pool.
    pub fn attribute(&mut self, name: &str, info: Vec<u8>) -> AttributeInfo {
        AttributeInfo {
            name_index: self.pool.add_utf8(name).unwrap(),
            info,
        }
    }

    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    pub fn method_with(mut self, flags: u16, name: &str, descriptor: &str, body: CodeAttribute) -> Self {
        let attribute = AttributeInfo {
            name_index: self.pool.add_utf8("Code").unwrap(),
            info: body.to_bytes().unwrap(),
        };
        self.methods.push(MemberInfo {
            access_flags: flags,
            name_index: self.pool.add_utf8(name).unwrap(),
            descriptor_index: self.pool.add_utf8(descriptor).unwrap(),
            attributes: vec![attribute],
        });
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let this_class = self.pool.add_class(&self.name).unwrap();
        let super_class = self.pool.add_class("java/lang/Object").unwrap();
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: self.pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: self.methods,
            attributes: vec![],
        }
        .to_bytes()
        .unwrap()
    }
}

/// A class with `void run()`, `int size(String[])` and a `main`.
pub fn service_class(internal_name: &str) -> Vec<u8> {
    ClassBuilder::new(internal_name)
        .method(PUBLIC, "run", "()V", 0, &[0xb1])
        .method(PUBLIC, "size", "([Ljava/lang/String;)I", 1, &[0x2b, 0xbe, 0xac])
        .method(PUBLIC | STATIC, "main", "([Ljava/lang/String;)V", 0, &[0xb1])
        .build()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracer
// ─────────────────────────────────────────────────────────────────────────────

/// Records every tracer call; span depth is shared across threads.
#[derive(Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<String>>,
    depth: Mutex<usize>,
}

impl RecordingTracer {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn depth(&self) -> usize {
        *self.depth.lock().unwrap()
    }
}

impl Tracer for RecordingTracer {
    fn has_active_context(&self) -> bool {
        *self.depth.lock().unwrap() > 0
    }

    fn start_root_span(&self, name: &str) {
        *self.depth.lock().unwrap() += 1;
        self.events.lock().unwrap().push(format!("root {}", name));
    }

    fn start_local_span(&self, name: &str) {
        *self.depth.lock().unwrap() += 1;
        self.events.lock().unwrap().push(format!("local {}", name));
    }

    fn stop_span(&self) {
        *self.depth.lock().unwrap() -= 1;
        self.events.lock().unwrap().push("stop".to_string());
    }

    fn record_error(&self, error: &dyn Error) {
        self.events.lock().unwrap().push(format!("error {}", error));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control plane
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory control plane with an optional artificial delay.
#[derive(Default)]
pub struct ScriptedControlPlane {
    subscriptions: Mutex<Option<Vec<Subscription>>>,
    delay: Mutex<Duration>,
    pub fetches: Mutex<usize>,
}

impl ScriptedControlPlane {
    pub fn serving(subscriptions: Vec<Subscription>) -> Arc<Self> {
        let plane = Arc::new(Self::default());
        plane.serve(subscriptions);
        plane
    }

    pub fn serve(&self, subscriptions: Vec<Subscription>) {
        *self.subscriptions.lock().unwrap() = Some(subscriptions);
    }

    pub fn go_down(&self) {
        *self.subscriptions.lock().unwrap() = None;
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn register_liveness(&self, _: &AgentIdentity) -> Result<(), SyncError> {
        Ok(())
    }

    async fn fetch_subscriptions(&self, _: &AgentIdentity) -> Result<Vec<Subscription>, SyncError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.fetches.lock().unwrap() += 1;
        self.subscriptions
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SyncError::Unreachable("scripted outage".to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// A request as seen by [`spawn_http`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    /// Path plus query string
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

pub type Responder = fn(&SeenRequest) -> Option<(u16, String)>;

/// Minimal HTTP/1.1 server on a random port. `None` from the responder
/// means never answer (to exercise client timeouts).
pub async fn spawn_http(responder: Responder) -> (String, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                log.lock().unwrap().push(request.clone());
                match responder(&request) {
                    Some((status, body)) => {
                        let response = format!(
                            "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(30)).await,
                }
            });
        }
    });

    (format!("http://{}", addr), seen)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<SeenRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body_end = buffer.len().min(header_end + length);
    let body = String::from_utf8_lossy(&buffer[header_end..body_end]).to_string();

    Some(SeenRequest {
        method,
        target,
        headers,
        body,
    })
}
