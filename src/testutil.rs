//! Test doubles: a scripted in-process settlement service speaking the
//! client's wire protocol, and a faucet endpoint with a programmable
//! status-code script.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    fail_next: Mutex<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, i64>>,
    session_counter: AtomicUsize,
}

/// In-process settlement service. Accepts any number of connections,
/// answers the hub's RPC frames, records every call in arrival order.
pub struct MockClearnode {
    addr: SocketAddr,
    state: Arc<MockState>,
    balance_micro: Arc<AtomicI64>,
}

impl MockClearnode {
    pub const MM_ADDRESS: &'static str = "0x00000000000000000000000000000000000000mm";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let state = Arc::new(MockState::default());
        let balance_micro = Arc::new(AtomicI64::new(1_000_000_000)); // $1,000

        let accept_state = state.clone();
        let accept_balance = balance_micro.clone();
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let state = accept_state.clone();
                let balance = accept_balance.clone();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut read) = ws.split();
                    while let Some(Ok(Message::Text(text))) = read.next().await {
                        if let Some(reply) = handle_frame(&state, &balance, &text) {
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            state,
            balance_micro,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_balance_dollars(&self, dollars: f64) {
        self.balance_micro
            .store((dollars * 1_000_000.0).round() as i64, Ordering::SeqCst);
    }

    /// Make the next call of `method` return an error frame.
    pub fn fail_next(&self, method: &str, message: &str) {
        self.state
            .fail_next
            .lock()
            .expect("fail map")
            .insert(method.to_string(), message.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().expect("calls").clone()
    }

    pub fn recorded_methods(&self) -> Vec<String> {
        self.recorded_calls()
            .into_iter()
            .map(|call| call.method)
            .collect()
    }

    /// Call sequence excluding the auth handshake and balance polls; the
    /// shape scenario tests assert on.
    pub fn settlement_sequence(&self) -> Vec<(String, String)> {
        self.recorded_calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call.method.as_str(),
                    "submit_app_state" | "close_app_session" | "transfer" | "create_app_session"
                )
            })
            .map(|call| {
                let session = call
                    .params
                    .get("app_session_id")
                    .and_then(|s| s.as_str())
                    .unwrap_or_else(|| {
                        call.params
                            .get("destination")
                            .and_then(|d| d.as_str())
                            .unwrap_or("")
                    })
                    .to_string();
                (call.method, session)
            })
            .collect()
    }
}

fn handle_frame(state: &MockState, balance: &AtomicI64, text: &str) -> Option<String> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let id = frame.get("id")?.as_u64()?;
    let method = frame.get("method")?.as_str()?.to_string();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    state.calls.lock().expect("calls").push(RecordedCall {
        method: method.clone(),
        params: params.clone(),
    });

    if let Some(message) = state.fail_next.lock().expect("fail map").remove(&method) {
        return Some(json!({ "id": id, "error": message }).to_string());
    }

    let result = match method.as_str() {
        "auth_request" => json!({ "challenge": "nonce-0001" }),
        "auth_verify" => json!({ "success": true, "address": MockClearnode::MM_ADDRESS }),
        "create_app_session" => {
            let n = state.session_counter.fetch_add(1, Ordering::SeqCst);
            let session_id = format!("sess_mock_{n}");
            state
                .sessions
                .lock()
                .expect("sessions")
                .insert(session_id.clone(), 1);
            json!({ "app_session_id": session_id, "version": 1, "status": "open" })
        }
        "submit_app_state" => {
            let session_id = params
                .get("app_session_id")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let version = params.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut sessions = state.sessions.lock().expect("sessions");
            let current = sessions.entry(session_id).or_insert(0);
            if version <= *current {
                return Some(
                    json!({
                        "id": id,
                        "error": format!("version {version} is not greater than {current}"),
                    })
                    .to_string(),
                );
            }
            *current = version;
            json!({ "version": version })
        }
        "close_app_session" => json!({ "status": "closed" }),
        "transfer" => json!({ "success": true }),
        "get_ledger_balances" => {
            json!({ "balance": balance.load(Ordering::SeqCst).to_string() })
        }
        "get_app_sessions" => json!({ "sessions": [] }),
        other => json!({ "echo": other }),
    };
    Some(json!({ "id": id, "result": result }).to_string())
}

/// Faucet endpoint answering from a fixed status-code script, then 200.
pub struct MockFaucet {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct FaucetState {
    script: Arc<Mutex<Vec<u16>>>,
    hits: Arc<AtomicUsize>,
}

impl MockFaucet {
    pub async fn start(script: Vec<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind faucet");
        let addr = listener.local_addr().expect("faucet addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let state = FaucetState {
            script: Arc::new(Mutex::new(script)),
            hits: hits.clone(),
        };
        let app = Router::new()
            .route("/", post(faucet_handler))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, hits }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn faucet_handler(State(state): State<FaucetState>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut script = state.script.lock().expect("script");
    let code = if script.is_empty() {
        200
    } else {
        script.remove(0)
    };
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}
