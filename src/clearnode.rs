//! Settlement-service client.
//!
//! One long-lived WebSocket to the state-channel broker. RPCs are JSON
//! frames `{id, method, params}` answered by `{id, result}` or
//! `{id, error}`; unsolicited frames are ignored. The first RPC connects
//! and authenticates lazily, concurrent connects are de-duplicated behind
//! one async mutex, and a lost connection is re-established by the next
//! RPC. Every request carries a 15 second deadline.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{HubConfig, DEV_MM_ADDRESS};
use crate::errors::{HubError, HubResult};
use crate::lmsr::{from_micro_units, to_micro_units};

pub const PRIMARY_ASSET: &str = "usdc";

const RPC_TIMEOUT: Duration = Duration::from_secs(15);
const FAUCET_BASE_DELAY_MS: u64 = 500;
const FAUCET_MAX_DELAY_MS: u64 = 5_000;
const FAUCET_MAX_RETRIES: u32 = 3;

/// One participant's holding inside an app session. Amounts cross the wire
/// as integer micro-unit strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub participant: String,
    pub asset: String,
    pub amount: String,
}

impl Allocation {
    pub fn new(participant: &str, dollars: f64) -> HubResult<Self> {
        Ok(Self {
            participant: participant.to_string(),
            asset: PRIMARY_ASSET.to_string(),
            amount: to_micro_units(dollars)?.to_string(),
        })
    }

    pub fn dollars(&self) -> f64 {
        self.amount
            .parse::<i64>()
            .map(from_micro_units)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateIntent {
    Operate,
    Deposit,
    Withdraw,
}

impl StateIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateIntent::Operate => "operate",
            StateIntent::Deposit => "deposit",
            StateIntent::Withdraw => "withdraw",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSessionInfo {
    pub app_session_id: String,
    pub version: i64,
    #[serde(default)]
    pub status: String,
}

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

struct Connection {
    writer: mpsc::UnboundedSender<Message>,
}

pub struct ClearnodeClient {
    url: String,
    application_name: String,
    mm_private_key: Option<String>,
    /// Guards connect/reconnect so only one connect future is in flight.
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
    pending: PendingMap,
    next_id: AtomicU64,
    mm_address: std::sync::RwLock<String>,
    /// Serializes submit_app_state per session id.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Only one faucet request may be in flight at a time.
    faucet_lock: Mutex<()>,
    faucet_url: String,
    http: reqwest::Client,
    balance_cache: moka::future::Cache<&'static str, String>,
}

impl ClearnodeClient {
    pub fn new(config: &HubConfig) -> Arc<Self> {
        Arc::new(Self {
            url: config.clearnode_url.clone(),
            application_name: config.application_name.clone(),
            mm_private_key: config.mm_private_key.clone(),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            mm_address: std::sync::RwLock::new(DEV_MM_ADDRESS.to_string()),
            session_locks: Mutex::new(HashMap::new()),
            faucet_lock: Mutex::new(()),
            faucet_url: config.faucet_url.clone(),
            http: reqwest::Client::new(),
            balance_cache: moka::future::Cache::builder()
                .max_capacity(1)
                .time_to_live(Duration::from_secs(2))
                .build(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The market-maker address, as confirmed by the service at auth time.
    pub fn mm_address(&self) -> String {
        self.mm_address.read().expect("mm address lock").clone()
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    async fn ensure_connected(self: &Arc<Self>) -> HubResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() && self.is_connected() {
            return Ok(());
        }
        *guard = None;

        info!(url = %self.url, "connecting to settlement service");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| HubError::RemoteRpcError(format!("connect failed: {e}")))?;
        let (mut sink, mut read) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        // Writer: single owner of the sink half.
        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader: correlates replies to pending requests, answers pings,
        // ignores everything unsolicited.
        let pending = self.pending.clone();
        let connected = Arc::clone(self);
        let pong_tx = writer_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch_reply(&pending, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "settlement service closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "settlement service read error");
                        break;
                    }
                }
            }
            connected.connected.store(false, Ordering::SeqCst);
            fail_all_pending(&connected.pending);
        });

        *guard = Some(Connection {
            writer: writer_tx.clone(),
        });
        self.connected.store(true, Ordering::SeqCst);
        drop(guard);

        if let Err(e) = self.authenticate().await {
            self.connected.store(false, Ordering::SeqCst);
            *self.connection.lock().await = None;
            return Err(e);
        }
        Ok(())
    }

    /// Three-step handshake: request, challenge, verify. The signature
    /// payload is opaque here; the wallet stack that produces a real
    /// EIP-712 signature lives outside the hub.
    async fn authenticate(self: &Arc<Self>) -> HubResult<()> {
        let address = self.mm_address();
        let challenge = self
            .raw_request(
                "auth_request",
                json!({
                    "address": address,
                    "application": self.application_name,
                }),
            )
            .await?;
        let token = challenge
            .get("challenge")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        let signature = match &self.mm_private_key {
            Some(key) => format!("sig:{}:{}", &key[..key.len().min(8)], token),
            None => format!("sig:dev:{token}"),
        };
        let verified = self
            .raw_request(
                "auth_verify",
                json!({ "challenge": token, "signature": signature }),
            )
            .await?;

        if let Some(confirmed) = verified.get("address").and_then(|a| a.as_str()) {
            *self.mm_address.write().expect("mm address lock") = confirmed.to_string();
        }
        info!(address = %self.mm_address(), "settlement service authenticated");
        Ok(())
    }

    /// Send one frame and await its correlated reply. Does not try to
    /// connect; used by both `authenticate` and `request`.
    async fn raw_request(self: &Arc<Self>, method: &str, params: Value) -> HubResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        let sent = {
            let guard = self.connection.lock().await;
            match guard.as_ref() {
                Some(connection) => connection.writer.send(Message::Text(frame.into())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(HubError::NotConnected);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(remote))) => Err(HubError::RemoteRpcError(remote)),
            Ok(Err(_)) => Err(HubError::NotConnected),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                warn!(method, "settlement RPC timed out");
                Err(HubError::Timeout)
            }
        }
    }

    /// Public RPC path: lazily (re)connects, then sends.
    async fn request(self: &Arc<Self>, method: &str, params: Value) -> HubResult<Value> {
        self.ensure_connected().await?;
        debug!(method, "settlement RPC");
        self.raw_request(method, params).await
    }

    // ------------------------------------------------------------------
    // RPC surface
    // ------------------------------------------------------------------

    pub async fn create_app_session(
        self: &Arc<Self>,
        counterparty: &str,
        allocations: &[Allocation],
        session_data: &str,
    ) -> HubResult<AppSessionInfo> {
        let result = self
            .request(
                "create_app_session",
                json!({
                    "participants": [counterparty, self.mm_address()],
                    "allocations": allocations,
                    "session_data": session_data,
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| HubError::RemoteRpcError(format!("malformed session reply: {e}")))
    }

    /// Submit a new session state. Calls for the same session are
    /// serialized here; the service rejects version regressions on its
    /// side as well.
    pub async fn submit_app_state(
        self: &Arc<Self>,
        app_session_id: &str,
        intent: StateIntent,
        version: i64,
        allocations: &[Allocation],
        session_data: &str,
    ) -> HubResult<i64> {
        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(app_session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let result = self
            .request(
                "submit_app_state",
                json!({
                    "app_session_id": app_session_id,
                    "intent": intent.as_str(),
                    "version": version,
                    "allocations": allocations,
                    "session_data": session_data,
                }),
            )
            .await?;
        result
            .get("version")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HubError::RemoteRpcError("submit reply missing version".into()))
    }

    /// Close a session; the final allocations become effective balances.
    pub async fn close_session(
        self: &Arc<Self>,
        app_session_id: &str,
        allocations: &[Allocation],
        session_data: &str,
    ) -> HubResult<()> {
        self.request(
            "close_app_session",
            json!({
                "app_session_id": app_session_id,
                "allocations": allocations,
                "session_data": session_data,
            }),
        )
        .await?;
        Ok(())
    }

    /// Move `amount` dollars of `asset` from the market-maker account to
    /// `destination`.
    pub async fn transfer(
        self: &Arc<Self>,
        destination: &str,
        asset: &str,
        amount: f64,
    ) -> HubResult<()> {
        self.request(
            "transfer",
            json!({
                "destination": destination,
                "allocations": [{
                    "participant": destination,
                    "asset": asset,
                    "amount": to_micro_units(amount)?.to_string(),
                }],
            }),
        )
        .await?;
        self.balance_cache.invalidate(&"balance").await;
        Ok(())
    }

    /// The market-maker account balance in the primary asset, dollars.
    pub async fn get_balance(self: &Arc<Self>) -> HubResult<f64> {
        let result = self
            .request("get_ledger_balances", json!({ "participant": self.mm_address() }))
            .await?;
        let micro: i64 = result
            .get("balance")
            .and_then(|b| b.as_str())
            .and_then(|b| b.parse().ok())
            .ok_or_else(|| HubError::RemoteRpcError("balance reply not a micro-unit string".into()))?;
        let dollars = from_micro_units(micro);
        self.balance_cache
            .insert("balance", micro.to_string())
            .await;
        Ok(dollars)
    }

    /// Pool value for read paths; short-lived cache in front of
    /// `get_balance`, `None` when the service is unreachable.
    pub async fn pool_value(self: &Arc<Self>) -> Option<f64> {
        if let Some(cached) = self.balance_cache.get(&"balance").await {
            if let Ok(micro) = cached.parse::<i64>() {
                return Some(from_micro_units(micro));
            }
        }
        match self.get_balance().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "pool value unavailable");
                None
            }
        }
    }

    pub async fn get_app_sessions(
        self: &Arc<Self>,
        participant: Option<&str>,
        status: Option<&str>,
    ) -> HubResult<Value> {
        self.request(
            "get_app_sessions",
            json!({ "participant": participant, "status": status }),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Faucet
    // ------------------------------------------------------------------

    /// Test-net faucet top-up. 5xx and transport errors retry with capped,
    /// jittered exponential backoff; 4xx is fatal immediately. Calls are
    /// globally serialized.
    pub async fn request_faucet(self: &Arc<Self>, address: &str) -> HubResult<()> {
        let _serial = self.faucet_lock.lock().await;

        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .http
                .post(&self.faucet_url)
                .json(&json!({ "userAddress": address }))
                .send()
                .await;

            let retryable = match outcome {
                Ok(response) if response.status().is_success() => {
                    info!(address, "faucet request accepted");
                    return Ok(());
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(HubError::Faucet(format!(
                        "faucet rejected request: HTTP {}",
                        response.status()
                    )));
                }
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) => format!("transport: {e}"),
            };

            if attempt >= FAUCET_MAX_RETRIES {
                return Err(HubError::Faucet(format!(
                    "retries exhausted after {attempt} attempts, last error {retryable}"
                )));
            }
            let base = FAUCET_BASE_DELAY_MS
                .saturating_mul(1 << attempt)
                .min(FAUCET_MAX_DELAY_MS);
            // ±20 % jitter
            let jitter_span = base / 5;
            let delay = base - jitter_span + rand_jitter(jitter_span * 2 + 1);
            warn!(address, attempt, delay_ms = delay, error = %retryable, "faucet retry");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }
}

fn rand_jitter(span_ms: u64) -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..span_ms.max(1))
}

fn dispatch_reply(pending: &PendingMap, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("ignoring unparseable settlement frame");
        return;
    };
    let Some(id) = value.get("id").and_then(|id| id.as_u64()) else {
        debug!("ignoring unsolicited settlement frame");
        return;
    };
    let Some(sender) = pending.lock().expect("pending lock").remove(&id) else {
        return;
    };
    if let Some(error) = value.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let _ = sender.send(Err(message));
    } else {
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        let _ = sender.send(Ok(result));
    }
}

/// A dropped connection fails every in-flight request; callers see
/// `NotConnected` and the next RPC reconnects.
fn fail_all_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending
        .lock()
        .expect("pending lock")
        .drain()
        .map(|(_, sender)| sender)
        .collect();
    for sender in drained {
        drop(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClearnode;

    fn client_for(url: &str, faucet_url: &str) -> Arc<ClearnodeClient> {
        let config = HubConfig {
            clearnode_url: url.to_string(),
            faucet_url: faucet_url.to_string(),
            ..HubConfig::default()
        };
        ClearnodeClient::new(&config)
    }

    #[tokio::test]
    async fn allocations_carry_micro_unit_strings() {
        let allocation = Allocation::new("0xuser", 12.5).unwrap();
        assert_eq!(allocation.amount, "12500000");
        assert_eq!(allocation.asset, PRIMARY_ASSET);
        assert!((allocation.dollars() - 12.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn first_rpc_connects_authenticates_and_answers() {
        let mock = MockClearnode::start().await;
        let client = client_for(&mock.url(), "http://127.0.0.1:1/faucet");

        assert!(!client.is_connected());
        let balance = client.get_balance().await.unwrap();
        assert_eq!(balance, 1_000.0);
        assert!(client.is_connected());
        assert_eq!(client.mm_address(), MockClearnode::MM_ADDRESS);

        let methods = mock.recorded_methods();
        assert_eq!(
            &methods[..3],
            &["auth_request", "auth_verify", "get_ledger_balances"]
        );
    }

    #[tokio::test]
    async fn session_lifecycle_round_trips() {
        let mock = MockClearnode::start().await;
        let client = client_for(&mock.url(), "http://127.0.0.1:1/faucet");

        let allocations = vec![
            Allocation::new("0xuser", 10.0).unwrap(),
            Allocation::new(MockClearnode::MM_ADDRESS, 0.0).unwrap(),
        ];
        let session = client
            .create_app_session("0xuser", &allocations, r#"{"v":1,"mode":"lmsr"}"#)
            .await
            .unwrap();
        assert_eq!(session.version, 1);

        let version = client
            .submit_app_state(
                &session.app_session_id,
                StateIntent::Operate,
                2,
                &allocations,
                r#"{"v":2,"mode":"lmsr"}"#,
            )
            .await
            .unwrap();
        assert_eq!(version, 2);

        client
            .close_session(&session.app_session_id, &allocations, r#"{"v":3,"mode":"lmsr"}"#)
            .await
            .unwrap();

        let listing = client
            .get_app_sessions(Some("0xuser"), Some("open"))
            .await
            .unwrap();
        assert!(listing.get("sessions").is_some());

        let methods = mock.recorded_methods();
        assert!(methods.contains(&"create_app_session".to_string()));
        assert!(methods.contains(&"submit_app_state".to_string()));
        assert!(methods.contains(&"close_app_session".to_string()));
        assert!(methods.contains(&"get_app_sessions".to_string()));
    }

    #[tokio::test]
    async fn error_replies_fail_only_their_own_request() {
        let mock = MockClearnode::start().await;
        mock.fail_next("transfer", "insufficient funds");
        let client = client_for(&mock.url(), "http://127.0.0.1:1/faucet");

        let err = client.transfer("0xuser", PRIMARY_ASSET, 5.0).await.unwrap_err();
        assert!(matches!(err, HubError::RemoteRpcError(_)));

        // The connection is still healthy for the next request.
        assert!(client.get_balance().await.is_ok());
    }

    #[tokio::test]
    async fn version_regression_is_rejected_remotely() {
        let mock = MockClearnode::start().await;
        let client = client_for(&mock.url(), "http://127.0.0.1:1/faucet");

        let allocations = vec![Allocation::new("0xuser", 1.0).unwrap()];
        let session = client
            .create_app_session("0xuser", &allocations, "{}")
            .await
            .unwrap();
        client
            .submit_app_state(&session.app_session_id, StateIntent::Operate, 2, &allocations, "{}")
            .await
            .unwrap();
        let err = client
            .submit_app_state(&session.app_session_id, StateIntent::Operate, 1, &allocations, "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::RemoteRpcError(_)));
    }

    #[tokio::test]
    async fn faucet_4xx_is_fatal_without_retries() {
        let faucet = crate::testutil::MockFaucet::start(vec![400]).await;
        let mock = MockClearnode::start().await;
        let client = client_for(&mock.url(), &faucet.url());

        let err = client.request_faucet("0xuser").await.unwrap_err();
        assert!(matches!(err, HubError::Faucet(_)));
        assert_eq!(faucet.hits(), 1);
    }

    #[tokio::test]
    async fn faucet_5xx_retries_then_succeeds() {
        let faucet = crate::testutil::MockFaucet::start(vec![500, 502, 200]).await;
        let mock = MockClearnode::start().await;
        let client = client_for(&mock.url(), &faucet.url());

        client.request_faucet("0xuser").await.unwrap();
        assert_eq!(faucet.hits(), 3);
    }
}
