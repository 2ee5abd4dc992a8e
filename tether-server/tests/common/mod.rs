//! Shared fixtures for tether-server integration tests: a scripted in-process
//! messaging client and a fully wired `ConnectionService` over the memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tether_core::config::{
    CleanupConfig, DatabaseConfig, HttpConfig, ServiceConfig, SessionConfig, SidecarConfig,
    StorageBackend, StorageConfig,
};
use tether_core::{
    AccountInfo, ClientError, ConnectionStatus, ConnectionStore, MemoryConnectionStore,
    MessageContent, MessagingClient, SendAck, SessionEvent, SessionHandle, SessionOptions,
    SessionParts, TetherConfig,
};
use tether_server::ConnectionService;
use tokio::sync::mpsc;

pub const PHONE: &str = "15550001111";

// ============================================================================
// FakeClient
// ============================================================================

/// State shared between the client (to emit events) and the handle.
pub struct FakeSession {
    pub options: SessionOptions,
    tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    pub sent: Mutex<Vec<(String, MessageContent)>>,
    pub destroyed: AtomicBool,
    fail_sends: AtomicBool,
    account_delay: Duration,
}

struct FakeHandle {
    state: Arc<FakeSession>,
}

#[async_trait]
impl SessionHandle for FakeHandle {
    async fn send_message(&self, jid: &str, content: &MessageContent) -> Result<SendAck, ClientError> {
        if self.state.destroyed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                code: 500,
                message: "send rejected".to_string(),
            });
        }
        let mut sent = self.state.sent.lock().unwrap();
        sent.push((jid.to_string(), content.clone()));
        Ok(SendAck {
            id: format!("msg-{}", sent.len()),
            timestamp: Utc::now(),
        })
    }

    async fn account_info(&self) -> Result<AccountInfo, ClientError> {
        tokio::time::sleep(self.state.account_delay).await;
        Ok(AccountInfo {
            phone_number: Some(PHONE.to_string()),
            display_name: Some("Front Desk".to_string()),
            ..AccountInfo::default()
        })
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.state.destroyed.store(true, Ordering::SeqCst);
        self.state.tx.lock().unwrap().take();
        Ok(())
    }
}

/// Messaging client whose sessions emit scripted events.
///
/// Each `create_session` pops the next script from the per-id queue, falling
/// back to the default script. Further events are pushed with `emit`.
pub struct FakeClient {
    sessions: DashMap<String, Arc<FakeSession>>,
    scripts: DashMap<String, VecDeque<Vec<SessionEvent>>>,
    default_script: Mutex<Vec<SessionEvent>>,
    fail_create: AtomicBool,
    pub created: AtomicUsize,
    create_delay_ms: AtomicU64,
    account_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            scripts: DashMap::new(),
            default_script: Mutex::new(vec![SessionEvent::Qr("QR1".to_string())]),
            fail_create: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            create_delay_ms: AtomicU64::new(0),
            account_delay_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_default_script(&self, events: Vec<SessionEvent>) {
        *self.default_script.lock().unwrap() = events;
    }

    /// Queue the events the next session created for `id` emits right away.
    pub fn script(&self, id: &str, events: Vec<SessionEvent>) {
        self.scripts.entry(id.to_string()).or_default().push_back(events);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every `create_session` call take `delay` before returning.
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make `account_info` on sessions created from now on take `delay`.
    pub fn set_account_delay(&self, delay: Duration) {
        self.account_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most `create_session` calls observed running at the same time.
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn session(&self, id: &str) -> Option<Arc<FakeSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn fail_sends(&self, id: &str, fail: bool) {
        if let Some(session) = self.session(id) {
            session.fail_sends.store(fail, Ordering::SeqCst);
        }
    }

    pub async fn emit(&self, id: &str, event: SessionEvent) {
        let tx = self
            .session(id)
            .and_then(|s| s.tx.lock().unwrap().clone())
            .expect("session is open");
        tx.send(event).await.expect("event delivered");
    }

    /// End the session's event stream without a terminal event.
    pub fn close_stream(&self, id: &str) {
        if let Some(session) = self.session(id) {
            session.tx.lock().unwrap().take();
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn create_session(
        &self,
        connection_id: &str,
        options: SessionOptions,
    ) -> Result<SessionParts, ClientError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                code: 500,
                message: "browser failed to start".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self
            .scripts
            .get_mut(connection_id)
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.default_script.lock().unwrap().clone());

        let (tx, rx) = mpsc::channel(16);
        for event in script {
            tx.send(event).await.expect("scripted event");
        }

        let state = Arc::new(FakeSession {
            options,
            tx: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            account_delay: Duration::from_millis(self.account_delay_ms.load(Ordering::SeqCst)),
        });
        self.sessions.insert(connection_id.to_string(), state.clone());

        Ok(SessionParts {
            handle: Arc::new(FakeHandle { state }),
            events: rx,
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub service: Arc<ConnectionService>,
    pub store: Arc<MemoryConnectionStore>,
    pub client: Arc<FakeClient>,
    pub config: TetherConfig,
    _auth: tempfile::TempDir,
    _cache: tempfile::TempDir,
}

pub fn test_config(auth_root: &str, cache_root: &str) -> TetherConfig {
    TetherConfig {
        service: ServiceConfig {
            log_level: "debug".to_string(),
        },
        database: DatabaseConfig {
            url: "postgresql://unused".to_string(),
            max_connections: 1,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
        },
        session: SessionConfig {
            auth_root: auth_root.to_string(),
            cache_root: cache_root.to_string(),
            launch_timeout_secs: 1,
            ..SessionConfig::default()
        },
        cleanup: CleanupConfig::default(),
        sidecar: SidecarConfig::default(),
        http: HttpConfig::default(),
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build a harness after adjusting the default test config.
    pub fn with_config(adjust: impl FnOnce(&mut TetherConfig)) -> Self {
        let auth = tempfile::tempdir().expect("auth dir");
        let cache = tempfile::tempdir().expect("cache dir");
        let mut config = test_config(
            &auth.path().display().to_string(),
            &cache.path().display().to_string(),
        );
        adjust(&mut config);
        let store = Arc::new(MemoryConnectionStore::new());
        let client = Arc::new(FakeClient::new());
        let service = Arc::new(ConnectionService::new(store.clone(), client.clone(), &config));

        Self {
            service,
            store,
            client,
            config,
            _auth: auth,
            _cache: cache,
        }
    }

    pub async fn persisted_status(&self, id: &str) -> ConnectionStatus {
        self.store
            .get(id)
            .await
            .expect("store read")
            .expect("record exists")
            .status
    }

    /// Poll the store until `id` reaches `status` (the event pump is async).
    pub async fn wait_for_status(&self, id: &str, status: ConnectionStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if self.persisted_status(id).await == status {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "{} never reached {} (last: {})",
                    id,
                    status,
                    self.persisted_status(id).await
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll the registry until the live session for `id` reports `status`.
    pub async fn wait_for_live(&self, id: &str, status: ConnectionStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if self.service.registry().get(id).map(|s| s.status) == Some(status) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("live session {} never reached {}", id, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_until_inactive(&self, id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while self.service.registry().has(id) {
            if tokio::time::Instant::now() > deadline {
                panic!("{} still has an active session", id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
