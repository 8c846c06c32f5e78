//! Test doubles for the voice SDK, the token endpoint and the call-log store

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use softphone_client_core::call_log::{CallLogUpdate, NewCallLog};
use softphone_client_core::{
    CallLeg, CallLogRecord, CallLogStatus, CallLogStore, CallState, ClientConfig, ClientResult, ConnectParams,
    DeviceFactory, DeviceOptions, DeviceState, LogId, MemoryCallLogStore, NotificationSink, SdkError,
    SdkNotification, Softphone, SoftphoneBuilder, TokenProvider, VoiceDevice, VoiceToken,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("softphone_client_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn voice_token(identity: &str, expires_in_secs: u64) -> VoiceToken {
    VoiceToken {
        identity: identity.to_string(),
        token: format!("token-{}-{}", identity, expires_in_secs),
        expires_in_secs,
    }
}

// ===== TOKEN PROVIDER =====

/// Hands out queued results, then long-lived tokens
pub struct ScriptedTokenProvider {
    results: Mutex<VecDeque<ClientResult<VoiceToken>>>,
    pub calls: AtomicUsize,
}

impl ScriptedTokenProvider {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, result: ClientResult<VoiceToken>) -> Self {
        self.results.lock().push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for ScriptedTokenProvider {
    async fn fetch_token(&self, identity: &str) -> ClientResult<VoiceToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.results.lock().pop_front() {
            Some(result) => result,
            None => Ok(voice_token(identity, 3600)),
        }
    }
}

// ===== CALL LEG =====

pub struct MockLeg {
    id: Mutex<Option<String>>,
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub mute_calls: Mutex<Vec<bool>>,
    pub hold_calls: Mutex<Vec<bool>>,
    pub digits: Mutex<Vec<String>>,
    pub fail_controls: AtomicBool,
}

impl MockLeg {
    pub fn new(id: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: Mutex::new(id.map(str::to_string)),
            accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
            mute_calls: Mutex::new(Vec::new()),
            hold_calls: Mutex::new(Vec::new()),
            digits: Mutex::new(Vec::new()),
            fail_controls: AtomicBool::new(false),
        })
    }

    pub fn assign_id(&self, id: &str) {
        *self.id.lock() = Some(id.to_string());
    }

    pub fn fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::SeqCst);
    }

    fn control(&self) -> Result<(), SdkError> {
        if self.fail_controls.load(Ordering::SeqCst) {
            Err(SdkError::with_code(31_000, "media not available"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CallLeg for MockLeg {
    fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    async fn accept(&self) -> Result<(), SdkError> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<(), SdkError> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), SdkError> {
        self.control()?;
        self.mute_calls.lock().push(muted);
        Ok(())
    }

    async fn hold(&self, on_hold: bool) -> Result<(), SdkError> {
        self.control()?;
        self.hold_calls.lock().push(on_hold);
        Ok(())
    }

    async fn send_digits(&self, digits: &str) -> Result<(), SdkError> {
        self.control()?;
        self.digits.lock().push(digits.to_string());
        Ok(())
    }
}

// ===== DEVICE =====

pub struct MockDevice {
    pub token: Mutex<String>,
    pub options: DeviceOptions,
    pub registrations: AtomicUsize,
    pub destroyed: AtomicBool,
    pub token_updates: Mutex<Vec<String>>,
    pub dialed: Mutex<Vec<ConnectParams>>,
    pub legs: Mutex<Vec<Arc<MockLeg>>>,
    pub fail_connect: AtomicBool,
    register_delay: Duration,
    fail_register: bool,
}

impl MockDevice {
    pub fn last_leg(&self) -> Option<Arc<MockLeg>> {
        self.legs.lock().last().cloned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceDevice for MockDevice {
    async fn register(&self) -> Result<(), SdkError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if !self.register_delay.is_zero() {
            tokio::time::sleep(self.register_delay).await;
        }
        if self.fail_register {
            return Err(SdkError::with_code(20_101, "invalid access token"));
        }
        Ok(())
    }

    async fn update_token(&self, token: &str) -> Result<(), SdkError> {
        *self.token.lock() = token.to_string();
        self.token_updates.lock().push(token.to_string());
        Ok(())
    }

    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn CallLeg>, SdkError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SdkError::new("signaling connection lost"));
        }
        self.dialed.lock().push(params);
        let leg = MockLeg::new(None);
        self.legs.lock().push(leg.clone());
        Ok(leg)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

// ===== FACTORY =====

pub struct MockDeviceFactory {
    pub devices: Mutex<Vec<Arc<MockDevice>>>,
    pub sinks: Mutex<Vec<NotificationSink>>,
    pub register_delay: Mutex<Duration>,
    pub fail_register: AtomicBool,
}

impl MockDeviceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            register_delay: Mutex::new(Duration::ZERO),
            fail_register: AtomicBool::new(false),
        })
    }

    pub fn set_register_delay(&self, delay: Duration) {
        *self.register_delay.lock() = delay;
    }

    pub fn created(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn device(&self) -> Arc<MockDevice> {
        self.devices.lock().last().cloned().expect("no device created")
    }

    pub fn sink(&self) -> NotificationSink {
        self.sinks.lock().last().cloned().expect("no device created")
    }

    /// Deliver a notification through the newest device's sink
    pub fn emit(&self, notification: SdkNotification) {
        self.sink().emit(notification);
    }

    pub fn emit_call(&self, name: &str, call_id: Option<&str>) {
        self.emit(SdkNotification::call(name, call_id.map(str::to_string)));
    }

    pub fn offer_incoming(&self, from: &str, call_id: &str) -> Arc<MockLeg> {
        let leg = MockLeg::new(Some(call_id));
        self.emit(SdkNotification::incoming(leg.clone(), json!({ "from": from })));
        leg
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn create(
        &self,
        token: &str,
        options: &DeviceOptions,
        sink: NotificationSink,
    ) -> Result<Arc<dyn VoiceDevice>, SdkError> {
        let device = Arc::new(MockDevice {
            token: Mutex::new(token.to_string()),
            options: options.clone(),
            registrations: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            token_updates: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
            legs: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            register_delay: *self.register_delay.lock(),
            fail_register: self.fail_register.load(Ordering::SeqCst),
        });
        self.devices.lock().push(device.clone());
        self.sinks.lock().push(sink);
        Ok(device)
    }
}

// ===== CALL LOG STORE =====

/// An in-memory store whose writes take a fixed time
pub struct SlowStore {
    pub records: Arc<MemoryCallLogStore>,
    create_delay: Duration,
    update_delay: Duration,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
}

impl SlowStore {
    pub fn new(create_delay: Duration, update_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: Arc::new(MemoryCallLogStore::new()),
            create_delay,
            update_delay,
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CallLogStore for SlowStore {
    async fn create(&self, record: NewCallLog) -> ClientResult<LogId> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.create_delay).await;
        self.records.create(record).await
    }

    async fn update(&self, id: &LogId, update: CallLogUpdate) -> ClientResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.update_delay).await;
        self.records.update(id, update).await
    }
}

// ===== HARNESS =====

pub struct Harness {
    pub phone: Arc<Softphone>,
    pub factory: Arc<MockDeviceFactory>,
    pub tokens: Arc<ScriptedTokenProvider>,
    pub store: Arc<MemoryCallLogStore>,
}

/// Terminal call states stay put so tests can observe them
pub fn test_config() -> ClientConfig {
    ClientConfig::new().with_terminal_reset(None)
}

pub async fn harness() -> Harness {
    harness_with(test_config(), ScriptedTokenProvider::new()).await
}

pub async fn harness_with(config: ClientConfig, tokens: ScriptedTokenProvider) -> Harness {
    let store = Arc::new(MemoryCallLogStore::new());
    build_harness(config, tokens, store.clone(), store).await
}

/// A ready harness for `alice` whose call log goes through `store`
pub async fn slow_store_harness(store: Arc<SlowStore>) -> Harness {
    let records = store.records.clone();
    let h = build_harness(test_config(), ScriptedTokenProvider::new(), store, records).await;
    h.phone.initialize("alice").await.expect("initialize");
    h
}

async fn build_harness(
    config: ClientConfig,
    tokens: ScriptedTokenProvider,
    call_log: Arc<dyn CallLogStore>,
    store: Arc<MemoryCallLogStore>,
) -> Harness {
    init_tracing();
    let factory = MockDeviceFactory::new();
    let tokens = Arc::new(tokens);
    let phone = SoftphoneBuilder::new()
        .config(config)
        .token_provider(tokens.clone())
        .device_factory(factory.clone())
        .call_log_store(call_log)
        .build()
        .await
        .expect("build softphone");
    Harness {
        phone,
        factory,
        tokens,
        store,
    }
}

/// A harness with a registered device for `alice`
pub async fn ready_harness() -> Harness {
    let h = harness().await;
    h.phone.initialize("alice").await.expect("initialize");
    assert_eq!(h.phone.connection_status().state, DeviceState::Ready);
    h
}

/// Compare client handles by address
pub fn same_client(a: &Arc<dyn VoiceDevice>, b: &Arc<dyn VoiceDevice>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Let the dispatcher drain queued notifications
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn wait_for_call_state(phone: &Softphone, state: CallState) {
    let mut rx = phone.watch_call();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for call state {}", state))
        .expect("call status channel closed");
}

/// Wait until `count` records exist and none is still `connecting`
pub async fn wait_for_finalized_logs(store: &MemoryCallLogStore, count: usize) -> Vec<CallLogRecord> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let records = store.records();
            if records.len() == count && records.iter().all(|r| r.status != CallLogStatus::Connecting) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} finalized call logs", count))
}

pub async fn wait_for_device_state(phone: &Softphone, state: DeviceState) {
    let mut rx = phone.watch_connection();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for device state {}", state))
        .expect("connection status channel closed");
}
