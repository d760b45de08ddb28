//! Device adapters: one per vendor protocol.
//!
//! Every adapter implements [`DeviceAdapter`] and hands out short-lived
//! [`DeviceSession`]s. The registry never holds a session across operations:
//! it opens one, runs a single command or state fetch, and closes it again
//! (see [`apply_once`] and [`fetch_once`]). Adapters that need a long-lived
//! vendor session (Tapo) cache it internally, keyed by host.
//!
//! Push-style adapters additionally implement [`DeviceAdapter::watch`], which
//! holds a subscription open and reports [`StatePatch`]es until the
//! connection drops.

pub mod cast;
pub mod tapo;
pub mod tuya;
pub mod wiz;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::CredentialStore;
use crate::error::{DeviceError, DeviceResult};
use crate::model::{DeviceCommand, DeviceDescriptor, DeviceState, Protocol, StatePatch, Transport};

pub use cast::CastAdapter;
pub use tapo::TapoAdapter;
pub use tuya::TuyaAdapter;
pub use wiz::WizAdapter;

/// Protocol-specific driver for one family of devices.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn transport(&self) -> Transport {
        Transport::Poll
    }

    /// Opens a session to the device.
    ///
    /// Fails with `ConnectionError` when the transport cannot be established
    /// and `ConfigurationError` when credentials are missing or rejected.
    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceSession>>;

    /// Streams state changes into `sink` until the connection drops.
    ///
    /// Returns `Ok(())` when the sink is closed and an error when the device
    /// connection is lost. Only push-style adapters implement this.
    async fn watch(
        &self,
        descriptor: &DeviceDescriptor,
        _sink: mpsc::Sender<StatePatch>,
    ) -> DeviceResult<()> {
        Err(DeviceError::ProtocolError(format!(
            "{} does not push state ({})",
            self.protocol(),
            descriptor.id
        )))
    }
}

/// An open connection to one device.
///
/// Dropping a session releases its sockets; [`close`](Self::close) also lets
/// the adapter say goodbye to the device where the protocol has a notion of it.
#[async_trait]
pub trait DeviceSession: Send {
    /// Sends a validated command.
    async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()>;

    /// Reads the full current state from the device.
    async fn fetch_state(&mut self) -> DeviceResult<DeviceState>;

    async fn close(self: Box<Self>);
}

/// Runs one command in a fresh session.
pub async fn apply_once(
    adapter: &dyn DeviceAdapter,
    descriptor: &DeviceDescriptor,
    command: &DeviceCommand,
) -> DeviceResult<()> {
    let mut session = adapter.connect(descriptor).await?;
    let result = session.apply_command(command).await;
    session.close().await;
    result
}

/// Fetches state in a fresh session.
pub async fn fetch_once(
    adapter: &dyn DeviceAdapter,
    descriptor: &DeviceDescriptor,
) -> DeviceResult<DeviceState> {
    let mut session = adapter.connect(descriptor).await?;
    let result = session.fetch_state().await;
    session.close().await;
    result
}

/// Adapters keyed by the protocol they speak.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Protocol, Arc<dyn DeviceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in adapters reading credentials from `credentials`.
    ///
    /// The Tapo adapter is passed in so discovery can share its session cache.
    pub fn with_defaults(
        credentials: CredentialStore,
        tapo: Arc<TapoAdapter>,
        operation_timeout: Duration,
    ) -> Self {
        let mut set = Self::new();
        set.insert(Arc::new(CastAdapter::new(operation_timeout)));
        set.insert(Arc::new(WizAdapter::new(operation_timeout)));
        set.insert(tapo);
        set.insert(Arc::new(TuyaAdapter::new(credentials, operation_timeout)));
        set
    }

    /// Adds or replaces the adapter for its protocol.
    pub fn insert(&mut self, adapter: Arc<dyn DeviceAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    pub fn get(&self, protocol: Protocol) -> DeviceResult<Arc<dyn DeviceAdapter>> {
        self.adapters.get(&protocol).cloned().ok_or_else(|| {
            DeviceError::ConfigurationError(format!("no adapter registered for {protocol}"))
        })
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.adapters.keys().copied()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory adapter shared by registry and bridge tests.

    use super::*;
    use crate::model::DeviceId;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the mock does for one operation.
    #[derive(Clone, Debug)]
    pub enum Step {
        Ok,
        Fail(DeviceError),
        /// Never completes; the bridge timeout has to fire.
        Hang,
        /// Completes after a delay.
        Delay(Duration),
    }

    #[derive(Default)]
    pub struct MockState {
        /// Scripted outcomes per device; `Step::Ok` once exhausted.
        pub script: HashMap<DeviceId, VecDeque<Step>>,
        pub applied: Vec<(DeviceId, DeviceCommand)>,
        pub device_state: HashMap<DeviceId, DeviceState>,
        pub fetch_failures: HashMap<DeviceId, DeviceError>,
    }

    pub struct MockAdapter {
        pub protocol: Protocol,
        pub transport: Transport,
        pub state: Arc<Mutex<MockState>>,
        pub fetches: Arc<AtomicUsize>,
        pub watch_rx: Mutex<HashMap<DeviceId, mpsc::Receiver<StatePatch>>>,
    }

    impl MockAdapter {
        pub fn new(protocol: Protocol) -> Self {
            Self {
                protocol,
                transport: Transport::Poll,
                state: Arc::new(Mutex::new(MockState::default())),
                fetches: Arc::new(AtomicUsize::new(0)),
                watch_rx: Mutex::new(HashMap::new()),
            }
        }

        pub fn push(protocol: Protocol) -> Self {
            Self {
                transport: Transport::Push,
                ..Self::new(protocol)
            }
        }

        pub fn script(&self, id: &DeviceId, steps: impl IntoIterator<Item = Step>) {
            self.state
                .lock()
                .script
                .entry(id.clone())
                .or_default()
                .extend(steps);
        }

        pub fn applied(&self) -> Vec<(DeviceId, DeviceCommand)> {
            self.state.lock().applied.clone()
        }

        pub fn set_device_state(&self, id: &DeviceId, state: DeviceState) {
            self.state.lock().device_state.insert(id.clone(), state);
        }

        pub fn fail_fetch(&self, id: &DeviceId, err: Option<DeviceError>) {
            let mut state = self.state.lock();
            match err {
                Some(err) => state.fetch_failures.insert(id.clone(), err),
                None => state.fetch_failures.remove(id),
            };
        }

        /// Hands the adapter the receiving side of a push feed for `id`.
        pub fn feed(&self, id: &DeviceId) -> mpsc::Sender<StatePatch> {
            let (tx, rx) = mpsc::channel(8);
            self.watch_rx.lock().insert(id.clone(), rx);
            tx
        }
    }

    struct MockSession {
        id: DeviceId,
        state: Arc<Mutex<MockState>>,
        fetches: Arc<AtomicUsize>,
    }

    async fn run_step(step: Step) -> DeviceResult<()> {
        match step {
            Step::Ok => Ok(()),
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
            Step::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DeviceSession for MockSession {
        async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
            let step = self
                .state
                .lock()
                .script
                .get_mut(&self.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Step::Ok);
            run_step(step).await?;
            self.state
                .lock()
                .applied
                .push((self.id.clone(), *command));
            Ok(())
        }

        async fn fetch_state(&mut self) -> DeviceResult<DeviceState> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let state = self.state.lock();
            if let Some(err) = state.fetch_failures.get(&self.id) {
                return Err(err.clone());
            }
            Ok(state
                .device_state
                .get(&self.id)
                .cloned()
                .unwrap_or_else(|| DeviceState::discovered(0)))
        }

        async fn close(self: Box<Self>) {}
    }

    #[async_trait]
    impl DeviceAdapter for MockAdapter {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn transport(&self) -> Transport {
            self.transport
        }

        async fn connect(
            &self,
            descriptor: &DeviceDescriptor,
        ) -> DeviceResult<Box<dyn DeviceSession>> {
            Ok(Box::new(MockSession {
                id: descriptor.id.clone(),
                state: self.state.clone(),
                fetches: self.fetches.clone(),
            }))
        }

        async fn watch(
            &self,
            descriptor: &DeviceDescriptor,
            sink: mpsc::Sender<StatePatch>,
        ) -> DeviceResult<()> {
            let rx = self.watch_rx.lock().remove(&descriptor.id);
            let Some(mut rx) = rx else {
                return std::future::pending().await;
            };
            while let Some(patch) = rx.recv().await {
                if sink.send(patch).await.is_err() {
                    return Ok(());
                }
            }
            Err(DeviceError::DeviceUnreachable("push feed closed".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use parking_lot::RwLock;

    #[test]
    fn default_set_covers_every_protocol() {
        let credentials = Arc::new(RwLock::new(Credentials::default()));
        let tapo = Arc::new(TapoAdapter::new(credentials.clone(), reqwest::Client::new()));
        let set = AdapterSet::with_defaults(credentials, tapo, Duration::from_secs(1));
        for protocol in Protocol::ALL {
            let adapter = set.get(protocol).unwrap();
            assert_eq!(adapter.protocol(), protocol);
        }
        assert_eq!(
            set.get(Protocol::Chromecast).unwrap().transport(),
            Transport::Push
        );
        assert_eq!(set.get(Protocol::Wiz).unwrap().transport(), Transport::Poll);
    }

    #[test]
    fn missing_adapter_is_a_configuration_error() {
        let set = AdapterSet::new();
        assert!(matches!(
            set.get(Protocol::Tuya),
            Err(DeviceError::ConfigurationError(_))
        ));
    }
}
