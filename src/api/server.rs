use crate::api::MockedEndpoint;
use crate::common::data::{EventKind, ProxyEvent, RuleData};
use crate::common::runtime;
use crate::server::{
    builder::{self, MockProxyServerBuilder},
    events::{EventBus, EventStream, Subscription},
    state::{self, RuleRegistry, StateManager},
};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot build instance: {0}")]
    BuildError(#[from] builder::Error),
    #[error("instance terminated before reporting its address")]
    StartupError,
}

/// Proxy URLs for handing to a process under test.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnv {
    #[serde(rename = "HTTP_PROXY")]
    pub http_proxy: String,
    #[serde(rename = "HTTPS_PROXY")]
    pub https_proxy: String,
}

/// One running mock proxy instance, driven in-process.
///
/// The instance serves plain HTTP, implicit TLS and `CONNECT` tunnels on a
/// single port. Tests register rules against it, point their subject at
/// [`MockProxy::proxy_env`] (or call it directly as an origin), and observe
/// traffic through [`MockedEndpoint`] handles and the event stream.
pub struct MockProxy {
    addr: SocketAddr,
    registry: Arc<RuleRegistry>,
    events: EventBus,
    ca_certificate_pem: String,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockProxy {
    /// Starts an instance with default settings on a free port, serving on
    /// the ambient tokio runtime.
    pub async fn start_async() -> Self {
        Self::start_builder_async(MockProxyServerBuilder::new())
            .await
            .expect("cannot start mock proxy instance")
    }

    /// Starts an instance configured by the given builder, serving on the
    /// ambient tokio runtime.
    pub async fn start_builder_async(builder: MockProxyServerBuilder) -> Result<Self, Error> {
        let registry = Arc::new(RuleRegistry::new());
        let server = builder.build_with_state(registry.clone())?;

        let events = server.events();
        let ca_certificate_pem = server.ca_certificate_pem().to_string();
        let (addr_tx, addr_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            if let Err(err) = server
                .start_with_signals(Some(addr_tx), async {
                    let _ = stop_rx.await;
                })
                .await
            {
                tracing::error!("mock proxy instance failed: {}", err);
            }
        });

        let addr = addr_rx.await.map_err(|_| Error::StartupError)?;

        Ok(MockProxy {
            addr,
            registry,
            events,
            ca_certificate_pem,
            stop: Mutex::new(Some(stop_tx)),
        })
    }

    /// Starts an instance with default settings on a dedicated background
    /// runtime thread. Must not be called from async context; use
    /// [`MockProxy::start_async`] there.
    pub fn start() -> Self {
        Self::start_builder(MockProxyServerBuilder::new())
            .expect("cannot start mock proxy instance")
    }

    /// Starts a builder-configured instance on a dedicated background
    /// runtime thread.
    pub fn start_builder(builder: MockProxyServerBuilder) -> Result<Self, Error> {
        let registry = Arc::new(RuleRegistry::new());
        let server = builder.build_with_state(registry.clone())?;

        let events = server.events();
        let ca_certificate_pem = server.ca_certificate_pem().to_string();
        let (addr_tx, addr_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        std::thread::spawn(move || {
            runtime::block_on_current_thread(async move {
                if let Err(err) = server
                    .start_with_signals(Some(addr_tx), async {
                        let _ = stop_rx.await;
                    })
                    .await
                {
                    tracing::error!("mock proxy instance failed: {}", err);
                }
            });
        });

        let addr = addr_rx.blocking_recv().map_err(|_| Error::StartupError)?;

        Ok(MockProxy {
            addr,
            registry,
            events,
            ca_certificate_pem,
            stop: Mutex::new(Some(stop_tx)),
        })
    }

    /// Registers a rule and returns its endpoint handle.
    ///
    /// # Panics
    /// Panics when the rule data fails validation; use
    /// [`MockProxy::try_add_rule`] to handle that case.
    pub fn add_rule(&self, rule: RuleData) -> MockedEndpoint {
        self.try_add_rule(rule).expect("invalid rule data")
    }

    /// Registers a rule and returns its endpoint handle.
    pub fn try_add_rule(&self, rule: RuleData) -> Result<MockedEndpoint, state::Error> {
        let id = self.registry.add_rule(rule)?;
        Ok(MockedEndpoint::new(id, self.registry.clone()))
    }

    /// Removes all rules. In-flight requests finish against the rule list
    /// they already captured; outstanding endpoint handles turn empty.
    pub fn reset(&self) {
        self.registry.reset();
    }

    /// Handles for all active rules, in registration order.
    pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
        self.registry
            .rule_ids()
            .into_iter()
            .map(|id| MockedEndpoint::new(id, self.registry.clone()))
            .collect()
    }

    /// The handle for one active rule.
    pub fn mocked_endpoint(&self, id: usize) -> Option<MockedEndpoint> {
        self.registry
            .rule_ids()
            .contains(&id)
            .then(|| MockedEndpoint::new(id, self.registry.clone()))
    }

    /// A pull-style subscription to the instance's lifecycle events.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// A push-style subscription; the callback fires for every event of the
    /// given kind. Registration is durable once this returns.
    pub fn on_event<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(ProxyEvent) + Send + 'static,
    {
        self.events.on_event(kind, callback)
    }

    pub fn address(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The instance's base URL, e.g. `http://127.0.0.1:8000`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// A URL under the instance's base URL.
    pub fn url<S: AsRef<str>>(&self, path: S) -> String {
        format!("{}{}", self.base_url(), path.as_ref())
    }

    /// Environment-style proxy settings pointing at this instance.
    pub fn proxy_env(&self) -> ProxyEnv {
        ProxyEnv {
            http_proxy: self.base_url(),
            https_proxy: self.base_url(),
        }
    }

    /// The PEM root certificate TLS clients can trust for this instance.
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_certificate_pem
    }

    /// Shuts the instance down: the listener closes, connection tasks are
    /// cancelled, and subscribers may receive a final burst of abort
    /// events. Idempotent; also runs on drop.
    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().expect("stop signal lock poisoned").take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.stop();
    }
}
