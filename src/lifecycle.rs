//! Activation and teardown of the session pipeline
//!
//! [`SessionProxy`] wires host hooks to the session stream, the API filter,
//! the stats relay and the upstream router. Startup order is engine, system
//! proxy, hooks, streams; shutdown runs in reverse. A failed startup undoes
//! every step already taken so the proxy is left inert.

use crate::config::Config;
use crate::error::{EngineError, ProxyError, Result};
use crate::filter::{ApiFilter, ApiRule};
use crate::host::{
    BeforeRequestHandler, CommandSystemProxy, HookId, HostEngine, NoopSystemProxy,
    SessionCompleteHandler, SystemProxy,
};
use crate::metrics::Metrics;
use crate::relay::{HttpCollector, StatsCollector, StatsRelay};
use crate::router::UpstreamRouter;
use crate::session::{PendingRequest, Session, SharedSession};
use crate::settings::{ProxySettings, RelayToggles, SettingsStore};
use crate::stream::{Connection, Multicast, Subscription};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::runtime::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Running,
    ShutDown,
}

/// Open/closed switch for a hook body. Closing waits for bodies in flight.
#[derive(Default)]
struct HookGate {
    open: RwLock<bool>,
}

impl HookGate {
    fn run<F: FnOnce()>(&self, body: F) {
        let open = self.open.read();
        if *open {
            body();
        }
    }

    fn set(&self, open: bool) {
        *self.open.write() = open;
    }
}

struct Active {
    hooks: Vec<HookId>,
    connections: Vec<Connection>,
}

enum Lifecycle {
    Idle,
    Running(Active),
    ShutDown,
}

/// Everything the pipeline needs besides the config.
pub struct ProxyParts {
    pub engine: Arc<dyn HostEngine>,
    pub system_proxy: Arc<dyn SystemProxy>,
    pub collector: Arc<dyn StatsCollector>,
    pub runtime: Handle,
}

pub struct SessionProxy {
    engine: Arc<dyn HostEngine>,
    system_proxy: Arc<dyn SystemProxy>,
    listen_port: u16,
    system_proxy_address: String,

    settings: Arc<SettingsStore>,
    toggles: Arc<RelayToggles>,
    metrics: Arc<Metrics>,

    sessions: Multicast<SharedSession>,
    api: ApiFilter,
    router: Arc<UpstreamRouter>,
    routing_gate: Arc<HookGate>,
    _relay: Subscription,

    lifecycle: Mutex<Lifecycle>,
}

impl SessionProxy {
    pub fn new(config: &Config, parts: ProxyParts) -> Self {
        let settings = Arc::new(SettingsStore::new(config.upstream.clone()));
        let toggles = Arc::new(RelayToggles::new(
            config.relay.enabled,
            config.relay.access_key.clone(),
        ));
        let metrics = Arc::new(Metrics::new());

        let sessions = Multicast::new("sessions");
        let api = ApiFilter::attach(&sessions, ApiRule::from(&config.api_filter), metrics.clone());

        let relay = Arc::new(StatsRelay::new(
            config.whitelist(),
            config.relay.agent.clone(),
            toggles.clone(),
            parts.collector,
            metrics.clone(),
            parts.runtime,
        ));
        let relay_subscription = relay.attach(api.stream());

        let router = Arc::new(UpstreamRouter::new(settings.clone(), metrics.clone()));

        Self {
            engine: parts.engine,
            system_proxy: parts.system_proxy,
            listen_port: config.listen_port,
            system_proxy_address: config.system_proxy_address(),
            settings,
            toggles,
            metrics,
            sessions,
            api,
            router,
            routing_gate: Arc::new(HookGate::default()),
            _relay: relay_subscription,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Builds the proxy with the HTTP stats collector and the system proxy
    /// command from `config`.
    pub fn from_config(config: &Config, engine: Arc<dyn HostEngine>, runtime: Handle) -> Result<Self> {
        let collector = HttpCollector::new(config.relay.endpoint.clone(), config.relay_timeout())?;
        let system_proxy: Arc<dyn SystemProxy> = match &config.system_proxy.command {
            Some(command) => Arc::new(CommandSystemProxy::new(
                command.clone(),
                config.system_proxy.args.clone(),
            )),
            None => Arc::new(NoopSystemProxy),
        };

        Ok(Self::new(
            config,
            ProxyParts {
                engine,
                system_proxy,
                collector: Arc::new(collector),
                runtime,
            },
        ))
    }

    /// Every completed session. Subscribe before [`SessionProxy::startup`] to
    /// see the first one.
    pub fn session_source(&self) -> &Multicast<SharedSession> {
        &self.sessions
    }

    /// Completed game-API sessions.
    pub fn api_sessions(&self) -> &Multicast<SharedSession> {
        self.api.stream()
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn relay_toggles(&self) -> &Arc<RelayToggles> {
        &self.toggles
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn set_upstream(&self, settings: Option<ProxySettings>) {
        match settings {
            Some(settings) => self.settings.store(settings),
            None => self.settings.clear(),
        };
    }

    pub fn state(&self) -> ProxyState {
        match *self.lifecycle.lock() {
            Lifecycle::Idle => ProxyState::Idle,
            Lifecycle::Running(_) => ProxyState::Running,
            Lifecycle::ShutDown => ProxyState::ShutDown,
        }
    }

    /// Starts the engine, applies the system proxy, registers the hooks and
    /// connects both streams. Blocks while a system proxy command runs, so
    /// call it from a blocking context when inside a runtime.
    pub fn startup(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => {
                tracing::debug!("Session proxy already running");
                return Ok(());
            }
            Lifecycle::ShutDown => return Err(ProxyError::ShutDown),
            Lifecycle::Idle => {}
        }

        self.engine.start(self.listen_port)?;

        if let Err(e) = self.system_proxy.apply(&self.system_proxy_address) {
            tracing::error!(error = %e, "Failed to configure system proxy");
            self.engine.stop();
            return Err(e.into());
        }

        let hooks = match self.register_hooks() {
            Ok(hooks) => hooks,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register engine hooks");
                self.engine.stop();
                return Err(e.into());
            }
        };

        let connections = vec![self.sessions.connect(), self.api.connect()];
        self.routing_gate.set(true);

        *lifecycle = Lifecycle::Running(Active { hooks, connections });
        tracing::info!(
            port = self.listen_port,
            system_proxy = %self.system_proxy_address,
            "Session proxy started"
        );
        Ok(())
    }

    /// Registers both hooks, removing any already registered on failure.
    fn register_hooks(&self) -> std::result::Result<Vec<HookId>, EngineError> {
        let sessions = self.sessions.clone();
        let metrics = self.metrics.clone();
        let on_complete: SessionCompleteHandler = Arc::new(move |session: Session| {
            if sessions.publish(session.into_shared()) {
                metrics.record_session();
            }
        });

        let router = self.router.clone();
        let gate = self.routing_gate.clone();
        let before_request: BeforeRequestHandler = Arc::new(move |request: &mut PendingRequest| {
            gate.run(|| {
                router.route(request);
            });
        });

        let completion_hook = self.engine.on_session_complete(on_complete)?;
        match self.engine.on_before_request(before_request) {
            Ok(request_hook) => Ok(vec![completion_hook, request_hook]),
            Err(e) => {
                self.engine.remove_hook(completion_hook);
                Err(e)
            }
        }
    }

    /// Stops event delivery and removes the hooks. Safe to call more than
    /// once; uploads already dispatched finish on their own.
    pub fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::ShutDown);

        let Lifecycle::Running(mut active) = previous else {
            tracing::debug!("Session proxy not running, nothing to shut down");
            return;
        };

        for connection in &mut active.connections {
            connection.disconnect();
        }
        self.routing_gate.set(false);
        self.sessions.complete();
        self.api.stream().complete();

        for hook in active.hooks {
            self.engine.remove_hook(hook);
        }
        self.engine.stop();

        tracing::info!("Session proxy shut down");
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
