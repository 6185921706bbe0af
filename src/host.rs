//! Seams to the host proxy engine and the OS proxy configuration
//!
//! The interception engine (TLS termination, HTTP parsing, forwarding) is
//! outside this crate. It raises two hooks: one before each outbound request
//! and one per completed session. [`LocalEngine`] is an in-process engine that
//! raises those hooks on demand, for replaying recorded traffic and tests.

use crate::error::EngineError;
use crate::session::{PendingRequest, Session, SessionId};
use dashmap::DashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

pub type SessionCompleteHandler = Arc<dyn Fn(Session) + Send + Sync>;
pub type BeforeRequestHandler = Arc<dyn Fn(&mut PendingRequest) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

pub trait HostEngine: Send + Sync {
    /// Starts listening on `port`.
    fn start(&self, port: u16) -> Result<(), EngineError>;

    fn on_session_complete(&self, handler: SessionCompleteHandler) -> Result<HookId, EngineError>;

    fn on_before_request(&self, handler: BeforeRequestHandler) -> Result<HookId, EngineError>;

    /// Removes a hook. Unknown ids are ignored.
    fn remove_hook(&self, hook: HookId);

    fn stop(&self);
}

/// Applies `host:port` as the operating system's default proxy.
pub trait SystemProxy: Send + Sync {
    fn apply(&self, address: &str) -> Result<(), EngineError>;
}

/// Leaves the OS proxy configuration alone.
#[derive(Debug, Default)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn apply(&self, address: &str) -> Result<(), EngineError> {
        tracing::debug!(address, "System proxy configuration skipped");
        Ok(())
    }
}

/// Runs an external command, substituting `{address}` in its arguments.
/// `apply` blocks until the command exits.
#[derive(Debug, Clone)]
pub struct CommandSystemProxy {
    command: String,
    args: Vec<String>,
}

impl CommandSystemProxy {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn expanded_args(&self, address: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{address}", address))
            .collect()
    }
}

impl SystemProxy for CommandSystemProxy {
    fn apply(&self, address: &str) -> Result<(), EngineError> {
        let args = self.expanded_args(address);
        tracing::info!(command = %self.command, ?args, "Applying system proxy");

        let status = Command::new(&self.command)
            .args(&args)
            .status()
            .map_err(|e| EngineError::SystemProxy(format!("{}: {}", self.command, e)))?;

        if !status.success() {
            return Err(EngineError::SystemProxy(format!(
                "{} exited with {}",
                self.command, status
            )));
        }
        Ok(())
    }
}

/// In-process engine that raises hooks when told to.
#[derive(Default)]
pub struct LocalEngine {
    running: AtomicBool,
    port: AtomicU16,
    next_hook: AtomicU64,
    next_session: AtomicU64,
    completion_hooks: DashMap<HookId, SessionCompleteHandler>,
    request_hooks: DashMap<HookId, BeforeRequestHandler>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> Option<u16> {
        self.is_running().then(|| self.port.load(Ordering::SeqCst))
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn hook_count(&self) -> usize {
        self.completion_hooks.len() + self.request_hooks.len()
    }

    /// Runs the before-request hooks on `request`.
    pub fn send_request(&self, request: &mut PendingRequest) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let hooks: Vec<BeforeRequestHandler> =
            self.request_hooks.iter().map(|h| h.value().clone()).collect();
        for hook in hooks {
            hook(request);
        }
        Ok(())
    }

    /// Raises the completion hooks for `session`.
    pub fn complete_session(&self, session: Session) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let hooks: Vec<SessionCompleteHandler> =
            self.completion_hooks.iter().map(|h| h.value().clone()).collect();
        for hook in hooks {
            hook(session.clone());
        }
        Ok(())
    }

    fn hook_id(&self) -> HookId {
        HookId(self.next_hook.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl HostEngine for LocalEngine {
    fn start(&self, port: u16) -> Result<(), EngineError> {
        if port == 0 {
            return Err(EngineError::StartFailed {
                port,
                reason: "port must be non-zero".to_string(),
            });
        }
        self.port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(port, "Local engine started");
        Ok(())
    }

    fn on_session_complete(&self, handler: SessionCompleteHandler) -> Result<HookId, EngineError> {
        let id = self.hook_id();
        self.completion_hooks.insert(id, handler);
        Ok(id)
    }

    fn on_before_request(&self, handler: BeforeRequestHandler) -> Result<HookId, EngineError> {
        let id = self.hook_id();
        self.request_hooks.insert(id, handler);
        Ok(id)
    }

    fn remove_hook(&self, hook: HookId) {
        self.completion_hooks.remove(&hook);
        self.request_hooks.remove(&hook);
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Local engine stopped");
        }
    }
}
