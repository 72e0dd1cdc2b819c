//! Port and API prefix discovery
//!
//! The port comes from configuration or from the first `http(s)://host:PORT` the backend
//! prints. The prefix is found by, in order: the `__API_BASE__` marker on the
//! documentation page, a configuration-read probe at each candidate root, and finally URLs
//! in the backend output that point at the discovered port.

use crate::error::Result;
use crate::supervisor::inflight::InFlight;
use crate::supervisor::probe::{ProbeClient, ProbeOutcome};
use crate::supervisor::state::SharedState;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

static PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[^\s:/]+:(\d{1,5})").expect("Invalid regex pattern")
});

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s:/]+:(\d{1,5})(/[^\s"'<>`]*)?"#).expect("Invalid regex pattern")
});

static API_BASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"__API_BASE__\s*=\s*["'`]([^"'`]*)["'`]"#).expect("Invalid regex pattern")
});

/// Endpoint names that end a printed URL but are not part of the prefix
const KNOWN_LEAVES: &[&str] = &["doc", "config", "health", "event", "agent", "session", "app"];

/// First plausible port in a line of backend output
pub fn parse_port(line: &str) -> Option<u16> {
    PORT_RE
        .captures_iter(line)
        .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        .find(|port| *port != 0)
}

/// Value of the `__API_BASE__` marker in a documentation page
pub fn extract_api_base(body: &str) -> Option<String> {
    API_BASE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| normalize_prefix(m.as_str()))
}

/// Normalize a prefix: leading slash, no trailing slash, `/` becomes empty
pub fn normalize_prefix(raw: &str) -> String {
    let mut value = raw.trim().to_string();

    if value.starts_with("http://") || value.starts_with("https://") {
        value = match url::Url::parse(&value) {
            Ok(url) => url.path().to_string(),
            Err(_) => String::new(),
        };
    }

    if let Some(idx) = value.find(|c| c == '?' || c == '#') {
        value.truncate(idx);
    }

    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Prefix suggested by a printed URL that points at `port`
pub fn passive_prefix(line: &str, port: u16) -> Option<String> {
    URL_RE.captures_iter(line).find_map(|c| {
        let url_port = c.get(1)?.as_str().parse::<u16>().ok()?;
        if url_port != port {
            return None;
        }
        let path = normalize_prefix(c.get(2)?.as_str());
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.last().map(|leaf| KNOWN_LEAVES.contains(leaf)).unwrap_or(false) {
            segments.pop();
        }
        (!segments.is_empty()).then(|| format!("/{}", segments.join("/")))
    })
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            next: initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Settings the discovery engine needs from the configuration
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub candidates: Vec<String>,
    pub doc_path: String,
    pub config_path: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

/// Learns the port and prefix of the current backend process
pub struct DiscoveryEngine {
    state: SharedState,
    probe: ProbeClient,
    settings: DiscoverySettings,
    flight: InFlight<Option<String>>,
    /// Prefix seen in output for a generation, used when active probing finds nothing
    passive_hint: Mutex<Option<(u64, String)>>,
    retry_loop_active: AtomicBool,
    /// Cuts the retry loop's backoff sleep short
    wake: Notify,
    runtime: Handle,
}

impl DiscoveryEngine {
    pub fn new(state: SharedState, probe: ProbeClient, settings: DiscoverySettings, runtime: Handle) -> Self {
        let candidates = settings
            .candidates
            .iter()
            .map(|c| normalize_prefix(c))
            .collect();
        Self {
            state,
            probe,
            settings: DiscoverySettings {
                candidates,
                ..settings
            },
            flight: InFlight::new("prefix discovery"),
            passive_hint: Mutex::new(None),
            retry_loop_active: AtomicBool::new(false),
            wake: Notify::new(),
            runtime,
        }
    }

    /// Normalized candidate roots, in probe order
    pub fn candidates(&self) -> &[String] {
        &self.settings.candidates
    }

    /// Feed one line of backend output
    pub fn observe_line(&self, generation: u64, line: &str) {
        let mut state = self.state.write();
        if !state.is_current(generation) {
            return;
        }

        if state.port.is_none() {
            if let Some(port) = parse_port(line) {
                if state.adopt_port(generation, port) {
                    info!("🔌 Backend port discovered from output: {}", port);
                }
            }
        }

        if !state.prefix.is_detected() {
            if let Some(port) = state.backend_port() {
                if let Some(prefix) = passive_prefix(line, port) {
                    let mut hint = self.passive_hint.lock();
                    if hint.as_ref().map(|(g, _)| *g) != Some(generation) {
                        debug!("Prefix hint from output: {:?}", prefix);
                        *hint = Some((generation, prefix));
                    }
                }
            }
        }
    }

    /// Forget per-process hints
    pub fn reset(&self) {
        *self.passive_hint.lock() = None;
    }

    /// Run one coalesced discovery attempt for `generation`
    pub async fn discover(self: &Arc<Self>, generation: u64) -> Result<Option<String>> {
        let this = Arc::clone(self);
        let joined = self
            .flight
            .run(&self.runtime, move || async move { this.attempt(generation).await });
        joined.future.await
    }

    /// Make sure a retry loop is working on the prefix of the current process
    ///
    /// A loop that is already waiting out its backoff retries right away.
    pub fn trigger(self: &Arc<Self>) {
        if self.retry_loop_active.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
            return;
        }

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let mut backoff = Backoff::new(this.settings.backoff_initial, this.settings.backoff_max);
            let mut last_generation = None;

            while let Some(generation) = this.pending_generation() {
                if last_generation != Some(generation) {
                    backoff.reset();
                    last_generation = Some(generation);
                }

                match this.discover(generation).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => warn!("Prefix discovery attempt failed: {}", e),
                }

                let delay = backoff.next_delay();
                debug!("Prefix still unknown, retrying in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = this.wake.notified() => {
                        debug!("Prefix discovery woken early");
                        backoff.reset();
                    }
                }
            }

            this.retry_loop_active.store(false, Ordering::SeqCst);
            // A launch may have slipped in between the last check and the flag reset
            if this.pending_generation().is_some() {
                this.trigger();
            }
        });
    }

    /// Generation whose prefix still needs discovering, if any
    fn pending_generation(&self) -> Option<u64> {
        let state = self.state.read();
        let wanted = !state.shutting_down
            && !state.stopped
            && state.process.is_alive()
            && !state.prefix.is_detected();
        wanted.then_some(state.generation)
    }

    async fn attempt(&self, generation: u64) -> Result<Option<String>> {
        let port = {
            let state = self.state.read();
            if !state.is_current(generation) {
                return Ok(None);
            }
            if let Some(prefix) = state.prefix.value() {
                return Ok(Some(prefix.to_string()));
            }
            match state.backend_port() {
                Some(port) => port,
                None => return Ok(None),
            }
        };

        for root in &self.settings.candidates {
            match self.probe.doc_marker(port, root, &self.settings.doc_path).await {
                ProbeOutcome::Success(prefix) => {
                    return Ok(self.apply(generation, &prefix, "documentation marker"));
                }
                ProbeOutcome::Retry(e) => debug!("Doc marker probe: {}", e),
                ProbeOutcome::Fatal(e) => {
                    warn!("Doc marker probe failed: {}", e);
                    break;
                }
            }
        }

        for root in &self.settings.candidates {
            match self.probe.config(port, root, &self.settings.config_path).await {
                ProbeOutcome::Success(probed) => {
                    let prefix = probed.effective_prefix.unwrap_or_else(|| root.clone());
                    return Ok(self.apply(generation, &prefix, "configuration probe"));
                }
                ProbeOutcome::Retry(e) => debug!("Config probe: {}", e),
                ProbeOutcome::Fatal(e) => {
                    warn!("Config probe failed: {}", e);
                    break;
                }
            }
        }

        let hint = self.passive_hint.lock().clone();
        if let Some((hint_generation, prefix)) = hint {
            if hint_generation == generation {
                return Ok(self.apply(generation, &prefix, "backend output"));
            }
        }

        Ok(None)
    }

    fn apply(&self, generation: u64, prefix: &str, source: &str) -> Option<String> {
        let mut state = self.state.write();
        if state.detect_prefix(generation, prefix) {
            info!("🧭 Backend API prefix detected via {}: {:?}", source, prefix);
        }
        if state.is_current(generation) {
            state.prefix.value().map(str::to_string)
        } else {
            None
        }
    }
}
