//! CDP target discovery.
//!
//! Lists the debuggable pages an IDE instance exposes on its DevTools HTTP
//! endpoint and picks the one matching a requested role. Discovery failures
//! are routine (the IDE may still be booting), so the resolver reports
//! `None` instead of an error and callers retry on their own schedule.

use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

/// How long a single discovery request may take.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// A debuggable page advertised by the IDE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub id: String,
    pub title: String,
    pub url: String,
    /// DevTools WebSocket URL, rewritten to the address we actually dialed.
    pub ws_url: Option<String>,
}

/// Raw entry shape of `GET /json/list`.
#[derive(Debug, Deserialize)]
struct RawTarget {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: Option<String>,
}

/// Which page of the IDE a caller wants to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetRole {
    /// The agent/chat side panel webview.
    AgentPanel,
    /// The main workbench page.
    #[default]
    Workbench,
    /// First debuggable page, whatever it is.
    Any,
}

impl TargetRole {
    /// URL fragment identifying this role, if it has one.
    fn url_fragment(&self) -> Option<&'static str> {
        match self {
            TargetRole::AgentPanel => Some("agent"),
            TargetRole::Workbench => Some("workbench"),
            TargetRole::Any => None,
        }
    }
}

/// Resolves CDP targets for IDE endpoints.
///
/// Keeps a last-good-port hint per host so a workspace whose recorded port
/// went stale can still be found quickly. The hint is always re-validated
/// by an actual discovery round trip before use.
#[derive(Debug)]
pub struct TargetResolver {
    client: reqwest::Client,
    last_good: DashMap<String, u16>,
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetResolver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            last_good: DashMap::new(),
        }
    }

    /// Resolve the target matching `role` at `host:port`.
    ///
    /// Selection priority: role URL fragment, then the workbench page, then
    /// the first listed target. Returns `None` when nothing is reachable,
    /// which callers treat as retryable.
    pub async fn resolve(&self, host: &str, port: u16, role: TargetRole) -> Option<Target> {
        let mut candidates = vec![port];
        if let Some(hint) = self.last_good.get(host) {
            if *hint != port {
                candidates.push(*hint);
            }
        }

        for candidate in candidates {
            let Some(raw) = self.fetch_targets(host, candidate).await else {
                continue;
            };

            self.last_good.insert(host.to_string(), candidate);
            return select_target(raw, role).map(|mut t| {
                t.ws_url = t.ws_url.map(|ws| rewrite_ws_host(&ws, host, candidate));
                t
            });
        }

        // Nothing answered; a stale hint would only slow the next attempt.
        self.last_good.remove(host);
        None
    }

    /// List every debuggable page at `host:port`, ws URLs rewritten.
    pub async fn list(&self, host: &str, port: u16) -> Option<Vec<Target>> {
        let raw = self.fetch_targets(host, port).await?;
        Some(
            raw.into_iter()
                .map(|r| {
                    let mut t = target_from_raw(r);
                    t.ws_url = t.ws_url.map(|ws| rewrite_ws_host(&ws, host, port));
                    t
                })
                .collect(),
        )
    }

    /// Quick readiness probe against `GET /json/version`.
    pub async fn probe_version(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{}:{}/json/version", host, port);
        self.client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map(|res| res.status().is_success())
            .unwrap_or(false)
    }

    async fn fetch_targets(&self, host: &str, port: u16) -> Option<Vec<RawTarget>> {
        let url = format!("http://{}:{}/json/list", host, port);

        let response = match self
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
        {
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                debug!("target discovery at {} answered {}", url, res.status());
                return None;
            }
            Err(e) => {
                debug!("target discovery at {} failed: {}", url, e);
                return None;
            }
        };

        match response.json::<Vec<RawTarget>>().await {
            Ok(targets) => Some(targets),
            Err(e) => {
                debug!("target list at {} unparseable: {}", url, e);
                None
            }
        }
    }
}

fn target_from_raw(raw: RawTarget) -> Target {
    Target {
        id: raw.id,
        title: raw.title,
        url: raw.url,
        ws_url: raw.ws_url,
    }
}

/// Pick the best match for a role out of a target list.
fn select_target(raw: Vec<RawTarget>, role: TargetRole) -> Option<Target> {
    if raw.is_empty() {
        return None;
    }

    if let Some(fragment) = role.url_fragment() {
        if let Some(pos) = raw.iter().position(|t| t.url.contains(fragment)) {
            let mut raw = raw;
            return Some(target_from_raw(raw.swap_remove(pos)));
        }
    }

    if let Some(pos) = raw.iter().position(|t| t.url.contains("workbench")) {
        let mut raw = raw;
        return Some(target_from_raw(raw.swap_remove(pos)));
    }

    let mut raw = raw;
    Some(target_from_raw(raw.swap_remove(0)))
}

/// Replace the host:port of a DevTools ws URL with the address we dialed.
///
/// The advertised URL can carry a container-internal address that is not
/// reachable from the server side.
fn rewrite_ws_host(ws_url: &str, host: &str, port: u16) -> String {
    let Some(scheme_end) = ws_url.find("://") else {
        return ws_url.to_string();
    };
    let scheme = &ws_url[..scheme_end];
    let rest = &ws_url[scheme_end + 3..];
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "",
    };
    format!("{}://{}:{}{}", scheme, host, port, path)
}
