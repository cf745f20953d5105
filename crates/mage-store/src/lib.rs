use anyhow::{Context as _, Result, anyhow};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimal key-value contract shared by the rate limiter and the
/// generation log. Lists are newest-first: `list_push` prepends.
pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    fn list_push(&self, key: &str, value: &str) -> Result<()>;
    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()>;
    fn ping(&self) -> Result<()>;
}

impl<T: KvStore + ?Sized> KvStore for &T {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn list_push(&self, key: &str, value: &str) -> Result<()> {
        (**self).list_push(key, value)
    }

    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        (**self).list_range(key, start, stop)
    }

    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        (**self).list_trim(key, start, stop)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn list_push(&self, key: &str, value: &str) -> Result<()> {
        (**self).list_push(key, value)
    }

    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        (**self).list_range(key, start, stop)
    }

    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        (**self).list_trim(key, start, stop)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, ValueEntry>,
    lists: HashMap<String, Vec<String>>,
}

/// Process-local backend. TTLs are checked lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve_index(len: usize, index: i64) -> i64 {
    if index < 0 { len as i64 + index } else { index }
}

fn clamp_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let start = resolve_index(len, start).max(0);
    let stop = resolve_index(len, stop).min(len as i64 - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let expired = matches!(
            inner.values.get(key),
            Some(ValueEntry { expires_at: Some(deadline), .. }) if Instant::now() >= *deadline
        );
        if expired {
            inner.values.remove(key);
            return Ok(None);
        }
        Ok(inner.values.get(key).map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = clamp_range(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list[start..=stop].to_vec())
    }

    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };
        match clamp_range(list.len(), start, stop) {
            Some((start, stop)) => {
                *list = list[start..=stop].to_vec();
            }
            None => {
                list.clear();
            }
        }
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable networked backend speaking the Upstash-style REST protocol:
/// path commands, bearer auth, `{ "result": ... }` envelopes.
pub struct RestStore {
    base_url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl RestStore {
    pub fn new(base_url: String, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client for REST store")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn command<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
        body: Option<&str>,
    ) -> Result<Option<T>> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.client.post(&url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        let response = request
            .send()
            .with_context(|| format!("REST store request failed: {path}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("REST store returned status {}", response.status()));
        }
        let envelope: RestEnvelope<T> = response
            .json()
            .context("failed decoding REST store response")?;
        if let Some(error) = envelope.error {
            return Err(anyhow!("REST store command error: {error}"));
        }
        Ok(envelope.result)
    }
}

impl KvStore for RestStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.command::<String>(&format!("get/{key}"), None)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let path = match ttl {
            Some(ttl) => format!("set/{key}?EX={}", ttl.as_secs().max(1)),
            None => format!("set/{key}"),
        };
        self.command::<String>(&path, Some(value))?;
        Ok(())
    }

    fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.command::<i64>(&format!("lpush/{key}"), Some(value))?;
        Ok(())
    }

    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(self
            .command::<Vec<String>>(&format!("lrange/{key}/{start}/{stop}"), None)?
            .unwrap_or_default())
    }

    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.command::<String>(&format!("ltrim/{key}/{start}/{stop}"), None)?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.command::<String>("ping", None)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Connected,
    Degraded,
}

pub type TransitionHook = Box<dyn Fn(BackendState) + Send + Sync>;

struct Supervisor {
    state: BackendState,
    last_probe: Instant,
}

/// Two-state supervisor over a durable backend with an in-memory fallback.
/// A durable failure demotes to Degraded and the call is served from memory;
/// while Degraded the durable side is re-probed at most once per
/// `probe_interval` and promoted back on a successful ping. Callers never
/// see durable-backend errors.
pub struct FailoverStore<D: KvStore, M: KvStore> {
    durable: D,
    memory: M,
    supervisor: Mutex<Supervisor>,
    probe_interval: Duration,
    on_transition: Option<TransitionHook>,
}

impl<D: KvStore, M: KvStore> FailoverStore<D, M> {
    pub fn new(durable: D, memory: M) -> Self {
        Self {
            durable,
            memory,
            supervisor: Mutex::new(Supervisor {
                state: BackendState::Connected,
                last_probe: Instant::now(),
            }),
            probe_interval: Duration::from_secs(5),
            on_transition: None,
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn on_transition(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    pub fn state(&self) -> BackendState {
        self.supervisor
            .lock()
            .map(|s| s.state)
            .unwrap_or(BackendState::Degraded)
    }

    fn transition(&self, next: BackendState) {
        if let Some(hook) = &self.on_transition {
            hook(next);
        }
    }

    /// Routes one operation, demoting on durable failure and probing for
    /// recovery while degraded. Memory-side errors would only come from a
    /// poisoned lock, so the returned result is effectively infallible.
    fn route<T>(
        &self,
        durable_op: impl FnOnce(&D) -> Result<T>,
        memory_op: impl FnOnce(&M) -> Result<T>,
    ) -> Result<T> {
        let state = {
            let Ok(mut supervisor) = self.supervisor.lock() else {
                return memory_op(&self.memory);
            };
            let mut state = supervisor.state;
            if state == BackendState::Degraded
                && supervisor.last_probe.elapsed() >= self.probe_interval
            {
                supervisor.last_probe = Instant::now();
                if self.durable.ping().is_ok() {
                    supervisor.state = BackendState::Connected;
                    state = BackendState::Connected;
                    tracing::info!("durable store reachable again, switching back");
                    drop(supervisor);
                    self.transition(BackendState::Connected);
                }
            }
            state
        };

        match state {
            BackendState::Connected => match durable_op(&self.durable) {
                Ok(value) => Ok(value),
                Err(err) => {
                    if let Ok(mut supervisor) = self.supervisor.lock() {
                        if supervisor.state == BackendState::Connected {
                            supervisor.state = BackendState::Degraded;
                            supervisor.last_probe = Instant::now();
                            tracing::warn!("durable store unavailable, falling back to memory: {err:#}");
                            drop(supervisor);
                            self.transition(BackendState::Degraded);
                        }
                    }
                    memory_op(&self.memory)
                }
            },
            BackendState::Degraded => memory_op(&self.memory),
        }
    }
}

impl<D: KvStore, M: KvStore> KvStore for FailoverStore<D, M> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.route(|d| d.get(key), |m| m.get(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.route(|d| d.set(key, value, ttl), |m| m.set(key, value, ttl))
    }

    fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.route(|d| d.list_push(key, value), |m| m.list_push(key, value))
    }

    fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.route(
            |d| d.list_range(key, start, stop),
            |m| m.list_range(key, start, stop),
        )
    }

    fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.route(
            |d| d.list_trim(key, start, stop),
            |m| m.list_trim(key, start, stop),
        )
    }

    fn ping(&self) -> Result<()> {
        self.route(|d| d.ping(), |m| m.ping())
    }
}
