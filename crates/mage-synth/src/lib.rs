use anyhow::{Context as _, Result, anyhow};
use mage_store::KvStore;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generation request wire shape: `{ prompt, context?: { fullCode? } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SynthesisContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_code: Option<String>,
}

/// Generation response wire shape: `{ code, injectedLibraries }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedFragment {
    pub code: String,
    pub injected_libraries: Vec<String>,
}

/// Repair request wire shape: `{ error, code }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairRequest {
    pub error: String,
    pub code: String,
}

/// Repair response wire shape: `{ fixedCode, explanation }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub fixed_code: String,
    pub explanation: String,
}

pub trait SynthesisService {
    fn synthesize(&self, req: &SynthesisRequest) -> Result<SynthesizedFragment>;
}

pub trait RepairService {
    fn repair(&self, req: &RepairRequest) -> Result<RepairOutcome>;
}

/// Blocking HTTP client for both endpoints. Malformed responses surface as
/// errors the caller recovers from; nothing here panics.
#[derive(Clone)]
pub struct HttpSynthesisClient {
    synth_url: String,
    repair_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSynthesisClient {
    pub fn new(synth_url: String, repair_url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(45))
            .build()
            .context("failed to build HTTP client for synthesis")?;
        Ok(Self {
            synth_url,
            repair_url,
            api_key,
            client,
        })
    }

    fn post<B: Serialize, T: serde::de::DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let mut request = self.client.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .with_context(|| format!("failed calling {url}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(anyhow!("request to {url} failed ({status}): {body}"));
        }
        response
            .json()
            .with_context(|| format!("failed decoding response from {url}"))
    }
}

impl SynthesisService for HttpSynthesisClient {
    fn synthesize(&self, req: &SynthesisRequest) -> Result<SynthesizedFragment> {
        let fragment: SynthesizedFragment = self.post(&self.synth_url, req)?;
        if fragment.code.trim().is_empty() {
            return Err(anyhow!("synthesis returned empty code for {:?}", req.prompt));
        }
        Ok(fragment)
    }
}

impl RepairService for HttpSynthesisClient {
    fn repair(&self, req: &RepairRequest) -> Result<RepairOutcome> {
        let outcome: RepairOutcome = self.post(&self.repair_url, req)?;
        if outcome.fixed_code.trim().is_empty() {
            return Err(anyhow!("repair returned an empty fix"));
        }
        Ok(outcome)
    }
}

pub const GENERATION_LOG_KEY: &str = "magic:generation-log";
pub const GENERATION_LOG_CAP: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub prompt: String,
    pub code: String,
    pub timestamp: u64,
}

/// Bounded newest-first log of synthesized fragments, capped to the most
/// recent 50 records. Lives on the key-value store, so a degraded store
/// makes logging best-effort rather than an error.
pub struct GenerationLog<S: KvStore> {
    store: S,
}

impl<S: KvStore> GenerationLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn append(&self, prompt: &str, code: &str) -> Result<()> {
        let record = GenerationRecord {
            prompt: prompt.to_string(),
            code: code.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        };
        let raw = serde_json::to_string(&record).context("failed serializing log record")?;
        self.store.list_push(GENERATION_LOG_KEY, &raw)?;
        self.store
            .list_trim(GENERATION_LOG_KEY, 0, GENERATION_LOG_CAP - 1)?;
        Ok(())
    }

    pub fn recent(&self) -> Result<Vec<GenerationRecord>> {
        let raw = self
            .store
            .list_range(GENERATION_LOG_KEY, 0, GENERATION_LOG_CAP - 1)?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }
}
