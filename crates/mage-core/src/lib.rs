pub mod blocks;

use mage_heal::{Delay, HealController, HealOutcome};
use mage_ratelimit::{Clock, RateLimitDecision, RateLimiter, SystemClock};
use mage_splice::{Fragment, PromptCache, prepend_imports, splice};
use mage_store::KvStore;
use mage_synth::{
    GenerationLog, RepairService, SynthesisContext, SynthesisRequest, SynthesisService,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cache_capacity: usize,
    pub rate_limit: u64,
    pub rate_window_secs: u64,
    pub rate_identifier: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 24,
            rate_limit: 10,
            rate_window_secs: 60,
            rate_identifier: "magic:generate".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Final runnable program text after splicing and import normalization.
    pub runnable: String,
    /// Prompts still awaiting synthesis, one per uncached occurrence.
    pub pending_prompts: Vec<String>,
    /// The prompt synthesized during this pass, if any.
    pub synthesized: Option<String>,
    /// Set when the generation call was rejected by the rate limiter; the
    /// caller should back off rather than retry immediately.
    pub rate_limited: Option<RateLimitDecision>,
}

/// Orchestrates one editing session. Owns the single source of truth for
/// the current runnable program text; collaborators only read snapshots and
/// return proposed replacements.
pub struct Session<G, R, D, C>
where
    G: SynthesisService,
    R: RepairService,
    D: Delay,
    C: Clock,
{
    program: String,
    cache: PromptCache,
    synthesis: G,
    heal: HealController<R, D>,
    limiter: RateLimiter<Arc<dyn KvStore>, C>,
    log: GenerationLog<Arc<dyn KvStore>>,
    options: SessionOptions,
}

impl<G, R, D> Session<G, R, D, SystemClock>
where
    G: SynthesisService,
    R: RepairService,
    D: Delay,
{
    pub fn new(
        synthesis: G,
        heal: HealController<R, D>,
        store: Arc<dyn KvStore>,
        options: SessionOptions,
    ) -> Self {
        Self::with_clock(synthesis, heal, store, options, SystemClock)
    }
}

impl<G, R, D, C> Session<G, R, D, C>
where
    G: SynthesisService,
    R: RepairService,
    D: Delay,
    C: Clock,
{
    pub fn with_clock(
        synthesis: G,
        heal: HealController<R, D>,
        store: Arc<dyn KvStore>,
        options: SessionOptions,
        clock: C,
    ) -> Self {
        Self {
            program: String::new(),
            cache: PromptCache::new(options.cache_capacity),
            synthesis,
            heal,
            limiter: RateLimiter::with_clock(Arc::clone(&store), clock),
            log: GenerationLog::new(store),
            options,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn cache(&self) -> &PromptCache {
        &self.cache
    }

    /// Seeds a fragment directly, e.g. when the embedding editor restores
    /// previously synthesized code for a project.
    pub fn insert_fragment(&mut self, prompt: String, fragment: Fragment) {
        self.cache.insert(prompt, fragment);
    }

    /// Runs one pass of the pipeline over freshly block-compiled raw text:
    /// prune the cache to live markers, splice cached fragments, synthesize
    /// at most the first uncached prompt (synthesis is serialized per
    /// session), and normalize imports. Synthesis failures keep the
    /// pre-synthesis draft; nothing here is fatal.
    pub fn refresh(&mut self, raw_text: &str) -> RefreshOutcome {
        self.cache.prune_to_live(raw_text);
        let mut outcome = splice(raw_text, &self.cache);
        let mut synthesized = None;
        let mut rate_limited = None;

        if let Some(first_miss) = outcome.uncached.first().cloned() {
            let decision = self.limiter.check(
                &self.options.rate_identifier,
                self.options.rate_limit,
                self.options.rate_window_secs,
            );
            if !decision.success {
                tracing::warn!(
                    "generation rate limit hit, retry after epoch {}",
                    decision.reset
                );
                rate_limited = Some(decision);
            } else {
                match self.synthesis.synthesize(&SynthesisRequest {
                    prompt: first_miss.clone(),
                    context: Some(SynthesisContext {
                        full_code: Some(raw_text.to_string()),
                    }),
                }) {
                    Ok(fragment) => {
                        self.cache.insert(
                            first_miss.clone(),
                            Fragment {
                                code: fragment.code.clone(),
                                libs: fragment.injected_libraries,
                            },
                        );
                        if let Err(err) = self.log.append(&first_miss, &fragment.code) {
                            tracing::warn!("failed appending generation log: {err:#}");
                        }
                        synthesized = Some(first_miss);
                        outcome = splice(raw_text, &self.cache);
                    }
                    Err(err) => {
                        tracing::warn!("synthesis failed, keeping draft: {err:#}");
                    }
                }
            }
        }

        let runnable = prepend_imports(&outcome.text, &self.cache.libs_union());
        self.program = runnable.clone();
        RefreshOutcome {
            runnable,
            pending_prompts: outcome.uncached,
            synthesized,
            rate_limited,
        }
    }

    /// Feeds a runtime error from the preview into the healing controller
    /// and applies the proposed fix. The fix is applied only if the program
    /// text still equals the snapshot the repair was requested against, so
    /// a stale response never clobbers newer edits.
    pub fn handle_runtime_error(&mut self, error: &str) -> HealOutcome {
        let snapshot = self.program.clone();
        let outcome = self.heal.handle(error, &snapshot);
        if let HealOutcome::Repaired { fixed_code, .. } = &outcome {
            if self.program == snapshot {
                self.program = fixed_code.clone();
            } else {
                tracing::warn!("discarding stale repair: program changed during healing");
            }
        }
        outcome
    }
}
