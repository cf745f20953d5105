use anyhow::{Result, anyhow};
use mage_core::{RefreshOutcome, Session, SessionOptions};
use mage_heal::{Delay, HealController, HealOutcome};
use mage_ratelimit::Clock;
use mage_splice::Fragment;
use mage_store::{KvStore, MemoryStore};
use mage_synth::{
    GenerationLog, RepairOutcome, RepairRequest, RepairService, SynthesisRequest, SynthesisService,
    SynthesizedFragment,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct StubSynth {
    fail: bool,
    fragments: HashMap<String, SynthesizedFragment>,
    requests: RefCell<Vec<SynthesisRequest>>,
}

impl StubSynth {
    fn failing() -> Self {
        Self {
            fail: true,
            fragments: HashMap::new(),
            requests: RefCell::new(Vec::new()),
        }
    }

    fn with_fragment(prompt: &str, code: &str, libs: &[&str]) -> Self {
        let mut fragments = HashMap::new();
        fragments.insert(
            prompt.to_string(),
            SynthesizedFragment {
                code: code.to_string(),
                injected_libraries: libs.iter().map(ToString::to_string).collect(),
            },
        );
        Self {
            fail: false,
            fragments,
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl SynthesisService for &StubSynth {
    fn synthesize(&self, req: &SynthesisRequest) -> Result<SynthesizedFragment> {
        self.requests.borrow_mut().push(req.clone());
        if self.fail {
            return Err(anyhow!("synthesis endpoint unreachable"));
        }
        self.fragments
            .get(&req.prompt)
            .cloned()
            .ok_or_else(|| anyhow!("no fragment for prompt {:?}", req.prompt))
    }
}

struct StubRepair {
    fixed_code: String,
}

impl RepairService for StubRepair {
    fn repair(&self, _req: &RepairRequest) -> Result<RepairOutcome> {
        Ok(RepairOutcome {
            fixed_code: self.fixed_code.clone(),
            explanation: "replaced the failing call".to_string(),
        })
    }
}

struct NoDelay;

impl Delay for NoDelay {
    fn pause(&self, _duration: Duration) {}
}

struct FixedClock;

impl Clock for FixedClock {
    fn epoch_secs(&self) -> u64 {
        1_000
    }
}

const RAW: &str =
    "window.x();\n/* ✨ AI Request: \"glow\" */\n{ console.log('AI_MAGIC_TRIGGER: glow'); }\n";

fn session<'a>(
    synth: &'a StubSynth,
    store: Arc<dyn KvStore>,
    options: SessionOptions,
) -> Session<&'a StubSynth, StubRepair, NoDelay, FixedClock> {
    let heal = HealController::with_delay(
        StubRepair {
            fixed_code: "healed();".to_string(),
        },
        NoDelay,
    )
    .with_presentation_delay(Duration::ZERO);
    Session::with_clock(synth, heal, store, options, FixedClock)
}

fn refresh_with_seeded_cache(raw: &str) -> RefreshOutcome {
    let synth = StubSynth::failing();
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );
    editor.insert_fragment(
        "glow".to_string(),
        Fragment {
            code: "FRAG".to_string(),
            libs: vec!["p5".to_string()],
        },
    );
    editor.refresh(raw)
}

#[test]
fn cached_prompt_splices_and_imports_land_first() {
    let outcome = refresh_with_seeded_cache(RAW);
    assert!(outcome.runnable.contains("FRAG"));
    assert!(!outcome.runnable.contains("AI_MAGIC_TRIGGER"));
    assert!(outcome.pending_prompts.is_empty());
    assert!(
        outcome.runnable.starts_with(
            "loadScript('https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.9.0/p5.min.js');\n"
        )
    );
}

#[test]
fn empty_cache_keeps_marker_and_reports_miss() {
    let synth = StubSynth::failing();
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );
    let outcome = editor.refresh(RAW);
    assert_eq!(outcome.runnable, RAW);
    assert_eq!(outcome.pending_prompts, vec!["glow".to_string()]);
    assert_eq!(outcome.synthesized, None);
}

#[test]
fn duplicate_prompts_are_replaced_identically() {
    let raw = format!("{RAW}{RAW}");
    let outcome = refresh_with_seeded_cache(&raw);
    assert_eq!(outcome.runnable.matches("FRAG").count(), 2);
    assert!(!outcome.runnable.contains("AI_MAGIC_TRIGGER"));
}

#[test]
fn synthesis_fills_the_cache_and_logs_the_fragment() {
    let synth = StubSynth::with_fragment("glow", "FRAG", &["p5"]);
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let mut editor = session(&synth, Arc::clone(&store), SessionOptions::default());

    let outcome = editor.refresh(RAW);
    assert_eq!(outcome.synthesized.as_deref(), Some("glow"));
    assert!(outcome.runnable.contains("FRAG"));
    assert!(outcome.pending_prompts.is_empty());

    let records = GenerationLog::new(store)
        .recent()
        .expect("log should be readable");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt, "glow");
    assert_eq!(records[0].code, "FRAG");

    // synthesis carried the full draft as context
    let requests = synth.requests.borrow();
    assert_eq!(requests.len(), 1);
    let context = requests[0].context.as_ref().expect("context should be set");
    assert_eq!(context.full_code.as_deref(), Some(RAW));
}

#[test]
fn only_the_first_miss_is_dispatched_per_pass() {
    let spin = "/* ✨ AI Request: \"spin\" */\n{ console.log('AI_MAGIC_TRIGGER: spin'); }\n";
    let raw = format!("{RAW}{spin}");

    let synth = StubSynth::with_fragment("glow", "FRAG", &[]);
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );

    let outcome = editor.refresh(&raw);
    assert_eq!(outcome.synthesized.as_deref(), Some("glow"));
    assert_eq!(outcome.pending_prompts, vec!["spin".to_string()]);
    assert_eq!(synth.requests.borrow().len(), 1);
}

#[test]
fn rate_limited_generation_backs_off() {
    let spin = "/* ✨ AI Request: \"spin\" */\n{ console.log('AI_MAGIC_TRIGGER: spin'); }\n";
    let raw = format!("{RAW}{spin}");

    let synth = StubSynth::with_fragment("glow", "FRAG", &[]);
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions {
            rate_limit: 1,
            ..SessionOptions::default()
        },
    );

    let first = editor.refresh(&raw);
    assert_eq!(first.synthesized.as_deref(), Some("glow"));
    assert!(first.rate_limited.is_none());

    let second = editor.refresh(&raw);
    assert_eq!(second.synthesized, None);
    let decision = second.rate_limited.expect("second pass should be limited");
    assert!(!decision.success);
    assert_eq!(decision.remaining, 0);
    // the draft keeps the uncached marker untouched
    assert!(second.runnable.contains("AI_MAGIC_TRIGGER: spin"));
}

#[test]
fn cache_prunes_when_a_marker_disappears() {
    let synth = StubSynth::failing();
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );
    editor.insert_fragment(
        "glow".to_string(),
        Fragment {
            code: "FRAG".to_string(),
            libs: vec!["p5".to_string()],
        },
    );

    let outcome = editor.refresh("window.x();\n");
    assert!(editor.cache().is_empty());
    // no live fragment, so no import either
    assert_eq!(outcome.runnable, "window.x();\n");
}

#[test]
fn runtime_error_heals_and_replaces_the_program() {
    let synth = StubSynth::failing();
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );
    editor.refresh("window.x();\n");

    let outcome = editor.handle_runtime_error("TypeError: window.x is not a function");
    assert!(matches!(outcome, HealOutcome::Repaired { .. }));
    assert_eq!(editor.program(), "healed();");
}

#[test]
fn recurring_error_on_healed_program_is_a_fresh_cycle() {
    let synth = StubSynth::failing();
    let mut editor = session(
        &synth,
        Arc::new(MemoryStore::new()),
        SessionOptions::default(),
    );
    editor.refresh("window.x();\n");

    assert!(matches!(
        editor.handle_runtime_error("boom"),
        HealOutcome::Repaired { .. }
    ));
    // the program text changed, so the same error text gets a fresh budget
    assert!(matches!(
        editor.handle_runtime_error("boom"),
        HealOutcome::Repaired { .. }
    ));
}
