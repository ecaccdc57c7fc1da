//! Context Window Manager: bounds the material sent to a provider.
//!
//! [`ContextWindowManager::compress`] turns task + background into a tiered
//! prompt that fits a token budget; [`ContextWindowManager::prune`] trims a
//! running conversation before each provider call.

pub mod extract;
pub mod history;
pub mod tokens;

use std::sync::Arc;

use tracing::{debug, warn};

use tether_core::messages::Message;
use tether_settings::ContextSettings;
use tether_telemetry::metrics::{names, MetricsRecorder};

use self::extract::SalientUnits;
use self::history::PrunedHistory;
use self::tokens::estimate_text_tokens;

const TASK_HEADER: &str = "## Task";
const DELIVERABLES_HEADER: &str = "## Expected Deliverables";
const CRITICAL_HEADER: &str = "## Critical Constraints";
const CONTEXT_HEADER: &str = "## Key Context";
const COMPONENTS_HEADER: &str = "## Related Components";
const BACKGROUND_HEADER: &str = "## Background";

/// Why a compressed context failed validation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("task requirement missing from compressed context: {line}")]
    TaskRequirementMissing { line: String },

    #[error("excessive compression: ratio {ratio:.3} below floor {floor:.3}")]
    ExcessiveCompression { ratio: f64, floor: f64 },
}

/// Bounded prompt material plus the bookkeeping needed to judge it.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedContext {
    pub text: String,
    pub estimated_tokens: usize,
    pub original_tokens: usize,
    /// Output length over input length, in bytes.
    pub compression_ratio: f64,
    pub warnings: Vec<String>,
    pub violation: Option<IntegrityViolation>,
}

impl CompressedContext {
    /// Task requirements preserved and compression within bounds.
    pub fn is_intact(&self) -> bool {
        self.violation.is_none()
    }
}

/// Inputs to one compression.
#[derive(Clone, Copy, Debug)]
pub struct CompressRequest<'a> {
    pub task: &'a str,
    pub background: &'a str,
    pub deliverable_spec: &'a str,
    pub budget_tokens: usize,
    /// Role keywords that promote matching constraints to the critical tier.
    pub domain_keywords: &'a [String],
}

/// One tier's greedy packer: items go in whole, in order, until the next
/// one would overflow the allocation.
struct Tier {
    allocation: usize,
    used: usize,
    items: Vec<String>,
}

impl Tier {
    fn new(allocation: usize) -> Self {
        Self {
            allocation,
            used: 0,
            items: Vec::new(),
        }
    }

    /// Returns false once the tier is full; later items are not tried.
    fn offer(&mut self, item: &str) -> bool {
        let cost = estimate_text_tokens(item) + 1;
        if self.used + cost > self.allocation {
            return false;
        }
        self.used += cost;
        self.items.push(item.to_string());
        true
    }

    fn fill<'a>(&mut self, items: impl IntoIterator<Item = &'a String>) {
        for item in items {
            if !self.offer(item) {
                break;
            }
        }
    }
}

pub struct ContextWindowManager {
    settings: ContextSettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ContextWindowManager {
    pub fn new(settings: ContextSettings) -> Self {
        Self {
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Compress task, background and deliverable spec into `budget_tokens`.
    ///
    /// The task text is always emitted verbatim. Tiers:
    /// - task share: task text (always) then the deliverable spec
    /// - critical share: constraints matching the role's domain keywords
    ///   (all constraints when the role has none)
    /// - general share: newest decisions, remaining constraints,
    ///   relationships, then entity names
    ///
    /// Once every salient unit is in, whatever budget is left takes the
    /// remaining background passages in source order.
    pub fn compress(&self, req: CompressRequest<'_>) -> CompressedContext {
        let s = &self.settings;
        let budget = req.budget_tokens as f64;
        let units = extract::extract(req.background);

        let mut task_tier = Tier::new((budget * s.task_share) as usize);
        task_tier.used = estimate_text_tokens(req.task);
        let deliverable = req.deliverable_spec.trim();
        if !deliverable.is_empty() {
            task_tier.offer(deliverable);
        }

        let (critical, general_constraints) = partition_constraints(&units, req.domain_keywords);
        let mut critical_tier = Tier::new((budget * s.critical_share) as usize);
        critical_tier.fill(&critical);

        let mut context_tier = Tier::new((budget * s.general_share) as usize);
        let mut general: Vec<&String> = units.decisions.iter().rev().collect();
        general.extend(&general_constraints);
        general.extend(&units.relationships);
        context_tier.fill(general);

        // entity names share whatever the general tier has left
        let mut components_tier = Tier::new(context_tier.allocation.saturating_sub(context_tier.used));
        let context_complete =
            context_tier.items.len() == units.decisions.len() + general_constraints.len() + units.relationships.len();
        if context_complete {
            components_tier.fill(&units.entities);
        }

        let spent = task_tier.used + critical_tier.used + context_tier.used + components_tier.used;
        let mut background_tier = Tier::new(req.budget_tokens.saturating_sub(spent));
        if context_complete
            && critical_tier.items.len() == critical.len()
            && components_tier.items.len() == units.entities.len()
        {
            background_tier.fill(&units.passages);
        }

        let text = render(
            req.task,
            &task_tier,
            [&critical_tier, &context_tier, &components_tier, &background_tier],
        );

        let original_len = req.task.len() + req.background.len() + req.deliverable_spec.len();
        let compression_ratio = if original_len == 0 {
            1.0
        } else {
            text.len() as f64 / original_len as f64
        };
        let original_tokens = estimate_text_tokens(req.task)
            + estimate_text_tokens(req.background)
            + estimate_text_tokens(req.deliverable_spec);

        let mut out = CompressedContext {
            estimated_tokens: estimate_text_tokens(&text),
            text,
            original_tokens,
            compression_ratio,
            warnings: Vec::new(),
            violation: None,
        };
        self.validate(req.task, &mut out);

        if let Some(m) = &self.metrics {
            m.histogram_observe(names::CONTEXT_COMPRESSION_RATIO, &[], compression_ratio);
            if !out.warnings.is_empty() {
                m.counter_inc(names::CONTEXT_INTEGRITY_WARNINGS, &[], out.warnings.len() as u64);
            }
        }
        debug!(
            budget = req.budget_tokens,
            estimated_tokens = out.estimated_tokens,
            original_tokens,
            ratio = compression_ratio,
            "context compressed"
        );
        out
    }

    /// Check the task survived verbatim, line by line, and that compression
    /// did not discard more than the configured floor allows.
    fn validate(&self, task: &str, out: &mut CompressedContext) {
        for line in task.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !out.text.contains(line) {
                let v = IntegrityViolation::TaskRequirementMissing { line: line.to_string() };
                warn!(error = %v, "context integrity violation");
                out.warnings.push(v.to_string());
                out.violation = Some(v);
                return;
            }
        }

        let floor = self.settings.min_compression_ratio;
        if out.compression_ratio < floor {
            let v = IntegrityViolation::ExcessiveCompression {
                ratio: out.compression_ratio,
                floor,
            };
            if self.settings.allow_aggressive {
                debug!(ratio = out.compression_ratio, "aggressive compression allowed");
            } else {
                warn!(error = %v, "context integrity violation");
                out.warnings.push(v.to_string());
                out.violation = Some(v);
            }
        }
    }

    /// Prune conversation history for the next provider call.
    pub fn prune(&self, messages: &[Message]) -> PrunedHistory {
        let pruned = history::prune_history(messages, &self.settings);
        if pruned.emergency {
            warn!(
                dropped = pruned.dropped,
                estimated_tokens = pruned.estimated_tokens,
                "emergency history pruning"
            );
        }
        pruned
    }
}

/// Split constraints into those naming a domain keyword and the rest.
fn partition_constraints(units: &SalientUnits, keywords: &[String]) -> (Vec<String>, Vec<String>) {
    if keywords.is_empty() {
        return (units.constraints.clone(), Vec::new());
    }
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    units
        .constraints
        .iter()
        .cloned()
        .partition(|c| {
            let lc = c.to_lowercase();
            lowered.iter().any(|k| lc.contains(k.as_str()))
        })
}

fn render(task: &str, task_tier: &Tier, [critical, context, components, background]: [&Tier; 4]) -> String {
    let mut out = format!("{TASK_HEADER}\n{task}\n");
    if let Some(spec) = task_tier.items.first() {
        out.push_str(&format!("\n{DELIVERABLES_HEADER}\n{spec}\n"));
    }
    push_list(&mut out, CRITICAL_HEADER, &critical.items);
    push_list(&mut out, CONTEXT_HEADER, &context.items);
    if !components.items.is_empty() {
        out.push_str(&format!("\n{COMPONENTS_HEADER}\n{}\n", components.items.join(", ")));
    }
    // passages are contiguous source text, so they read as one paragraph
    if !background.items.is_empty() {
        out.push_str(&format!("\n{BACKGROUND_HEADER}\n{}\n", background.items.join(" ")));
    }
    out
}

fn push_list(out: &mut String, header: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{header}\n"));
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}
