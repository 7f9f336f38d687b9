use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryScore {
    pub category: String,
    pub score: f64,
    pub emoji: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleTipGroup {
    pub category: String,
    pub tips: Vec<String>,
}

/// Which stage of the fallback chain produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    DirectJson,
    ExtractedJson,
    MarkdownFallback,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub total_score: i32,
    pub breakdown: Vec<CategoryScore>,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_tips: Option<Vec<StyleTipGroup>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_level_tips: Option<Vec<String>>,
    pub origin: Origin,
}

/// Request context the caller already has; carried for diagnostics and
/// the default result's feedback copy.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub requested_style: String,
}

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

struct Tuning {
    score_min: f64,
    score_max: f64,
    neutral_total: f64,
    flat_std_threshold: f64,
    perturbation_cycle: &'static [f64],
    feedback_fallback_lines: usize,
}

static TUNING: Tuning = Tuning {
    score_min: 1.0,
    score_max: 10.0,
    neutral_total: 7.0,
    flat_std_threshold: 0.5,
    perturbation_cycle: &[-0.5, 0.0, 0.5, 1.0, -1.0],
    feedback_fallback_lines: 3,
};

// ---------------------------------------------------------------------------
// Category catalog
// ---------------------------------------------------------------------------

struct CategorySpec {
    name: &'static str,
    emoji: &'static str,
}

static CATALOG: &[CategorySpec] = &[
    CategorySpec {
        name: "Color Coordination",
        emoji: "\u{1F3A8}",
    },
    CategorySpec {
        name: "Fit & Proportion",
        emoji: "\u{1F4CF}",
    },
    CategorySpec {
        name: "Style Coherence",
        emoji: "\u{2728}",
    },
    CategorySpec {
        name: "Accessories",
        emoji: "\u{1F48D}",
    },
    CategorySpec {
        name: "Outfit Creativity",
        emoji: "\u{1F3AF}",
    },
    CategorySpec {
        name: "Trend Awareness",
        emoji: "\u{1F31F}",
    },
    CategorySpec {
        name: "Overall Style",
        emoji: "\u{1F451}",
    },
];

struct CategoryPatterns {
    spec: &'static CategorySpec,
    score_re: Regex,
    detail_re: Regex,
}

static CATALOG_PATTERNS: Lazy<Vec<CategoryPatterns>> = Lazy::new(|| {
    CATALOG
        .iter()
        .map(|spec| {
            let label = regex::escape(spec.name);
            CategoryPatterns {
                spec,
                score_re: Regex::new(&format!(
                    r"(?i){label}[^\w\n:]*:\s*\**\s*(\d+(?:\.\d+)?)"
                ))
                .unwrap(),
                detail_re: Regex::new(&format!(r"(?i)\*\*{label}\*\*[^\w\n:]*:\s*([^*]+)"))
                    .unwrap(),
            }
        })
        .collect()
});

fn emoji_for(category: &str) -> &'static str {
    CATALOG
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(category.trim()))
        .map(|spec| spec.emoji)
        .unwrap_or("\u{2728}")
}

// ---------------------------------------------------------------------------
// Compiled patterns
// ---------------------------------------------------------------------------

static FENCED_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

static BLANK_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());

static TOTAL_SCORE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:overall|total)\s+score[^\w\n:]*:\s*\**\s*(\d+(?:\.\d+)?)").unwrap()
});

static FEEDBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\b(?:overall\s+feedback|feedback|summary)\**\s*:\s*(.+?)(?:\n\s*\n|\n\s*#|\n\s*\*\*|\z)")
        .unwrap()
});

static STYLE_TIPS_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*\*\*([^*]+?)\*\*\s*tips?\s*:").unwrap());

static NEXT_LEVEL_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:\*\*\s*next\s+level\s*\*\*|advanced\s+tips\s*:)").unwrap()
});

static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*]|\d+\.)\s+(.+)$").unwrap());

static DETAIL_SCORE_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+(?:\.\d+)?\s*(?:/\s*10)?\s*[-:,.]*\s*").unwrap());

// ---------------------------------------------------------------------------
// Wire shape (what the model is asked to emit)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAnalysis {
    #[serde(default)]
    total_score: Option<f64>,
    #[serde(default)]
    breakdown: Vec<WireCategory>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    style_tips: Vec<WireTipGroup>,
    #[serde(default)]
    next_level_tips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    category: String,
    score: f64,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTipGroup {
    category: String,
    #[serde(default)]
    tips: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pipeline intermediate
// ---------------------------------------------------------------------------

struct Draft {
    total_score: Option<f64>,
    breakdown: Vec<CategoryScore>,
    feedback: Option<String>,
    style_tips: Vec<StyleTipGroup>,
    next_level_tips: Vec<String>,
    origin: Origin,
}

fn wire_into_draft(wire: WireAnalysis, origin: Origin) -> Option<Draft> {
    if wire.breakdown.is_empty() {
        return None;
    }
    let breakdown = wire
        .breakdown
        .into_iter()
        .map(|c| {
            let emoji = c
                .emoji
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| emoji_for(&c.category).to_string());
            CategoryScore {
                emoji,
                score: c.score,
                details: c.details.filter(|d| !d.trim().is_empty()),
                category: c.category,
            }
        })
        .collect();
    let style_tips = wire
        .style_tips
        .into_iter()
        .filter(|g| !g.tips.is_empty())
        .map(|g| StyleTipGroup {
            category: g.category,
            tips: g.tips,
        })
        .collect();
    Some(Draft {
        total_score: wire.total_score,
        breakdown,
        feedback: wire.feedback,
        style_tips,
        next_level_tips: wire.next_level_tips,
        origin,
    })
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

fn try_direct_json(raw: &str) -> Option<Draft> {
    let wire: WireAnalysis = serde_json::from_str(raw.trim()).ok()?;
    wire_into_draft(wire, Origin::DirectJson)
}

fn outer_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

fn json_candidates(raw: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    if let Some(span) = outer_brace_span(raw) {
        candidates.push(span);
    }
    if let Some(caps) = FENCED_BLOCK_RE.captures(raw) {
        candidates.push(caps.get(1).unwrap().as_str());
    }
    for block in BLANK_LINE_RE.split(raw) {
        let block = block.trim();
        if block.starts_with('{') && block.ends_with('}') {
            candidates.push(block);
        }
    }
    candidates
}

fn try_extracted_json(raw: &str) -> Option<Draft> {
    for candidate in json_candidates(raw) {
        match serde_json::from_str::<WireAnalysis>(candidate.trim()) {
            Ok(wire) => {
                if let Some(draft) = wire_into_draft(wire, Origin::ExtractedJson) {
                    return Some(draft);
                }
            }
            Err(_) => trace!("embedded JSON candidate failed to parse"),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Markdown fallback
// ---------------------------------------------------------------------------

fn leading_lines_feedback(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(TUNING.feedback_fallback_lines)
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_feedback(raw: &str) -> Option<String> {
    let section = FEEDBACK_RE
        .captures(raw)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty());
    section.or_else(|| {
        let lines = leading_lines_feedback(raw);
        if lines.is_empty() {
            None
        } else {
            Some(lines)
        }
    })
}

fn extract_detail(pats: &CategoryPatterns, raw: &str) -> Option<String> {
    let caps = pats.detail_re.captures(raw)?;
    let detail = DETAIL_SCORE_PREFIX_RE
        .replace(caps[1].trim(), "")
        .trim()
        .to_string();
    if detail.is_empty() {
        None
    } else {
        Some(detail)
    }
}

fn collect_bullets(lines: &[&str], start: usize) -> Vec<String> {
    let mut tips = Vec::new();
    for line in &lines[start..] {
        if let Some(caps) = BULLET_RE.captures(line) {
            tips.push(caps[1].trim().to_string());
        } else if line.trim().is_empty() && tips.is_empty() {
            // blank line between header and first bullet
            continue;
        } else {
            break;
        }
    }
    tips
}

fn extract_style_tips(lines: &[&str]) -> Vec<StyleTipGroup> {
    let mut groups: Vec<StyleTipGroup> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if NEXT_LEVEL_HEADER_RE.is_match(line) {
            continue;
        }
        let Some(caps) = STYLE_TIPS_HEADER_RE.captures(line) else {
            continue;
        };
        let category = caps[1].trim().to_string();
        if groups
            .iter()
            .any(|g| g.category.eq_ignore_ascii_case(&category))
        {
            continue;
        }
        let tips = collect_bullets(lines, i + 1);
        if !tips.is_empty() {
            groups.push(StyleTipGroup { category, tips });
        }
    }
    groups
}

fn extract_next_level_tips(lines: &[&str]) -> Vec<String> {
    for (i, line) in lines.iter().enumerate() {
        if NEXT_LEVEL_HEADER_RE.is_match(line) {
            let tips = collect_bullets(lines, i + 1);
            if !tips.is_empty() {
                return tips;
            }
        }
    }
    Vec::new()
}

fn try_markdown_fallback(raw: &str) -> Option<Draft> {
    let mut breakdown = Vec::new();
    for pats in CATALOG_PATTERNS.iter() {
        let Some(caps) = pats.score_re.captures(raw) else {
            continue;
        };
        let Ok(score) = caps[1].parse::<f64>() else {
            continue;
        };
        breakdown.push(CategoryScore {
            category: pats.spec.name.to_string(),
            score,
            emoji: pats.spec.emoji.to_string(),
            details: extract_detail(pats, raw),
        });
    }
    if breakdown.is_empty() {
        trace!("markdown fallback matched no catalog categories");
        return None;
    }

    let total_score = TOTAL_SCORE_RE
        .captures(raw)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .or(Some(TUNING.neutral_total));
    let lines: Vec<&str> = raw.lines().collect();
    Some(Draft {
        total_score,
        breakdown,
        feedback: extract_feedback(raw),
        style_tips: extract_style_tips(&lines),
        next_level_tips: extract_next_level_tips(&lines),
        origin: Origin::MarkdownFallback,
    })
}

// ---------------------------------------------------------------------------
// Validation & repair
// ---------------------------------------------------------------------------

fn population_std(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    variance.sqrt()
}

fn rounded_mean_total(breakdown: &[CategoryScore]) -> i32 {
    let mean = breakdown.iter().map(|c| c.score).sum::<f64>() / breakdown.len() as f64;
    (mean.round() as i32).clamp(TUNING.score_min as i32, TUNING.score_max as i32)
}

fn neutral_feedback(ctx: &NormalizeContext) -> String {
    format!(
        "A solid {} foundation: the pieces work together, and a clearer focal point plus one deliberate accent would take this look further.",
        ctx.requested_style
    )
}

fn validate_and_repair(draft: Draft, ctx: &NormalizeContext) -> AnalysisResult {
    let mut seen: HashSet<String> = HashSet::new();
    let mut breakdown: Vec<CategoryScore> = draft
        .breakdown
        .into_iter()
        .filter(|c| seen.insert(c.category.trim().to_lowercase()))
        .collect();
    if breakdown.is_empty() {
        return default_result(ctx);
    }

    for c in &mut breakdown {
        c.score = c.score.clamp(TUNING.score_min, TUNING.score_max);
    }

    let scores: Vec<f64> = breakdown.iter().map(|c| c.score).collect();
    let std_dev = population_std(&scores);
    if std_dev < TUNING.flat_std_threshold {
        debug!(std_dev, "flat category scores, applying perturbation cycle");
        let cycle = TUNING.perturbation_cycle;
        for (i, c) in breakdown.iter_mut().enumerate() {
            c.score = (c.score + cycle[i % cycle.len()]).clamp(TUNING.score_min, TUNING.score_max);
        }
    }

    let total_score = rounded_mean_total(&breakdown);
    if let Some(extracted) = draft.total_score {
        if (extracted.round() as i32) != total_score {
            trace!(
                extracted,
                total_score,
                "extracted total disagreed with breakdown mean"
            );
        }
    }

    let feedback = draft
        .feedback
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| neutral_feedback(ctx));

    AnalysisResult {
        total_score,
        breakdown,
        feedback,
        style_tips: if draft.style_tips.is_empty() {
            None
        } else {
            Some(draft.style_tips)
        },
        next_level_tips: if draft.next_level_tips.is_empty() {
            None
        } else {
            Some(draft.next_level_tips)
        },
        origin: draft.origin,
    }
}

// ---------------------------------------------------------------------------
// Default result
// ---------------------------------------------------------------------------

static DEFAULT_BREAKDOWN: &[(&str, f64, &str)] = &[
    (
        "Color Coordination",
        6.0,
        "The palette hangs together without a clear focal color.",
    ),
    (
        "Fit & Proportion",
        7.0,
        "Silhouette and proportions read balanced overall.",
    ),
    (
        "Style Coherence",
        6.0,
        "The pieces agree on a direction, if not a statement.",
    ),
    (
        "Accessories",
        5.0,
        "Accessories are minimal; one deliberate accent would help.",
    ),
    (
        "Outfit Creativity",
        7.0,
        "There are personal touches here worth building on.",
    ),
    (
        "Trend Awareness",
        6.0,
        "Current without chasing any single trend.",
    ),
];

fn default_result(ctx: &NormalizeContext) -> AnalysisResult {
    debug!(
        style = %ctx.requested_style,
        "no usable breakdown extracted, substituting default result"
    );
    let breakdown: Vec<CategoryScore> = DEFAULT_BREAKDOWN
        .iter()
        .map(|&(name, score, details)| CategoryScore {
            category: name.to_string(),
            score,
            emoji: emoji_for(name).to_string(),
            details: Some(details.to_string()),
        })
        .collect();
    AnalysisResult {
        total_score: rounded_mean_total(&breakdown),
        breakdown,
        feedback: neutral_feedback(ctx),
        style_tips: None,
        next_level_tips: None,
        origin: Origin::Default,
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Normalize raw model output into a well-formed [`AnalysisResult`].
///
/// Total function: malformed input degrades through the fallback chain
/// (direct JSON, embedded JSON, markdown patterns) and bottoms out at a
/// deterministic default result. Never panics, never errors.
pub fn normalize(raw_text: &str, ctx: &NormalizeContext) -> AnalysisResult {
    let draft = try_direct_json(raw_text)
        .or_else(|| try_extracted_json(raw_text))
        .or_else(|| try_markdown_fallback(raw_text));
    let result = match draft {
        Some(draft) => validate_and_repair(draft, ctx),
        None => default_result(ctx),
    };
    debug!(
        origin = ?result.origin,
        total = result.total_score,
        categories = result.breakdown.len(),
        "normalized model response"
    );
    result
}

// ---------------------------------------------------------------------------
// Unit tests for extraction internals
// ---------------------------------------------------------------------------
