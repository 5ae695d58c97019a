//! Common-sense plausibility evaluation.
//!
//! Content is reduced to a small [`CommonSenseContext`], then each rule
//! inspects it independently and appends at most one flag.

use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CsdmaFlag {
    #[serde(rename = "Physical_Implausibility")]
    #[strum(serialize = "Physical_Implausibility")]
    PhysicalImplausibility,
    #[serde(rename = "Chemical_Biological_Implausibility")]
    #[strum(serialize = "Chemical_Biological_Implausibility")]
    ChemicalBiologicalImplausibility,
    #[serde(rename = "Resource_Improbable")]
    #[strum(serialize = "Resource_Improbable")]
    ResourceImprobable,
    #[serde(rename = "Immediate_Consequence_Risk")]
    #[strum(serialize = "Immediate_Consequence_Risk")]
    ImmediateConsequenceRisk,
    #[serde(rename = "Atypical_Without_Precedent")]
    #[strum(serialize = "Atypical_Without_Precedent")]
    AtypicalWithoutPrecedent,
}

/// The minimal world model extracted from a thought.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonSenseContext {
    /// Agents and objects mentioned, in order of appearance.
    pub entities: Vec<String>,
    pub environment: String,
    pub timeframe: String,
    pub physical_properties: Vec<String>,
    #[serde(skip)]
    words: Vec<String>,
}

impl CommonSenseContext {
    fn mentions(&self, phrase: &[&str]) -> bool {
        if phrase.is_empty() || phrase.len() > self.words.len() {
            return false;
        }
        self.words
            .windows(phrase.len())
            .any(|window| window.iter().zip(phrase).all(|(w, p)| word_matches(w, p)))
    }

    fn mentions_any(&self, phrases: &[&[&str]]) -> bool {
        phrases.iter().any(|phrase| self.mentions(phrase))
    }

    fn has_entity_in(&self, lexicon: &[&str]) -> bool {
        self.entities.iter().any(|e| lexicon.contains(&e.as_str()))
    }
}

/// `pattern` ending in `*` matches any word with that prefix.
fn word_matches(word: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => word.starts_with(prefix),
        None => word == pattern,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsdmaResult {
    /// 0 (implausible) ..= 10 (entirely ordinary).
    pub score: u8,
    pub flags: Vec<CsdmaFlag>,
    pub context: CommonSenseContext,
}

impl CsdmaResult {
    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(ToString::to_string).collect()
    }
}

/// Turns the flags raised for a thought into a score.
pub trait ScoringStrategy: Send + Sync {
    fn score(&self, flags: &[CsdmaFlag]) -> u8;
}

/// One point off per flag, floored at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearDeduction;

impl ScoringStrategy for LinearDeduction {
    fn score(&self, flags: &[CsdmaFlag]) -> u8 {
        let deduction = u8::try_from(flags.len()).unwrap_or(u8::MAX);
        10u8.saturating_sub(deduction)
    }
}

// ─── Lexicons ───────────────────────────────────────────────────────────────

const AGENTS: &[&str] = &[
    "human", "humans", "person", "people", "man", "woman", "child", "someone", "i", "you", "he",
    "she", "they",
];

const MASSIVE_OBJECTS: &[&str] = &[
    "building", "buildings", "mountain", "mountains", "house", "ship", "planet", "train", "truck",
    "skyscraper", "bridge",
];

const FEATS: &[&[&str]] = &[
    &["lift*"],
    &["carry*"],
    &["throw*"],
    &["push*"],
    &["move*"],
    &["pick", "up"],
];

const ENVIRONMENTS: &[&str] = &[
    "space",
    "underwater",
    "ocean",
    "moon",
    "mars",
    "desert",
    "indoors",
    "outdoors",
    "earth",
];

const INSTANT: &[&str] = &["instantly", "immediately", "now", "overnight", "instantaneously"];
const FUTURE: &[&str] = &["tomorrow", "later", "eventually", "soon"];
const PROPERTIES: &[&str] = &["heavy", "hot", "cold", "fast", "massive", "tiny", "fragile"];

const PHYSICAL: &[&[&str]] = &[
    &["conservation", "of", "energy"],
    &["perpetual", "motion"],
    &["faster", "than", "light"],
    &["time", "travel*"],
    &["infinite", "energy"],
    &["teleport*"],
    &["antigravity"],
    &["levitat*"],
];

const CHEMICAL_BIOLOGICAL: &[&[&str]] = &[
    &["lead", "into", "gold"],
    &["breathe", "underwater"],
    &["breathe", "in", "space"],
    &["live", "forever"],
    &["immortal*"],
    &["without", "oxygen"],
    &["regrow*"],
];

const IMMEDIATE_CONSEQUENCE: &[&[&str]] = &[
    &["jump", "off"],
    &["explod*"],
    &["detonat*"],
    &["poison*"],
    &["set", "fire"],
    &["electrocut*"],
    &["overdos*"],
    &["drink", "bleach"],
];

const UNPRECEDENTED: &[&[&str]] = &[
    &["never", "been", "done"],
    &["first", "ever"],
    &["unprecedented"],
    &["no", "one", "has", "ever"],
    &["nobody", "has", "ever"],
];

// ─── Evaluator ──────────────────────────────────────────────────────────────

pub struct CommonSenseDma {
    strategy: Box<dyn ScoringStrategy>,
}

impl CommonSenseDma {
    pub fn new() -> Self {
        Self::with_strategy(Box::new(LinearDeduction))
    }

    pub fn with_strategy(strategy: Box<dyn ScoringStrategy>) -> Self {
        Self { strategy }
    }

    pub fn extract_context(content: &str) -> CommonSenseContext {
        let words: Vec<String> = content
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();

        let mut entities = Vec::new();
        let mut properties = Vec::new();
        for word in &words {
            let known = AGENTS.contains(&word.as_str()) || MASSIVE_OBJECTS.contains(&word.as_str());
            if known && !entities.contains(word) {
                entities.push(word.clone());
            }
            if MASSIVE_OBJECTS.contains(&word.as_str()) && !properties.iter().any(|p| p == "massive") {
                properties.push("massive".to_string());
            }
            if PROPERTIES.contains(&word.as_str()) && !properties.contains(word) {
                properties.push(word.clone());
            }
        }

        let environment = words
            .iter()
            .find(|w| ENVIRONMENTS.contains(&w.as_str()))
            .cloned()
            .unwrap_or_else(|| "unspecified".to_string());

        let timeframe = if words.iter().any(|w| INSTANT.contains(&w.as_str())) {
            "instant"
        } else if words.iter().any(|w| FUTURE.contains(&w.as_str())) {
            "future"
        } else {
            "unspecified"
        };

        CommonSenseContext {
            entities,
            environment,
            timeframe: timeframe.to_string(),
            physical_properties: properties,
            words,
        }
    }

    pub fn evaluate(&self, content: &str) -> CsdmaResult {
        let context = Self::extract_context(content);
        let rules: [(CsdmaFlag, fn(&CommonSenseContext) -> bool); 5] = [
            (CsdmaFlag::PhysicalImplausibility, |c| c.mentions_any(PHYSICAL)),
            (CsdmaFlag::ChemicalBiologicalImplausibility, |c| {
                c.mentions_any(CHEMICAL_BIOLOGICAL)
            }),
            (CsdmaFlag::ResourceImprobable, resource_improbable),
            (CsdmaFlag::ImmediateConsequenceRisk, |c| {
                c.mentions_any(IMMEDIATE_CONSEQUENCE)
            }),
            (CsdmaFlag::AtypicalWithoutPrecedent, |c| {
                c.mentions_any(UNPRECEDENTED)
            }),
        ];

        let flags: Vec<CsdmaFlag> = rules
            .iter()
            .filter(|(_, rule)| rule(&context))
            .map(|(flag, _)| *flag)
            .collect();
        let score = self.strategy.score(&flags);
        CsdmaResult {
            score,
            flags,
            context,
        }
    }
}

impl Default for CommonSenseDma {
    fn default() -> Self {
        Self::new()
    }
}

/// An agent performing a feat of strength on a massive object.
fn resource_improbable(context: &CommonSenseContext) -> bool {
    context.has_entity_in(AGENTS)
        && context.has_entity_in(MASSIVE_OBJECTS)
        && context.mentions_any(FEATS)
}
