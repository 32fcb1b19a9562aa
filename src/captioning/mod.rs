//! Caption generation for training images.
//!
//! Captions are derived from the prompt template an image was rendered from,
//! never from the image itself. The caption opens with the subject's gender
//! tag and the template category, followed by situational tags whose trigger
//! phrases appear in the template. Tags that describe permanent identity
//! traits are dropped: those traits must be learned by the adapter, not
//! attributed to the caption.

use std::sync::Arc;

use regex::Regex;

use crate::catalog::PromptCatalog;
use crate::models::CandidateImage;

/// Situational tags and the template phrases that trigger them.
const TAG_RULES: &[(&str, &[&str])] = &[
    ("looking at viewer", &["looking at camera", "looking at the camera"]),
    ("looking away", &["looking away", "looking slightly away"]),
    ("looking up", &["looking up"]),
    ("looking down", &["looking down"]),
    ("side profile", &["side profile", "profile"]),
    ("three-quarter view", &["three-quarter view", "three-quarter"]),
    ("smiling", &["smiling", "smile"]),
    ("laughing", &["laughing"]),
    ("serious expression", &["serious"]),
    ("neutral expression", &["neutral expression"]),
    ("studio lighting", &["studio lighting", "studio background", "studio"]),
    ("natural light", &["natural light", "window light", "daytime", "by a window"]),
    ("dramatic lighting", &["dramatic lighting", "rim lighting"]),
    ("golden hour", &["golden hour"]),
    ("sunlight", &["sunlight"]),
    ("overcast", &["overcast"]),
    ("night", &["at night", "night"]),
    ("neon lighting", &["neon"]),
    ("outdoors", &["outdoors", "outdoor", "park", "beach", "mountain trail"]),
    ("indoors", &["indoors", "cafe", "kitchen", "office", "library", "living room"]),
    ("city street", &["city street", "street"]),
    ("sitting", &["sitting"]),
    ("standing", &["standing"]),
    ("walking", &["walking", "hiking"]),
    ("reading", &["reading"]),
    ("cooking", &["cooking"]),
    ("umbrella", &["umbrella"]),
    ("rain", &["in the rain", "rain"]),
    ("blazer", &["blazer"]),
    ("hoodie", &["hoodie"]),
    ("formal attire", &["formal attire", "suit", "gown"]),
    ("casual", &["casual"]),
    ("shallow depth of field", &["shallow depth of field", "bokeh"]),
    ("candid", &["candid"]),
];

/// Permanent identity traits. A tag matching any of these is never emitted.
const IDENTITY_TERMS: &[&str] = &[
    "skin",
    "complexion",
    "pale",
    "tanned",
    "freckles",
    "body type",
    "slim",
    "skinny",
    "curvy",
    "muscular",
    "petite",
    "plus size",
    "tall",
    "short",
    "blonde",
    "brunette",
    "redhead",
    "hair",
    "bald",
    "eyes",
    "eye color",
    "ethnicity",
    "asian",
    "african",
    "caucasian",
    "latina",
    "latino",
    "age",
    "tattoo",
    "birthmark",
];

/// Builds a case-insensitive, word-bounded alternation. `None` if nothing compiles.
fn phrase_regex(phrases: &[&str]) -> Option<Regex> {
    if phrases.is_empty() {
        return None;
    }
    let alternation = phrases
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).ok()
}

struct TagRule {
    tag: String,
    trigger: Regex,
}

pub struct Captioner {
    catalog: Arc<PromptCatalog>,
    rules: Vec<TagRule>,
    deny: Option<Regex>,
}

impl Captioner {
    pub fn new(catalog: Arc<PromptCatalog>) -> Self {
        let rules = TAG_RULES
            .iter()
            .filter_map(|(tag, triggers)| {
                phrase_regex(triggers).map(|trigger| TagRule {
                    tag: tag.to_string(),
                    trigger,
                })
            })
            .collect();

        Self {
            catalog,
            rules,
            deny: phrase_regex(IDENTITY_TERMS),
        }
    }

    /// Adds a tag rule after the built-in ones.
    pub fn with_rule(mut self, tag: impl Into<String>, triggers: &[&str]) -> Self {
        if let Some(trigger) = phrase_regex(triggers) {
            self.rules.push(TagRule {
                tag: tag.into(),
                trigger,
            });
        }
        self
    }

    fn denied(&self, tag: &str) -> bool {
        self.deny.as_ref().is_some_and(|re| re.is_match(tag))
    }

    /// Tags for a raw template text, without the leading gender tag.
    pub fn tags_for(&self, category: &str, template_text: &str) -> Vec<String> {
        let mut tags = Vec::new();
        let category = category.replace('_', " ");
        if !category.is_empty() {
            tags.push(category);
        }

        for rule in &self.rules {
            if rule.trigger.is_match(template_text)
                && !self.denied(&rule.tag)
                && !tags.contains(&rule.tag)
            {
                tags.push(rule.tag.clone());
            }
        }
        tags
    }

    /// Caption for one image. Deterministic for a given catalog.
    ///
    /// Images whose prompt is no longer in the catalog get the gender tag alone.
    pub fn caption(&self, image: &CandidateImage, gender_tag: &str) -> String {
        let mut parts = vec![gender_tag.trim().to_string()];
        if let Some(template) = self.catalog.get(&image.prompt_id) {
            parts.extend(self.tags_for(&template.category, &template.text));
        }
        parts.retain(|p| !p.is_empty());
        parts.join(", ")
    }
}
