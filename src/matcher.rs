use crate::catalog::ProductRecord;
use crate::keys::stable_hash;
use crate::llm::{ChatModel, LlmError, LlmMessage, parse_json_reply};
use crate::taxonomy::index::normalize_category_id;
use crate::taxonomy::{TaxonomyIndex, TaxonomyNode};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = r#"
You are a product categorization expert. You receive a product group (a tag shared by every product
in it), a sample of its products and a list of candidate categories from the product taxonomy.
Choose the single most specific candidate that describes what these products ARE, not what they are
used with. You must pick an id from the candidate list exactly as written; never invent ids. If no
candidate fits, return null for category_id.
Respond with JSON only, in this shape:
{"category_id": "<candidate id or null>", "confidence": "high|medium|low", "reasoning": "<one or two sentences>"}
"#;

/// Model calls allowed per group: the first selection plus one retry.
const SELECTION_ATTEMPTS: usize = 2;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "by", "for", "from", "in", "into", "is", "it", "of",
        "on", "or", "the", "to", "with", "without", "new", "pack", "pcs", "pc", "set", "kit", "piece",
        "pieces", "size", "color", "colour", "inch", "inches", "cm", "mm", "kg", "lb", "lbs", "other",
        "misc", "accessories", "general", "products", "product", "item", "items", "sale",
    ]
    .into_iter()
    .collect()
});

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn parse_label(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "medium" | "med" | "moderate" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryMatch {
    pub tag: String,
    pub node: TaxonomyNode,
    pub confidence: Confidence,
    pub reasoning: String,
    #[serde(default)]
    pub sample_size: usize,
    #[serde(default)]
    pub candidate_count: usize,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no confident category match for `{tag}`: {reason}")]
    NoConfidentMatch { tag: String, reason: String },
    #[error("model selected `{0}`, which was not among the offered candidates")]
    InvalidModelSelection(String),
    #[error("unparseable match response: {0}")]
    MalformedResponse(String),
    #[error("language model call failed: {0}")]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub sample_size: usize,
    pub candidates: usize,
    pub min_confidence: Confidence,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            sample_size: 25,
            candidates: 50,
            min_confidence: Confidence::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub full_path: String,
    pub score: u32,
}

struct LeafTerms {
    id: String,
    full_path: String,
    depth: usize,
    name: HashSet<String>,
    path: HashSet<String>,
}

pub struct CategoryMatcher {
    index: Arc<TaxonomyIndex>,
    llm: Arc<dyn ChatModel>,
    config: MatcherConfig,
    leaves: Vec<LeafTerms>,
}

impl CategoryMatcher {
    pub fn new(index: Arc<TaxonomyIndex>, llm: Arc<dyn ChatModel>, config: MatcherConfig) -> Self {
        let leaves = index
            .all_leaf()
            .map(|node| LeafTerms {
                id: node.id.clone(),
                full_path: node.full_path.clone(),
                depth: node.depth(),
                name: tokenize(&node.name).collect(),
                path: tokenize(&node.full_path).collect(),
            })
            .collect();
        Self {
            index,
            llm,
            config,
            leaves,
        }
    }

    /// Picks at most `sample_size` products. Large groups are sampled with an
    /// RNG seeded from the tag, so the same group always yields the same
    /// sample; input order is kept.
    pub fn sample<'a>(&self, tag: &str, products: &'a [ProductRecord]) -> Vec<&'a ProductRecord> {
        let cap = self.config.sample_size.max(1);
        if products.len() <= cap {
            return products.iter().collect();
        }
        let mut rng = SmallRng::seed_from_u64(stable_hash(tag));
        let mut picked = rand::seq::index::sample(&mut rng, products.len(), cap).into_vec();
        picked.sort_unstable();
        picked.into_iter().map(|idx| &products[idx]).collect()
    }

    /// Ranks every leaf by keyword overlap and keeps the best `candidates`.
    /// Zero-score leaves pad the list so it is never empty.
    pub fn candidates(&self, keywords: &HashSet<String>) -> Vec<Candidate> {
        let mut scored: Vec<(u32, &LeafTerms)> = self
            .leaves
            .iter()
            .map(|leaf| {
                let score: u32 = keywords
                    .iter()
                    .map(|kw| {
                        let mut hit = 0;
                        if leaf.name.contains(kw) {
                            hit += 2;
                        }
                        if leaf.path.contains(kw) {
                            hit += 1;
                        }
                        hit
                    })
                    .sum();
                (score, leaf)
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then_with(|| b.depth.cmp(&a.depth))
                .then_with(|| a.full_path.len().cmp(&b.full_path.len()))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored
            .into_iter()
            .take(self.config.candidates.max(1))
            .map(|(score, leaf)| Candidate {
                id: leaf.id.clone(),
                full_path: leaf.full_path.clone(),
                score,
            })
            .collect()
    }

    pub async fn match_group(
        &self,
        tag: &str,
        products: &[ProductRecord],
    ) -> Result<CategoryMatch, MatchError> {
        let tag = tag.trim();
        let sample = self.sample(tag, products);
        let keywords = keywords(tag, &sample);
        let candidates = self.candidates(&keywords);
        if candidates.is_empty() {
            return Err(MatchError::NoConfidentMatch {
                tag: tag.to_string(),
                reason: "taxonomy has no leaf categories".into(),
            });
        }
        debug!(
            target = "metafield.matcher",
            tag = %tag,
            keywords = keywords.len(),
            candidates = candidates.len(),
            top_score = candidates[0].score,
            "candidate set ready"
        );

        let messages = self.prompt(tag, &sample, &candidates);
        let mut last_error = None;
        for attempt in 1..=SELECTION_ATTEMPTS {
            let response = self.llm.chat(&messages).await?;
            match self.select(tag, &response.text, &candidates) {
                Ok((node, confidence, reasoning)) => {
                    if confidence < self.config.min_confidence {
                        return Err(MatchError::NoConfidentMatch {
                            tag: tag.to_string(),
                            reason: format!(
                                "model confidence `{}` is below `{}`",
                                confidence.as_str(),
                                self.config.min_confidence.as_str()
                            ),
                        });
                    }
                    info!(
                        target = "metafield.matcher",
                        tag = %tag,
                        category_id = %node.id,
                        category = %node.full_path,
                        confidence = confidence.as_str(),
                        attempt,
                        "group matched"
                    );
                    return Ok(CategoryMatch {
                        tag: tag.to_string(),
                        node: node.clone(),
                        confidence,
                        reasoning,
                        sample_size: sample.len(),
                        candidate_count: candidates.len(),
                        matched_at: Utc::now(),
                    });
                }
                Err(err @ (MatchError::InvalidModelSelection(_) | MatchError::MalformedResponse(_))) => {
                    warn!(
                        target = "metafield.matcher",
                        tag = %tag,
                        attempt,
                        error = %err,
                        "rejected model selection"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| MatchError::MalformedResponse("no response".into())))
    }

    fn prompt(
        &self,
        tag: &str,
        sample: &[&ProductRecord],
        candidates: &[Candidate],
    ) -> Vec<LlmMessage> {
        let products = sample
            .iter()
            .enumerate()
            .map(|(idx, product)| {
                format!(
                    "{}. Title: {}\n   Type: {}\n   Vendor: {}\n   Tags: {}",
                    idx + 1,
                    product.title,
                    product.product_type.as_deref().unwrap_or("N/A"),
                    product.vendor.as_deref().unwrap_or("N/A"),
                    product.tags.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let categories = candidates
            .iter()
            .map(|candidate| {
                let attributes = self
                    .index
                    .lookup_by_id(&candidate.id)
                    .map(|node| {
                        node.attribute_defs
                            .iter()
                            .map(|def| def.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!("- {} | {} | attributes: {}", candidate.id, candidate.full_path, attributes)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "TAG: \"{tag}\"\n\nSAMPLE PRODUCTS:\n{products}\n\nCANDIDATE CATEGORIES (id | path | attributes):\n{categories}"
        );
        vec![LlmMessage::system(SYSTEM_PROMPT.trim()), LlmMessage::user(user)]
    }

    fn select<'a>(
        &'a self,
        tag: &str,
        text: &str,
        candidates: &[Candidate],
    ) -> Result<(&'a TaxonomyNode, Confidence, String), MatchError> {
        let response: MatchResponse = parse_json_reply(text)
            .map_err(|err| MatchError::MalformedResponse(err.to_string()))?;

        let raw_id = match response.category_id {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => {
                return Err(MatchError::MalformedResponse(format!(
                    "category_id is not a string: {other}"
                )));
            }
        };
        let id = normalize_category_id(&raw_id);
        if id.is_empty() || id.eq_ignore_ascii_case("none") || id.eq_ignore_ascii_case("null") {
            return Err(MatchError::NoConfidentMatch {
                tag: tag.to_string(),
                reason: response
                    .reasoning
                    .unwrap_or_else(|| "model returned no category".into()),
            });
        }
        if !candidates.iter().any(|candidate| candidate.id == id) {
            return Err(MatchError::InvalidModelSelection(id.to_string()));
        }
        let node = self
            .index
            .lookup_by_id(id)
            .map_err(|_| MatchError::InvalidModelSelection(id.to_string()))?;

        let confidence = match response.confidence.as_deref() {
            Some(label) => Confidence::parse_label(label).ok_or_else(|| {
                MatchError::MalformedResponse(format!("unknown confidence `{label}`"))
            })?,
            None => Confidence::Low,
        };
        Ok((node, confidence, response.reasoning.unwrap_or_default()))
    }
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    #[serde(default, alias = "id", alias = "categoryId")]
    category_id: Option<Value>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default, alias = "rationale")]
    reasoning: Option<String>,
}

/// Lowercased terms with stopwords, single characters and bare numbers
/// removed. A trailing plural `s` is dropped so `Speakers` meets `speaker`.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !ch.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() >= 2)
        .filter(|token| !token.chars().all(|ch| ch.is_ascii_digit()))
        .filter(|token| !STOPWORDS.contains(token.as_str()))
        .map(|token| stem(&token))
}

fn stem(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Keyword set for a group: the tag plus every sampled title and product type.
pub fn keywords(tag: &str, sample: &[&ProductRecord]) -> HashSet<String> {
    let mut keywords: HashSet<String> = tokenize(tag).collect();
    for product in sample {
        keywords.extend(tokenize(&product.title));
        if let Some(product_type) = product.product_type.as_deref() {
            keywords.extend(tokenize(product_type));
        }
    }
    keywords
}
