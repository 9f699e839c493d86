//! Business rule evaluation
//!
//! Rules are evaluated against candidate metadata. Boost and penalty rules adjust the
//! score, filter and requirement rules decide whether a candidate stays in the set.
use crate::candidate::Candidate;
use crate::RankingError;
use search_ranking_backend::{Metadata, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::mem::discriminant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Boost,
    Penalty,
    Filter,
    Requirement,
}

impl RuleType {
    pub fn is_admission(&self) -> bool {
        matches!(self, RuleType::Filter | RuleType::Requirement)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuleType::Boost => write!(f, "boost"),
            RuleType::Penalty => write!(f, "penalty"),
            RuleType::Filter => write!(f, "filter"),
            RuleType::Requirement => write!(f, "requirement"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Contains,
}

impl Operator {
    /// Compare a metadata value with a rule operand.
    ///
    /// Returns `None` when the two sides cannot be compared with this operator,
    /// which callers treat as "does not match".
    pub fn evaluate(&self, field: &Value, operand: &Value) -> Option<bool> {
        match self {
            Operator::Eq => same_family(field, operand).then(|| field == operand),
            Operator::Ne => same_family(field, operand).then(|| field != operand),
            Operator::Gt => Some(field.as_f64()? > operand.as_f64()?),
            Operator::Lt => Some(field.as_f64()? < operand.as_f64()?),
            Operator::Gte => Some(field.as_f64()? >= operand.as_f64()?),
            Operator::Lte => Some(field.as_f64()? <= operand.as_f64()?),
            Operator::In => Some(operand.as_list()?.contains(field)),
            Operator::NotIn => Some(!operand.as_list()?.contains(field)),
            Operator::Contains => {
                let haystack = field.to_string().to_lowercase();
                let needle = operand.to_string().to_lowercase();
                Some(haystack.contains(&needle))
            }
        }
    }
}

fn same_family(a: &Value, b: &Value) -> bool {
    discriminant(a) == discriminant(b)
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub rule_id: String,
    pub rule_type: RuleType,
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    pub value: Value,
    /// Boost or penalty magnitude, ignored by filter and requirement rules
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl BusinessRule {
    pub fn new(
        rule_id: impl Into<String>,
        rule_type: RuleType,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_type,
            field: field.into(),
            operator,
            value: value.into(),
            weight: default_weight(),
            description: None,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        metadata
            .get(&self.field)
            .and_then(|value| self.operator.evaluate(value, &self.value))
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), RankingError> {
        if self.rule_id.is_empty() {
            return Err(RankingError::Config("`rule_id` cannot be empty".to_string()));
        }
        if self.field.is_empty() {
            return Err(RankingError::Config(format!(
                "rule `{}`: `field` cannot be empty",
                self.rule_id
            )));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(RankingError::Config(format!(
                "rule `{}`: `weight` must be a finite value >= 0, got {}",
                self.rule_id, self.weight
            )));
        }
        Ok(())
    }
}

/// Validate every rule and check that ids are unique
pub fn validate(rules: &[BusinessRule]) -> Result<(), RankingError> {
    let mut ids = HashSet::with_capacity(rules.len());
    for rule in rules {
        rule.validate()?;
        if !ids.insert(rule.rule_id.as_str()) {
            return Err(RankingError::Config(format!(
                "duplicate rule id `{}`",
                rule.rule_id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Removal {
    pub id: String,
    pub rule_id: String,
    /// `filter` or `requirement`
    pub reason: RuleType,
}

#[derive(Debug, Clone, Default)]
pub struct RuleApplication {
    pub candidates: Vec<Candidate>,
    pub removed: Vec<Removal>,
    /// Ids of the rules that matched at least one candidate, in rule order
    pub matched_rules: Vec<String>,
}

/// Apply `rules` to every candidate.
///
/// Boost and penalty weights of all matching rules are summed and applied once:
/// `score * (1 + Σboost - Σpenalty)`. The first failing filter or requirement rule
/// removes the candidate. Survivors are sorted by score, descending, keeping the
/// incoming order for ties.
pub fn apply(candidates: Vec<Candidate>, rules: &[BusinessRule]) -> RuleApplication {
    let mut matched = vec![false; rules.len()];
    let mut kept = Vec::with_capacity(candidates.len());
    let mut removed = Vec::new();

    for mut candidate in candidates {
        let mut adjustment = 0.0_f32;
        let mut removal: Option<&BusinessRule> = None;

        for (i, rule) in rules.iter().enumerate() {
            let is_match = rule.matches(&candidate.metadata);
            matched[i] |= is_match;

            match rule.rule_type {
                RuleType::Boost if is_match => {
                    adjustment += rule.weight;
                    candidate
                        .annotations
                        .business_rule_boosts
                        .insert(rule.rule_id.clone(), rule.weight);
                }
                RuleType::Penalty if is_match => {
                    adjustment -= rule.weight;
                    candidate
                        .annotations
                        .business_rule_penalties
                        .insert(rule.rule_id.clone(), rule.weight);
                }
                RuleType::Filter | RuleType::Requirement if !is_match && removal.is_none() => {
                    removal = Some(rule);
                }
                _ => {}
            }
        }

        if let Some(rule) = removal {
            removed.push(Removal {
                id: candidate.id,
                rule_id: rule.rule_id.clone(),
                reason: rule.rule_type,
            });
            continue;
        }

        if adjustment != 0.0 {
            candidate.score *= 1.0 + adjustment;
        }
        kept.push(candidate);
    }

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));

    let matched_rules = rules
        .iter()
        .zip(matched)
        .filter(|(_, m)| *m)
        .map(|(rule, _)| rule.rule_id.clone())
        .collect();

    RuleApplication {
        candidates: kept,
        removed,
        matched_rules,
    }
}

/// Render the admission rules as a vector index pre-filter, e.g.
/// `category == "audio" and price < 200 and tags in ["a", "b"]`.
///
/// Rules without a predicate form are left out. They are still enforced by [`apply`].
/// `contains` is one of them: index `like` matching is case sensitive.
pub fn filter_expression(rules: &[BusinessRule]) -> Option<String> {
    let clauses: Vec<String> = rules
        .iter()
        .filter(|rule| rule.rule_type.is_admission())
        .filter_map(clause)
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" and "))
    }
}

fn clause(rule: &BusinessRule) -> Option<String> {
    let field = &rule.field;
    let value = &rule.value;
    let comparison =
        |op: &str| -> Option<String> { Some(format!("{field} {op} {}", literal(value)?)) };
    let ordering =
        |op: &str| -> Option<String> { Some(format!("{field} {op} {}", value.as_f64()?)) };
    let membership = |op: &str| -> Option<String> {
        let items = value
            .as_list()?
            .iter()
            .map(literal)
            .collect::<Option<Vec<_>>>()?;
        Some(format!("{field} {op} [{}]", items.join(", ")))
    };

    match rule.operator {
        Operator::Eq => comparison("=="),
        Operator::Ne => comparison("!="),
        Operator::Gt => ordering(">"),
        Operator::Lt => ordering("<"),
        Operator::Gte => ordering(">="),
        Operator::Lte => ordering("<="),
        Operator::In => membership("in"),
        Operator::NotIn => membership("not in"),
        Operator::Contains => None,
    }
}

fn literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!("\"{}\"", escape(s))),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::List(_) => None,
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
