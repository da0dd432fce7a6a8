//! Rule definitions and the rule store interface

use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use log::debug;

use crate::error::ScanResult;

/// Lazily yielded rules, in the store's stable order
pub type RuleStream = BoxStream<'static, ScanResult<Rule>>;

/// An analysis rule as the orchestrator sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identity; the store yields rules in ascending id order
    pub id: u64,
    pub name: String,
    /// Restricts the rule to programs of one language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub group_names: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

impl Rule {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            language: None,
            group_names: Vec::new(),
            tags: Vec::new(),
            severity: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_names.push(group.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// True when the rule may run against a program written in `language`
    pub fn applies_to_language(&self, language: Option<&str>) -> bool {
        match (&self.language, language) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(rule_lang), Some(program_lang)) => rule_lang.eq_ignore_ascii_case(program_lang),
        }
    }
}

/// Rule selection criteria, persisted verbatim on the task
///
/// Empty fields match everything, so the default filter selects all rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Case-insensitive substring of the rule name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl RuleFilter {
    pub fn by_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rule_names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, rule: &Rule) -> bool {
        if !self.rule_names.is_empty() && !self.rule_names.iter().any(|n| n == &rule.name) {
            return false;
        }
        if !self.languages.is_empty() {
            let Some(language) = &rule.language else { return false };
            if !self.languages.iter().any(|l| l.eq_ignore_ascii_case(language)) {
                return false;
            }
        }
        if !self.group_names.is_empty()
            && !self.group_names.iter().any(|g| rule.group_names.contains(g))
        {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| rule.tags.contains(t)) {
            return false;
        }
        if let Some(keyword) = &self.keyword {
            if !rule.name.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Rule storage and query layer
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Count the rules matching `filter` and yield them lazily.
    ///
    /// Implementations must yield in ascending `Rule::id` order and must
    /// report a count equal to the number of rules the stream yields;
    /// resume positions depend on both.
    async fn count_and_yield(&self, filter: &RuleFilter) -> ScanResult<(usize, RuleStream)>;
}

/// Rule store backed by a vector
#[derive(Debug, Default, Clone)]
pub struct MemoryRuleStore {
    rules: Arc<RwLock<Vec<Rule>>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let store = Self::new();
        for rule in rules {
            store.insert(rule);
        }
        store
    }

    /// Insert or replace a rule by id
    pub fn insert(&self, rule: Rule) {
        let mut rules = self.rules.write();
        match rules.binary_search_by_key(&rule.id, |r| r.id) {
            Ok(pos) => rules[pos] = rule,
            Err(pos) => rules.insert(pos, rule),
        }
    }

    pub fn remove(&self, id: u64) -> Option<Rule> {
        let mut rules = self.rules.write();
        let pos = rules.iter().position(|r| r.id == id)?;
        Some(rules.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn count_and_yield(&self, filter: &RuleFilter) -> ScanResult<(usize, RuleStream)> {
        // Snapshot under the lock so count and stream agree
        let matched: Vec<Rule> = self
            .rules
            .read()
            .iter()
            .filter(|rule| filter.matches(rule))
            .cloned()
            .collect();
        debug!("Rule filter matched {} rules", matched.len());
        let count = matched.len();
        Ok((count, stream::iter(matched.into_iter().map(Ok)).boxed()))
    }
}
