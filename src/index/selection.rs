//! Drill-down selection queries and paginated option pages

use serde::{Deserialize, Serialize};

use crate::types::{Properties, PropertyValue};

/// Builder for a drill-down selection query
///
/// `selected` fixes the leading property values already chosen by the user;
/// the index reports the options for the first key not in `selected`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionQuery {
    /// Values chosen so far, by property key
    #[serde(default)]
    pub selected: Properties,

    /// Case-sensitive substring filter on option text
    #[serde(default)]
    pub term: Option<String>,

    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: usize,

    /// Options per page; `None` returns every option
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn default_page() -> usize {
    1
}

impl SelectionQuery {
    /// Create a query with nothing selected
    pub fn new() -> Self {
        Self {
            page: 1,
            ..Default::default()
        }
    }

    /// Fix the value of one property
    pub fn select(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.selected.insert(key.to_string(), value.into());
        self
    }

    /// Only report options containing `term`
    pub fn with_term(mut self, term: &str) -> Self {
        self.term = Some(term.to_string());
        self
    }

    /// Request a single page of options
    pub fn paginate(mut self, page: usize, page_size: usize) -> Self {
        self.page = page.max(1);
        self.page_size = Some(page_size);
        self
    }

    pub(crate) fn matches_term(&self, text: &str) -> bool {
        match &self.term {
            Some(term) => text.contains(term.as_str()),
            None => true,
        }
    }
}

/// One selectable option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionItem {
    /// Display text
    pub text: String,

    /// Value to send back when this option is chosen
    pub id: PropertyValue,
}

impl SelectionItem {
    pub(crate) fn from_value(value: &PropertyValue) -> Self {
        Self {
            text: value.to_string(),
            id: value.clone(),
        }
    }
}

/// Options available at one level of the hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionPage {
    /// Property key these options belong to; `None` once every key is selected
    pub key: Option<String>,

    /// Distinct values at this level after term filtering, across all pages
    pub total: usize,

    /// Options on the requested page
    pub items: Vec<SelectionItem>,
}

impl SelectionPage {
    /// Page reported once the hierarchy is exhausted
    pub fn exhausted() -> Self {
        Self::default()
    }

    /// True when exactly one option exists at this level
    pub fn is_singleton(&self) -> bool {
        self.key.is_some() && self.total == 1
    }
}

/// Cut the requested page out of an already filtered, sorted option list
pub(crate) fn paginate<T>(options: Vec<T>, page: usize, page_size: Option<usize>) -> Vec<T> {
    match page_size {
        None => options,
        Some(0) => Vec::new(),
        Some(size) => {
            let skip = page.saturating_sub(1).saturating_mul(size);
            options.into_iter().skip(skip).take(size).collect()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_is_one_based() {
        let options: Vec<u32> = (1..=7).collect();
        assert_eq!(paginate(options.clone(), 1, Some(3)), vec![1, 2, 3]);
        assert_eq!(paginate(options.clone(), 3, Some(3)), vec![7]);
        assert!(paginate(options.clone(), 4, Some(3)).is_empty());
        assert_eq!(paginate(options, 2, None).len(), 7);
    }

    #[test]
    fn test_term_filter() {
        let query = SelectionQuery::new().with_term("amp");
        assert!(query.matches_term("amplet1"));
        assert!(!query.matches_term("AMPLET1"));
    }
}
