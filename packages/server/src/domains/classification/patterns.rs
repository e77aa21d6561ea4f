//! Pattern-based pre-classification (the free tier).
//!
//! A fixed, ordered rule table evaluated case-insensitively against
//! `subject + body`; first match wins. No match means *no decision* - the
//! model stage decides, the pre-classifier never guesses.

use lazy_static::lazy_static;
use regex::Regex;

use super::models::Category;

lazy_static! {
    static ref RULES: Vec<(Category, Regex)> = vec![
        (
            Category::Invoice,
            Regex::new(r"(?i)\b(invoice|bill|payment\s+due|amount\s+(owed|due)|please\s+pay|receipt|charge|statement|remittance)\b").unwrap(),
        ),
        (
            Category::Contract,
            Regex::new(r"(?i)\b(sow|statement\s+of\s+work|nda|non-disclosure|agreement|contract|terms\s+and\s+conditions|sign\s+here|e-sign|docusign)\b").unwrap(),
        ),
        (
            Category::ProjectUpdate,
            Regex::new(r"(?i)\b(status\s+update|progress\s+report|milestone|sprint|standup|weekly\s+update|project\s+status|retrospective|scrum|daily\s+update)\b").unwrap(),
        ),
        (
            Category::ClientRequest,
            Regex::new(r"(?i)\b(quote|proposal|can\s+you|would\s+you|project\s+inquiry|new\s+project|rfp|request\s+for\s+proposal|estimate|consultation|interested\s+in\s+working)\b").unwrap(),
        ),
    ];
}

/// Match `subject + body` against the rule table, in rule order.
pub fn pre_classify(subject: &str, body: &str) -> Option<Category> {
    let text = format!("{subject} {body}");
    RULES
        .iter()
        .find(|(_, pattern)| pattern.is_match(&text))
        .map(|(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_subject_matches() {
        assert_eq!(
            pre_classify("Invoice #1234 payment due", ""),
            Some(Category::Invoice)
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            pre_classify("WEEKLY UPDATE", "all green"),
            Some(Category::ProjectUpdate)
        );
    }

    #[test]
    fn body_text_is_considered() {
        assert_eq!(
            pre_classify("hello", "please see the attached NDA"),
            Some(Category::Contract)
        );
    }

    #[test]
    fn first_rule_wins() {
        // Matches both the invoice and contract rules; invoice is listed first.
        assert_eq!(
            pre_classify("Invoice for the signed contract", ""),
            Some(Category::Invoice)
        );
    }

    #[test]
    fn no_match_returns_no_decision() {
        assert_eq!(pre_classify("Lunch on Friday?", "See you there"), None);
    }
}
