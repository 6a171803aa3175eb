//! Selector resolution and label bookkeeping
//!
//! Interactive commands name accounts and profiles loosely: by 1-based
//! position, by label, by email, or by a fragment of either. `resolve` turns
//! such a selector into an index, refusing to guess when a fragment is
//! ambiguous.

use oauth_auth::Identity;

use crate::document::{Account, Profile};

/// Anything that can be picked by a user-supplied selector.
pub trait Labeled {
    fn label(&self) -> &str;
    fn identity(&self) -> Option<&str>;
}

impl Labeled for Account {
    fn label(&self) -> &str {
        &self.label
    }

    fn identity(&self) -> Option<&str> {
        Account::identity(self)
    }
}

impl Labeled for Profile {
    fn label(&self) -> &str {
        &self.label
    }

    fn identity(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

/// Resolve `selector` against `items`. First rule that matches wins:
///
/// 1. a 1-based position within bounds
/// 2. case-insensitive exact label or identity
/// 3. case-insensitive substring of label or identity, only when exactly
///    one item matches
pub fn resolve<T: Labeled>(items: &[T], selector: &str) -> Option<usize> {
    let selector = selector.trim();
    if selector.is_empty() {
        return None;
    }

    if let Ok(position) = selector.parse::<usize>()
        && (1..=items.len()).contains(&position)
    {
        return Some(position - 1);
    }

    let needle = selector.to_lowercase();
    let fields = |item: &T| -> Vec<String> {
        std::iter::once(item.label())
            .chain(item.identity())
            .map(str::to_lowercase)
            .collect()
    };

    if let Some(index) = items
        .iter()
        .position(|item| fields(item).iter().any(|f| *f == needle))
    {
        return Some(index);
    }

    let mut matches = items
        .iter()
        .enumerate()
        .filter(|(_, item)| fields(item).iter().any(|f| f.contains(&needle)))
        .map(|(i, _)| i);
    match (matches.next(), matches.next()) {
        (Some(index), None) => Some(index),
        _ => None,
    }
}

/// Display label derived from a credential's identity.
///
/// Email local part, else an 8-character slug of the account id, else
/// `"{fallback} {ordinal}"`.
pub fn derive_label(identity: &Identity, fallback: &str, ordinal: usize) -> String {
    if let Some(local) = identity
        .email
        .as_deref()
        .and_then(|e| e.split('@').next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
    {
        return local.to_string();
    }

    if let Some(id) = identity.account_id.as_deref() {
        let slug: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        if !slug.is_empty() {
            return slug;
        }
    }

    format!("{fallback} {ordinal}")
}

/// `base` if no existing label matches it case-insensitively, else the first
/// free `"{base} 2"`, `"{base} 3"`, ...
pub fn unique_label<'a>(base: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<String> = existing.into_iter().map(str::to_lowercase).collect();
    let is_free = |candidate: &str| !taken.contains(&candidate.to_lowercase());

    if is_free(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base} {n}"))
        .find(|candidate| is_free(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Whether `label` collides (case-insensitively) with any item other than `skip`.
pub fn label_taken<T: Labeled>(items: &[T], label: &str, skip: Option<usize>) -> bool {
    let wanted = label.to_lowercase();
    items
        .iter()
        .enumerate()
        .any(|(i, item)| Some(i) != skip && item.label().to_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts(labels: &[&str]) -> Vec<Account> {
        labels
            .iter()
            .enumerate()
            .map(|(i, l)| Account::new(*l, format!("rt_{i}"), 0))
            .collect()
    }

    #[test]
    fn ambiguous_fragment_resolves_to_none() {
        let items = accounts(&["work", "work2"]);
        assert_eq!(resolve(&items, "wo"), None);
    }

    #[test]
    fn exact_label_beats_substring() {
        let items = accounts(&["work", "work2"]);
        assert_eq!(resolve(&items, "work2"), Some(1));
        assert_eq!(resolve(&items, "WORK"), Some(0));
    }

    #[test]
    fn position_is_one_based() {
        let items = accounts(&["a", "b", "c"]);
        assert_eq!(resolve(&items, "1"), Some(0));
        assert_eq!(resolve(&items, " 3 "), Some(2));
        assert_eq!(resolve(&items, "0"), None);
        assert_eq!(resolve(&items, "4"), None);
    }

    #[test]
    fn out_of_range_number_falls_back_to_labels() {
        let items = accounts(&["team 2024", "personal"]);
        assert_eq!(resolve(&items, "2024"), Some(0));
    }

    #[test]
    fn unique_fragment_matches_identity() {
        let mut items = accounts(&["alpha", "beta"]);
        items[1].email = Some("beta.person@corp.example".into());
        assert_eq!(resolve(&items, "corp"), Some(1));
        assert_eq!(resolve(&items, "BETA.PERSON@CORP.EXAMPLE"), Some(1));
    }

    #[test]
    fn empty_selector_resolves_to_none() {
        let items = accounts(&["a"]);
        assert_eq!(resolve(&items, "  "), None);
    }

    #[test]
    fn derive_label_prefers_email_local_part() {
        let identity = Identity {
            email: Some("jane.doe@example.com".into()),
            account_id: Some("acct_123456789".into()),
            project_id: None,
        };
        assert_eq!(derive_label(&identity, "account", 1), "jane.doe");
    }

    #[test]
    fn derive_label_slugs_account_id() {
        let identity = Identity {
            email: None,
            account_id: Some("ACCT:9f8e7d6c5b4a".into()),
            project_id: None,
        };
        assert_eq!(derive_label(&identity, "account", 1), "acct9f8e");
    }

    #[test]
    fn derive_label_falls_back_to_counter() {
        assert_eq!(derive_label(&Identity::default(), "account", 3), "account 3");
    }

    #[test]
    fn unique_label_appends_counter() {
        assert_eq!(unique_label("work", ["home"]), "work");
        assert_eq!(unique_label("work", ["Work"]), "work 2");
        assert_eq!(unique_label("work", ["work", "work 2"]), "work 3");
    }

    #[test]
    fn label_taken_ignores_self() {
        let items = accounts(&["work", "home"]);
        assert!(label_taken(&items, "HOME", Some(0)));
        assert!(!label_taken(&items, "home", Some(1)));
    }
}
