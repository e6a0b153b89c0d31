use std::collections::HashSet;

use crate::names::mention_ids;
use crate::roster::SpeakerProfile;

/// Speakers referenced by one generated message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    /// Speakers whose name appears verbatim in the text.
    pub by_name: Vec<String>,
    /// Ids taken from platform mention tokens, minus those already in `by_name`.
    pub by_token: Vec<String>,
}

impl Mentions {
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_token.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.by_name.iter().chain(self.by_token.iter())
    }
}

/// Scan `text` for speaker names (case-sensitive substring, one hit per
/// speaker) and for mention tokens. Each id is reported once per message.
pub fn find_mentions(text: &str, profiles: &[SpeakerProfile]) -> Mentions {
    let mut seen = HashSet::new();
    let mut mentions = Mentions::default();

    for profile in profiles {
        let named = profile
            .aliases
            .iter()
            .any(|alias| !alias.is_empty() && text.contains(alias.as_str()));
        if named && seen.insert(profile.id.clone()) {
            mentions.by_name.push(profile.id.clone());
        }
    }

    for id in mention_ids(text) {
        if seen.insert(id.clone()) {
            mentions.by_token.push(id);
        }
    }

    mentions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, aliases: &[&str]) -> SpeakerProfile {
        SpeakerProfile {
            id: id.to_string(),
            display_name: aliases.first().copied().unwrap_or(id).to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            avatar_url: None,
        }
    }

    #[test]
    fn finds_names_case_sensitively() {
        let profiles = vec![profile("1", &["Alice"]), profile("2", &["Bob"])];
        let mentions = find_mentions("alice told Bob a secret", &profiles);
        assert_eq!(mentions.by_name, vec!["2"]);
        assert!(mentions.by_token.is_empty());
    }

    #[test]
    fn any_alias_counts_once() {
        let profiles = vec![profile("1", &["Alice", "Al"])];
        let mentions = find_mentions("Alice and Al", &profiles);
        assert_eq!(mentions.by_name, vec!["1"]);
    }

    #[test]
    fn two_names_yield_two_ids() {
        let profiles = vec![profile("1", &["Alice"]), profile("2", &["Bob"])];
        let mentions = find_mentions("Alice and Bob", &profiles);
        assert_eq!(mentions.by_name, vec!["1", "2"]);
    }

    #[test]
    fn tokens_are_deduplicated_against_names() {
        let profiles = vec![profile("1", &["Alice"])];
        let mentions = find_mentions("Alice <@1> <@2> <@!2>", &profiles);
        assert_eq!(mentions.by_name, vec!["1"]);
        assert_eq!(mentions.by_token, vec!["2"]);
        assert_eq!(mentions.all().count(), 2);
    }

    #[test]
    fn empty_alias_never_matches() {
        let profiles = vec![profile("1", &[""])];
        assert!(find_mentions("anything", &profiles).is_empty());
    }
}
