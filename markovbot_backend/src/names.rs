//! Turning user-typed names into ids, and ids back into display text.

use rand::seq::IteratorRandom;
use rand::Rng;
use regex_lite::{Captures, Regex};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::corpus::NameDirectory;
use crate::roster::SpeakerRoster;

pub const RANDOM_TAG: &str = "rand";
pub const INCLUSIVE_TAG: &str = "all";
pub const REFLEXIVE_TAG: &str = "me";
/// How many ids the `all` tag expands to.
pub const INCLUSIVE_COUNT: usize = 5;
pub const UNKNOWN_USER: &str = "@UNKNOWN_USER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameLookup {
    Found(String),
    NotFound,
    Ambiguous(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameParseError {
    TooMany(usize),
    NotFound(String),
    Ambiguous { name: String, candidates: Vec<String> },
}

impl fmt::Display for NameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameParseError::TooMany(count) => write!(f, "Too many inputs ({}).", count),
            NameParseError::NotFound(name) => write!(f, "Name not found {}.", name),
            NameParseError::Ambiguous { name, candidates } => write!(
                f,
                "{} maps to multiple people: {}.",
                name,
                candidates.join(", ")
            ),
        }
    }
}

impl std::error::Error for NameParseError {}

/// Resolve one name against the directory. An exact case-insensitive match
/// wins; otherwise the name must be a substring of exactly one entry.
///
/// When `members` is given, only those ids are considered.
pub fn lookup_name(
    name: &str,
    directory: &NameDirectory,
    members: Option<&HashSet<String>>,
) -> NameLookup {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return NameLookup::NotFound;
    }

    let mut partial = Vec::new();
    for (id, display) in directory.entries() {
        if members.is_some_and(|members| !members.contains(id)) {
            continue;
        }
        let display_lower = display.to_lowercase();
        if display_lower == wanted {
            return NameLookup::Found(id.to_string());
        }
        if display_lower.contains(&wanted) {
            partial.push(id.to_string());
        }
    }

    match partial.len() {
        0 => NameLookup::NotFound,
        1 => NameLookup::Found(partial.remove(0)),
        _ => NameLookup::Ambiguous(partial),
    }
}

/// Parse a `+`-separated list of names (`alice+bob`, `rand`, `all`, `me`).
pub fn parse_names<R: Rng + ?Sized>(
    input: &str,
    author_id: &str,
    members: Option<&HashSet<String>>,
    directory: &NameDirectory,
    max_names: usize,
    rng: &mut R,
) -> Result<Vec<String>, NameParseError> {
    let lowered = input.to_lowercase();
    let names: Vec<&str> = lowered.split('+').collect();
    if names.len() > max_names {
        return Err(NameParseError::TooMany(names.len()));
    }

    let mut ids = Vec::new();
    for name in names {
        match name.trim() {
            RANDOM_TAG => match directory.random_id(rng) {
                Some(id) => ids.push(id.to_string()),
                None => return Err(NameParseError::NotFound(name.to_string())),
            },
            INCLUSIVE_TAG => {
                let picked = directory
                    .entries()
                    .map(|(id, _)| id.to_string())
                    .choose_multiple(rng, INCLUSIVE_COUNT);
                if picked.is_empty() {
                    return Err(NameParseError::NotFound(name.to_string()));
                }
                ids.extend(picked);
            }
            REFLEXIVE_TAG => ids.push(author_id.to_string()),
            other => match lookup_name(other, directory, members) {
                NameLookup::Found(id) => ids.push(id),
                NameLookup::NotFound => return Err(NameParseError::NotFound(other.to_string())),
                NameLookup::Ambiguous(candidates) => {
                    return Err(NameParseError::Ambiguous {
                        name: other.to_string(),
                        candidates: candidates
                            .iter()
                            .map(|id| directory.name_of(id).unwrap_or(id).to_string())
                            .collect(),
                    })
                }
            },
        }
    }
    Ok(ids)
}

/// Join display names with `+` while the result stays under `max_len`.
/// Names that do not fit are summarised as a trailing count.
pub fn generate_nick(ids: &[String], directory: &NameDirectory, max_len: usize) -> String {
    let mut nick = String::new();
    let mut included = 0;
    for id in ids {
        let name = directory.name_of(id).unwrap_or(id);
        if nick.len() + name.len() < max_len {
            nick.push_str(name);
            nick.push('+');
            included += 1;
        }
    }

    if included < ids.len() {
        nick.push_str(&(ids.len() - included).to_string());
    } else {
        nick.pop();
    }
    nick
}

fn mention_regex() -> &'static Regex {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    MENTION.get_or_init(|| Regex::new(r"<@!?(\d+)>").expect("mention regex is valid"))
}

/// Ids referenced by platform mention tokens (`<@123>` or `<@!123>`), in order
/// of appearance.
pub fn mention_ids(text: &str) -> Vec<String> {
    mention_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|id| id.as_str().to_string()))
        .collect()
}

/// Replace mention tokens with `@DisplayName`, or `@UNKNOWN_USER` when the id
/// is not on the roster.
pub fn remove_mentions(text: &str, roster: &dyn SpeakerRoster) -> String {
    mention_regex()
        .replace_all(text, |caps: &Captures<'_>| match roster.resolve(&caps[1]) {
            Some(profile) => format!("@{}", profile.display_name),
            None => UNKNOWN_USER.to_string(),
        })
        .into_owned()
}

/// Comma-separated pages of names, each under `max_len` bytes. With `search`,
/// only names containing it (case-insensitive) are listed.
pub fn page_names(names: &[String], search: Option<&str>, max_len: usize) -> Vec<String> {
    let search = search.map(str::to_lowercase);
    let mut sorted: Vec<&String> = names
        .iter()
        .filter(|name| {
            search
                .as_deref()
                .map_or(true, |search| name.to_lowercase().contains(search))
        })
        .collect();
    sorted.sort_by_key(|name| name.to_lowercase());

    let mut pages = Vec::new();
    let mut current = String::new();
    for name in sorted {
        if !current.is_empty() && current.len() + name.len() + 2 >= max_len {
            pages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(", ");
        }
        current.push_str(name);
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::DirectoryRoster;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn directory() -> NameDirectory {
        NameDirectory::parse("1;Alice\n2;Alicia\n3;Bob\n4;Carol\n5;Dave\n6;Eve\n")
    }

    #[test]
    fn exact_match_beats_substring_match() {
        assert_eq!(
            lookup_name("alice", &directory(), None),
            NameLookup::Found("1".to_string())
        );
    }

    #[test]
    fn unique_substring_resolves() {
        assert_eq!(
            lookup_name("ob", &directory(), None),
            NameLookup::Found("3".to_string())
        );
    }

    #[test]
    fn shared_substring_is_ambiguous() {
        assert_eq!(
            lookup_name("ali", &directory(), None),
            NameLookup::Ambiguous(vec!["1".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn members_filter_limits_candidates() {
        let members: HashSet<String> = ["2".to_string()].into_iter().collect();
        assert_eq!(
            lookup_name("ali", &directory(), Some(&members)),
            NameLookup::Found("2".to_string())
        );
        assert_eq!(
            lookup_name("bob", &directory(), Some(&members)),
            NameLookup::NotFound
        );
    }

    #[test]
    fn parse_names_handles_tags_and_errors() {
        let dir = directory();
        let mut rng = StdRng::seed_from_u64(3);

        let ids = parse_names("Bob+me", "99", None, &dir, 5, &mut rng).unwrap();
        assert_eq!(ids, vec!["3", "99"]);

        let all = parse_names("all", "99", None, &dir, 5, &mut rng).unwrap();
        assert_eq!(all.len(), INCLUSIVE_COUNT);

        let random = parse_names("rand", "99", None, &dir, 5, &mut rng).unwrap();
        assert!(dir.contains(&random[0]));

        assert_eq!(
            parse_names("a+b+c+d+e+f", "99", None, &dir, 5, &mut rng),
            Err(NameParseError::TooMany(6))
        );
        assert_eq!(
            parse_names("zed", "99", None, &dir, 5, &mut rng),
            Err(NameParseError::NotFound("zed".to_string()))
        );
        let err = parse_names("ali", "99", None, &dir, 5, &mut rng).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ali maps to multiple people: Alice, Alicia."
        );
    }

    #[test]
    fn nick_joins_names_that_fit() {
        let dir = directory();
        let ids = vec!["1".to_string(), "3".to_string()];
        assert_eq!(generate_nick(&ids, &dir, 30), "Alice+Bob");
    }

    #[test]
    fn nick_counts_omitted_names() {
        let dir = directory();
        let ids: Vec<String> = ["1", "2", "3", "4", "5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // "Alice+Alicia+Bob+" is 17 bytes; "Carol" still fits, "Dave" does not.
        assert_eq!(generate_nick(&ids, &dir, 25), "Alice+Alicia+Bob+Carol+1");
    }

    #[test]
    fn mention_tokens_are_extracted_and_rewritten() {
        let dir = directory();
        let roster = DirectoryRoster::new(&dir, &[]);
        let text = "hey <@1> and <@!3>, meet <@777>";
        assert_eq!(mention_ids(text), vec!["1", "3", "777"]);
        assert_eq!(
            remove_mentions(text, &roster),
            "hey @Alice and @Bob, meet @UNKNOWN_USER"
        );
    }

    #[test]
    fn pages_respect_length_and_search() {
        let names: Vec<String> = ["delta", "alpha", "charlie", "bravo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            page_names(&names, None, 100),
            vec!["alpha, bravo, charlie, delta"]
        );
        assert_eq!(
            page_names(&names, None, 16),
            vec!["alpha, bravo", "charlie, delta"]
        );
        assert_eq!(page_names(&names, Some("AR"), 100), vec!["charlie"]);
        assert!(page_names(&names, Some("zz"), 100).is_empty());
    }
}
