//! Novelty commands: matchmaking scores and the snap.

const MATCHMAKING_HEADER: &str = ":heartpulse: __**MATCHMAKING**__ :heartpulse:\n";
const SHIP_ALL_COUNT: usize = 10;

const DESCRIPTIONS: &[(u32, &str)] = &[
    (9, "Awful :sob:"),
    (19, "Bad :cry:"),
    (29, "Pretty low :frowning:"),
    (39, "Not Too Great :confused:"),
    (49, "Worse Than Average :neutral_face:"),
    (59, "Barely :no_mouth:"),
    (68, "Not Bad :slight_smile:"),
    (69, "( \u{361}\u{b0} \u{35c}\u{296} \u{361}\u{b0})"),
    (79, "Pretty Good :smiley:"),
    (89, "Great :smile:"),
    (99, "Amazing :heart_eyes:"),
    (100, "PERFECT! :heart_exclamation:"),
];

/// Deterministic 0..=100 score from the codepoints of both names.
pub fn calc_relationship(a: &str, b: &str) -> u32 {
    let total: u64 = a.chars().chain(b.chars()).map(|c| c as u64).sum();
    ((total + 32) % 101) as u32
}

pub fn describe_relationship(percent: u32) -> &'static str {
    DESCRIPTIONS
        .iter()
        .find(|(max, _)| percent <= *max)
        .map(|(_, text)| *text)
        .unwrap_or(DESCRIPTIONS[DESCRIPTIONS.len() - 1].1)
}

/// Lowercase and drop spaces, the form names are scored in.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "")
}

pub fn ship_message(a: &str, b: &str) -> String {
    let a = normalize_name(a);
    let b = normalize_name(b);
    let percent = calc_relationship(&a, &b);
    let bars = (percent / 10) as usize;

    let mut out = format!(
        "{MATCHMAKING_HEADER}:small_red_triangle_down: *`{a}`*\n:small_red_triangle: *`{b}`*\n\n**{percent}%** \u{200b}`"
    );
    out.push_str(&"\u{2588}".repeat(bars));
    out.push_str(&" \u{200b}".repeat(10 - bars.min(10)));
    out.push_str("`\n\n");
    out.push_str(describe_relationship(percent));
    out
}

/// Rank `word` against every name; the best ten, or the worst ten with `bottom`.
pub fn ship_all(word: &str, names: &[String], bottom: bool) -> String {
    let word = normalize_name(word);
    let mut scored: Vec<(u32, &String)> = names
        .iter()
        .map(|name| (calc_relationship(&word, &normalize_name(name)), name))
        .collect();
    if bottom {
        scored.sort_by_key(|(percent, _)| *percent);
    } else {
        scored.sort_by(|a, b| b.0.cmp(&a.0));
    }

    let mut out = MATCHMAKING_HEADER.to_string();
    for (rank, (percent, name)) in scored.iter().take(SHIP_ALL_COUNT).enumerate() {
        out.push_str(&format!(
            "**{}**: `{}` :heart: `{}`: {}%\n",
            rank + 1,
            word,
            name,
            percent
        ));
    }
    out
}

/// Capitalise the first letter of every alphabetic run.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

pub fn is_spared(name: &str) -> bool {
    name.chars().map(|c| c as u64).sum::<u64>() % 2 == 0
}

pub fn snap(name: &str) -> String {
    let title = title_case(name);
    if is_spared(name) {
        format!("{}, you were spared by Thanos.", title)
    } else {
        format!(
            "{}, you were slain by Thanos, for the good of the Universe.",
            title
        )
    }
}
