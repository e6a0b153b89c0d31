//! Text deathmatch between two names, driven by a table of attack lines.
//!
//! Each line of the attack file is `text;power`, where `text` may contain
//! `$P1` (attacker) and `$P2` (defender) and `power` is 0..=11.

use anyhow::{Context, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEATHMATCH_HEADER: &str = "__**:anger:DEATHMATCH:anger:**__";

const STARTING_HEALTH: u32 = 100;
const MISS_ONE_IN: u32 = 21;
const MAX_TURNS: usize = 500;

/// Relative frequency of each attack power.
const POWER_WEIGHTS: &[(u32, u32)] = &[
    (0, 5),
    (1, 25),
    (2, 22),
    (3, 18),
    (4, 15),
    (5, 12),
    (6, 9),
    (7, 6),
    (8, 4),
    (9, 3),
    (10, 2),
    (11, 1),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attack {
    pub text: String,
    pub power: u32,
}

#[derive(Debug, Clone)]
pub struct DeathmatchResult {
    /// Every rendered state of the fight, starting with the lineup.
    pub frames: Vec<String>,
    pub winner: String,
}

impl DeathmatchResult {
    /// The final frame, which carries the trophy line.
    pub fn transcript(&self) -> &str {
        self.frames.last().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Deathmatch {
    attacks: BTreeMap<u32, Vec<String>>,
    powers: Vec<u32>,
    weights: WeightedIndex<u32>,
}

impl Deathmatch {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read attacks from {}", path.display()))?;
        Self::from_lines(&raw)
    }

    pub fn from_lines(raw: &str) -> Result<Self> {
        let mut attacks = Vec::new();
        for line in raw.lines() {
            let line = line.trim_start_matches('\u{feff}');
            if line.trim().is_empty() {
                continue;
            }
            let parsed = line.rsplit_once(';').and_then(|(text, power)| {
                power.trim().parse::<u32>().ok().map(|power| Attack {
                    text: text.to_string(),
                    power,
                })
            });
            match parsed {
                Some(attack) => attacks.push(attack),
                None => tracing::warn!("Skipping malformed attack line: {}", line),
            }
        }
        Self::from_attacks(attacks)
    }

    pub fn from_attacks(attacks: Vec<Attack>) -> Result<Self> {
        let mut by_power: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for attack in attacks {
            by_power.entry(attack.power).or_default().push(attack.text);
        }

        if !by_power.keys().any(|power| *power > 0) {
            anyhow::bail!("Attack table needs at least one attack with power above 0");
        }

        // Only powers that have at least one attack can be drawn.
        let (powers, weights): (Vec<u32>, Vec<u32>) = POWER_WEIGHTS
            .iter()
            .filter(|(power, _)| by_power.contains_key(power))
            .copied()
            .unzip();
        let weights = WeightedIndex::new(weights).context("Invalid attack weights")?;

        Ok(Self {
            attacks: by_power,
            powers,
            weights,
        })
    }

    fn draw_attack<R: Rng + ?Sized>(&self, rng: &mut R) -> (u32, &str) {
        let power = self.powers[self.weights.sample(rng)];
        let text = self
            .attacks
            .get(&power)
            .and_then(|texts| texts.choose(rng))
            .map(String::as_str)
            .unwrap_or_default();
        (power, text)
    }

    /// Fight until one side runs out of health. `second` strikes first.
    pub fn fight<R: Rng + ?Sized>(
        &self,
        first: &str,
        second: &str,
        bet: Option<u64>,
        rng: &mut R,
    ) -> DeathmatchResult {
        let mut first_health = STARTING_HEALTH;
        let mut second_health = STARTING_HEALTH;
        let mut first_turn = false;
        let mut frames = vec![format!(
            "{DEATHMATCH_HEADER}\n\n\n\n{}",
            health_lines(first, first_health, second, second_health)
        )];
        let mut previous_attack = "\n".to_string();

        for _ in 0..MAX_TURNS {
            let (power, template) = self.draw_attack(rng);
            let missed = rng.gen_range(0..MISS_ONE_IN) == 0;
            let spared = template.contains("Infinity Gauntlet") && rng.gen_bool(0.5);
            let damage = if missed || spared {
                0
            } else {
                calculate_damage(power, rng)
            };

            let (arrow, attacker, defender) = if first_turn {
                second_health = second_health.saturating_sub(damage);
                (":arrow_right:", first, second)
            } else {
                first_health = first_health.saturating_sub(damage);
                (":arrow_left:", second, first)
            };
            first_turn = !first_turn;

            let mut line = format!(
                "{}{}",
                arrow,
                template.replace("$P1", attacker).replace("$P2", defender)
            );
            if damage == 0 && power != 0 {
                line.pop();
                line.push_str(", but it misses!");
            }
            line.push_str(&format!(" It does {} damage.\n", damage));

            let frame = format!(
                "{DEATHMATCH_HEADER}\n\n{}{}\n{}",
                previous_attack,
                line,
                health_lines(first, first_health, second, second_health)
            );
            frames.push(frame.clone());
            previous_attack = line;

            let winner = if second_health == 0 {
                Some(first)
            } else if first_health == 0 {
                Some(second)
            } else {
                None
            };
            if let Some(winner) = winner {
                frames.push(format!("{}\n{}", frame, trophy_line(winner, bet)));
                return DeathmatchResult {
                    frames,
                    winner: winner.to_string(),
                };
            }
        }

        // Only reachable with a table that almost never lands a hit.
        let winner = if first_health >= second_health {
            first
        } else {
            second
        };
        let last = frames.last().cloned().unwrap_or_default();
        frames.push(format!("{}\n{}", last, trophy_line(winner, bet)));
        DeathmatchResult {
            frames,
            winner: winner.to_string(),
        }
    }
}

/// 0 for power 0, 100 above power 10, otherwise `3p ± p` floored at zero.
pub fn calculate_damage<R: Rng + ?Sized>(power: u32, rng: &mut R) -> u32 {
    match power {
        0 => 0,
        p if p > 10 => 100,
        p => {
            let p = p as i64;
            (p * 3 + rng.gen_range(-p..=p)).max(0) as u32
        }
    }
}

fn health_lines(first: &str, first_health: u32, second: &str, second_health: u32) -> String {
    format!(
        "**{}**: {}/{}\n**{}**: {}/{}",
        first, first_health, STARTING_HEALTH, second, second_health, STARTING_HEALTH
    )
}

fn trophy_line(winner: &str, bet: Option<u64>) -> String {
    match bet {
        Some(bet) => format!(":trophy: **{} has won G${}!**", winner, bet),
        None => format!(":trophy: **{} has won!**", winner),
    }
}
