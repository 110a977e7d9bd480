// src/gate/plate.rs
//
// Plate text rules shared by readings and whitelist entries:
// normalization, Cyrillic repair, noise heuristics, grammar/region check.

use crate::types::GateConfig;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;

/// Letters allowed on RU plates (all have Latin look-alikes)
const RU_LETTERS: &str = "АВЕКМНОРСТУХ";

fn latin_to_cyrillic(c: char) -> char {
    match c {
        'A' => 'А',
        'B' => 'В',
        'C' => 'С',
        'E' => 'Е',
        'H' => 'Н',
        'K' => 'К',
        'M' => 'М',
        'O' => 'О',
        'P' => 'Р',
        'T' => 'Т',
        'X' => 'Х',
        'Y' => 'У',
        _ => c,
    }
}

fn as_digit(c: char) -> char {
    match c {
        'О' => '0',
        'В' => '8',
        'Т' => '7',
        _ => c,
    }
}

fn as_letter(c: char) -> char {
    match c {
        '0' => 'О',
        '8' => 'В',
        _ => c,
    }
}

/// Uppercase and drop separators (spaces, dashes, dots, anything non-alphanumeric).
pub fn strip_separators(raw: &str) -> String {
    raw.chars()
        .flat_map(|c| c.to_uppercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Map Latin homoglyphs to Cyrillic, then fix O/0, B/8, T/7 confusions by
/// position for the `L DDD LL RR(R)` layout.
pub fn repair_ru(plate: &str) -> String {
    let chars: Vec<char> = plate.chars().map(latin_to_cyrillic).collect();
    if chars.len() != 8 && chars.len() != 9 {
        return chars.into_iter().collect();
    }
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| match i {
            0 | 4 | 5 => as_letter(c),
            _ => as_digit(c),
        })
        .collect()
}

/// Typical OCR garbage: fragments, bare numbers, one repeated glyph.
pub fn is_noise(plate: &str) -> bool {
    let len = plate.chars().count();
    if len <= 4 {
        return true;
    }
    if len <= 5 && plate.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let mut chars = plate.chars();
    match chars.next() {
        Some(first) => chars.all(|c| c == first),
        None => true,
    }
}

/// Trailing run of digits (2-3 on RU plates).
pub fn region_of(plate: &str) -> Option<&str> {
    let digits = plate
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    // digits are single-byte, so byte offset == char offset from the end
    Some(&plate[plate.len() - digits..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateRejection {
    InvalidFormat,
    InvalidRegion,
}

impl PlateRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::InvalidRegion => "invalid_region",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlateRules {
    cyrillic_repair: bool,
    pattern: Option<Regex>,
    allowed_regions: HashSet<String>,
}

impl PlateRules {
    pub fn from_config(cfg: &GateConfig) -> Result<Self> {
        let pattern = if cfg.format_check {
            Some(
                Regex::new(&cfg.plate_pattern)
                    .with_context(|| format!("Invalid plate pattern: {}", cfg.plate_pattern))?,
            )
        } else {
            None
        };
        Ok(Self {
            cyrillic_repair: cfg.cyrillic_repair,
            pattern,
            allowed_regions: cfg.allowed_regions.iter().map(|r| r.trim().to_string()).collect(),
        })
    }

    pub fn normalize(&self, raw: &str) -> String {
        let plate = strip_separators(raw);
        if self.cyrillic_repair {
            repair_ru(&plate)
        } else {
            plate
        }
    }

    /// `region_hint` comes from the OCR service when it reports one.
    pub fn validate(&self, plate: &str, region_hint: Option<&str>) -> Result<(), PlateRejection> {
        if let Some(re) = &self.pattern {
            if !re.is_match(plate) {
                return Err(PlateRejection::InvalidFormat);
            }
        }
        if !self.allowed_regions.is_empty() {
            let region = region_hint
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .or_else(|| region_of(plate));
            match region {
                Some(r) if self.allowed_regions.contains(r) => {}
                _ => return Err(PlateRejection::InvalidRegion),
            }
        }
        Ok(())
    }
}
