use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::domain::models::RawTitle;

pub const ONE_GIB: u64 = 1 << 30;

/// Which disc titles are carried forward to identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Titles of at least this many bytes
    SizeThreshold(u64),
    /// The n largest titles
    CountN(usize),
    /// Titles strictly larger than the median size
    Median,
    /// Titles with these disc names, in this order
    NameList(Vec<String>),
    All,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::SizeThreshold(ONE_GIB)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("invalid extraction mode '{0}'. Expected one of: 1gb, size:<bytes>, count:<n>, median, name:<a>,<b>, all")]
    Invalid(String),
}

impl FromStr for SelectionPolicy {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SelectionError::Invalid(s.to_string());
        let trimmed = s.trim();
        let lower = trimmed.to_lowercase();

        match lower.as_str() {
            "1gb" => return Ok(SelectionPolicy::SizeThreshold(ONE_GIB)),
            "median" => return Ok(SelectionPolicy::Median),
            "all" => return Ok(SelectionPolicy::All),
            _ => {}
        }

        if let Some(bytes) = lower.strip_prefix("size:") {
            return bytes
                .parse()
                .map(SelectionPolicy::SizeThreshold)
                .map_err(|_| invalid());
        }
        if let Some(n) = lower.strip_prefix("count:") {
            return n.parse().map(SelectionPolicy::CountN).map_err(|_| invalid());
        }
        // Names keep their original case
        if lower.starts_with("name:") {
            let names: Vec<String> = trimmed["name:".len()..]
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                return Err(invalid());
            }
            return Ok(SelectionPolicy::NameList(names));
        }

        Err(invalid())
    }
}

/// Filters `titles` (in disc order) according to `policy`.
pub fn select_titles(titles: &[RawTitle], policy: &SelectionPolicy) -> Vec<RawTitle> {
    match policy {
        SelectionPolicy::All => titles.to_vec(),
        SelectionPolicy::SizeThreshold(bytes) => titles
            .iter()
            .filter(|t| t.size_bytes >= *bytes)
            .cloned()
            .collect(),
        SelectionPolicy::CountN(n) => largest(titles, *n),
        SelectionPolicy::Median => above_median(titles),
        SelectionPolicy::NameList(names) => by_name(titles, names),
    }
}

fn largest(titles: &[RawTitle], n: usize) -> Vec<RawTitle> {
    let mut ranked: Vec<usize> = (0..titles.len()).collect();
    ranked.sort_by(|&a, &b| {
        titles[b]
            .size_bytes
            .cmp(&titles[a].size_bytes)
            .then(titles[a].disc_index.cmp(&titles[b].disc_index))
    });
    ranked.truncate(n);
    ranked.sort_unstable();
    ranked.into_iter().map(|i| titles[i].clone()).collect()
}

fn above_median(titles: &[RawTitle]) -> Vec<RawTitle> {
    if titles.is_empty() {
        return Vec::new();
    }
    let mut sizes: Vec<u64> = titles.iter().map(|t| t.size_bytes).collect();
    sizes.sort_unstable();
    let mid = sizes.len() / 2;
    // Twice the median, so even-length lists need no fractional arithmetic
    let doubled_median = if sizes.len() % 2 == 0 {
        u128::from(sizes[mid - 1]) + u128::from(sizes[mid])
    } else {
        2 * u128::from(sizes[mid])
    };

    titles
        .iter()
        .filter(|t| 2 * u128::from(t.size_bytes) > doubled_median)
        .cloned()
        .collect()
}

fn by_name(titles: &[RawTitle], names: &[String]) -> Vec<RawTitle> {
    let mut selected: Vec<RawTitle> = Vec::new();
    for name in names {
        match titles.iter().find(|t| &t.name == name) {
            Some(title) if !selected.iter().any(|s| s.id == title.id) => {
                selected.push(title.clone())
            }
            Some(_) => {}
            None => warn!(name = %name, "No title on the disc has this name"),
        }
    }
    selected
}
