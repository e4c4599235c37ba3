//! Compact rank-set encoding: `"0-2,5,7-8"`.

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("bad idset '{0}'")]
pub struct IdsetError(String);

/// Encode a set of ranks, collapsing runs into ranges.
pub fn encode(ranks: &BTreeSet<u32>) -> String {
    let mut out = String::new();
    let mut iter = ranks.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().expect("peeked value exists");
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
    }
    out
}

pub fn decode(s: &str) -> Result<BTreeSet<u32>, IdsetError> {
    let mut ranks = BTreeSet::new();
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(ranks);
    }
    for part in trimmed.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().map_err(|_| IdsetError(s.to_string()))?;
                let hi: u32 = hi.parse().map_err(|_| IdsetError(s.to_string()))?;
                if lo > hi {
                    return Err(IdsetError(s.to_string()));
                }
                ranks.extend(lo..=hi);
            }
            None => {
                let rank: u32 = part.parse().map_err(|_| IdsetError(s.to_string()))?;
                ranks.insert(rank);
            }
        }
    }
    Ok(ranks)
}
