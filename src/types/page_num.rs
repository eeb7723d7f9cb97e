//! Composite page numbers.
//!
//! Callers that only understand one flat page number address a flow page as
//! `M<stepIndex>:<subPageNum>`, packing the step and the submodule-local page
//! into a single token.

use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX: char = 'M';
const SEPARATOR: char = ':';

/// A step index plus a page identifier local to that step's submodule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositePageNum {
    pub step_index: usize,
    pub sub_page_num: String,
}

impl CompositePageNum {
    pub fn new(step_index: usize, sub_page_num: impl Into<String>) -> Self {
        Self {
            step_index,
            sub_page_num: sub_page_num.into(),
        }
    }

    /// Parse a token, returning `None` for anything that is not composite
    pub fn parse(token: &str) -> Option<Self> {
        decode(token)
    }
}

impl fmt::Display for CompositePageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}{SEPARATOR}{}",
            self.step_index, self.sub_page_num
        )
    }
}

/// Encode a step index and sub-page into `M<stepIndex>:<subPageNum>`.
pub fn encode(step_index: usize, sub_page_num: &str) -> String {
    format!("{PREFIX}{step_index}{SEPARATOR}{sub_page_num}")
}

/// Decode a composite token.
///
/// Malformed input is the ordinary "not composite" case and yields `None`:
/// the token must be `M`, one or more ASCII digits fitting a `usize`, `:`,
/// and a non-empty remainder taken verbatim.
pub fn decode(token: &str) -> Option<CompositePageNum> {
    let rest = token.strip_prefix(PREFIX)?;
    let (digits, sub_page_num) = rest.split_once(SEPARATOR)?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if sub_page_num.is_empty() {
        return None;
    }

    let step_index = digits.parse::<usize>().ok()?;
    Some(CompositePageNum::new(step_index, sub_page_num))
}
