// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wildcard pattern lists used by `--run-subtest` and `--dynamic-subtest`.

use crate::errors::PatternParseError;
use std::fmt;

/// A single wildcard pattern, possibly negated.
///
/// The glob is compiled once to a byte regex with no separator handling, so `*` and `?` match
/// any characters of a subtest name and `[...]` matches a character class.
#[derive(Clone, Debug)]
pub struct SubtestPattern {
    /// The pattern string, without the leading `!`.
    glob_str: String,

    /// True if the pattern was written with a leading `!`.
    negated: bool,

    /// The regex to match against.
    regex: regex::bytes::Regex,
}

impl SubtestPattern {
    /// Creates a new pattern from a single list element such as `basic-*` or `!basic-render*`.
    pub fn new(input: &str) -> Result<Self, PatternParseError> {
        let (negated, glob_str) = match input.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        if glob_str.is_empty() {
            return Err(PatternParseError::Empty {
                input: input.to_owned(),
            });
        }

        let glob = globset::GlobBuilder::new(glob_str)
            // Subtest names never contain `/`, and `*` should cross nothing special.
            .literal_separator(false)
            // `\` is an ordinary character in subtest names.
            .backslash_escape(false)
            .build()
            .map_err(|error| PatternParseError::InvalidGlob {
                input: input.to_owned(),
                error,
            })?;

        let regex = regex::bytes::Regex::new(glob.regex()).map_err(|error| {
            PatternParseError::Regex {
                input: input.to_owned(),
                message: error.to_string(),
            }
        })?;

        Ok(Self {
            glob_str: glob_str.to_owned(),
            negated,
            regex,
        })
    }

    /// Returns true if this pattern was negated with `!`.
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Returns true if the glob part of this pattern matches `name`, ignoring negation.
    pub fn glob_matches(&self, name: &str) -> bool {
        self.regex.is_match(name.as_bytes())
    }
}

impl fmt::Display for SubtestPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.negated {
            write!(f, "!")?;
        }
        write!(f, "{}", self.glob_str)
    }
}

/// An ordered, comma-separated list of wildcard patterns.
///
/// A name matches the list if the *last* pattern whose glob matches it is not negated. A name
/// that no pattern matches is not selected.
///
/// ```
/// use igt_metadata::SubtestPatternList;
///
/// let list: SubtestPatternList = "basic*,!basic-render*".parse().unwrap();
/// assert!(list.is_match("basic-copy"));
/// assert!(!list.is_match("basic-render-a"));
/// assert!(!list.is_match("advanced"));
/// ```
#[derive(Clone, Debug)]
pub struct SubtestPatternList {
    patterns: Vec<SubtestPattern>,
}

impl SubtestPatternList {
    /// Creates a pattern list from individual pattern strings.
    pub fn new<I, S>(patterns: I) -> Result<Self, PatternParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| SubtestPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if `name` is selected by this list.
    pub fn is_match(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .rev()
            .find(|p| p.glob_matches(name))
            .is_some_and(|p| !p.is_negated())
    }

    /// Returns the patterns in this list.
    pub fn patterns(&self) -> &[SubtestPattern] {
        &self.patterns
    }
}

impl std::str::FromStr for SubtestPatternList {
    type Err = PatternParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(','))
    }
}

impl fmt::Display for SubtestPatternList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{pattern}")?;
        }
        Ok(())
    }
}
