// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::TestNameParseError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Returns true if `name` is a valid subtest or dynamic subtest name.
///
/// Valid names are non-empty and consist only of ASCII letters, digits, `_` and `-`.
pub fn is_valid_subtest_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// The prefix some test lists put in front of fully-qualified names.
pub const TEST_NAME_PREFIX: &str = "igt@";

/// A fully-qualified test name: `binary[@subtest[@dynamic]]`.
///
/// This is the name include and exclude filters are matched against, and the key of the result
/// document.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(into = "String", try_from = "String")]
pub struct TestName {
    /// The binary name (file name under the test root).
    pub binary: String,

    /// The subtest, if this names anything finer than a whole binary.
    pub subtest: Option<String>,

    /// The dynamic subtest, if any. Only set if `subtest` is set.
    pub dynamic: Option<String>,
}

impl TestName {
    /// Creates a name for a whole binary.
    pub fn binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            subtest: None,
            dynamic: None,
        }
    }

    /// Creates a name for a subtest of a binary.
    pub fn subtest(binary: impl Into<String>, subtest: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            subtest: Some(subtest.into()),
            dynamic: None,
        }
    }

    /// Creates a name for a dynamic subtest.
    pub fn dynamic(
        binary: impl Into<String>,
        subtest: impl Into<String>,
        dynamic: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            subtest: Some(subtest.into()),
            dynamic: Some(dynamic.into()),
        }
    }

    /// Returns the subtest component along with the dynamic component, joined by `@`.
    ///
    /// This is the form used in job list entries.
    pub fn subtest_path(&self) -> Option<String> {
        match (&self.subtest, &self.dynamic) {
            (Some(subtest), Some(dynamic)) => Some(format!("{subtest}@{dynamic}")),
            (Some(subtest), None) => Some(subtest.clone()),
            (None, _) => None,
        }
    }

    /// Returns the name with the `igt@` prefix, the form used as a key in result documents.
    pub fn to_prefixed(&self) -> String {
        format!("{TEST_NAME_PREFIX}{self}")
    }

    /// Returns true if this is a dynamic subtest name.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic.is_some()
    }

    /// Returns the name of the enclosing subtest, if this is a dynamic subtest.
    pub fn parent(&self) -> Option<TestName> {
        self.dynamic.as_ref()?;
        Some(TestName {
            binary: self.binary.clone(),
            subtest: self.subtest.clone(),
            dynamic: None,
        })
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.binary)?;
        if let Some(subtest) = &self.subtest {
            write!(f, "@{subtest}")?;
        }
        if let Some(dynamic) = &self.dynamic {
            write!(f, "@{dynamic}")?;
        }
        Ok(())
    }
}

impl FromStr for TestName {
    type Err = TestNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix(TEST_NAME_PREFIX).unwrap_or(s);
        let mut parts = trimmed.split('@');
        let binary = parts.next().unwrap_or_default();
        if binary.is_empty() || binary.contains('/') {
            return Err(TestNameParseError::new(s, "binary name is empty or a path"));
        }
        let subtest = parts.next();
        let dynamic = parts.next();
        if parts.next().is_some() {
            return Err(TestNameParseError::new(s, "too many `@` separators"));
        }
        for component in subtest.iter().chain(dynamic.iter()) {
            if !is_valid_subtest_name(component) {
                return Err(TestNameParseError::new(
                    s,
                    "subtest names may only contain [A-Za-z0-9_-]",
                ));
            }
        }

        Ok(Self {
            binary: binary.to_owned(),
            subtest: subtest.map(str::to_owned),
            dynamic: dynamic.map(str::to_owned),
        })
    }
}

impl From<TestName> for String {
    fn from(name: TestName) -> Self {
        name.to_string()
    }
}

impl TryFrom<String> for TestName {
    type Error = TestNameParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
