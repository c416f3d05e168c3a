//! Mapping result items back to runner-native test ids.
//!
//! A failures-only rerun has to name the failed items in the runner's own
//! selection syntax, but a JUnit result file only records `classname` and
//! `name`. Each runner stores identity differently:
//!
//! | Format | Runner id | JUnit classname | JUnit name |
//! |--------|-----------|-----------------|------------|
//! | pytest | `tests/web/test_login.py::test_ok` | `tests.web.test_login` | `test_ok` |
//! | robot | `Web.Login.Valid Login` | `Web.Login` | `Valid Login` |
//! | nextest | `login::valid` | `mycrate` | `login::valid` |
//! | default | `name` | (ignored) | `name` |

use serde::{Deserialize, Serialize};

use super::junit::TestItem;

/// Selects how a result item is turned into a runner id.
///
/// ```toml
/// [runner]
/// junit_format = "robot"
/// ```
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JunitFormat {
    /// `classname` with dots as path separators, plus `.py::name`.
    Pytest,

    /// Robot Framework long names: `classname.name`.
    ///
    /// Robot's xunit output puts the dotted suite path in `classname`,
    /// which is what `--test` accepts once the test name is appended.
    Robot,

    /// `name` already holds the full test path.
    Nextest,

    /// Use `name` as-is.
    #[default]
    Default,
}

impl JunitFormat {
    /// Converts `classname` and `name` into the runner's test id.
    pub fn to_test_id(&self, classname: &str, name: &str) -> String {
        match self {
            JunitFormat::Pytest => format!("{}.py::{}", classname.replace('.', "/"), name),
            JunitFormat::Robot if classname.is_empty() => name.to_string(),
            JunitFormat::Robot => format!("{classname}.{name}"),
            JunitFormat::Nextest | JunitFormat::Default => name.to_string(),
        }
    }

    /// Runner id of a parsed result item.
    pub fn item_id(&self, item: &TestItem) -> String {
        self.to_test_id(&item.classname, &item.name)
    }
}
