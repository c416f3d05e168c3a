//! JUnit XML result documents.
//!
//! Every test attempt writes one JUnit XML file. [`ResultDocument`] reads
//! such a file into an ordered, de-duplicated list of [`TestItem`]s, lets
//! later attempts override earlier ones, and writes the result back out.
//!
//! Output is deterministic: suites appear in first-seen order, totals are
//! recomputed from the items, and times are written with millisecond
//! precision. Parsing a written document and writing it again yields the
//! same bytes.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" skipped="1" time="0.300">
//!   <testsuite name="web" tests="3" failures="1" errors="0" skipped="1" time="0.300">
//!     <testcase classname="web.login" name="valid_login" time="0.100"/>
//!     <testcase classname="web.login" name="bad_password" time="0.150">
//!       <failure message="expected error banner">banner not shown</failure>
//!     </testcase>
//!     <testcase classname="web.login" name="sso" time="0.050">
//!       <skipped/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use super::{ReportError, ReportResult};

/// Final status of one test item in one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl ItemStatus {
    /// Returns `true` for statuses that make an item eligible for rerun.
    pub fn is_failure(&self) -> bool {
        matches!(self, ItemStatus::Failed | ItemStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Passed => "passed",
            ItemStatus::Failed => "failed",
            ItemStatus::Error => "error",
            ItemStatus::Skipped => "skipped",
        }
    }
}

/// One `<testcase>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestItem {
    /// Name of the enclosing `<testsuite>`.
    pub suite: String,
    pub classname: String,
    pub name: String,
    pub status: ItemStatus,
    pub duration_ms: u64,
    /// `message` attribute of the failure, error or skip element.
    pub message: Option<String>,
    /// Text body of the failure, error or skip element.
    pub details: Option<String>,
}

impl TestItem {
    /// Creates a passed item with zero duration.
    pub fn new(suite: impl Into<String>, classname: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            classname: classname.into(),
            name: name.into(),
            status: ItemStatus::Passed,
            duration_ms: 0,
            message: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Identity of the item across attempts: `suite::classname::name`.
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.suite, self.classname, self.name)
    }
}

/// Tallies over a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl ResultCounts {
    pub fn has_failures(&self) -> bool {
        self.failed + self.errors > 0
    }

    /// Adds `other` into `self`.
    pub fn absorb(&mut self, other: &ResultCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }

    fn count(&mut self, status: ItemStatus) {
        self.total += 1;
        match status {
            ItemStatus::Passed => self.passed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Error => self.errors += 1,
            ItemStatus::Skipped => self.skipped += 1,
        }
    }
}

/// An ordered set of test items keyed by [`TestItem::key`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultDocument {
    items: Vec<TestItem>,
    index: HashMap<String, usize>,
}

impl ResultDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses a result file.
    pub fn load(path: &Path) -> ReportResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses JUnit XML.
    ///
    /// An item that appears twice keeps its first position and its last
    /// content.
    pub fn parse(content: &str) -> ReportResult<Self> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut document = ResultDocument::new();
        let mut suites: Vec<String> = Vec::new();
        let mut current: Option<TestItem> = None;
        let mut capturing = false;

        loop {
            match reader.read_event()? {
                Event::Start(element) => match element.name().as_ref() {
                    b"testsuite" => suites.push(attribute(&element, b"name")?.unwrap_or_default()),
                    b"testcase" => current = Some(item_from(&element, suites.last())?),
                    b"failure" | b"error" | b"skipped" => {
                        if let Some(item) = current.as_mut() {
                            apply_outcome(item, &element)?;
                            capturing = true;
                        }
                    }
                    _ => {}
                },
                Event::Empty(element) => match element.name().as_ref() {
                    b"testcase" => document.upsert(item_from(&element, suites.last())?),
                    b"failure" | b"error" | b"skipped" => {
                        if let Some(item) = current.as_mut() {
                            apply_outcome(item, &element)?;
                        }
                    }
                    _ => {}
                },
                Event::Text(text) if capturing => {
                    let text = text
                        .unescape()
                        .map_err(|e| ReportError::Parse(e.to_string()))?;
                    if let Some(item) = current.as_mut() {
                        append_details(item, &text);
                    }
                }
                Event::CData(data) if capturing => {
                    let bytes = data.into_inner();
                    if let Some(item) = current.as_mut() {
                        append_details(item, String::from_utf8_lossy(&bytes).trim());
                    }
                }
                Event::End(element) => match element.name().as_ref() {
                    b"testsuite" => {
                        suites.pop();
                    }
                    b"testcase" => {
                        if let Some(item) = current.take() {
                            document.upsert(item);
                        }
                        capturing = false;
                    }
                    b"failure" | b"error" | b"skipped" => capturing = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(document)
    }

    /// Inserts `item`, replacing any item with the same key in place.
    pub fn upsert(&mut self, item: TestItem) {
        let key = item.key();
        match self.index.get(&key) {
            Some(&position) => self.items[position] = item,
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
            }
        }
    }

    /// Applies every item of `later` on top of this document.
    pub fn overlay(&mut self, later: &ResultDocument) {
        for item in &later.items {
            self.upsert(item.clone());
        }
    }

    /// Keeps only the items for which `keep` returns `true`.
    ///
    /// Returns how many items were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&TestItem) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|item| keep(item));
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| (item.key(), position))
            .collect();
        before - self.items.len()
    }

    pub fn items(&self) -> &[TestItem] {
        &self.items
    }

    pub fn get(&self, key: &str) -> Option<&TestItem> {
        self.index.get(key).map(|&position| &self.items[position])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items whose status makes them eligible for rerun.
    pub fn failed(&self) -> impl Iterator<Item = &TestItem> {
        self.items.iter().filter(|item| item.status.is_failure())
    }

    pub fn failed_keys(&self) -> HashSet<String> {
        self.failed().map(TestItem::key).collect()
    }

    pub fn counts(&self) -> ResultCounts {
        let mut counts = ResultCounts::default();
        for item in &self.items {
            counts.count(item.status);
        }
        counts
    }

    /// Items grouped by suite, in first-seen suite order.
    pub fn suites(&self) -> Vec<(&str, Vec<&TestItem>)> {
        let mut order: Vec<(&str, Vec<&TestItem>)> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for item in &self.items {
            let position = *positions.entry(item.suite.as_str()).or_insert_with(|| {
                order.push((item.suite.as_str(), Vec::new()));
                order.len() - 1
            });
            order[position].1.push(item);
        }
        order
    }

    /// Serializes the document as JUnit XML.
    pub fn to_xml(&self) -> ReportResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let counts = self.counts();
        let total_ms: u64 = self.items.iter().map(|item| item.duration_ms).sum();
        let mut testsuites = BytesStart::new("testsuites");
        push_counts(&mut testsuites, &counts, total_ms);
        writer.write_event(Event::Start(testsuites))?;

        for (suite, items) in self.suites() {
            let mut suite_counts = ResultCounts::default();
            for item in &items {
                suite_counts.count(item.status);
            }
            let suite_ms: u64 = items.iter().map(|item| item.duration_ms).sum();

            let mut testsuite = BytesStart::new("testsuite");
            testsuite.push_attribute(("name", suite));
            push_counts(&mut testsuite, &suite_counts, suite_ms);
            writer.write_event(Event::Start(testsuite))?;

            for item in items {
                write_testcase(&mut writer, item)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|e| ReportError::Parse(e.to_string()))?;
        xml.push('\n');
        Ok(xml)
    }

    /// Writes the document to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> ReportResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_xml()?)?;
        Ok(())
    }
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, item: &TestItem) -> ReportResult<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", item.classname.as_str()));
    testcase.push_attribute(("name", item.name.as_str()));
    testcase.push_attribute(("time", format_secs(item.duration_ms).as_str()));

    let tag = match item.status {
        ItemStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        ItemStatus::Failed => "failure",
        ItemStatus::Error => "error",
        ItemStatus::Skipped => "skipped",
    };

    writer.write_event(Event::Start(testcase))?;

    let mut outcome = BytesStart::new(tag);
    if let Some(message) = &item.message {
        outcome.push_attribute(("message", sanitize(message).as_str()));
    }
    match item.details.as_deref().map(sanitize) {
        Some(details) if !details.is_empty() => {
            writer.write_event(Event::Start(outcome))?;
            writer.write_event(Event::Text(BytesText::new(&details)))?;
            writer.write_event(Event::End(BytesEnd::new(tag)))?;
        }
        _ => writer.write_event(Event::Empty(outcome))?,
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn push_counts(element: &mut BytesStart<'_>, counts: &ResultCounts, total_ms: u64) {
    element.push_attribute(("tests", counts.total.to_string().as_str()));
    element.push_attribute(("failures", counts.failed.to_string().as_str()));
    element.push_attribute(("errors", counts.errors.to_string().as_str()));
    element.push_attribute(("skipped", counts.skipped.to_string().as_str()));
    element.push_attribute(("time", format_secs(total_ms).as_str()));
}

fn item_from(element: &BytesStart<'_>, suite: Option<&String>) -> ReportResult<TestItem> {
    let name = attribute(element, b"name")?.unwrap_or_default();
    let classname = attribute(element, b"classname")?.unwrap_or_default();
    let duration_ms = attribute(element, b"time")?
        .map(|time| parse_millis(&time))
        .unwrap_or(0);

    Ok(TestItem::new(suite.cloned().unwrap_or_default(), classname, name).with_duration_ms(duration_ms))
}

fn apply_outcome(item: &mut TestItem, element: &BytesStart<'_>) -> ReportResult<()> {
    let status = match element.name().as_ref() {
        b"failure" => ItemStatus::Failed,
        b"error" => ItemStatus::Error,
        _ => ItemStatus::Skipped,
    };
    // A skip marker never hides a recorded failure.
    if status == ItemStatus::Skipped && item.status.is_failure() {
        return Ok(());
    }
    item.status = status;
    if let Some(message) = attribute(element, b"message")? {
        item.message = Some(message);
    }
    Ok(())
}

fn append_details(item: &mut TestItem, text: &str) {
    if text.is_empty() {
        return;
    }
    match item.details.as_mut() {
        Some(details) => {
            details.push('\n');
            details.push_str(text);
        }
        None => item.details = Some(text.to_string()),
    }
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> ReportResult<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ReportError::Parse(e.to_string()))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| ReportError::Parse(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parses a JUnit `time` attribute (seconds) into milliseconds.
fn parse_millis(time: &str) -> u64 {
    match time.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => (secs * 1000.0).round() as u64,
        _ => 0,
    }
}

fn format_secs(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}

/// Removes characters that are not allowed in XML 1.0.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
