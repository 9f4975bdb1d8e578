//! JUnit XML result parsing.
//!
//! Many runners can emit JUnit XML, so the generic adapter reads it as its
//! default result format. Test identity is stored differently from runner
//! to runner, which [`JunitFormat`] accounts for.
//!
//! # Supported Formats
//!
//! | Format | `TestId.file` | `TestId.scope` |
//! |--------|---------------|----------------|
//! | `default` | parsed from `name` (`file::scope`) | |
//! | `classname` | `classname` | `name` |
//! | `file` | `file` attribute, else `classname` | `name` |

use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use super::{FrameworkError, FrameworkResult};
use crate::model::{Execution, FailureDetail, RawStatus, TestId};

/// Specifies how to convert JUnit XML attributes to test IDs.
///
/// # Example
///
/// ```toml
/// [groups.go.framework]
/// type = "generic"
/// discover_command = "./list-tests.sh"
/// run_command = "gotestsum --junitfile junit.xml -- -run {tests} ./..."
/// result_file = "junit.xml"
/// junit_format = "classname"
/// ```
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JunitFormat {
    /// The `name` attribute already holds the full `file::scope` id.
    #[default]
    Default,

    /// `classname` is the file, `name` is the scope.
    ///
    /// - classname: `pkg/server`
    /// - name: `TestHandshake`
    /// - Result: `pkg/server::TestHandshake`
    Classname,

    /// The `file` attribute (falling back to `classname`) is the file and
    /// `name` is the scope. Jest and Vitest write this form.
    File,
}

impl JunitFormat {
    /// Convert JUnit XML attributes to a test ID.
    pub fn to_test_id(&self, classname: &str, name: &str, file: Option<&str>) -> Option<TestId> {
        match self {
            JunitFormat::Default => name.parse().ok(),
            JunitFormat::Classname if !classname.is_empty() => {
                Some(TestId::new(classname, name))
            }
            JunitFormat::File => {
                let file = file.filter(|f| !f.is_empty()).unwrap_or(classname);
                (!file.is_empty()).then(|| TestId::new(file, name))
            }
            JunitFormat::Classname => None,
        }
    }
}

/// Final state of one `<testcase>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseState {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug)]
struct Case {
    classname: String,
    name: String,
    file: Option<String>,
    time: f64,
    state: CaseState,
    message: Option<String>,
    kind: Option<String>,
    body: String,
}

impl Case {
    fn from_start(e: &BytesStart<'_>) -> FrameworkResult<Self> {
        let mut case = Case {
            classname: String::new(),
            name: String::new(),
            file: None,
            time: 0.0,
            state: CaseState::Passed,
            message: None,
            kind: None,
            body: String::new(),
        };
        for attr in e.attributes() {
            let attr = attr.map_err(|e| FrameworkError::ParseError(e.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| FrameworkError::ParseError(e.to_string()))?
                .into_owned();
            match attr.key.as_ref() {
                b"classname" => case.classname = value,
                b"name" => case.name = value,
                b"file" => case.file = Some(value),
                b"time" => case.time = value.trim().parse().unwrap_or(0.0),
                _ => {}
            }
        }
        Ok(case)
    }

    fn mark(&mut self, e: &BytesStart<'_>) -> FrameworkResult<()> {
        let state = match e.name().as_ref() {
            b"failure" | b"error" => CaseState::Failed,
            b"skipped" => CaseState::Skipped,
            _ => return Ok(()),
        };
        // A failure wins over a skip marker in the same case.
        if self.state != CaseState::Failed {
            self.state = state;
        }
        if state == CaseState::Failed {
            for attr in e.attributes() {
                let attr = attr.map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                let value = attr
                    .unescape_value()
                    .map_err(|e| FrameworkError::ParseError(e.to_string()))?
                    .into_owned();
                match attr.key.as_ref() {
                    b"message" => self.message = Some(value),
                    b"type" => self.kind = Some(value),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn into_execution(self, format: JunitFormat) -> Option<Execution> {
        let Some(id) = format.to_test_id(&self.classname, &self.name, self.file.as_deref())
        else {
            tracing::debug!(
                "Ignoring JUnit testcase without a usable id: classname={:?} name={:?}",
                self.classname,
                self.name
            );
            return None;
        };

        let duration = Duration::try_from_secs_f64(self.time).unwrap_or(Duration::ZERO);
        let execution = match self.state {
            CaseState::Passed => Execution::new(id, RawStatus::RanPassed),
            CaseState::Skipped => Execution::new(id, RawStatus::NotExecutedSkipped),
            CaseState::Failed => {
                let message = self
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| self.body.trim().to_string());
                let mut detail = FailureDetail::new(message);
                if let Some(kind) = self.kind {
                    detail = detail.with_exception_class(kind);
                }
                Execution::new(id, RawStatus::RanFailed).with_failure(detail)
            }
        };
        Some(execution.with_duration(duration))
    }
}

/// Parses JUnit XML into executions.
///
/// Nested `<testsuite>` elements are flattened. Test cases whose id cannot
/// be derived are dropped with a debug log.
pub fn parse_junit_xml(content: &str, format: JunitFormat) -> FrameworkResult<Vec<Execution>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut executions = Vec::new();
    let mut current: Option<Case> = None;
    let mut in_failure = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"testcase" => current = Some(Case::from_start(&e)?),
                b"failure" | b"error" | b"skipped" => {
                    if let Some(case) = current.as_mut() {
                        case.mark(&e)?;
                        in_failure = e.name().as_ref() != b"skipped";
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(exec) = Case::from_start(&e)?.into_execution(format) {
                        executions.push(exec);
                    }
                }
                b"failure" | b"error" | b"skipped" => {
                    if let Some(case) = current.as_mut() {
                        case.mark(&e)?;
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_failure => {
                if let Some(case) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                    case.body.push_str(&text);
                }
            }
            Ok(Event::CData(t)) if in_failure => {
                if let Some(case) = current.as_mut() {
                    case.body.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(exec) = current.take().and_then(|c| c.into_execution(format)) {
                        executions.push(exec);
                    }
                    in_failure = false;
                }
                b"failure" | b"error" => in_failure = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FrameworkError::ParseError(format!(
                    "invalid JUnit XML at position {}: {}",
                    reader.error_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    Ok(executions)
}
