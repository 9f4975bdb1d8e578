//! Cypress adapter.
//!
//! Cypress has no dry-run listing, so each spec file is one test: discovery
//! globs spec files under the launcher's working directory and every id is
//! a [`TestId::file_only`]. The only per-spec report Cypress prints
//! unconditionally is the `(Results)` table after each spec, which
//! [`ResultsParser`] reads from stdout as the run progresses.
//!
//! ```text
//!   (Results)
//!
//!   ┌──────────────────────────────────────┐
//!   │ Tests:        3                      │
//!   │ Passing:      2                      │
//!   │ Failing:      1                      │
//!   │ Pending:      0                      │
//!   │ Skipped:      0                      │
//!   │ Duration:     4 seconds              │
//!   │ Spec Ran:     login.cy.js            │
//!   └──────────────────────────────────────┘
//! ```
//!
//! Specs that never print a table fall back to the exit code: with exit 0
//! they passed. With a non-zero exit they stay unreported, or, when no
//! table was printed at all, the whole run counts as a crash.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use super::{FrameworkError, FrameworkResult, OutputParser, TestFramework, crash, render_command};
use crate::config::CypressConfig;
use crate::model::{DiscoveredTest, Execution, FailureDetail, RawStatus, TestId};
use crate::provider::{Command, ExecResult, Launcher};

/// Exit codes above this mean the process was killed by a signal.
const SIGNAL_EXIT_BASE: i32 = 128;

/// Cypress adapter. See the module docs.
pub struct CypressFramework {
    config: CypressConfig,
    root: PathBuf,
}

impl CypressFramework {
    /// `root` is the directory spec patterns are relative to.
    pub fn new(config: CypressConfig, root: PathBuf) -> Self {
        Self { config, root }
    }

    fn build_globset(pattern: &str) -> FrameworkResult<GlobSet> {
        let glob = Glob::new(pattern).map_err(|e| {
            FrameworkError::DiscoveryFailed(format!("invalid spec pattern {:?}: {}", pattern, e))
        })?;
        GlobSetBuilder::new()
            .add(glob)
            .build()
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))
    }
}

#[async_trait]
impl TestFramework for CypressFramework {
    fn name(&self) -> &'static str {
        "cypress"
    }

    async fn discover(&self, _launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        let include = Self::build_globset(&self.config.test_file_pattern)?;
        let exclude = self
            .config
            .test_file_exclude_pattern
            .as_deref()
            .map(Self::build_globset)
            .transpose()?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.file_name() != "node_modules")
        {
            let entry = entry.map_err(|e| {
                FrameworkError::DiscoveryFailed(format!(
                    "cannot walk {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if !include.is_match(relative) {
                continue;
            }
            if exclude.as_ref().is_some_and(|set| set.is_match(relative)) {
                continue;
            }
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        files.sort();

        tracing::debug!(
            "Found {} Cypress spec files matching {}",
            files.len(),
            self.config.test_file_pattern
        );

        Ok(files
            .into_iter()
            .map(|file| DiscoveredTest::new(TestId::file_only(file.clone()), file))
            .collect())
    }

    fn produce_test_execution_command(
        &self,
        tests: &[TestId],
        retry: bool,
    ) -> FrameworkResult<Command> {
        let template = match (&self.config.retry_command, retry) {
            (Some(retry_command), true) => retry_command,
            _ => &self.config.run_command,
        };
        let specs = tests
            .iter()
            .map(|t| t.file.as_str())
            .collect::<Vec<_>>()
            .join(",");
        render_command(template, &[specs], None)
    }

    fn output_parser(&self, tests: &[TestId]) -> Option<Box<dyn OutputParser>> {
        Some(Box::new(ResultsParser::new(tests.to_vec())))
    }

    fn parse_results(
        &self,
        tests: &[TestId],
        output: &ExecResult,
        _result_file: Option<&str>,
        streamed: &[TestId],
    ) -> FrameworkResult<Vec<Execution>> {
        let missing: Vec<&TestId> = tests.iter().filter(|t| !streamed.contains(t)).collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        if output.success() {
            return Ok(missing
                .into_iter()
                .map(|id| Execution::new(id.clone(), RawStatus::RanPassed))
                .collect());
        }

        if streamed.is_empty() || output.exit_code > SIGNAL_EXIT_BASE {
            return Err(crash(output, "Cypress printed no spec results"));
        }

        tracing::debug!(
            "Cypress exited with code {} without results for {} spec(s)",
            output.exit_code,
            missing.len()
        );
        Ok(Vec::new())
    }
}

/// Reads Cypress `(Results)` tables from stdout.
pub struct ResultsParser {
    pending: Vec<TestId>,
    in_results: bool,
    table: Table,
}

#[derive(Debug, Default)]
struct Table {
    tests: u32,
    passing: u32,
    failing: u32,
    pending: u32,
    skipped: u32,
    duration: Duration,
}

impl Table {
    fn status(&self) -> RawStatus {
        if self.failing > 0 {
            RawStatus::RanFailed
        } else if self.passing == 0 && self.pending + self.skipped >= self.tests {
            RawStatus::NotExecutedSkipped
        } else {
            RawStatus::RanPassed
        }
    }
}

impl ResultsParser {
    pub fn new(tests: Vec<TestId>) -> Self {
        Self {
            pending: tests,
            in_results: false,
            table: Table::default(),
        }
    }

    /// Matches a reported spec to a requested one: an exact relative path
    /// first, then a path suffix when exactly one requested spec has it.
    fn take_spec(&mut self, spec: &str) -> Option<TestId> {
        let spec = spec.replace('\\', "/");
        if let Some(pos) = self.pending.iter().position(|id| id.file == spec) {
            return Some(self.pending.remove(pos));
        }

        let suffix = format!("/{}", spec);
        let candidates: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, id)| id.file.ends_with(&suffix))
            .map(|(pos, _)| pos)
            .collect();
        match candidates.as_slice() {
            [pos] => Some(self.pending.remove(*pos)),
            [] => None,
            _ => {
                tracing::debug!("Spec {} matches more than one requested spec", spec);
                None
            }
        }
    }

    fn finish(&mut self, spec: &str) -> Option<Execution> {
        self.in_results = false;
        let table = std::mem::take(&mut self.table);
        let Some(id) = self.take_spec(spec) else {
            tracing::debug!("Ignoring results for unrequested spec {}", spec);
            return None;
        };
        let status = table.status();
        let mut execution = Execution::new(id, status).with_duration(table.duration);
        if status == RawStatus::RanFailed {
            execution = execution.with_failure(FailureDetail::new(format!(
                "{} of {} tests failed",
                table.failing, table.tests
            )));
        }
        Some(execution)
    }
}

impl OutputParser for ResultsParser {
    fn feed(&mut self, line: &str) -> Vec<Execution> {
        let plain = console::strip_ansi_codes(line);
        let text = plain
            .trim()
            .trim_start_matches('│')
            .trim_end_matches('│')
            .trim();

        if text == "(Results)" {
            self.in_results = true;
            self.table = Table::default();
            return Vec::new();
        }
        if !self.in_results {
            return Vec::new();
        }

        let Some((key, value)) = text.split_once(':') else {
            return Vec::new();
        };
        let value = value.trim();
        let count = || value.parse::<u32>().unwrap_or(0);
        match key.trim() {
            "Tests" => self.table.tests = count(),
            "Passing" => self.table.passing = count(),
            "Failing" => self.table.failing = count(),
            "Pending" => self.table.pending = count(),
            "Skipped" => self.table.skipped = count(),
            "Duration" => self.table.duration = parse_duration(value),
            "Spec Ran" => return self.finish(value).into_iter().collect(),
            _ => {}
        }
        Vec::new()
    }
}

/// Parses Cypress durations: `4 seconds`, `1 minute, 2 seconds`, `850ms`
/// or the older `00:04` clock form.
fn parse_duration(value: &str) -> Duration {
    if value.contains(':') {
        return value
            .split(':')
            .filter_map(|part| part.trim().parse::<u64>().ok())
            .fold(Duration::ZERO, |acc, n| acc * 60 + Duration::from_secs(n));
    }

    let mut total = Duration::ZERO;
    for part in value.split(',') {
        let part = part.trim();
        if let Some(ms) = part.strip_suffix("ms").and_then(|n| n.trim().parse().ok()) {
            total += Duration::from_millis(ms);
            continue;
        }
        let mut words = part.split_whitespace();
        let (Some(n), Some(unit)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(n) = n.parse::<u64>() else {
            continue;
        };
        total += match unit {
            u if u.starts_with("hour") => Duration::from_secs(n * 3600),
            u if u.starts_with("minute") => Duration::from_secs(n * 60),
            u if u.starts_with("second") => Duration::from_secs(n),
            _ => Duration::ZERO,
        };
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLauncher;
    use std::fs;
    use std::path::Path;

    fn results_block(spec: &str, passing: u32, failing: u32, pending: u32) -> Vec<String> {
        let tests = passing + failing + pending;
        vec![
            "  (Results)".to_string(),
            String::new(),
            "  ┌──────────────────────────────────────┐".to_string(),
            format!("  │ Tests:        {}                      │", tests),
            format!("  │ Passing:      {}                      │", passing),
            format!("  │ Failing:      {}                      │", failing),
            format!("  │ Pending:      {}                      │", pending),
            "  │ Skipped:      0                      │".to_string(),
            "  │ Duration:     1 minute, 2 seconds    │".to_string(),
            format!("  │ Spec Ran:     {}            │", spec),
            "  └──────────────────────────────────────┘".to_string(),
        ]
    }

    fn feed_all(parser: &mut ResultsParser, lines: &[String]) -> Vec<Execution> {
        lines.iter().flat_map(|l| parser.feed(l)).collect()
    }

    #[test]
    fn test_results_table_statuses() {
        let a = TestId::file_only("cypress/e2e/auth/login.cy.js");
        let b = TestId::file_only("cypress/e2e/cart.cy.ts");
        let c = TestId::file_only("cypress/e2e/wip.cy.ts");
        let mut parser = ResultsParser::new(vec![a.clone(), b.clone(), c.clone()]);

        let mut lines = results_block("auth/login.cy.js", 3, 0, 0);
        lines.extend(results_block("cart.cy.ts", 1, 2, 0));
        lines.extend(results_block("wip.cy.ts", 0, 0, 2));
        let execs = feed_all(&mut parser, &lines);

        assert_eq!(execs.len(), 3);
        assert_eq!(execs[0].id, a);
        assert_eq!(execs[0].status, RawStatus::RanPassed);
        assert_eq!(execs[0].duration, Duration::from_secs(62));
        assert_eq!(execs[1].id, b);
        assert_eq!(execs[1].status, RawStatus::RanFailed);
        assert_eq!(
            execs[1].failure.as_ref().unwrap().message,
            "2 of 3 tests failed"
        );
        assert_eq!(execs[2].id, c);
        assert_eq!(execs[2].status, RawStatus::NotExecutedSkipped);
    }

    #[test]
    fn test_parser_ignores_noise_and_unknown_specs() {
        let mut parser = ResultsParser::new(vec![TestId::file_only("cypress/e2e/a.cy.js")]);
        assert!(parser.feed("  Running:  a.cy.js   (1 of 1)").is_empty());
        assert!(feed_all(&mut parser, &results_block("other.cy.js", 1, 0, 0)).is_empty());
        assert_eq!(
            feed_all(&mut parser, &results_block("a.cy.js", 1, 0, 0)).len(),
            1
        );
    }

    #[test]
    fn test_same_named_specs_in_different_directories() {
        let nested = TestId::file_only("cypress/e2e/a/login.cy.js");
        let top = TestId::file_only("a/login.cy.js");
        let other = TestId::file_only("cypress/e2e/b/login.cy.js");
        let mut parser = ResultsParser::new(vec![nested.clone(), top.clone(), other.clone()]);

        // Exact path wins over a suffix match.
        let execs = feed_all(&mut parser, &results_block("a/login.cy.js", 1, 0, 0));
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].id, top);

        // A bare file name fits both remaining specs.
        assert!(feed_all(&mut parser, &results_block("login.cy.js", 1, 0, 0)).is_empty());

        let execs = feed_all(&mut parser, &results_block("b/login.cy.js", 0, 1, 0));
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].id, other);
        assert_eq!(parser.pending, vec![nested]);
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("4 seconds"), Duration::from_secs(4));
        assert_eq!(parse_duration("850ms"), Duration::from_millis(850));
        assert_eq!(parse_duration("00:04"), Duration::from_secs(4));
        assert_eq!(parse_duration("01:02"), Duration::from_secs(62));
        assert_eq!(parse_duration("garbage"), Duration::ZERO);
    }

    #[test]
    fn test_command_joins_specs_with_commas() {
        let framework = CypressFramework::new(CypressConfig::default(), PathBuf::from("."));
        let cmd = framework
            .produce_test_execution_command(
                &[
                    TestId::file_only("cypress/e2e/a.cy.js"),
                    TestId::file_only("cypress/e2e/b.cy.js"),
                ],
                false,
            )
            .unwrap();
        assert_eq!(
            cmd.args,
            vec!["cypress", "run", "--spec", "cypress/e2e/a.cy.js,cypress/e2e/b.cy.js"]
        );
    }

    #[test]
    fn test_exit_code_fallback() {
        let framework = CypressFramework::new(CypressConfig::default(), PathBuf::from("."));
        let a = TestId::file_only("a.cy.js");
        let b = TestId::file_only("b.cy.js");
        let tests = vec![a.clone(), b.clone()];

        let ok = ExecResult::default();
        let execs = framework
            .parse_results(&tests, &ok, None, std::slice::from_ref(&a))
            .unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].id, b);
        assert_eq!(execs[0].status, RawStatus::RanPassed);

        let failed = ExecResult {
            exit_code: 1,
            ..Default::default()
        };
        let execs = framework
            .parse_results(&tests, &failed, None, std::slice::from_ref(&a))
            .unwrap();
        assert!(execs.is_empty());

        let err = framework
            .parse_results(&tests, &failed, None, &[])
            .unwrap_err();
        assert!(matches!(err, FrameworkError::AdapterCrash { .. }));
    }

    #[tokio::test]
    async fn test_discover_globs_spec_files() {
        let dir = tempfile::tempdir().unwrap();
        let e2e = dir.path().join("cypress/e2e/auth");
        fs::create_dir_all(&e2e).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg/cypress/e2e")).unwrap();
        fs::write(e2e.join("login.cy.js"), "").unwrap();
        fs::write(dir.path().join("cypress/e2e/cart.cy.ts"), "").unwrap();
        fs::write(dir.path().join("cypress/e2e/draft.cy.ts"), "").unwrap();
        fs::write(dir.path().join("cypress/e2e/helpers.js"), "").unwrap();
        fs::write(
            dir.path().join("node_modules/pkg/cypress/e2e/x.cy.js"),
            "",
        )
        .unwrap();

        let config = CypressConfig {
            test_file_exclude_pattern: Some("**/draft.cy.ts".into()),
            ..Default::default()
        };
        let framework = CypressFramework::new(config, dir.path().to_path_buf());
        let tests = framework.discover(&ScriptedLauncher::new()).await.unwrap();

        let ids: Vec<String> = tests.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["cypress/e2e/auth/login.cy.js", "cypress/e2e/cart.cy.ts"]
        );
    }

    #[tokio::test]
    async fn test_discover_missing_root_fails() {
        let framework = CypressFramework::new(
            CypressConfig::default(),
            Path::new("/nonexistent/verdict-root").to_path_buf(),
        );
        let err = framework
            .discover(&ScriptedLauncher::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameworkError::DiscoveryFailed(_)));
    }
}
