//! Result analysis: classification, error extraction, truncation and the
//! verification pass

use std::sync::Arc;
use tracing::warn;

use super::executor::{ErrorClassification, ExecutionResult, ExecutionStatus, RawCapture};
use super::languages::{FailureSignature, LanguageRegistry};
use super::verify::Verifier;
use crate::config::VerificationConfig;
use crate::error::Result;

/// Exit code of a process killed by SIGKILL
const SIGKILL_EXIT: i64 = 137;

/// Longest error summary kept on a result
const MAX_SUMMARY_BYTES: usize = 512;

pub struct ResultAnalyzer {
    languages: Arc<LanguageRegistry>,
    verifier: Verifier,
    max_output_bytes: usize,
}

impl ResultAnalyzer {
    pub fn new(
        languages: Arc<LanguageRegistry>,
        verification: &VerificationConfig,
        max_output_bytes: usize,
    ) -> Result<Self> {
        Ok(ResultAnalyzer {
            languages,
            verifier: Verifier::new(verification)?,
            max_output_bytes,
        })
    }

    /// Analyze, falling back to the unclassified capture if analysis fails
    pub fn analyze_or_raw(&self, raw: RawCapture) -> ExecutionResult {
        match self.analyze(raw.clone()) {
            Ok(result) => result,
            Err(e) => {
                warn!("Analysis of {} failed, returning raw capture: {}", raw.execution_id, e);
                let mut result = ExecutionResult::from_raw(raw);
                result.stdout_truncated |= truncate_utf8(&mut result.stdout, self.max_output_bytes);
                result.stderr_truncated |= truncate_utf8(&mut result.stderr, self.max_output_bytes);
                result
            }
        }
    }

    /// Classify a raw capture
    ///
    /// Status is taken from the driver as is; analysis only annotates.
    pub fn analyze(&self, raw: RawCapture) -> Result<ExecutionResult> {
        let verify = raw.verify;
        let infrastructure_error = raw.infrastructure_error.clone();
        let oom_killed = raw.oom_killed;
        let language = raw.language.clone();

        let mut result = ExecutionResult::from_raw(raw);
        result.stdout_truncated |= truncate_utf8(&mut result.stdout, self.max_output_bytes);
        result.stderr_truncated |= truncate_utf8(&mut result.stderr, self.max_output_bytes);

        if let Some(message) = infrastructure_error {
            result.error_classification = Some(ErrorClassification::InfrastructureError);
            result.error_summary = Some(summary(&message));
            return Ok(result);
        }

        match result.status {
            // The engine ended these; stderr signatures say nothing about why
            ExecutionStatus::TimedOut | ExecutionStatus::Killed => {}
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                let descriptor = self.languages.resolve(&language)?;
                let exit_code = result.exit_code.unwrap_or(0);

                if oom_killed || (exit_code == SIGKILL_EXIT && result.status == ExecutionStatus::Failed) {
                    result.error_classification = Some(ErrorClassification::ResourceViolation);
                    result.error_summary = Some(if oom_killed {
                        "killed by the runtime: memory limit exceeded".to_string()
                    } else {
                        format!("killed by the runtime (exit code {})", exit_code)
                    });
                } else {
                    let signature = descriptor.match_failure(&result.stderr);
                    if exit_code != 0 || signature.is_some() {
                        let (classification, line) = match signature {
                            Some((FailureSignature::Syntax, line)) => {
                                (ErrorClassification::SyntaxError, Some(line))
                            }
                            Some((FailureSignature::Runtime, line)) => {
                                (ErrorClassification::RuntimeException, Some(line))
                            }
                            None => (ErrorClassification::RuntimeException, None),
                        };
                        let line = line
                            .filter(|l| !l.is_empty())
                            .or_else(|| last_nonempty_line(&result.stderr))
                            .unwrap_or_else(|| format!("exited with code {}", exit_code));
                        result.error_classification = Some(classification);
                        result.error_summary = Some(summary(&line));
                    }
                }
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }

        result.verification = self.verifier.verify(&result.stdout, verify);
        Ok(result)
    }
}

/// Truncate to at most `max` bytes on a char boundary; true if anything was cut
pub fn truncate_utf8(text: &mut String, max: usize) -> bool {
    if text.len() <= max {
        return false;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    true
}

fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn summary(text: &str) -> String {
    let mut text = text.trim().to_string();
    truncate_utf8(&mut text, MAX_SUMMARY_BYTES);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_languages;
    use crate::sandbox::executor::ExecutionId;
    use crate::sandbox::verify::ConstantTag;
    use std::time::Duration;

    fn analyzer(max_output_bytes: usize) -> ResultAnalyzer {
        let languages = Arc::new(LanguageRegistry::from_table(&default_languages()).unwrap());
        ResultAnalyzer::new(languages, &VerificationConfig::default(), max_output_bytes).unwrap()
    }

    fn raw(language: &str, status: ExecutionStatus, exit_code: Option<i64>, stdout: &str, stderr: &str) -> RawCapture {
        RawCapture {
            execution_id: ExecutionId::generate(),
            language: language.to_string(),
            session: "default".to_string(),
            file_name: "main".to_string(),
            status,
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::from_millis(20),
            oom_killed: false,
            infrastructure_error: None,
            verify: None,
        }
    }

    #[test]
    fn test_clean_run() {
        let result = analyzer(1024)
            .analyze(raw("python", ExecutionStatus::Completed, Some(0), "hello\n", ""))
            .unwrap();
        assert!(result.success());
        assert!(result.error_classification.is_none());
        assert!(result.verification.is_none());
    }

    #[test]
    fn test_syntax_error() {
        let stderr = "  File \"/code/main.py\", line 1\n    def\n       ^\nSyntaxError: invalid syntax\n";
        let result = analyzer(1024)
            .analyze(raw("python", ExecutionStatus::Failed, Some(1), "", stderr))
            .unwrap();
        assert_eq!(result.error_classification, Some(ErrorClassification::SyntaxError));
        assert_eq!(result.error_summary.as_deref(), Some("SyntaxError: invalid syntax"));
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_runtime_exception() {
        let stderr = "panic: runtime error: index out of range [5] with length 3\n\ngoroutine 1 [running]:\nmain.main()\n";
        let result = analyzer(1024)
            .analyze(raw("go", ExecutionStatus::Failed, Some(2), "", stderr))
            .unwrap();
        assert_eq!(
            result.error_classification,
            Some(ErrorClassification::RuntimeException)
        );

        // Non-zero exit without any known signature
        let result = analyzer(1024)
            .analyze(raw("javascript", ExecutionStatus::Failed, Some(3), "", ""))
            .unwrap();
        assert_eq!(
            result.error_classification,
            Some(ErrorClassification::RuntimeException)
        );
        assert_eq!(result.error_summary.as_deref(), Some("exited with code 3"));
    }

    #[test]
    fn test_c_compile_error_is_syntax() {
        let stderr = "main.c: In function 'main':\nmain.c:3:5: error: expected ';' before 'return'\n";
        let result = analyzer(1024)
            .analyze(raw("c", ExecutionStatus::Failed, Some(1), "", stderr))
            .unwrap();
        assert_eq!(result.error_classification, Some(ErrorClassification::SyntaxError));
        assert_eq!(
            result.error_summary.as_deref(),
            Some("main.c:3:5: error: expected ';' before 'return'")
        );
    }

    #[test]
    fn test_resource_violation() {
        let mut capture = raw("python", ExecutionStatus::Failed, Some(137), "", "Killed\n");
        capture.oom_killed = true;
        let result = analyzer(1024).analyze(capture).unwrap();
        assert_eq!(
            result.error_classification,
            Some(ErrorClassification::ResourceViolation)
        );
    }

    #[test]
    fn test_timeout_skips_signatures() {
        let result = analyzer(1024)
            .analyze(raw(
                "python",
                ExecutionStatus::TimedOut,
                None,
                "",
                "Traceback (most recent call last):\nKeyboardInterrupt:\n",
            ))
            .unwrap();
        assert!(result.error_classification.is_none());
        assert!(result.exit_code.is_none());
    }

    #[test]
    fn test_infrastructure_error() {
        let mut capture = raw("python", ExecutionStatus::Failed, None, "", "");
        capture.infrastructure_error = Some("Failed to pull image python:3.11-slim".to_string());
        let result = analyzer(1024).analyze(capture).unwrap();
        assert_eq!(
            result.error_classification,
            Some(ErrorClassification::InfrastructureError)
        );
        assert!(result.error_summary.unwrap().contains("pull"));
    }

    #[test]
    fn test_truncation_keeps_char_boundary() {
        let result = analyzer(5)
            .analyze(raw("python", ExecutionStatus::Completed, Some(0), "abcdé", ""))
            .unwrap();
        assert_eq!(result.stdout, "abcd");
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[test]
    fn test_verification_does_not_change_status() {
        let mut capture = raw("python", ExecutionStatus::Completed, Some(0), "1.07\n", "");
        capture.verify = Some(ConstantTag::Pi);
        let result = analyzer(1024).analyze(capture).unwrap();
        let verification = result.verification.clone().unwrap();
        assert!(!verification.within_tolerance);
        assert_eq!(verification.expected, std::f64::consts::PI);
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_unknown_language_degrades_to_raw() {
        let analyzer = analyzer(1024);
        let capture = raw("cobol", ExecutionStatus::Failed, Some(1), "", "boom");
        assert!(analyzer.analyze(capture.clone()).is_err());

        let result = analyzer.analyze_or_raw(capture);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error_classification.is_none());
        assert_eq!(result.stderr, "boom");
    }
}
