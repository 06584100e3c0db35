//! Language registry
//!
//! Immutable table built once at startup from the language configuration.
//! Malformed entries fail here, not at request time.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{builtin_language, LanguageConfig, FILE_PLACEHOLDER, STEM_PLACEHOLDER};
use crate::error::{Error, Result};

/// Resolved, immutable description of one supported language
#[derive(Debug, Clone)]
pub struct LanguageDescriptor {
    pub id: String,
    pub runtime_image: String,
    pub file_extension: String,
    pub extra_packages: Vec<String>,
    pub env: BTreeMap<String, String>,
    run_command: Vec<String>,
    compile_command: Option<Vec<String>>,
    install_command: Vec<String>,
    syntax_patterns: Vec<Regex>,
    runtime_patterns: Vec<Regex>,
}

/// Stderr signature that matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignature {
    Syntax,
    Runtime,
}

impl LanguageDescriptor {
    /// Build a descriptor from a configuration entry
    pub fn from_config(id: &str, config: &LanguageConfig) -> Result<Self> {
        let fail = |msg: String| Error::Config(format!("languages.{}: {}", id, msg));

        if config.image.trim().is_empty() {
            return Err(fail("image is empty".to_string()));
        }
        if config.file_ext.is_empty() || !config.file_ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(fail(format!("invalid file extension '{}'", config.file_ext)));
        }
        let run_command = config.cmd.argv();
        if run_command.is_empty() {
            return Err(fail("run command is empty".to_string()));
        }
        let compile_command = match &config.compile {
            Some(compile) if compile.is_empty() => {
                return Err(fail("compile command is empty".to_string()))
            }
            Some(compile) => Some(compile.argv()),
            None => None,
        };

        // Entries that name no patterns inherit the built-in ones for the same id
        let builtin = builtin_language(id);
        let syntax = if config.syntax_patterns.is_empty() {
            builtin.as_ref().map(|b| b.syntax_patterns.clone()).unwrap_or_default()
        } else {
            config.syntax_patterns.clone()
        };
        let runtime = if config.runtime_patterns.is_empty() {
            builtin.as_ref().map(|b| b.runtime_patterns.clone()).unwrap_or_default()
        } else {
            config.runtime_patterns.clone()
        };

        Ok(LanguageDescriptor {
            id: id.to_string(),
            runtime_image: config.image.clone(),
            file_extension: config.file_ext.clone(),
            extra_packages: config.packages.clone(),
            env: config.env.clone(),
            run_command,
            compile_command,
            install_command: config.install_cmd.argv(),
            syntax_patterns: compile_patterns(id, &syntax)?,
            runtime_patterns: compile_patterns(id, &runtime)?,
        })
    }

    /// Whether this language compiles before it runs
    pub fn is_two_stage(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Container command for the given source file
    ///
    /// Single-stage languages run their argv directly. Two-stage languages
    /// go through `sh -c` with every argument single-quoted.
    pub fn command_for(&self, file_name: &str) -> Vec<String> {
        // After a compile stage the run command executes the build output
        let run = substitute(&self.run_command, file_name, self.compile_command.is_none());
        match &self.compile_command {
            None => run,
            Some(compile) => {
                let compile = substitute(compile, file_name, true);
                let script = format!("{} && exec {}", shell_join(&compile), shell_join(&run));
                vec!["sh".to_string(), "-c".to_string(), script]
            }
        }
    }

    /// Install command with the extra packages appended, if any are listed
    pub fn install_command(&self) -> Option<Vec<String>> {
        if self.extra_packages.is_empty() || self.install_command.is_empty() {
            return None;
        }
        let mut argv = self.install_command.clone();
        argv.extend(self.extra_packages.iter().cloned());
        Some(argv)
    }

    /// Install command template without packages
    pub fn install_template(&self) -> &[String] {
        &self.install_command
    }

    /// Generated file name for requests that do not name one
    pub fn default_file_name(&self, token: &str) -> String {
        format!("script_{}.{}", token, self.file_extension)
    }

    /// Append the language extension when the name lacks it
    pub fn ensure_extension(&self, file_name: &str) -> String {
        let suffix = format!(".{}", self.file_extension);
        if file_name.ends_with(&suffix) {
            file_name.to_string()
        } else {
            format!("{}{}", file_name, suffix)
        }
    }

    /// Match stderr against the failure signatures
    ///
    /// Syntax signatures win over runtime ones. Returns the kind and the
    /// line that best describes the failure.
    pub fn match_failure(&self, stderr: &str) -> Option<(FailureSignature, String)> {
        for pattern in &self.syntax_patterns {
            if let Some(m) = pattern.find(stderr) {
                return Some((FailureSignature::Syntax, line_containing(stderr, m.start())));
            }
        }
        if self.runtime_patterns.iter().any(|p| p.is_match(stderr)) {
            return Some((FailureSignature::Runtime, last_line(stderr).unwrap_or_default()));
        }
        None
    }
}

/// Read-only table of supported languages
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, Arc<LanguageDescriptor>>,
}

impl LanguageRegistry {
    /// Build the registry from a language table
    pub fn from_table(table: &BTreeMap<String, LanguageConfig>) -> Result<Self> {
        if table.is_empty() {
            return Err(Error::Config("no languages configured".to_string()));
        }

        let mut languages = BTreeMap::new();
        for (id, config) in table {
            let id = id.to_lowercase();
            let descriptor = LanguageDescriptor::from_config(&id, config)?;
            if languages.insert(id.clone(), Arc::new(descriptor)).is_some() {
                return Err(Error::Config(format!("duplicate language id '{}'", id)));
            }
        }

        Ok(LanguageRegistry { languages })
    }

    /// Resolve a language id (case-insensitive)
    pub fn resolve(&self, id: &str) -> Result<Arc<LanguageDescriptor>> {
        self.languages
            .get(&id.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("language '{}'", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.languages.contains_key(&id.trim().to_lowercase())
    }

    /// Language ids in sorted order
    pub fn ids(&self) -> Vec<&str> {
        self.languages.keys().map(|s| s.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LanguageDescriptor>> {
        self.languages.values()
    }

    /// Comma-separated list for error messages
    pub fn supported(&self) -> String {
        self.ids().join(", ")
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

fn compile_patterns(id: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                Error::Config(format!("languages.{}: invalid pattern '{}': {}", id, p, e))
            })
        })
        .collect()
}

fn substitute(template: &[String], file_name: &str, append_file: bool) -> Vec<String> {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);

    let has_placeholder = template
        .iter()
        .any(|arg| arg.contains(FILE_PLACEHOLDER) || arg.contains(STEM_PLACEHOLDER));

    let mut argv: Vec<String> = template
        .iter()
        .map(|arg| arg.replace(FILE_PLACEHOLDER, file_name).replace(STEM_PLACEHOLDER, stem))
        .collect();
    if !has_placeholder && append_file {
        argv.push(file_name.to_string());
    }
    argv
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

fn line_containing(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = text[offset..].find('\n').map_or(text.len(), |i| offset + i);
    text[start..end].trim().to_string()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_languages, CommandLine};

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_table(&default_languages()).unwrap()
    }

    #[test]
    fn test_resolve() {
        let registry = registry();
        let python = registry.resolve("Python").unwrap();
        assert_eq!(python.runtime_image, "python:3.11-slim");
        assert_eq!(python.file_extension, "py");
        assert!(matches!(registry.resolve("cobol"), Err(Error::NotFound(_))));
        assert_eq!(registry.supported(), "c, go, javascript, python");
    }

    #[test]
    fn test_single_stage_command() {
        let registry = registry();
        let go = registry.resolve("go").unwrap();
        assert_eq!(go.command_for("main.go"), vec!["go", "run", "main.go"]);

        let mut table = BTreeMap::new();
        let mut ruby = builtin_language("python").unwrap();
        ruby.cmd = CommandLine::Line("ruby".to_string());
        table.insert("ruby".to_string(), ruby);
        let registry = LanguageRegistry::from_table(&table).unwrap();
        assert_eq!(
            registry.resolve("ruby").unwrap().command_for("x.rb"),
            vec!["ruby", "x.rb"]
        );
    }

    #[test]
    fn test_two_stage_command_is_quoted() {
        let c = registry().resolve("c").unwrap();
        assert!(c.is_two_stage());
        let cmd = c.command_for("main.c");
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "gcc -O2 -o /tmp/program main.c -lm && exec /tmp/program"
        );

        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    #[test]
    fn test_file_names() {
        let python = registry().resolve("python").unwrap();
        assert_eq!(python.default_file_name("1a2b3c4d"), "script_1a2b3c4d.py");
        assert_eq!(python.ensure_extension("solver"), "solver.py");
        assert_eq!(python.ensure_extension("solver.py"), "solver.py");
    }

    #[test]
    fn test_failure_signatures() {
        let python = registry().resolve("python").unwrap();

        let syntax = "  File \"/code/main.py\", line 1\n    print(\n         ^\nSyntaxError: '(' was never closed\n";
        let (kind, line) = python.match_failure(syntax).unwrap();
        assert_eq!(kind, FailureSignature::Syntax);
        assert_eq!(line, "SyntaxError: '(' was never closed");

        let runtime = "Traceback (most recent call last):\n  File \"/code/main.py\", line 1, in <module>\n    1/0\nZeroDivisionError: division by zero\n";
        let (kind, line) = python.match_failure(runtime).unwrap();
        assert_eq!(kind, FailureSignature::Runtime);
        assert_eq!(line, "ZeroDivisionError: division by zero");

        assert!(python.match_failure("just a warning\n").is_none());
    }

    #[test]
    fn test_install_command() {
        let mut table = default_languages();
        table.get_mut("python").unwrap().packages = vec!["numpy".to_string(), "sympy".to_string()];
        let registry = LanguageRegistry::from_table(&table).unwrap();

        let python = registry.resolve("python").unwrap();
        assert_eq!(
            python.install_command().unwrap(),
            vec!["pip", "install", "numpy", "sympy"]
        );
        assert!(registry.resolve("go").unwrap().install_command().is_none());
    }

    #[test]
    fn test_malformed_entry_fails_eagerly() {
        let mut table = default_languages();
        table.get_mut("go").unwrap().runtime_patterns = vec!["[".to_string()];
        assert!(matches!(
            LanguageRegistry::from_table(&table),
            Err(Error::Config(_))
        ));

        assert!(LanguageRegistry::from_table(&BTreeMap::new()).is_err());
    }
}
