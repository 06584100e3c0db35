//! Language table configuration types
//!
//! Each entry maps a language id to its runtime image and structured
//! command lines. Unknown keys are ignored; missing required fields make
//! the whole configuration fail to parse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder replaced with the source file name in command lines
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Placeholder replaced with the file name without its extension
pub const STEM_PLACEHOLDER: &str = "{stem}";

/// A command line, written either as a single string or as an argv list
///
/// String form is split on whitespace; it never goes through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Split into program and arguments
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::Argv(argv) => argv.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv().is_empty()
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Line(line.to_string())
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(argv: Vec<&str>) -> Self {
        CommandLine::Argv(argv.into_iter().map(str::to_string).collect())
    }
}

/// One entry of the language table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Runtime image
    pub image: String,
    /// Source file extension, without the dot
    pub file_ext: String,
    /// Run command; `{file}` is substituted, or the file is appended
    pub cmd: CommandLine,
    /// Dependency install command
    pub install_cmd: CommandLine,
    /// Extra packages expected in the image
    #[serde(default)]
    pub packages: Vec<String>,
    /// Optional first stage (compile) run before `cmd`
    #[serde(default)]
    pub compile: Option<CommandLine>,
    /// Extra environment for the unit
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Stderr patterns that indicate a parse/compile-time failure
    #[serde(default)]
    pub syntax_patterns: Vec<String>,
    /// Stderr patterns that indicate a runtime exception
    #[serde(default)]
    pub runtime_patterns: Vec<String>,
}

/// Built-in language table
pub fn default_languages() -> BTreeMap<String, LanguageConfig> {
    let mut languages = BTreeMap::new();
    for id in ["python", "javascript", "go", "c"] {
        if let Some(config) = builtin_language(id) {
            languages.insert(id.to_string(), config);
        }
    }
    languages
}

/// Built-in definition for a known language id
pub fn builtin_language(id: &str) -> Option<LanguageConfig> {
    let config = match id {
        "python" => LanguageConfig {
            image: "python:3.11-slim".to_string(),
            file_ext: "py".to_string(),
            cmd: vec!["python", "-u", FILE_PLACEHOLDER].into(),
            install_cmd: "pip install".into(),
            packages: Vec::new(),
            compile: None,
            env: BTreeMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]),
            syntax_patterns: strings(&[r"(?m)^\s*(SyntaxError|IndentationError|TabError):"]),
            runtime_patterns: strings(&[
                r"Traceback \(most recent call last\)",
                r"(?m)^\w+(Error|Exception|Exit|Interrupt):",
            ]),
        },
        "javascript" => LanguageConfig {
            image: "node:18-slim".to_string(),
            file_ext: "js".to_string(),
            cmd: vec!["node", FILE_PLACEHOLDER].into(),
            install_cmd: "npm install".into(),
            packages: Vec::new(),
            compile: None,
            env: BTreeMap::new(),
            syntax_patterns: strings(&[r"(?m)^SyntaxError:"]),
            runtime_patterns: strings(&[r"(?m)^(Uncaught )?\w*Error\b", r"(?m)^\s+at .+:\d+:\d+"]),
        },
        "go" => LanguageConfig {
            image: "golang:1.20-alpine".to_string(),
            file_ext: "go".to_string(),
            cmd: vec!["go", "run", FILE_PLACEHOLDER].into(),
            install_cmd: "go get".into(),
            packages: Vec::new(),
            compile: None,
            env: BTreeMap::from([
                ("GOCACHE".to_string(), "/tmp/go-cache".to_string()),
                ("GOPATH".to_string(), "/tmp/go".to_string()),
                ("HOME".to_string(), "/tmp".to_string()),
            ]),
            syntax_patterns: strings(&[
                r"(?m)^# command-line-arguments",
                r"syntax error",
                r"(?m)\.go:\d+:\d+: ",
            ]),
            runtime_patterns: strings(&[r"(?m)^panic:", r"(?m)^fatal error:", r"goroutine \d+ \["]),
        },
        "c" => LanguageConfig {
            image: "gcc:13".to_string(),
            file_ext: "c".to_string(),
            cmd: vec!["/tmp/program"].into(),
            install_cmd: "apt-get install -y".into(),
            packages: Vec::new(),
            compile: Some(vec!["gcc", "-O2", "-o", "/tmp/program", FILE_PLACEHOLDER, "-lm"].into()),
            env: BTreeMap::new(),
            syntax_patterns: strings(&[r": (fatal )?error:"]),
            runtime_patterns: strings(&[r"Segmentation fault", r"Aborted", r"core dumped"]),
        },
        _ => return None,
    };
    Some(config)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_forms() {
        let line: CommandLine = serde_json::from_str("\"go run {file}\"").unwrap();
        assert_eq!(line.argv(), vec!["go", "run", "{file}"]);

        let argv: CommandLine = serde_json::from_str("[\"python\", \"-u\"]").unwrap();
        assert_eq!(argv.argv(), vec!["python", "-u"]);

        assert!(CommandLine::Line("   ".to_string()).is_empty());
    }

    #[test]
    fn test_unknown_keys_ignored_missing_fields_rejected() {
        let ok: LanguageConfig = toml::from_str(
            r#"
            image = "ruby:3.3-slim"
            file_ext = "rb"
            cmd = "ruby"
            install_cmd = "gem install"
            flavour = "extra key"
            "#,
        )
        .unwrap();
        assert!(ok.packages.is_empty());
        assert!(ok.compile.is_none());

        let missing = toml::from_str::<LanguageConfig>(
            r#"
            image = "ruby:3.3-slim"
            cmd = "ruby"
            install_cmd = "gem install"
            "#,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_default_languages() {
        let languages = default_languages();
        assert_eq!(languages.len(), 4);
        assert_eq!(languages["python"].image, "python:3.11-slim");
        assert_eq!(languages["javascript"].image, "node:18-slim");
        assert_eq!(languages["go"].image, "golang:1.20-alpine");
        assert!(languages["c"].compile.is_some());
    }
}
