//! SQL runner: restricted scripts against a per-test in-memory SQLite database
//!
//! Submissions may only define and manipulate data. Everything that reaches
//! outside the ephemeral database is refused before any execution:
//! shell dot-commands, ATTACH/DETACH, PRAGMA, VACUUM and the file/extension
//! functions. The `sqlite3 -safe` flag enforces the same at runtime.

use async_trait::async_trait;
use codelab_common::Language;

use super::{CompiledUnit, LanguageRunner, PrepareError, RunnerSettings};
use crate::limits::{LimitOverrides, ResourceLimits};
use crate::sandbox::Invocation;

const ENTRY_FILE: &str = "main.sql";
const DEFAULT_MEMORY_FLOOR_MB: u64 = 512;

const ALLOWED_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "DROP", "ALTER", "VALUES",
    "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE",
];

const FORBIDDEN_FUNCTIONS: &[&str] = &["LOAD_EXTENSION", "READFILE", "WRITEFILE", "EDIT", "FTS3_TOKENIZER"];

/// First keyword and called functions of one statement
#[derive(Debug, Clone, PartialEq)]
struct Statement {
    keyword: String,
    line: usize,
    calls: Vec<String>,
}

/// Split a script into statements, skipping comments and the contents of literals
fn lex(script: &str) -> Result<Vec<Statement>, String> {
    let chars: Vec<char> = script.chars().collect();
    let len = chars.len();
    let mut statements = Vec::new();
    let mut current: Option<Statement> = None;
    let mut line = 1;
    let mut i = 0;

    while i < len {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start_line = line;
                i += 2;
                loop {
                    if i + 1 >= len {
                        return Err(format!("line {}: unterminated block comment", start_line));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
            }
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                let start_line = line;
                current.get_or_insert_with(|| Statement {
                    keyword: String::new(),
                    line,
                    calls: Vec::new(),
                });
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("line {}: unterminated literal", start_line)),
                        // Doubled quote is an escaped quote
                        Some(&ch) if ch == close && close != ']' && chars.get(i + 1) == Some(&close) => i += 2,
                        Some(&ch) if ch == close => {
                            i += 1;
                            break;
                        }
                        Some(&'\n') => {
                            line += 1;
                            i += 1;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            ';' => {
                if let Some(statement) = current.take() {
                    statements.push(statement);
                }
                i += 1;
            }
            '.' if current.is_none() => {
                return Err(format!("line {}: dot-commands are not allowed", line));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect::<String>().to_uppercase();

                let mut j = i;
                while j < len && chars[j].is_whitespace() {
                    j += 1;
                }
                let called = chars.get(j) == Some(&'(');

                match &mut current {
                    None => {
                        current = Some(Statement {
                            calls: if called { vec![word.clone()] } else { Vec::new() },
                            keyword: word,
                            line,
                        })
                    }
                    Some(statement) if called => statement.calls.push(word),
                    Some(_) => {}
                }
            }
            _ => {
                current.get_or_insert_with(|| Statement {
                    keyword: String::new(),
                    line,
                    calls: Vec::new(),
                });
                i += 1;
            }
        }
    }

    if let Some(statement) = current {
        statements.push(statement);
    }
    Ok(statements)
}

/// Check a submission against the allowed statement subset; returns the statement count
pub fn validate_script(script: &str) -> Result<usize, String> {
    let statements = lex(script)?;
    if statements.is_empty() {
        return Err("script contains no SQL statements".to_string());
    }

    for statement in &statements {
        if statement.keyword.is_empty() {
            return Err(format!("line {}: statement must start with a keyword", statement.line));
        }
        if !ALLOWED_KEYWORDS.contains(&statement.keyword.as_str()) {
            return Err(format!(
                "line {}: {} statements are not allowed",
                statement.line, statement.keyword
            ));
        }
        if let Some(call) = statement
            .calls
            .iter()
            .find(|call| FORBIDDEN_FUNCTIONS.contains(&call.as_str()))
        {
            return Err(format!(
                "line {}: function {}() is not allowed",
                statement.line,
                call.to_lowercase()
            ));
        }
    }

    Ok(statements.len())
}

pub struct SqlRunner {
    settings: RunnerSettings,
}

impl SqlRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LanguageRunner for SqlRunner {
    fn language(&self) -> Language {
        Language::Sql
    }

    async fn prepare(&self, source: &str) -> Result<CompiledUnit, PrepareError> {
        validate_script(source).map_err(PrepareError::Syntax)?;
        Ok(CompiledUnit {
            language: Language::Sql,
            source: source.to_string(),
            file_name: ENTRY_FILE.to_string(),
        })
    }

    fn invocation(&self, _unit: &CompiledUnit, _limits: &ResourceLimits) -> Invocation {
        // A fresh :memory: database lives and dies with this one process
        Invocation::new(Language::Sql, &self.settings.command)
            .with_args(self.settings.args.iter().cloned().chain([":memory:".to_string()]))
            .with_image(self.settings.image.clone(), self.settings.cpu_share)
    }

    /// Test input is the fixture script (schema and data); the submission runs after it
    fn stdin_for(&self, unit: &CompiledUnit, input: &str) -> String {
        let mut script = String::with_capacity(input.len() + unit.source.len() + 1);
        script.push_str(input);
        if !input.is_empty() && !input.ends_with('\n') {
            script.push('\n');
        }
        script.push_str(&unit.source);
        if !unit.source.ends_with('\n') {
            script.push('\n');
        }
        script
    }

    fn limit_overrides(&self) -> LimitOverrides {
        LimitOverrides {
            memory_mb: Some(self.settings.memory_floor_mb.unwrap_or(DEFAULT_MEMORY_FLOOR_MB)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;

    fn runner() -> SqlRunner {
        let manager = LanguageConfigManager::builtin();
        SqlRunner::new(RunnerSettings::from_config(manager.get_config(&Language::Sql).unwrap()))
    }

    #[test]
    fn test_accepts_ddl_and_dml() {
        let script = "CREATE TABLE t (x INTEGER, name TEXT);\n\
                      INSERT INTO t VALUES (1, 'a;b'), (2, 'it''s');\n\
                      -- trailing comment; with a semicolon\n\
                      SELECT name FROM t WHERE x > 1 ORDER BY x;";
        assert_eq!(validate_script(script), Ok(3));
    }

    #[test]
    fn test_accepts_cte_and_transactions() {
        let script = "BEGIN; WITH s AS (SELECT 1 AS v) SELECT sum(v) FROM s; COMMIT";
        assert_eq!(validate_script(script), Ok(3));
    }

    #[test]
    fn test_rejects_dot_commands() {
        let err = validate_script("SELECT 1;\n.shell ls\n").unwrap_err();
        assert!(err.contains("line 2"));
        assert!(err.contains("dot-commands"));
    }

    #[test]
    fn test_rejects_escaping_statements() {
        for script in [
            "ATTACH DATABASE '/etc/passwd' AS p;",
            "detach p;",
            "PRAGMA writable_schema = 1;",
            "VACUUM INTO '/tmp/x.db';",
        ] {
            assert!(validate_script(script).is_err(), "accepted: {}", script);
        }
    }

    #[test]
    fn test_rejects_file_functions_outside_literals_only() {
        let err = validate_script("SELECT readfile('/etc/passwd');").unwrap_err();
        assert!(err.contains("readfile()"));
        assert!(validate_script("SELECT load_extension ('x');").is_err());
        assert_eq!(validate_script("SELECT 'readfile(1)' AS label;"), Ok(1));
    }

    #[test]
    fn test_keywords_inside_comments_and_literals_are_ignored() {
        let script = "/* ATTACH DATABASE x */ SELECT \"PRAGMA\", [VACUUM] FROM t;";
        assert_eq!(validate_script(script), Ok(1));
    }

    #[test]
    fn test_rejects_malformed_scripts() {
        assert!(validate_script("SELECT 'open").unwrap_err().contains("unterminated literal"));
        assert!(validate_script("SELECT 1; /* never closed").unwrap_err().contains("unterminated block comment"));
        assert!(validate_script("  -- only a comment\n ;; ").unwrap_err().contains("no SQL statements"));
        assert!(validate_script("").is_err());
    }

    #[tokio::test]
    async fn test_prepare_maps_to_syntax_error() {
        let err = runner().prepare("PRAGMA foo;").await.unwrap_err();
        assert!(matches!(err, PrepareError::Syntax(_)));
        assert!(runner().prepare("SELECT 1;").await.is_ok());
    }

    #[test]
    fn test_stdin_runs_fixture_then_submission() {
        let unit = CompiledUnit {
            language: Language::Sql,
            source: "SELECT x FROM t;".to_string(),
            file_name: ENTRY_FILE.to_string(),
        };
        let stdin = runner().stdin_for(&unit, "CREATE TABLE t(x); INSERT INTO t VALUES (7);");
        assert_eq!(stdin, "CREATE TABLE t(x); INSERT INTO t VALUES (7);\nSELECT x FROM t;\n");
    }

    #[test]
    fn test_invocation_uses_memory_database() {
        let unit = CompiledUnit {
            language: Language::Sql,
            source: "SELECT 1;".to_string(),
            file_name: ENTRY_FILE.to_string(),
        };
        let invocation = runner().invocation(&unit, &ResourceLimits::default());
        assert_eq!(
            invocation.command_line(),
            vec!["sqlite3", "-batch", "-bail", "-safe", ":memory:"]
        );
        assert!(invocation.files.is_empty());
        assert_eq!(runner().limit_overrides().memory_mb, Some(512));
    }
}
