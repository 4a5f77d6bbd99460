use async_trait::async_trait;
use codelab_common::Language;

use super::{finish_prepare, host_check, CompiledUnit, HostCheck, LanguageRunner, PrepareError, RunnerSettings};
use crate::limits::{LimitOverrides, ResourceLimits};
use crate::sandbox::Invocation;

const ENTRY_FILE: &str = "main.js";
/// V8 start-up and JIT threads burn CPU before user code runs
const STARTUP_CPU_MS: u64 = 1000;

pub struct JavaScriptRunner {
    settings: RunnerSettings,
}

impl JavaScriptRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    async fn check(&self, source: &str) -> HostCheck {
        let file = match tempfile::Builder::new().prefix("codelab-check-").suffix(".js").tempfile() {
            Ok(file) => file,
            Err(e) => return HostCheck::Unavailable(format!("cannot create temp file: {}", e)),
        };
        if let Err(e) = tokio::fs::write(file.path(), source).await {
            return HostCheck::Unavailable(format!("cannot write temp file: {}", e));
        }

        let path = file.path().to_string_lossy().into_owned();
        match host_check(&self.settings.command, &["--check", &path], None).await {
            // Report against the name the program runs under
            HostCheck::Failed(message) => HostCheck::Failed(message.replace(&path, ENTRY_FILE)),
            other => other,
        }
    }
}

#[async_trait]
impl LanguageRunner for JavaScriptRunner {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    async fn prepare(&self, source: &str) -> Result<CompiledUnit, PrepareError> {
        let check = if self.settings.syntax_check {
            self.check(source).await
        } else {
            HostCheck::Passed
        };
        finish_prepare(Language::JavaScript, source, ENTRY_FILE, check)
    }

    fn invocation(&self, unit: &CompiledUnit, limits: &ResourceLimits) -> Invocation {
        // Keep the V8 heap below the hard ceiling so exhaustion surfaces as a clean exit
        let heap_mb = (limits.memory_mb * 3 / 4).max(16);

        Invocation::new(Language::JavaScript, &self.settings.command)
            .with_args(
                self.settings
                    .args
                    .iter()
                    .cloned()
                    .chain([format!("--max-old-space-size={}", heap_mb), unit.file_name.clone()]),
            )
            .with_file(&unit.file_name, &unit.source)
            .with_image(self.settings.image.clone(), self.settings.cpu_share)
            .reserving_address_space()
    }

    fn limit_overrides(&self) -> LimitOverrides {
        LimitOverrides {
            memory_mb: self.settings.memory_floor_mb,
            extra_cpu_time_ms: Some(STARTUP_CPU_MS),
            output_bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;

    fn runner() -> JavaScriptRunner {
        let manager = LanguageConfigManager::builtin();
        JavaScriptRunner::new(RunnerSettings::from_config(manager.get_config(&Language::JavaScript).unwrap()))
    }

    #[test]
    fn test_invocation_caps_heap() {
        let unit = CompiledUnit {
            language: Language::JavaScript,
            source: "console.log(1)".to_string(),
            file_name: ENTRY_FILE.to_string(),
        };
        let limits = ResourceLimits {
            memory_mb: 256,
            ..Default::default()
        };

        let invocation = runner().invocation(&unit, &limits);
        assert_eq!(
            invocation.command_line(),
            vec!["node", "--max-old-space-size=192", "main.js"]
        );
        assert!(invocation.reserves_address_space);
    }

    #[test]
    fn test_cpu_headroom() {
        assert_eq!(runner().limit_overrides().extra_cpu_time_ms, Some(1000));
    }

    #[tokio::test]
    #[ignore = "requires node on the host"]
    async fn test_syntax_error_names_entry_file() {
        let err = runner().prepare("function (\n").await.unwrap_err();
        let PrepareError::Syntax(message) = err;
        assert!(message.contains("main.js"));
        assert!(message.contains("SyntaxError"));
    }
}
