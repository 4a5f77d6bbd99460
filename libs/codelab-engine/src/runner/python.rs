use async_trait::async_trait;
use codelab_common::Language;

use super::{finish_prepare, host_check, CompiledUnit, HostCheck, LanguageRunner, PrepareError, RunnerSettings};
use crate::limits::{LimitOverrides, ResourceLimits};
use crate::sandbox::Invocation;

const ENTRY_FILE: &str = "main.py";
/// Reads the source from stdin and compiles it without executing anything
const COMPILE_SCRIPT: &str = "import sys; compile(sys.stdin.buffer.read(), 'main.py', 'exec')";

pub struct PythonRunner {
    settings: RunnerSettings,
}

impl PythonRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LanguageRunner for PythonRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    async fn prepare(&self, source: &str) -> Result<CompiledUnit, PrepareError> {
        let check = if self.settings.syntax_check {
            host_check(&self.settings.command, &["-I", "-c", COMPILE_SCRIPT], Some(source)).await
        } else {
            HostCheck::Passed
        };
        finish_prepare(Language::Python, source, ENTRY_FILE, check)
    }

    fn invocation(&self, unit: &CompiledUnit, _limits: &ResourceLimits) -> Invocation {
        Invocation::new(Language::Python, &self.settings.command)
            .with_args(self.settings.args.iter().cloned().chain([unit.file_name.clone()]))
            .with_file(&unit.file_name, &unit.source)
            .with_image(self.settings.image.clone(), self.settings.cpu_share)
    }

    fn limit_overrides(&self) -> LimitOverrides {
        LimitOverrides {
            memory_mb: self.settings.memory_floor_mb,
            ..Default::default()
        }
    }
}
