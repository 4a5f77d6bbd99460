// CLI commands for running and checking submissions locally
use anyhow::{bail, Context, Result};
use codelab_common::{Language, Verdict};
use codelab_engine::{
    build_service, EngineConfig, InMemoryChallengeRepository, IsolationKind, LanguageConfigManager, RunnerRegistry,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const SAMPLE_CHALLENGES: &str = include_str!("../../../config/challenges.json");

pub struct RunOptions<'a> {
    pub challenges: &'a Path,
    pub challenge_id: &'a str,
    pub language: &'a str,
    pub source: &'a Path,
    pub isolation: Option<&'a str>,
    pub reveal: bool,
    pub json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    challenge_id: &'a str,
    language: &'a str,
    verdict: &'a Verdict,
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read source file {}", path.display()))
}

/// Run a source file against a challenge; returns whether every test passed
pub async fn run_submission(languages_path: Option<&Path>, options: RunOptions<'_>) -> Result<bool> {
    let languages = LanguageConfigManager::load_or_builtin(languages_path)?;
    let mut config = EngineConfig::from_env()?;
    if let Some(isolation) = options.isolation {
        config.isolation = IsolationKind::from_str(isolation)
            .with_context(|| format!("Unknown isolation backend: {}", isolation))?;
    }

    let source = read_source(options.source)?;
    let challenges = InMemoryChallengeRepository::from_json_file(options.challenges)?;
    let service = build_service(&config, &languages, Arc::new(challenges))?;

    if !options.json {
        println!(
            "🚀 Running {} against '{}' ({:?} isolation)...\n",
            options.source.display(),
            options.challenge_id,
            config.isolation
        );
    }

    let verdict = service
        .submit_and_wait(options.challenge_id, options.language, &source)
        .await
        .context("Submission was not judged")?;
    let verdict = if options.reveal {
        verdict.as_ref().clone()
    } else {
        verdict.redacted()
    };

    if options.json {
        let report = RunReport {
            challenge_id: options.challenge_id,
            language: options.language,
            verdict: &verdict,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_verdict(&verdict));
    }

    Ok(verdict.overall_passed)
}

/// Human-readable verdict table followed by failure details
fn render_verdict(verdict: &Verdict) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<6} {:<8} {:<10} {:<20}", "Test", "Result", "Time", "Error");
    let _ = writeln!(out, "{}", "─".repeat(48));

    for result in &verdict.results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        let error = result.error.map(|e| e.to_string()).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<6} {:<8} {:<10} {:<20}",
            result.test_case_id,
            status,
            format!("{}ms", result.execution_time_ms),
            error
        );
    }

    for result in verdict.results.iter().filter(|r| !r.passed && !r.hidden) {
        let _ = writeln!(out, "\n🔎 Test {}:", result.test_case_id);
        if !result.actual_output.is_empty() {
            let _ = writeln!(out, "  stdout: {}", result.actual_output.trim_end());
        }
        if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.is_empty()) {
            for line in stderr.lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }
    }

    let passed = verdict.results.iter().filter(|r| r.passed).count();
    let mark = if verdict.overall_passed { "✅" } else { "❌" };
    let _ = writeln!(
        out,
        "\n{} Passed {}/{} (score {}, {}ms)",
        mark,
        passed,
        verdict.results.len(),
        verdict.aggregate_score,
        verdict.total_time_ms
    );
    if verdict.degraded {
        let _ = writeln!(out, "⚠️  Some test cases could not be run; the sandbox may be unavailable");
    }
    out
}

/// Syntax-check a source file; returns whether it parsed
pub async fn check_syntax(languages_path: Option<&Path>, language: &str, source: &Path) -> Result<bool> {
    let languages = LanguageConfigManager::load_or_builtin(languages_path)?;
    let Some(parsed) = Language::from_str(language) else {
        bail!("Unsupported language: {}", language);
    };
    let runners = RunnerRegistry::from_config(&languages);
    let runner = runners
        .get(parsed)
        .with_context(|| format!("Language {} is not configured", parsed))?;

    let source_code = read_source(source)?;
    match runner.prepare(&source_code).await {
        Ok(_) => {
            println!("✅ {} is valid {}", source.display(), parsed);
            Ok(true)
        }
        Err(e) => {
            println!("❌ {} has a syntax error:\n{}", source.display(), e);
            Ok(false)
        }
    }
}

/// List all configured languages
pub fn list_languages(languages_path: Option<&Path>) -> Result<()> {
    let manager = LanguageConfigManager::load_or_builtin(languages_path)?;
    let languages = manager.list_languages();

    if languages.is_empty() {
        println!("No languages configured.");
        println!("\n💡 Write the defaults with: codelab-cli init");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<8} {:<24} {:<28} {:<10}", "Name", "Version", "Image", "Command", "CPU/Mem");
    println!("{}", "─".repeat(86));

    for language in &languages {
        let config = manager.get_config(language)?;
        let command = std::iter::once(config.execution.command.as_str())
            .chain(config.execution.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let memory = config
            .memory_limit_mb
            .map(|mb| format!("{} MB", mb))
            .unwrap_or_else(|| "challenge".to_string());
        println!(
            "{:<12} {:<8} {:<24} {:<28} {:.1}/{}",
            language, config.version, config.image, command, config.cpu_limit, memory
        );
    }

    println!("\n✅ Total: {} language(s)", languages.len());

    Ok(())
}

/// Write config/languages.json and a sample config/challenges.json under `path`
pub fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing Codelab configuration at: {}", path);

    let config_dir = Path::new(path).join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let languages_path = config_dir.join("languages.json");
    if languages_path.exists() {
        println!("  ⏭️  Kept existing: config/languages.json");
    } else {
        fs::write(&languages_path, LanguageConfigManager::builtin().to_json()?)
            .with_context(|| format!("Failed to write {}", languages_path.display()))?;
        println!("  ✅ Created: config/languages.json");
    }

    let challenges_path = config_dir.join("challenges.json");
    if challenges_path.exists() {
        println!("  ⏭️  Kept existing: config/challenges.json");
    } else {
        fs::write(&challenges_path, SAMPLE_CHALLENGES)
            .with_context(|| format!("Failed to write {}", challenges_path.display()))?;
        println!("  ✅ Created: config/challenges.json");
    }

    println!("✅ Configuration initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Check a file: codelab-cli check --language python solution.py");
    println!("  2. Run it: codelab-cli run --challenge max-subarray --language python solution.py");
    println!("  3. Serve the API: codelab-api");

    Ok(())
}
