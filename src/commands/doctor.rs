use std::path::Path;

use colored::Colorize;
use serde_json::{Value, json};

use crate::config::AppContext;
use crate::error::Result;
use crate::health;
use crate::output::Format;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Ok,
    Warn,
    Error,
}

#[derive(Debug)]
struct Check {
    category: &'static str,
    level: Level,
    message: String,
}

impl Check {
    fn ok(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            category,
            level: Level::Ok,
            message: msg.into(),
        }
    }
    fn warn(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            category,
            level: Level::Warn,
            message: msg.into(),
        }
    }
    fn error(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            category,
            level: Level::Error,
            message: msg.into(),
        }
    }

    fn prefix(&self) -> String {
        match self.level {
            Level::Ok => " ok ".green().to_string(),
            Level::Warn => "warn".yellow().to_string(),
            Level::Error => " ERR".red().bold().to_string(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "category": self.category,
            "level": match self.level {
                Level::Ok => "ok",
                Level::Warn => "warn",
                Level::Error => "error",
            },
            "message": self.message,
        })
    }
}

pub fn run(ctx: &AppContext, dir: &Path, fix: bool, format: Format) -> Result<()> {
    let report = health::check(ctx, dir)?;
    let mut checks: Vec<Check> = Vec::new();

    checks.push(Check::ok(
        "Build",
        format!(
            "mempack {} ({})",
            env!("CARGO_PKG_VERSION"),
            option_env!("MEMPACK_BUILD_GIT_SHA").unwrap_or("no build sha")
        ),
    ));
    checks.push(Check::ok(
        "Identity",
        format!("{} (source: {})", report.repo_id, report.id_source),
    ));
    checks.push(Check::ok("Identity", format!("root {}", report.git_root)));

    if report.db_exists {
        checks.push(Check::ok(
            "Database",
            format!("{} ({} bytes)", report.db_path, report.db_size_bytes),
        ));
        if report.schema_version == report.expected_schema_version {
            checks.push(Check::ok(
                "Database",
                format!("schema version {}", report.schema_version),
            ));
        } else {
            checks.push(Check::error(
                "Database",
                format!(
                    "schema version {} (expected {})",
                    report.schema_version, report.expected_schema_version
                ),
            ));
        }
    } else {
        checks.push(Check::warn(
            "Database",
            format!("{} missing (created on first write)", report.db_path),
        ));
    }

    if report.db_exists {
        for (name, present) in [
            ("memories_fts", report.fts_memories_present),
            ("chunks_fts", report.fts_chunks_present),
        ] {
            if present {
                checks.push(Check::ok("Search", format!("{name} present")));
            } else {
                checks.push(Check::error("Search", format!("{name} missing")));
            }
        }

        if report.invalid_state_workspaces.is_empty() {
            checks.push(Check::ok("State", "all workspace states parse"));
        } else {
            for workspace in &report.invalid_state_workspaces {
                checks.push(Check::error(
                    "State",
                    format!("workspace '{workspace}' has invalid state_current JSON"),
                ));
            }
        }

        if fix && !report.is_healthy() {
            let rebuild = !report.fts_memories_present || !report.fts_chunks_present;
            let store = Store::open(Path::new(&report.db_path))?;
            let summary = health::repair(&store, &report.repo_id, &ctx.config.tokenizer, rebuild)?;
            checks.push(Check::ok(
                "Repair",
                format!(
                    "{} state rows repaired, fts rebuilt: {}",
                    summary.state_rows_repaired, summary.fts_rebuilt
                ),
            ));
        } else if !report.is_healthy() {
            if let Some(hint) = &report.remediation {
                checks.push(Check::warn("Repair", hint.clone()));
            }
        }
    }

    let passed = checks.iter().filter(|c| c.level == Level::Ok).count();
    let warnings = checks.iter().filter(|c| c.level == Level::Warn).count();
    let errors = checks.iter().filter(|c| c.level == Level::Error).count();

    match format {
        Format::Json => {
            let arr: Vec<Value> = checks.iter().map(|c| c.to_json()).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "checks": arr,
                    "report": report,
                    "summary": {"passed": passed, "warnings": warnings, "errors": errors},
                }))?
            );
        }
        Format::Pretty => {
            let mut current_cat = "";
            for check in &checks {
                if check.category != current_cat {
                    if !current_cat.is_empty() {
                        eprintln!();
                    }
                    eprintln!("{}", check.category.bold());
                    current_cat = check.category;
                }
                eprintln!("  {}  {}", check.prefix(), check.message);
            }
            eprintln!();
            eprintln!("{passed} passed, {warnings} warnings, {errors} errors");
        }
    }

    if errors > 0 && !fix {
        std::process::exit(1);
    }
    Ok(())
}
