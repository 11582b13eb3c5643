use std::{fs, path::PathBuf, sync::Arc};

use callsim::{
    eval::{Evaluator, RunSummary},
    providers::scripted::ScriptedProvider,
    synthetic::{SyntheticDataConfig, SyntheticDataGenerator},
    ProviderKind, ProviderRegistry, RunAggregate, TestRunner, TestSuite,
};
use clap::{Parser, Subcommand};
use colored::Colorize;

const DRY_RUN_VERDICT: &str = r#"{"score": 1.0, "passed": true, "reason": "dry run"}"#;

#[derive(Parser)]
#[command(name = "callsim")]
#[command(about = "Simulate calls between LLM agents and grade the transcripts")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every conversation in a suite file
    Run {
        suite: PathBuf,

        /// Override the suite's turn limit
        #[arg(long)]
        max_turns: Option<usize>,

        /// Write a run log
        #[arg(long)]
        persist: bool,

        #[arg(long)]
        logs_dir: Option<PathBuf>,

        /// Also write per-test CSV rows (implies --persist)
        #[arg(long)]
        csv: bool,

        /// Use scripted providers instead of calling any API
        #[arg(long)]
        dry_run: bool,

        /// Print the results as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Generate customer scenarios for a service prompt
    Generate {
        #[arg(long)]
        service_prompt_file: PathBuf,

        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,

        #[arg(long, default_value = "openai")]
        provider: ProviderKind,

        #[arg(long, default_value_t = 10)]
        count: usize,

        #[arg(long, default_value_t = 5)]
        concurrency: usize,

        /// Write YAML here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn registry_from_env() -> ProviderRegistry {
    ProviderKind::ALL
        .into_iter()
        .fold(ProviderRegistry::new(), |registry, kind| {
            match std::env::var(kind.api_key_env()) {
                Ok(key) if !key.trim().is_empty() => registry.with_api_key(kind, key),
                _ => registry,
            }
        })
}

fn print_results(results: &RunAggregate) {
    for result in results.values() {
        let status = if result.is_completed() {
            "completed".green().bold()
        } else {
            "failed".red().bold()
        };
        let end_reason = result
            .end_reason
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "\n{} {} [{}] {} ({})",
            "Test".bold(),
            result.test_id,
            result.call_type,
            status,
            end_reason
        );
        if let Some(error) = &result.error {
            println!("  {}", error.red());
        }

        println!("{}", result.transcript.dimmed());

        for evaluation in &result.evaluation_results {
            let mark = if evaluation.passed { "PASS".green() } else { "FAIL".red() };
            println!(
                "  {} {} {:.2}: {}",
                mark,
                evaluation.name.bold(),
                evaluation.score,
                evaluation.reason
            );
        }
    }
}

async fn run_suite(
    suite_path: PathBuf,
    max_turns: Option<usize>,
    persist: bool,
    logs_dir: Option<PathBuf>,
    csv: bool,
    dry_run: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let suite = TestSuite::from_path(&suite_path)?;

    let (registry, evaluator) = if dry_run {
        let registry = ProviderRegistry::new()
            .with_fallback(Arc::new(ScriptedProvider::constant("(dry run reply)")));
        let evaluator = Evaluator::with_llm_judge(
            Arc::new(ScriptedProvider::constant(DRY_RUN_VERDICT)),
            suite.run.eval_model.clone(),
        );
        (registry, evaluator)
    } else {
        let registry = registry_from_env();
        let evaluator = suite.evaluator(&registry)?;
        (registry, evaluator)
    };

    let specs = suite.build_specs(&registry)?;

    let mut options = suite.run.to_options();
    if let Some(max_turns) = max_turns {
        options = options.with_max_turns(max_turns);
    }
    if let Some(logs_dir) = logs_dir {
        options = options.with_logs_dir(logs_dir);
    }
    if persist || csv {
        options = options.with_persist(true);
    }
    if csv {
        options = options.with_csv_log(true);
    }

    let results = TestRunner::new(evaluator).run_tests(specs, &options).await;
    let summary = RunSummary::from_aggregate(&results);

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
        println!(
            "\nTotal: {}, Completed: {}, Failed: {}, All criteria passed: {}",
            summary.total,
            summary.completed.to_string().green(),
            summary.failed.to_string().red(),
            summary.passed
        );
    }

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn generate(
    service_prompt_file: PathBuf,
    model: String,
    provider: ProviderKind,
    count: usize,
    concurrency: usize,
    out: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let service_prompt = fs::read_to_string(&service_prompt_file)?;
    let provider = registry_from_env().resolve(provider)?;

    let config = SyntheticDataConfig::new(service_prompt, model, count).with_max_concurrency(concurrency);
    let scenarios = SyntheticDataGenerator::new(config, provider).generate().await;

    let yaml = serde_yaml::to_string(&scenarios)?;
    match out {
        Some(path) => {
            fs::write(&path, yaml)?;
            eprintln!("Wrote {} scenarios to {}", scenarios.len(), path.display());
        }
        None => print!("{yaml}"),
    }

    if scenarios.len() < count {
        eprintln!(
            "{}",
            format!("Only {} of {count} scenarios were generated", scenarios.len()).yellow()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run {
            suite,
            max_turns,
            persist,
            logs_dir,
            csv,
            dry_run,
            json,
        } => run_suite(suite, max_turns, persist, logs_dir, csv, dry_run, json).await,
        Command::Generate {
            service_prompt_file,
            model,
            provider,
            count,
            concurrency,
            out,
        } => generate(service_prompt_file, model, provider, count, concurrency, out).await,
    }
}
