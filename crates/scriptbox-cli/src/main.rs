//! scriptbox CLI: run, check, and precompile guest scripts.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use scriptbox_core::config::EngineConfig;
use scriptbox_core::{EvalMode, Value};
use scriptbox_exec::{Engine, InstructionSequence};
use scriptbox_vm::Source;

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(about = "Quota-governed sandbox for untrusted guest scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script and print the result of its last expression
    Run {
        /// Path to the guest script
        script: PathBuf,

        /// Arena capacity in bytes (overrides config)
        #[arg(long)]
        memory_bytes: Option<usize>,

        /// Instruction ceiling (overrides config)
        #[arg(long)]
        instruction_quota: Option<u64>,

        /// Wall-clock ceiling in milliseconds (overrides config)
        #[arg(long)]
        time_quota_ms: Option<u64>,

        /// Run on the caller thread without the watchdog
        #[arg(long)]
        unmonitored: bool,

        /// Inject a slot before evaluation, as name=JSON (repeatable)
        #[arg(long = "inject", value_name = "NAME=JSON")]
        injections: Vec<String>,

        /// Extract a slot after evaluation instead of the result (repeatable)
        #[arg(long = "extract", value_name = "NAME")]
        extractions: Vec<String>,

        /// Print resource usage to stderr when done
        #[arg(long)]
        stat: bool,
    },

    /// Parse and compile a script without running it
    Check {
        /// Path to the guest script
        script: PathBuf,
    },

    /// Precompile scripts into a serialized instruction sequence
    Compile {
        /// Paths to the guest scripts, concatenated in order
        scripts: Vec<PathBuf>,

        /// Output path for the serialized sequence
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run {
            script,
            memory_bytes,
            instruction_quota,
            time_quota_ms,
            unmonitored,
            injections,
            extractions,
            stat,
        } => run(
            &script,
            memory_bytes,
            instruction_quota,
            time_quota_ms,
            unmonitored,
            &injections,
            &extractions,
            stat,
        ),
        Commands::Check { script } => check(&script),
        Commands::Compile { scripts, output } => compile(&scripts, &output),
    };
    if let Err(message) = outcome {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    script: &PathBuf,
    memory_bytes: Option<usize>,
    instruction_quota: Option<u64>,
    time_quota_ms: Option<u64>,
    unmonitored: bool,
    injections: &[String],
    extractions: &[String],
    stat: bool,
) -> Result<(), String> {
    let mut config = EngineConfig::from_env();
    if let Some(bytes) = memory_bytes {
        config.memory_capacity = bytes;
    }
    if let Some(quota) = instruction_quota {
        config.instruction_quota = quota;
    }
    if let Some(ms) = time_quota_ms {
        config.time_quota = Duration::from_millis(ms);
    }
    if unmonitored {
        config.mode = EvalMode::Unmonitored;
    }

    let text = read(script)?;
    let mut engine = Engine::new(config).map_err(|e| e.to_string())?;

    for injection in injections {
        let (name, json) = injection
            .split_once('=')
            .ok_or_else(|| format!("bad --inject {injection:?}, expected NAME=JSON"))?;
        let parsed: serde_json::Value =
            serde_json::from_str(json).map_err(|e| format!("bad JSON for {name}: {e}"))?;
        engine
            .inject(name, &json_to_value(&parsed))
            .map_err(|e| e.to_string())?;
    }

    let result = engine
        .eval(&script.to_string_lossy(), &text)
        .map_err(|e| e.to_string())?;

    if extractions.is_empty() {
        print_value(&result)?;
    } else {
        for name in extractions {
            let value = engine.extract(name).map_err(|e| e.to_string())?;
            print_value(&value)?;
        }
    }

    if stat {
        let stat = engine.stat();
        eprintln!(
            "{}",
            serde_json::to_string(&stat).map_err(|e| e.to_string())?
        );
    }
    Ok(())
}

fn check(script: &PathBuf) -> Result<(), String> {
    let text = read(script)?;
    let source = Source::new(script.to_string_lossy(), text);
    scriptbox_vm::compile_source(&source).map_err(|e| e.to_string())?;
    println!("ok");
    Ok(())
}

fn compile(scripts: &[PathBuf], output: &PathBuf) -> Result<(), String> {
    if scripts.is_empty() {
        return Err("no input scripts".to_string());
    }
    let mut sources = Vec::with_capacity(scripts.len());
    for script in scripts {
        sources.push(Source::new(script.to_string_lossy(), read(script)?));
    }
    let iseq = InstructionSequence::compile(&sources).map_err(|e| e.to_string())?;
    fs::write(output, iseq.as_bytes())
        .map_err(|e| format!("cannot write {}: {e}", output.display()))?;
    println!("{} {} bytes", iseq.content_hash(), iseq.size());
    Ok(())
}

fn read(path: &PathBuf) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))
}

fn print_value(value: &Value) -> Result<(), String> {
    let json = value_to_json(value)?;
    println!(
        "{}",
        serde_json::to_string(&json).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::String(n.to_string()),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}

fn value_to_json(value: &Value) -> Result<serde_json::Value, String> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Symbol(s) => serde_json::Value::String(format!(":{s}")),
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<Result<_, _>>()?,
        ),
        Value::Map(pairs) => {
            let mut object = serde_json::Map::with_capacity(pairs.len());
            for (key, val) in pairs {
                let key = match key {
                    Value::String(s) => s.clone(),
                    Value::Symbol(s) => s.clone(),
                    Value::Integer(i) => i.to_string(),
                    other => return Err(format!("map key {other} cannot render as JSON")),
                };
                object.insert(key, value_to_json(val)?);
            }
            serde_json::Value::Object(object)
        }
    })
}
