use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use llmodel::{generate, select_backend, EnvConfig, GenerationConfig, PromptContext};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llmodel")]
#[command(version)]
#[command(about = "Run local language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a completion for a prompt
    Run {
        model: String,
        prompt: String,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        temp: Option<f32>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        top_p: Option<f32>,
        #[arg(long)]
        repeat_penalty: Option<f32>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Extra options as a JSON object, e.g. '{"num_predict": 64}'
        #[arg(long)]
        options: Option<String>,
    },
    /// Print a model's architecture, hyperparameters and memory needs
    Inspect { model: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = EnvConfig::from_env();

    if let Err(e) = execute(cli.command, &env) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn execute(command: Commands, env: &EnvConfig) -> Result<()> {
    match command {
        Commands::Run {
            model,
            prompt,
            max_tokens,
            temp,
            top_k,
            top_p,
            repeat_penalty,
            threads,
            seed,
            options,
        } => {
            let mut config = match options {
                Some(json) => {
                    let map: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&json).context("--options must be a JSON object")?;
                    GenerationConfig::from_map(&map)
                }
                None => GenerationConfig::default(),
            }
            .with_env(env);

            if let Some(n) = max_tokens {
                config.max_tokens = n;
            }
            if let Some(t) = temp {
                config.sampling.temperature = t;
            }
            if let Some(k) = top_k {
                config.sampling.top_k = k;
            }
            if let Some(p) = top_p {
                config.sampling.top_p = p;
            }
            if let Some(r) = repeat_penalty {
                config.sampling.repeat_penalty = r;
            }
            if seed.is_some() {
                config.seed = seed;
            }

            run(env, &model, &prompt, &config, threads.or(env.threads))
        }
        Commands::Inspect { model } => inspect(env, &model),
    }
}

fn resolve(env: &EnvConfig, model: &str) -> Result<PathBuf> {
    match env.resolve_model(model) {
        Some(path) => Ok(path),
        None => bail!("model '{}' not found", model),
    }
}

fn run(env: &EnvConfig, model: &str, prompt: &str, config: &GenerationConfig, threads: Option<usize>) -> Result<()> {
    let path = resolve(env, model)?;
    let mut backend = select_backend(&path).with_context(|| format!("selecting backend for {}", path.display()))?;

    let required = backend.required_memory(&path)?;
    tracing::info!(required_bytes = required, "loading {}", path.display());
    backend
        .load_model(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(n) = threads {
        backend.set_thread_count(n);
    }

    let mut ctx = PromptContext::for_backend(backend.as_ref());
    let mut stdout = std::io::stdout().lock();
    let mut generation = generate(backend.as_mut(), &mut ctx, prompt, config)?;

    for fragment in generation.by_ref() {
        stdout.write_all(fragment?.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    let stats = generation.stats();
    tracing::info!(
        prompt_tokens = stats.prompt_tokens,
        generated_tokens = stats.generated_tokens,
        stop_reason = ?stats.stop_reason,
        "done"
    );
    Ok(())
}

fn inspect(env: &EnvConfig, model: &str) -> Result<()> {
    let path = resolve(env, model)?;
    let mut backend = select_backend(&path)?;
    let required = backend.required_memory(&path)?;
    backend.load_model(&path)?;

    let hp = backend
        .hyperparameters()
        .context("backend reported no hyperparameters")?;
    println!("architecture:    {}", backend.architecture());
    println!("context length:  {}", hp.n_ctx);
    println!("embedding:       {}", hp.n_embd);
    println!("heads:           {} ({} kv)", hp.n_head, hp.n_head_kv);
    println!("layers:          {}", hp.n_layer);
    println!("feed forward:    {}", hp.n_ff);
    println!("vocabulary:      {}", hp.n_vocab);
    println!("required memory: {} bytes", required);
    println!("end tokens:      {:?}", backend.end_tokens().iter().map(|t| backend.token_to_string(*t)).collect::<Vec<_>>());
    Ok(())
}
