//! profilegen - generate, embed and collect user profiles

use clap::{Args, Parser, Subcommand};
use profilegen::embedding::{EmbeddingBatcher, DEFAULT_EMBED_BATCH_SIZE};
use profilegen::openai::DEFAULT_EMBEDDING_MODEL;
use profilegen::{
    build_embedder, build_generator, store, BackendKind, GenerationConfig, JsonDataset, Pipeline,
    ProfileGenerator, PromptSet, Strategy,
};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, clap::ValueEnum)]
enum CliBackend {
    #[value(name = "openai")]
    OpenAI,
}

impl From<CliBackend> for BackendKind {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::OpenAI => BackendKind::OpenAI,
        }
    }
}

#[derive(Parser)]
#[command(name = "profilegen")]
#[command(about = "Generate natural-language user profiles from interaction histories")]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate profiles for the users of a dataset
    Generate(GenerateArgs),
    /// Embed a JSON map of profiles
    Encode(EncodeArgs),
    /// Build a profile JSON map from a folder of <user>.txt files
    Collect {
        /// Folder holding the per-user files
        #[arg(short, long)]
        dir: PathBuf,
        /// Output JSON path
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Merge embedding JSON maps; later files override earlier ids
    MergeEmbeddings {
        /// Output JSON path
        #[arg(short, long)]
        out: PathBuf,
        /// Embedding files, in merge order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct BackendArgs {
    /// Backend provider
    #[arg(short, long, value_enum, default_value = "openai")]
    backend: CliBackend,

    /// Backend API URL (for OpenAI-compatible servers)
    #[arg(short = 'u', long)]
    backend_url: Option<String>,

    /// API key (optional, uses OPENAI_API_KEY env var if not provided)
    #[arg(short = 'k', long)]
    backend_key: Option<String>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Dataset JSON file
    #[arg(short, long)]
    dataset: PathBuf,

    /// Interaction field whose items define the history order (e.g. "watched %")
    #[arg(short, long)]
    interaction_field: String,

    /// Output folder for checkpoint and profiles
    #[arg(short, long)]
    out: PathBuf,

    /// Aggregation strategy: agg_after, agg_with or several_profiles
    #[arg(short, long, default_value = "agg_after")]
    strategy: Strategy,

    /// Built-in prompt set: movies or products
    #[arg(short, long, default_value = "movies")]
    prompts: String,

    /// Custom prompt set (TOML), overrides --prompts
    #[arg(long)]
    prompts_file: Option<PathBuf>,

    /// JSON list of user ids to process (default: all users)
    #[arg(long)]
    user_ids: Option<PathBuf>,

    /// Model to use
    #[arg(short, long, default_value = "gpt-4o-mini")]
    model: String,

    /// Temperature for sampling
    #[arg(short, long, default_value = "0.7")]
    temperature: f32,

    /// Output tokens reserved for every call
    #[arg(long, default_value = "1024")]
    max_output_tokens: u32,

    /// Users per batch call
    #[arg(long, default_value = "128")]
    batch_size: usize,

    /// Concurrent requests inside one batch call
    #[arg(long, default_value = "8")]
    max_concurrency: usize,

    /// Override the model's context length
    #[arg(long)]
    max_context_length: Option<usize>,

    /// Reuse per-user profiles already written to the output folder
    #[arg(long)]
    resume: bool,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args)]
struct EncodeArgs {
    /// Profile JSON map ({user_id: profile})
    #[arg(short, long)]
    profiles: PathBuf,

    /// Output embeddings JSON path
    #[arg(short, long)]
    out: PathBuf,

    /// Embedding model
    #[arg(short, long, default_value = DEFAULT_EMBEDDING_MODEL)]
    model: String,

    /// Profiles per embedding call
    #[arg(long, default_value_t = DEFAULT_EMBED_BATCH_SIZE)]
    batch_size: usize,

    #[command(flatten)]
    backend: BackendArgs,
}

fn backend_config(args: BackendArgs) -> GenerationConfig {
    // Resolve API key from args or environment
    let api_key = args.backend_key.or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let mut config = GenerationConfig::default().with_backend(args.backend.into());
    if let Some(url) = args.backend_url {
        config = config.with_base_url(url);
    }
    if let Some(key) = api_key {
        config = config.with_api_key(key);
    }
    config
}

fn generate(args: GenerateArgs) -> profilegen::Result<()> {
    let prompts = match &args.prompts_file {
        Some(path) => PromptSet::from_toml_file(path)?,
        None => PromptSet::builtin(&args.prompts)?,
    };
    let requested = args.user_ids.as_deref().map(store::read_user_ids).transpose()?;
    let dataset = JsonDataset::load(&args.dataset)?;

    let mut config = backend_config(args.backend)
        .with_temperature(args.temperature)
        .with_max_output_tokens(args.max_output_tokens)
        .with_batch_size(args.batch_size)
        .with_max_concurrency(args.max_concurrency)
        .with_resume(args.resume);
    config.model = args.model;
    if let Some(n) = args.max_context_length {
        config = config.with_max_context_length(n);
    }

    let generator = build_generator(&config)?;
    let pipeline = Pipeline::new(args.strategy, &prompts);
    let profiles = ProfileGenerator::new(&pipeline, &*generator, &config).generate(
        &dataset,
        &args.interaction_field,
        requested.as_deref(),
        &args.out,
    )?;

    tracing::info!(
        profiles = profiles.len(),
        "generation finished, outputs in {}",
        args.out.display()
    );
    Ok(())
}

fn encode(args: EncodeArgs) -> profilegen::Result<()> {
    let config = backend_config(args.backend).with_embed_batch_size(args.batch_size);
    let embedder = build_embedder(&config, &args.model)?;

    let profiles = store::read_profiles(&args.profiles)?;
    let embeddings = EmbeddingBatcher::new(&*embedder, config.embed_batch_size)
        .embed(profiles.iter().map(|(id, text)| (id.as_str(), text.as_str())))?;
    store::write_embeddings(&args.out, &embeddings)
}

fn run(command: Command) -> profilegen::Result<()> {
    match command {
        Command::Generate(args) => generate(args),
        Command::Encode(args) => encode(args),
        Command::Collect { dir, out } => {
            let profiles = store::collect_profiles_from_folder(&dir)?;
            store::write_profiles(&out, &profiles)
        }
        Command::MergeEmbeddings { out, inputs } => {
            let merged = store::merge_embedding_files(&inputs)?;
            store::write_embeddings(&out, &merged)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(level)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
