//! metaicl CLI: tensorize training data, inspect shards, score evaluations

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use metaicl_rs::{
    load_jsonl, parse_training, read_shard, render_row, ByteTokenizer, DataConfig,
    EvaluationConfig, EvaluationRun, HfTokenizer, Materialized, Method, PrecomputedLosses,
    ShardSelection, ShardedTensorizationCache, TokenEncoder, TruncationPolicy,
};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "metaicl")]
#[command(about = "In-context learning data preparation and evaluation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Tensorize training JSONL files into sharded safetensors files
    Tensorize {
        #[command(flatten)]
        data: DataArgs,

        /// Training JSONL files
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Name used in the shard file names
        #[arg(long, default_value = "train")]
        keyword: String,

        /// Load the shards back after writing them
        #[arg(long)]
        verify: bool,
    },
    /// Render the first rows of a shard file
    Inspect {
        #[command(flatten)]
        data: DataArgs,

        /// Shard file to read
        shard: PathBuf,

        /// Number of rows to render
        #[arg(short, long, default_value_t = 1)]
        rows: usize,
    },
    /// Score evaluation tasks from saved per-row losses
    Score {
        #[command(flatten)]
        data: DataArgs,

        /// Directory of `<task>/<task>_<k>_<seed>_<split>.jsonl` files
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Directory of `<task>.json` task configs
        #[arg(long, default_value = "config/tasks")]
        config_dir: PathBuf,

        /// Test tasks (comma separated)
        #[arg(long, required = true, value_delimiter = ',')]
        tasks: Vec<String>,

        #[arg(long, default_value = "dev")]
        split: String,

        /// k-shot seeds, assigned to tasks round-robin (comma separated)
        #[arg(long, default_value = "100", value_delimiter = ',')]
        seeds: Vec<String>,

        #[arg(long)]
        max_examples_per_task: Option<usize>,

        /// Directory holding the saved loss arrays
        #[arg(long)]
        losses_dir: PathBuf,

        /// Subtract the null-input losses before predicting
        #[arg(long)]
        use_calibration: bool,

        /// Write per-task results as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Flags shared by every subcommand; they only ever become a DataConfig
#[derive(Args)]
struct DataArgs {
    #[arg(long, value_enum, default_value_t = Method::Direct)]
    method: Method,

    /// Do not concatenate demonstrations
    #[arg(long)]
    no_demonstrations: bool,

    #[arg(short, long, default_value_t = 16)]
    k: usize,

    /// Base length; with demonstrations rows hold min(base * k, 1024) tokens
    #[arg(long, default_value_t = 256)]
    max_length: usize,

    #[arg(long, default_value_t = 256)]
    max_length_per_example: usize,

    /// Separate examples with spaces instead of newlines
    #[arg(long)]
    no_newlines: bool,

    /// Demonstration draws per training example
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    #[arg(long, default_value_t = 4)]
    n_process: usize,

    #[arg(long, default_value_t = 1)]
    n_gpu: usize,

    /// Load only this rank's shard
    #[arg(long)]
    local_rank: Option<usize>,

    #[arg(long, default_value = "tensorized")]
    tensorize_dir: PathBuf,

    #[arg(long, default_value_t = 100)]
    seed: u64,

    /// Task prefixes whose long answers split the budget in half (comma separated)
    #[arg(long, value_delimiter = ',')]
    balanced_prefixes: Option<Vec<String>>,

    /// Local `tokenizer.json`
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Hugging Face model id to fetch `tokenizer.json` from (e.g. "gpt2-large")
    #[arg(long)]
    hub_tokenizer: Option<String>,
}

impl DataArgs {
    fn to_config(&self) -> DataConfig {
        let mut config = DataConfig {
            method: self.method,
            use_demonstrations: !self.no_demonstrations,
            k: self.k,
            max_length_per_example: self.max_length_per_example,
            add_newlines: !self.no_newlines,
            repeat: self.repeat,
            n_process: self.n_process,
            n_gpu: self.n_gpu,
            local_rank: self.local_rank,
            tensorize_dir: self.tensorize_dir.clone(),
            seed: self.seed,
            ..Default::default()
        };
        config.max_length = config.effective_max_length(self.max_length);
        if let Some(prefixes) = &self.balanced_prefixes {
            config.truncation = TruncationPolicy {
                balanced_prefixes: prefixes.clone(),
                ..TruncationPolicy::default()
            };
        }
        config
    }

    fn load_tokenizer(&self) -> Result<Box<dyn TokenEncoder>> {
        match (&self.tokenizer, &self.hub_tokenizer) {
            (Some(_), Some(_)) => bail!("--tokenizer and --hub-tokenizer are mutually exclusive"),
            (Some(path), None) => Ok(Box::new(HfTokenizer::from_file(path)?)),
            (None, Some(model_id)) => Ok(Box::new(HfTokenizer::from_pretrained(model_id)?)),
            (None, None) => {
                info!("No tokenizer given, using byte-level tokenizer");
                Ok(Box::new(ByteTokenizer))
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Tensorize {
            data,
            input,
            keyword,
            verify,
        } => tensorize(&data, &input, &keyword, verify),
        Command::Inspect { data, shard, rows } => inspect(&data, &shard, rows),
        Command::Score {
            data,
            data_dir,
            config_dir,
            tasks,
            split,
            seeds,
            max_examples_per_task,
            losses_dir,
            use_calibration,
            output,
        } => {
            let config = EvaluationConfig {
                data_dir,
                config_dir,
                tasks,
                split,
                seeds,
                max_examples_per_task,
                use_calibration,
                ..Default::default()
            };
            score(&data, config, losses_dir, output)
        }
    }
}

fn tensorize(args: &DataArgs, input: &[PathBuf], keyword: &str, verify: bool) -> Result<()> {
    let config = args.to_config();
    let tokenizer = args.load_tokenizer()?;

    println!("=== metaicl: tensorize ===");
    println!("Method:  {}", config.method_name());
    println!("Length:  {} (per example {})", config.max_length, config.max_length_per_example);
    println!("Shards:  {} in {}", config.n_gpu, config.tensorize_dir.display());

    let mut examples = Vec::new();
    for path in input {
        let records = load_jsonl(path).with_context(|| format!("Failed to read {}", path.display()))?;
        examples.extend(parse_training(&records).with_context(|| format!("Invalid records in {}", path.display()))?);
    }
    info!("Loaded {} training examples", examples.len());

    let cache = ShardedTensorizationCache::new(tokenizer.as_ref(), config);
    match cache.materialize(&examples, keyword)? {
        Materialized::AlreadyPresent => println!("\nShards already exist, nothing to do"),
        Materialized::Written {
            rows,
            skipped_partitions,
        } => {
            println!("\nWrote {rows} rows");
            if !skipped_partitions.is_empty() {
                println!("Skipped partitions: {}", skipped_partitions.join(", "));
            }
        }
    }

    if verify {
        let selection = ShardSelection::from_local_rank(cache.config().local_rank);
        let table = cache.load(keyword, examples.len(), selection)?;
        println!("Verified {} rows of length {}", table.len(), table.max_length());
    }
    Ok(())
}

fn inspect(args: &DataArgs, shard: &Path, rows: usize) -> Result<()> {
    let config = args.to_config();
    let tokenizer = args.load_tokenizer()?;
    let table = read_shard(shard, config.max_length)
        .with_context(|| format!("Failed to read shard {}", shard.display()))?;

    println!("=== {} ===", shard.display());
    println!("{} rows of length {}", table.len(), table.max_length());
    for (i, row) in table.rows().iter().take(rows).enumerate() {
        println!("\n--- row {i} ---");
        println!("{}", render_row(row, tokenizer.as_ref())?);
    }
    Ok(())
}

fn score(args: &DataArgs, config: EvaluationConfig, losses_dir: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let data = args.to_config();
    let tokenizer = args.load_tokenizer()?;
    let mut source = PrecomputedLosses::new(losses_dir);

    let run = EvaluationRun::new(tokenizer.as_ref(), data, config);
    let results = run.run(&mut source)?;

    println!("\n=== Results ===");
    for task in &results.tasks {
        let metric = if task.is_classification { "Macro-F1" } else { "Accuracy" };
        println!("{:30} seed={:5} {}={:.1}", task.task, task.seed, metric, task.score * 100.0);
    }
    match results.mean() {
        Some(mean) => println!("\nMean over {} tasks: {:.1}", results.tasks.len(), mean * 100.0),
        None => println!("\nNo task could be scored"),
    }
    if !results.errors.is_empty() {
        println!("Errors: {}", results.errors.join(", "));
    }

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&results)?)?;
        info!("Results saved to {}", path.display());
    }
    Ok(())
}
