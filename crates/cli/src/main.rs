use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flmr_core::{
    indexing::{BatchEncoder, IndexOutputMode},
    loader::{self, ModelFiles},
    models::{EncoderInputs, ReaderInputs},
    multimodal::ImageProcessor,
};
use serde::Serialize;

mod config;
mod corpus;
mod index_file;
mod logging;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "flmr", about = "Late-interaction multimodal retrieval")]
struct Cli {
    /// Config file (default: <config_dir>/flmr/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Runtime {
    /// Weight dtype: f32, f16 or bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Run on CPU even if CUDA is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct Retriever {
    /// Retriever checkpoint directory
    #[arg(long)]
    model: Option<PathBuf>,

    /// Passages per encoder batch
    #[arg(long)]
    batch_size: Option<usize>,

    #[command(flatten)]
    runtime: Runtime,
}

#[derive(Clone, Copy, ValueEnum)]
enum Layout {
    Flatten,
    Dense,
    Ragged,
}

impl From<Layout> for IndexOutputMode {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Flatten => IndexOutputMode::Flatten,
            Layout::Dense => IndexOutputMode::Dense,
            Layout::Ragged => IndexOutputMode::Ragged,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Encode a JSONL passage file into a late-interaction index
    Index {
        #[command(flatten)]
        retriever: Retriever,

        /// Passages, one JSON object per line
        #[arg(long)]
        corpus: PathBuf,

        /// Output safetensors file
        #[arg(long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = Layout::Flatten)]
        layout: Layout,

        /// Storage dtype for document embeddings (e.g. f16)
        #[arg(long)]
        doc_dtype: Option<String>,
    },

    /// Rank passages for one query
    Search {
        #[command(flatten)]
        retriever: Retriever,

        /// Query text
        query: String,

        /// Optional query image
        #[arg(long)]
        image: Option<PathBuf>,

        /// Index written by `flmr index`
        #[arg(long, required_unless_present = "corpus", conflicts_with = "corpus")]
        index: Option<PathBuf>,

        /// Encode this JSONL passage file on the fly instead
        #[arg(long)]
        corpus: Option<PathBuf>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Extract answer spans from passages with a span reader
    Read {
        /// Reader checkpoint directory
        #[arg(long)]
        reader_model: Option<PathBuf>,

        #[command(flatten)]
        runtime: Runtime,

        question: String,

        /// Passages, one JSON object per line
        #[arg(long)]
        passages: PathBuf,

        /// Longest answer span in tokens
        #[arg(long)]
        max_answer_len: Option<usize>,

        /// Number of passages to report
        #[arg(long)]
        top_k: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env())?;

    let mut cfg = match &cli.config {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => CliConfig::load(),
    };

    match cli.command {
        Command::Index {
            retriever,
            corpus,
            output,
            layout,
            doc_dtype,
        } => {
            cfg.merge(&retriever.overrides());
            cfg.merge(&CliConfig {
                doc_dtype,
                ..Default::default()
            });
            run_index(&cfg, &corpus, &output, layout.into())
        }
        Command::Search {
            retriever,
            query,
            image,
            index,
            corpus,
            top_k,
        } => {
            cfg.merge(&retriever.overrides());
            cfg.merge(&CliConfig {
                top_k,
                ..Default::default()
            });
            let source = match (index, corpus) {
                (Some(index), _) => Source::Index(index),
                (None, Some(corpus)) => Source::Corpus(corpus),
                (None, None) => bail!("either --index or --corpus is required"),
            };
            run_search(&cfg, &query, image.as_deref(), source)
        }
        Command::Read {
            reader_model,
            runtime,
            question,
            passages,
            max_answer_len,
            top_k,
        } => {
            cfg.merge(&runtime.overrides());
            cfg.merge(&CliConfig {
                reader_model,
                max_answer_len,
                top_k,
                ..Default::default()
            });
            run_read(&cfg, &question, &passages)
        }
    }
}

impl Runtime {
    fn overrides(&self) -> CliConfig {
        CliConfig {
            dtype: self.dtype.clone(),
            cpu: self.cpu.then_some(true),
            ..Default::default()
        }
    }
}

impl Retriever {
    fn overrides(&self) -> CliConfig {
        CliConfig {
            model: self.model.clone(),
            batch_size: self.batch_size,
            ..self.runtime.overrides()
        }
    }
}

fn parse_dtype(s: &str) -> anyhow::Result<DType> {
    match s {
        "auto" | "fp32" | "f32" | "float32" | "float" => Ok(DType::F32),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "fp16" | "f16" | "float16" | "half" => Ok(DType::F16),
        other => bail!("Unknown dtype: {other}"),
    }
}

fn select_device(cfg: &CliConfig) -> anyhow::Result<Device> {
    if cfg.cpu.unwrap_or(false) {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

fn load_retriever(cfg: &CliConfig, device: &Device) -> anyhow::Result<loader::LoadedRetriever> {
    let dir = cfg
        .model
        .as_ref()
        .context("no retriever model; pass --model or set `model` in the config file")?;
    let dtype = parse_dtype(cfg.dtype.as_deref().unwrap_or("auto"))?;
    let mut retriever = loader::load_retriever(&ModelFiles::from_dir(dir)?, dtype, device)?;
    if let Some(doc_dtype) = cfg.doc_dtype.as_deref() {
        retriever.model = retriever.model.with_context_dtype(Some(parse_dtype(doc_dtype)?));
    }
    Ok(retriever)
}

fn run_index(
    cfg: &CliConfig,
    corpus_path: &Path,
    output: &Path,
    mode: IndexOutputMode,
) -> anyhow::Result<()> {
    let device = select_device(cfg)?;
    let retriever = load_retriever(cfg, &device)?;
    let passages = corpus::read_passages(corpus_path)?;
    let docs = corpus::to_collection(&passages)?;

    let encoder = BatchEncoder::new(
        &retriever.model,
        &retriever.query_tokenizer,
        &retriever.context_tokenizer,
        cfg.batch_size(),
    );
    let indexed = encoder.encode_documents(&docs, mode)?;
    index_file::save(output, &corpus::passage_ids(&passages), &indexed)?;
    println!("indexed {} passages into {}", passages.len(), output.display());
    Ok(())
}

enum Source {
    Index(PathBuf),
    Corpus(PathBuf),
}

#[derive(Serialize)]
struct SearchHit<'a> {
    rank: usize,
    id: &'a str,
    score: f32,
}

fn run_search(
    cfg: &CliConfig,
    query: &str,
    image: Option<&Path>,
    source: Source,
) -> anyhow::Result<()> {
    let device = select_device(cfg)?;
    let retriever = load_retriever(cfg, &device)?;
    let encoder = BatchEncoder::new(
        &retriever.model,
        &retriever.query_tokenizer,
        &retriever.context_tokenizer,
        cfg.batch_size(),
    );

    let query_emb = match image {
        None => encoder.query_from_text(&[query])?.0,
        Some(path) => {
            let vision = retriever
                .model
                .vision_config()
                .context("the model has no vision encoder for --image")?;
            let pixels = ImageProcessor::from_vision_config(vision, &device)
                .with_dtype(retriever.model.dtype())
                .load_batch(&[path])?;
            let ids = retriever.query_tokenizer.encode_batch(&[query])?;
            let text = retriever.query_tokenizer.tensorize(&ids, &device)?;
            retriever
                .model
                .query(&EncoderInputs::text(&text.input_ids, &text.attention_mask).with_pixels(&pixels))?
                .embeddings
        }
    };

    let (ids, documents) = match source {
        Source::Index(path) => {
            let stored = index_file::load(&path, &device)?;
            (stored.ids, stored.documents)
        }
        Source::Corpus(path) => {
            let passages = corpus::read_passages(&path)?;
            let docs = corpus::to_collection(&passages)?;
            let documents = encoder.encode_documents(&docs, IndexOutputMode::Flatten)?;
            (corpus::passage_ids(&passages), documents)
        }
    };

    let scores = index_file::score_query(&query_emb, &documents)?;
    for (rank, i) in index_file::top_k(&scores, cfg.top_k()).into_iter().enumerate() {
        let hit = SearchHit {
            rank: rank + 1,
            id: &ids[i],
            score: scores[i],
        };
        println!("{}", serde_json::to_string(&hit)?);
    }
    Ok(())
}

#[derive(Serialize)]
struct ReadResult<'a> {
    rank: usize,
    id: &'a str,
    title: &'a str,
    answer: Option<String>,
    span_score: Option<f32>,
    relevance: f32,
}

fn run_read(cfg: &CliConfig, question: &str, passages_path: &Path) -> anyhow::Result<()> {
    let dir = cfg
        .reader_model
        .as_ref()
        .context("no reader model; pass --reader-model or set `reader_model` in the config file")?;
    let device = select_device(cfg)?;
    let dtype = parse_dtype(cfg.dtype.as_deref().unwrap_or("auto"))?;
    let (reader, tokenizer) = loader::load_reader(&ModelFiles::from_dir(dir)?, dtype, &device)?;

    let passages = corpus::read_passages(passages_path)?;
    let ids = corpus::passage_ids(&passages);
    let titles: Vec<&str> = passages.iter().map(|p| p.title.as_str()).collect();
    let texts: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
    let inputs = ReaderInputs::new(&tokenizer, question, &titles, &texts, &device)?;

    let output = reader.forward(&inputs.batch.input_ids, &inputs.batch.attention_mask)?;
    let spans = output.best_spans(&inputs.text_starts, &inputs.lengths, cfg.max_answer_len())?;
    let relevance = output.relevance_logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let token_ids = inputs.batch.input_ids.to_vec2::<u32>()?;
    tracing::debug!(passages = passages.len(), "scored passages");

    for (rank, i) in index_file::top_k(&relevance, cfg.top_k()).into_iter().enumerate() {
        let answer = spans[i]
            .as_ref()
            .map(|span| tokenizer.decode(&token_ids[i][span.start..=span.end]))
            .transpose()?;
        let result = ReadResult {
            rank: rank + 1,
            id: &ids[i],
            title: &passages[i].title,
            answer,
            span_score: spans[i].as_ref().map(|s| s.score),
            relevance: relevance[i],
        };
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}
