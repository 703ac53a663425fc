use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use cdr_mediation::codec::SchemaCodec;
use cdr_mediation::collab::{LocalArchiver, LocalTransport, MemoryDedupStore};
use cdr_mediation::config::MediationConfig;
use cdr_mediation::derive::{Category, Projection};
use cdr_mediation::framer::{decoded_document, frame};
use cdr_mediation::pipeline::{install_signal_handlers, write_atomic, FileReport, Pipeline};
use cdr_mediation::schema::{Asn1Schema, DEFAULT_ROOT_TYPE};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "CDR mediation: BER decode, field derivation and routing",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode binary CDR files into JSON documents.
    Decode(DecodeArgs),
    /// Derive canonical records from decoded JSON.
    Map(MapArgs),
    /// Tag and route decoded records once.
    Route(RouteArgs),
    /// Watch the input directory and route whatever arrives.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// ASN.1 schema text; the bundled record schema when omitted.
    #[arg(long = "schema")]
    schema: Option<PathBuf>,

    /// Save the parsed schema in binary form here.
    #[arg(long = "compile-schema")]
    compile_schema: Option<PathBuf>,

    /// Load a schema saved with --compile-schema.
    #[arg(long = "load-compiled")]
    load_compiled: Option<PathBuf>,

    #[arg(long = "root-type", default_value = DEFAULT_ROOT_TYPE)]
    root_type: String,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[command(flatten)]
    schema: SchemaArgs,

    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    /// Comma-separated extensions to pick up from input directories.
    #[arg(long = "ext")]
    ext: Option<String>,

    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct MapArgs {
    #[arg(long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Detected per record when omitted.
    #[arg(long = "category")]
    category: Option<Category>,

    #[arg(long = "projection", default_value = "WAREHOUSE")]
    projection: Projection,

    #[arg(long = "output-dir")]
    output_dir: PathBuf,

    #[arg(long = "ext")]
    ext: Option<String>,

    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RouteArgs {
    #[command(flatten)]
    schema: SchemaArgs,

    #[arg(long = "config", default_value = "config.json")]
    config: PathBuf,

    #[arg(long = "ext")]
    ext: Option<String>,

    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    schema: SchemaArgs,

    #[arg(long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Claimed files are moved here while they are processed.
    #[arg(long = "work-dir", default_value = "./work")]
    work_dir: PathBuf,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

fn load_schema(args: &SchemaArgs) -> Result<SchemaCodec> {
    let schema = if let Some(bin_path) = &args.load_compiled {
        info!("Loading pre-compiled schema from {:?}", bin_path);
        Asn1Schema::load_compiled(bin_path)
            .with_context(|| format!("Failed to load compiled schema {:?}", bin_path))?
    } else if let Some(text_path) = &args.schema {
        info!("Parsing text schema from {:?}", text_path);
        let schema_text = std::fs::read_to_string(text_path)
            .with_context(|| format!("Failed to read schema file {:?}", text_path))?;
        Asn1Schema::parse(&schema_text)?
    } else {
        Asn1Schema::bundled().context("Failed to parse bundled schema")?
    };

    if let Some(save_path) = &args.compile_schema {
        info!("Saving compiled schema to {:?}", save_path);
        schema
            .save_compiled(save_path)
            .with_context(|| format!("Failed to write compiled schema {:?}", save_path))?;
    }

    if !schema.knows_type(&args.root_type) {
        return Err(anyhow!(
            "root-type '{}' does not appear in parsed schema (check spelling / module).",
            args.root_type
        ));
    }
    Ok(SchemaCodec::new(schema, args.root_type.clone()))
}

fn allowed_extensions(ext: Option<&String>) -> Option<HashSet<String>> {
    ext.map(|s| {
        s.split(',')
            .map(|x| x.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|x| !x.is_empty())
            .collect()
    })
}

fn expand_inputs(inputs: &[PathBuf], allowed_exts: Option<&HashSet<String>>) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for p in inputs {
        if p.is_file() {
            if should_include(p, allowed_exts) {
                files.push(p.clone());
            }
        } else if p.is_dir() {
            for entry in WalkDir::new(p).follow_links(false) {
                let entry = entry?;
                let path = entry.path();
                if path.is_file() && should_include(path, allowed_exts) {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            return Err(anyhow!("Input path is not a file or directory: {:?}", p));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[inline]
fn should_include(path: &Path, allowed_exts: Option<&HashSet<String>>) -> bool {
    let Some(set) = allowed_exts else { return true; };
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else { return false; };
    set.contains(&ext.to_ascii_lowercase())
}

fn decode_file(codec: &SchemaCodec, in_path: &Path, out_dir: &Path) -> Result<usize> {
    let file = File::open(in_path).with_context(|| format!("Failed to open input file {:?}", in_path))?;
    if file.metadata()?.len() == 0 {
        return Ok(0);
    }
    let mmap = unsafe { Mmap::map(&file)? };

    let file_name = in_path
        .file_name()
        .ok_or_else(|| anyhow!("Input path has no filename: {:?}", in_path))?
        .to_string_lossy()
        .to_string();

    let records = frame(codec, &mmap);
    let out_path = out_dir.join(format!("{}.json", file_name));
    write_atomic(&out_path, &decoded_document(mmap.len(), &records))
        .with_context(|| format!("Failed to write output file {:?}", out_path))?;
    Ok(records.len())
}

fn summarize(kind: &str, results: Vec<(PathBuf, Result<FileReport>)>) {
    let mut total = FileReport::default();
    for (path, res) in results {
        match res {
            Ok(r) => {
                info!(
                    "{} {:?}: {} records, {} ok, {} rejected, {} duplicates",
                    kind, path, r.records, r.routed, r.rejected, r.duplicates
                );
                total.records += r.records;
                total.routed += r.routed;
                total.rejected += r.rejected;
            }
            Err(e) => error!("{} failed for {:?}: {:#}", kind, path, e),
        }
    }
    info!(
        "Total: {} records, {} ok, {} rejected",
        total.records, total.routed, total.rejected
    );
}

fn decode(args: DecodeArgs) -> Result<()> {
    let codec = load_schema(&args.schema)?;
    std::fs::create_dir_all(&args.output_dir)?;

    let allowed_exts = allowed_extensions(args.ext.as_ref());
    let input_files = expand_inputs(&args.inputs, allowed_exts.as_ref())
        .with_context(|| "Failed to expand input files/directories")?;
    if input_files.is_empty() {
        warn!("No input files found.");
        return Ok(());
    }
    info!("Found {} input files", input_files.len());

    let results: Vec<(PathBuf, Result<usize>)> = input_files
        .par_iter()
        .map(|p| (p.clone(), decode_file(&codec, p, &args.output_dir)))
        .collect();

    let mut total_records = 0usize;
    for (path, res) in results {
        match res {
            Ok(count) => {
                total_records += count;
                info!("Decoded {} records from {:?}", count, path);
            }
            Err(e) => error!("Decoding failed for {:?}: {:#}", path, e),
        }
    }
    info!("Total decoded records: {}", total_records);
    Ok(())
}

fn map(args: MapArgs) -> Result<()> {
    let config = MediationConfig::load(&args.config)?;
    let codec = SchemaCodec::new(Asn1Schema::bundled()?, DEFAULT_ROOT_TYPE);
    let pipeline = Pipeline::new(config, codec)?;

    let allowed_exts = allowed_extensions(args.ext.as_ref());
    let input_files = expand_inputs(&args.inputs, allowed_exts.as_ref())?;
    let results = input_files
        .into_iter()
        .map(|p| {
            let res = pipeline
                .load_input(&p)
                .and_then(|doc| {
                    pipeline.map_document(&doc, &p, args.category, args.projection, &args.output_dir)
                })
                .map_err(anyhow::Error::from);
            (p, res)
        })
        .collect();
    summarize("Mapped", results);
    Ok(())
}

fn route(args: RouteArgs) -> Result<()> {
    let config = MediationConfig::load(&args.config)?;
    let pipeline = Pipeline::new(config, load_schema(&args.schema)?)?;

    let allowed_exts = allowed_extensions(args.ext.as_ref());
    let input_files = expand_inputs(&args.inputs, allowed_exts.as_ref())?;
    let results = input_files
        .into_iter()
        .map(|p| {
            let res = pipeline
                .load_input(&p)
                .and_then(|doc| pipeline.route_document(&doc, &p))
                .map_err(anyhow::Error::from);
            (p, res)
        })
        .collect();
    summarize("Routed", results);
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let config = MediationConfig::load(&args.config)?;
    let transport = LocalTransport::new(&config.input_dir, &args.work_dir)
        .with_context(|| format!("Failed to prepare input directory {:?}", config.input_dir))?;
    let dedup = MemoryDedupStore::new(
        config.dedup_retry_max,
        Duration::from_millis(config.dedup_retry_wait_ms),
    )
    .with_capacity(config.dedup_capacity);
    let archive_dir = config.archive_dir.clone();

    let mut pipeline = Pipeline::new(config, load_schema(&args.schema)?)?.with_dedup(Box::new(dedup));
    if let Some(dir) = archive_dir {
        pipeline = pipeline.with_archiver(Box::new(LocalArchiver::new(dir)));
    }

    install_signal_handlers();
    pipeline.run(&transport)?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let overall_start = Instant::now();

    match cli.command {
        Command::Decode(args) => decode(args)?,
        Command::Map(args) => map(args)?,
        Command::Route(args) => route(args)?,
        Command::Run(args) => run(args)?,
    }

    info!("Total elapsed wall time: {:.3} s", overall_start.elapsed().as_secs_f64());
    Ok(())
}
