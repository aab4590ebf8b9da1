use facet::Facet;
use figue as args;
use std::io::Write;

use snarl_graph::TraceGraph;
use snarl_graph::detect::{SearchOptions, find_deadlock};
use snarl_normalize::Normalizer;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    /// Analyze a trace for deadlocks.
    Check {
        #[facet(args::named)]
        file: String,
        #[facet(args::named, default)]
        verbose: bool,
        #[facet(args::named, default)]
        debug: bool,
        #[facet(args::named, default)]
        debug_file: Option<String>,
        #[facet(args::named, default)]
        subset_size: Option<u64>,
        #[facet(args::named, default)]
        max_nodes: Option<u64>,
    },
    /// Canonicalize raw trace logs into a normalized event stream.
    Normalize {
        #[facet(args::named)]
        log_files: Vec<String>,
        #[facet(args::named, default)]
        output: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, String> {
    let cli = parse_cli()?;
    match cli.command {
        Command::Check {
            file,
            verbose,
            debug,
            debug_file,
            subset_size,
            max_nodes,
        } => run_check(file, verbose, debug, debug_file, subset_size, max_nodes),
        Command::Normalize { log_files, output } => run_normalize(log_files, output),
    }
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("snarl")
                .description("Offline deadlock detector for semaphore trace logs")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn run_check(
    file: String,
    verbose: bool,
    debug: bool,
    debug_file: Option<String>,
    subset_size: Option<u64>,
    max_nodes: Option<u64>,
) -> Result<i32, String> {
    let content = std::fs::read_to_string(&file).map_err(|e| format!("read {file}: {e}"))?;
    let mut normalizer = Normalizer::new();
    normalizer
        .ingest_files(&[content])
        .map_err(|e| e.to_string())?;
    let trace = TraceGraph::build(normalizer.events());

    let mut options = SearchOptions::default();
    if let Some(subset_size) = subset_size {
        options.subset_size = subset_size as usize;
    }
    options.max_nodes = max_nodes.map(|max_nodes| max_nodes as usize);

    let Some(witness) = find_deadlock(&trace, &options) else {
        println!("No deadlock was found");
        return Ok(0);
    };

    println!("Deadlock was found");
    println!();
    if verbose {
        println!("{witness}");
    }
    if debug {
        write_debug_records(&witness, debug_file.as_deref())?;
    }
    Ok(1)
}

fn write_debug_records(
    witness: &snarl_graph::detect::Witness,
    debug_file: Option<&str>,
) -> Result<(), String> {
    let mut lines = String::new();
    for record in witness.debug_info() {
        let line =
            facet_json::to_string(&record).map_err(|e| format!("encode debug record: {e}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }
    match debug_file {
        None => {
            let stderr = std::io::stderr();
            stderr
                .lock()
                .write_all(lines.as_bytes())
                .map_err(|e| format!("write debug records: {e}"))
        }
        Some(path) => {
            std::fs::write(path, lines).map_err(|e| format!("write {path}: {e}"))
        }
    }
}

fn run_normalize(log_files: Vec<String>, output: Option<String>) -> Result<i32, String> {
    if log_files.is_empty() {
        return Err("normalize needs at least one --log-files entry".to_string());
    }
    let output = output.unwrap_or_else(|| format!("{}.out.json", log_files[0]));

    let mut contents = Vec::with_capacity(log_files.len());
    for path in &log_files {
        contents.push(std::fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?);
    }
    let mut normalizer = Normalizer::new();
    normalizer
        .ingest_files(&contents)
        .map_err(|e| e.to_string())?;

    let mut stream = Vec::new();
    normalizer.write_jsonl(&mut stream)?;
    std::fs::write(&output, stream).map_err(|e| format!("write {output}: {e}"))?;
    Ok(0)
}
