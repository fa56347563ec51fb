use std::path::PathBuf;

use clap::Parser;
use inspect_core::walker::DEFAULT_MAGIC;
use inspect_core::{codec, dwarf, value};

/// Extract DWARF debug info from a binary, deduplicate and encode it, and
/// embed it into a reserved region of one or more target files.
#[derive(Parser)]
struct Args {
    /// ELF file to read DWARF debug info from.
    file: PathBuf,

    /// File(s) to patch with the encoded table. Defaults to `FILE`.
    #[arg(short, long = "target")]
    targets: Vec<PathBuf>,

    /// Magic header to search for, as 16 hex digits.
    #[arg(short = 'm', long)]
    magic: Option<String>,

    /// Enable per-variable ingest tracing.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_magic(hex: &str) -> [u8; 8] {
    let mut magic = DEFAULT_MAGIC;
    for (i, byte) in magic.iter_mut().enumerate() {
        if let Some(pair) = hex.get(i * 2..i * 2 + 2) {
            if let Ok(parsed) = u8::from_str_radix(pair, 16) {
                *byte = parsed;
            }
        }
    }
    magic
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose { "inspect_core=trace" } else { "inspect_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let magic = args.magic.as_deref().map(parse_magic).unwrap_or(DEFAULT_MAGIC);
    let targets = if args.targets.is_empty() {
        vec![args.file.clone()]
    } else {
        args.targets.clone()
    };

    let graph = dwarf::load(&args.file)?;
    tracing::info!(variables = count_variables(&graph), "ingested DWARF");

    let deduped = value::dedup(&graph);
    tracing::info!(before = graph.len(), after = deduped.len(), "deduplicated");

    let encoded = codec::encode(&deduped);
    let compressed = deflate(&encoded);
    tracing::info!(bytes = compressed.len(), "encoded and compressed");

    inspect_core::patch::patch_files(&targets, &compressed, &magic)?;
    for target in &targets {
        tracing::info!(target = %target.display(), "patched");
    }
    Ok(())
}

fn count_variables(graph: &value::Graph) -> usize {
    graph.root().map(|r| graph.variables(r).len()).unwrap_or(0)
}

fn deflate(data: &[u8]) -> Vec<u8> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write as _;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).expect("writing to an in-memory encoder cannot fail");
    encoder.finish().expect("finishing an in-memory encoder cannot fail")
}
