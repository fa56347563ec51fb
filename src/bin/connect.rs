use std::thread;
use std::time::Duration;

use clap::Parser;
use inspect_core::transport::Client;
use inspect_core::walker::Walker;

/// Connect to a target's memory-access responder and periodically dump
/// every top-level variable's current value.
#[derive(Parser)]
struct Args {
    /// Target host.
    #[arg(short = 'c', long, default_value = "127.0.0.1")]
    host: String,

    /// Target port.
    #[arg(short, long, default_value_t = 4567)]
    port: u16,

    /// Symbol used to compute the load base.
    #[arg(short, long, default_value = "DEBUG_DATA")]
    symbol: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("inspect_core=info"))
        .init();

    let args = Args::parse();
    let client = Client::connect((args.host.as_str(), args.port))?;
    let mut walker = Walker::attach(client, &args.symbol)?;
    tracing::info!(host = %args.host, port = args.port, "attached");

    loop {
        for (node, rendered) in walker.render_all() {
            let name = walker.graph().name(node);
            match rendered {
                Ok(value) => println!("{name} = {value}"),
                Err(e) => println!("{name} = <error: {e}>"),
            }
        }
        println!("---");
        thread::sleep(Duration::from_secs(1));
    }
}
