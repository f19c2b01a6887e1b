use clap::Parser;
use validator::node::{run, NodeConfig};

/// Parses command-line arguments, sets up logging and drives the node
/// until shutdown.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// IP address to bind the node listener to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on (0 picks a free port)
        #[clap(short, long, default_value = "0")]
        port: u16,
        /// Coordinator address to join
        #[clap(short, long, default_value = "127.0.0.1:8080")]
        server: String,
    }

    let args = Args::parse();
    env_logger::init();

    let config = NodeConfig {
        listen: format!("{}:{}", args.host, args.port).parse()?,
        server: args.server.parse()?,
    };

    run(config).await?;
    Ok(())
}
