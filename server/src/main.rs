use clap::Parser;
use server::coordinator::Coordinator;
use server::network::Server;

/// Parses command-line arguments, builds the coordinator and serves
/// until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Grid period of spawn-capable chunks (0 = origin only)
        #[clap(short = 'd', long, default_value = "2")]
        spawn_density: i32,
        /// Seed for assignment and spawn selection (random if omitted)
        #[clap(short, long)]
        seed: Option<u64>,
    }

    let args = Args::parse();
    env_logger::init();

    let seed = args.seed.unwrap_or_else(rand::random);
    let coordinator = Coordinator::new(seed, args.spawn_density);

    let listen = format!("{}:{}", args.host, args.port).parse()?;
    let server = Server::bind(listen, coordinator).await?;
    server.run().await?;
    Ok(())
}
