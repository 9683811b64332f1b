// Key generation utility for Basalt validators.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;

use basalt::crypto::SecretSeed;

#[derive(Parser)]
#[command(name = "basalt-keygen")]
#[command(about = "Generate and inspect Basalt validator keys", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh validator secret seed.
    Validator {
        /// Print export lines for a .env file instead of the bare key.
        #[arg(short, long)]
        env: bool,
    },
    /// Derive the peer id and on-chain address from an existing seed.
    PeerId {
        /// 32-byte hex seed (the validator_key value).
        seed: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Validator { env } => {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            let seed = SecretSeed::from_bytes(bytes);
            let key_hex = hex::encode(seed.as_bytes());
            if env {
                println!("validator_key={}", key_hex);
                println!("validator_address={}", hex::encode(seed.address()));
            } else {
                println!("{}", key_hex);
            }
        }
        Commands::PeerId { seed } => {
            let seed = SecretSeed::from_hex(&seed)?;
            println!("peer_id: {}", hex::encode(seed.public()));
            println!("address: {}", hex::encode(seed.address()));
        }
    }
    Ok(())
}
