//! Entry point for the parcel client.

use std::io::Write as _;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use parcel::client::{self, ClientConfig, ADDRESS_MAX_LENGTH, USERNAME_MAX_LENGTH};
use parcel::crypto;
use parcel::daemon::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "parcel", version, about = "end-to-end encrypted group chat client")]
struct Cli {
    /// Server address (www.example.com, 111.222.333.444)
    #[arg(short = 'a', long = "address")]
    address: Option<String>,

    /// Server port
    #[arg(
        short = 'p',
        long = "port",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Username displayed alongside sent messages
    #[arg(short = 'u', long = "username")]
    username: Option<String>,

    /// Use the OS login name as the username
    #[arg(short = 'l', long = "login", conflicts_with = "username")]
    login: bool,
}

/// Prompt on stdout until a non-empty value within `max` characters arrives.
fn prompt(label: &str, max: usize) -> Result<String> {
    loop {
        print!("> {label}: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            bail!("stdin closed before {label} was provided");
        }
        let value = line.trim();
        if value.is_empty() {
            continue;
        }
        if value.chars().count() > max {
            println!("> Maximum length is {max} characters");
            continue;
        }
        return Ok(value.to_string());
    }
}

fn login_name() -> Option<String> {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|name| !name.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let address = match cli.address {
        Some(addr) if addr.chars().count() <= ADDRESS_MAX_LENGTH => addr,
        Some(_) => {
            println!("\x1b[33mAddress argument too long\x1b[0m");
            prompt("Server address", ADDRESS_MAX_LENGTH)?
        }
        None => prompt("Server address", ADDRESS_MAX_LENGTH)?,
    };

    let username = if cli.login {
        match login_name() {
            Some(name) if name.chars().count() <= USERNAME_MAX_LENGTH => name,
            _ => {
                println!("\x1b[33mCould not determine login name\x1b[0m");
                prompt("Username", USERNAME_MAX_LENGTH)?
            }
        }
    } else {
        match cli.username {
            Some(name) if name.chars().count() <= USERNAME_MAX_LENGTH => name,
            Some(_) => {
                println!("\x1b[33mUsername argument too long\x1b[0m");
                prompt("Username", USERNAME_MAX_LENGTH)?
            }
            None => prompt("Username", USERNAME_MAX_LENGTH)?,
        }
    };

    let session = client::connect(ClientConfig {
        address,
        port: cli.port,
        username,
    })
    .await?;

    println!(
        "Connected. Fingerprint is: {}",
        crypto::fingerprint_display(session.fingerprint())
    );

    session.run().await
}
