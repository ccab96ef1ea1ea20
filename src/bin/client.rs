//! Concurrency test client binary. Fires one batch of asynchronous calls at
//! a greeter server and prints the aggregated results.

use greetq::{Client, Config};

/// Command line overrides for the `[client]` config section.
#[derive(Default)]
struct Args {
    config: Option<String>,
    target: Option<std::net::SocketAddr>,
    requests: Option<usize>,
    prefix: Option<String>,
}

fn parse_args() -> Result<Args, greetq::Error> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--target" => {
                let value = iter.next().ok_or("--target requires a value")?;
                args.target = Some(value.parse()?);
            }
            "--requests" => {
                let value = iter.next().ok_or("--requests requires a value")?;
                args.requests = Some(value.parse()?);
            }
            "--prefix" => {
                args.prefix = Some(iter.next().ok_or("--prefix requires a value")?);
            }
            "--config" => {
                args.config = Some(iter.next().ok_or("--config requires a value")?);
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }

    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), greetq::Error> {
    let args = parse_args()?;

    let path = args.config.as_deref().unwrap_or("greetq.toml");
    let mut config = Config::load(path).await?.client;

    if let Some(target) = args.target {
        config.target = target;
    }
    if let Some(requests) = args.requests {
        config.requests = requests;
    }
    if let Some(prefix) = args.prefix {
        config.name_prefix = prefix;
    }

    println!("=== greetq concurrency test v{} ===", greetq::VERSION);
    println!("Target server: {}", config.target);
    println!("Number of concurrent requests: {}", config.requests);
    println!("===============================");

    let mut client = Client::connect(config.target).await?;
    let summary = client
        .issue_and_await(config.requests, &config.name_prefix)
        .await;

    println!("\n{summary}");

    Ok(())
}
