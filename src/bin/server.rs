//! Greeter server binary. Options come from `greetq.toml` if present and can
//! be overridden on the command line; the process listens until it is killed.

use greetq::{Config, Server};

/// Command line overrides for the `[server]` config section.
#[derive(Default)]
struct Args {
    config: Option<String>,
    port: Option<u16>,
}

fn parse_args() -> Result<Args, greetq::Error> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => {
                let value = iter.next().ok_or("--port requires a value")?;
                args.port = Some(value.parse()?);
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
    let mut config = Config::load(path).await?.server;

    if let Some(port) = args.port {
        config.listen.set_port(port);
    }

    println!("greetq server v{}", greetq::VERSION);

    Server::init(config)?.run().await
}
