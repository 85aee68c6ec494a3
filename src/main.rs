use clap::Parser;
use log::LevelFilter;
use tokenmail::config::{self, Cli, Config};
use tokenmail::{MessageFields, SendError, Transmitter};

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok((host, port)) => {
            println!("Message sent successfully via {host}:{port}");
        }
        Err(e) => {
            eprintln!("Send failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<(String, u16), SendError> {
    let config = Config::from_cli(cli)?;
    let body = config::load_body(&config.body_file)?;

    let mut fields = MessageFields::new(&config.from, &config.to, &config.subject, &body);
    if let Some(ref name) = config.from_name {
        fields = fields.with_from_name(name);
    }
    let message = fields.try_compose()?;

    let transmitter = Transmitter::new(config.tls)?.hello_name(&config.ehlo_name);
    let mut session = config.session();
    transmitter.send(&mut session, &message)?;

    Ok((config.server, config.port))
}
