use abtest_http::serve;
use clap::{parser::ValueSource, ArgMatches, CommandFactory, FromArgMatches, Parser};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7800;

#[derive(Parser)]
#[command(name = "abtest", about = "Campaign A/B experiment service")]
struct Cli {
    #[arg(long, env = "ABTEST_DATA_DIR", default_value = "./data")]
    data_dir: String,
    #[arg(long, env = "ABTEST_BIND_ADDR")]
    bind_addr: Option<String>,
    #[arg(long, env = "ABTEST_PORT")]
    port: Option<u16>,

    /// Keep experiments in memory only; nothing is written to the data dir.
    #[arg(long)]
    in_memory: bool,

    /// Bind to 127.0.0.1:0 (OS-assigned ephemeral port).
    #[arg(long)]
    auto_port: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    let bind_addr = resolve_bind_addr(&cli, &matches)
        .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;
    std::env::set_var("ABTEST_DATA_DIR", &cli.data_dir);
    std::env::set_var("ABTEST_BIND_ADDR", &bind_addr);
    if cli.in_memory {
        std::env::set_var("ABTEST_IN_MEMORY", "1");
    }
    serve().await
}

fn resolve_bind_addr(cli: &Cli, matches: &ArgMatches) -> Result<String, String> {
    if cli.auto_port && is_set_on_command_line(matches, "bind_addr") {
        return Err("--auto-port cannot be used with --bind-addr".to_string());
    }

    if cli.auto_port && is_set_on_command_line(matches, "port") {
        return Err("--auto-port cannot be used with --port".to_string());
    }

    if cli.auto_port {
        return Ok(format!("{DEFAULT_HOST}:0"));
    }

    // an explicit --port beats a bind address that only came from the environment
    if is_set_on_command_line(matches, "port") && !is_set_on_command_line(matches, "bind_addr") {
        if let Some(port) = cli.port {
            return Ok(format!("{DEFAULT_HOST}:{port}"));
        }
    }

    if let Some(bind_addr) = &cli.bind_addr {
        return Ok(bind_addr.clone());
    }

    let port = cli.port.unwrap_or(DEFAULT_PORT);
    Ok(format!("{DEFAULT_HOST}:{port}"))
}

fn is_set_on_command_line(matches: &ArgMatches, arg: &str) -> bool {
    matches.value_source(arg) == Some(ValueSource::CommandLine)
}
