use clap::Parser;
use sensor2store::cli::{commands, config::Config, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    sensor2store::native::init_tracing();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => commands::execute_serve(config, args).await?,
        Commands::Upload(args) => commands::execute_upload(config, args).await?,
        Commands::Flush(args) => commands::execute_flush(config, args).await?,
        Commands::Pending => commands::execute_pending(config)?,
    }

    Ok(())
}
