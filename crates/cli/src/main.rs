use clap::Parser;

use afterhours_cli::Cli;
use afterhours_infra::tasks::TaskRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    afterhours_observability::init(cli.log_format);
    afterhours_cli::run(cli, TaskRegistry::new()).await
}
