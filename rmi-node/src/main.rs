use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use rmi::{
    config::{Config, Transport},
    DistributedControl,
};

mod init;
mod workload;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    #[command(flatten)]
    pub workload: workload::Workload,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let nodes = match (args.options.transport, args.options.num_procs) {
        (Transport::InMemory, Some(numprocs)) if numprocs > 1 => {
            DistributedControl::in_memory(&args.options, numprocs).await?
        }
        _ => vec![DistributedControl::init(&args.options).await?],
    };

    rmi::futures::future::try_join_all(nodes.iter().map(|dc| async {
        args.workload.run(dc).await?;
        dc.shutdown().await
    }))
    .await?;

    Ok(())
}
