use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::cli::config::Config;
use crate::cli::{FlushArgs, UploadArgs};
use crate::measurement::{Measurement, StorableMeasurement};
use crate::pending::PendingQueue;
use crate::publish::HttpPublisher;
use crate::upload::{UploadOutcome, Uploader};

fn build_uploader(config: &Config, endpoint: Option<String>) -> Result<Uploader> {
    let endpoint = endpoint.unwrap_or_else(|| config.endpoint.clone());
    let publisher = HttpPublisher::new(endpoint, config.publish_timeout())?;
    let queue = PendingQueue::open(&config.pending_dir)?;

    Ok(
        Uploader::new(Arc::new(publisher), queue, config.topic.clone())
            .with_timeout(config.publish_timeout()),
    )
}

pub async fn execute_upload(config: Config, args: UploadArgs) -> Result<()> {
    let device_id = args
        .device_id
        .or_else(|| config.device_id.clone())
        .context("No device ID. Pass --device-id or set device_id in the config file.")?;
    let uploader = build_uploader(&config, args.endpoint)?;

    let storable = StorableMeasurement::new(device_id, Utc::now(), args.temp);
    let m = Measurement::try_from(&storable)?;

    let outcome = if args.no_flush {
        uploader.upload(&m).await?
    } else {
        uploader.upload_and_flush(&m).await?
    };

    match outcome {
        UploadOutcome::Published => println!("Published {}", storable),
        UploadOutcome::Queued => println!(
            "Queued {} ({} pending)",
            storable,
            uploader.queue().len()?
        ),
    }

    Ok(())
}

pub async fn execute_flush(config: Config, args: FlushArgs) -> Result<()> {
    let uploader = build_uploader(&config, args.endpoint)?;

    let summary = uploader
        .flush_pending()
        .await
        .context("Flush stopped; remaining measurements stay queued")?;
    println!("Published {} pending measurements", summary.published);

    Ok(())
}
