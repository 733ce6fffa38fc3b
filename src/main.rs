mod aggregator;
mod config;
mod database;
mod error;
mod models;
mod publisher;
mod sensor;
mod shutdown;
mod utils;

use log::{error, info, warn};
use tokio::time::{timeout, Duration};

use aggregator::SampleAggregator;
use config::SensorConfig;
use publisher::{DatabasePublisher, LogPublisher, Publisher};
use sensor::{AcquisitionScheduler, CdevGpio, GpioDriver};
use shutdown::KeepGoing;

// how long queued measurements may take to reach the database on shutdown
const WRITER_DRAIN_SECS: u64 = 10;

/// Read the sensor until `keep_going` is cleared, feeding every raw pair into
/// the aggregator. Fails if the sensor's GPIO went down while running.
fn main_loop<G: GpioDriver, P: Publisher>(
    scheduler: &mut AcquisitionScheduler<G>,
    aggregator: &mut SampleAggregator<P>,
    keep_going: &KeepGoing,
) -> Result<(), String> {
    info!("Starting main loop");
    aggregator.begin();

    while keep_going.is_set() {
        if !scheduler.wait_for_next_measurement(keep_going) {
            break;
        }
        // both reads fall in the same window; the second comes from cache
        let temperature = scheduler.read_temperature(keep_going);
        let humidity = scheduler.read_humidity(keep_going);
        aggregator.process_sample(temperature, humidity);
    }

    let diagnostics = scheduler.diagnostics();
    info!(
        "Stopping after {} failed reads, {} sensor resets, {} NaN samples",
        diagnostics.total_failures,
        diagnostics.resets,
        aggregator.overall_nan_count()
    );
    if diagnostics.overruns > 0 || diagnostics.anomalies > 0 || diagnostics.dropped_edges > 0 {
        info!(
            "Edge diagnostics: {} overruns, {} anomalies, {} dropped",
            diagnostics.overruns, diagnostics.anomalies, diagnostics.dropped_edges
        );
    }

    let gpio_lost = keep_going.is_set();
    scheduler.shutdown();
    if gpio_lost {
        return Err("sensor GPIO is no longer available".into());
    }
    Ok(())
}

async fn run_acquisition<G, P>(
    mut scheduler: AcquisitionScheduler<G>,
    publisher: P,
    keep_going: KeepGoing,
) -> Result<(), Box<dyn std::error::Error>>
where
    G: GpioDriver + Send + 'static,
    P: Publisher + Send + 'static,
{
    let mut aggregator = SampleAggregator::new(publisher);
    tokio::task::spawn_blocking(move || main_loop(&mut scheduler, &mut aggregator, &keep_going))
        .await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SensorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let mut scheduler = AcquisitionScheduler::new(
        CdevGpio::new(&config.gpio_chip),
        config.pins,
        config.max_consecutive_failures,
    );
    if let Err(e) = scheduler.begin() {
        error!("Failed to initialise sensor: {}", e);
        return Err(e.into());
    }

    // Handle Ctrl+C gracefully
    let keep_going = KeepGoing::new();
    {
        let keep_going = keep_going.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Program terminated by user. Exiting gracefully.");
                    keep_going.stop();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    let result = match config.database_url.clone() {
        Some(database_url) => {
            let (publisher, writer) =
                DatabasePublisher::spawn(database_url, config.device_name.clone());
            let result = run_acquisition(scheduler, publisher, keep_going).await;
            if timeout(Duration::from_secs(WRITER_DRAIN_SECS), writer)
                .await
                .is_err()
            {
                warn!("Shutting down with measurements not yet stored");
            }
            result
        }
        None => {
            let publisher = LogPublisher::new(config.device_name.clone());
            run_acquisition(scheduler, publisher, keep_going).await
        }
    };

    match &result {
        Ok(()) => info!("Program completed successfully"),
        Err(e) => error!("Fatal error: {}", e),
    }
    result
}
