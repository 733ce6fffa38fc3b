//! Database operations for storing aggregated climate measurements

use crate::database::connection::execute_with_retry;
use crate::models::Measurement;

/// Store one aggregated measurement in the climate_data table
///
/// A NaN value is stored as NULL. Uses the retry mechanism to ride out
/// transient database connection issues.
///
/// # Arguments
/// * `measurement` - Aggregated value with its quantity, device and timestamp
/// * `database_url` - PostgreSQL connection string
pub async fn store_measurement(measurement: &Measurement, database_url: &str) -> Result<(), String> {
    // Clone data for move into async closure
    let measurement = measurement.clone();

    execute_with_retry(database_url, move |client| {
        let measurement = measurement.clone();
        async move {
            client
                .execute(
                    "INSERT INTO climate_data(device, quantity, value, time)
                     VALUES ($1, $2, $3, $4)",
                    &[
                        &measurement.device,
                        &measurement.quantity.as_str(),
                        &measurement.stored_value(),
                        &measurement.time,
                    ],
                )
                .await
        }
    })
    .await
}
