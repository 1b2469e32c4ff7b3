//! Environmental sensor seam.
//!
//! A `Sensor` is polled by each recorder's supervisor every `extra_data_interval`; readings
//! are forwarded to the region writer, which stores them with `add_extra_data`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::ExtraData;

pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    /// Current reading, or `None` when the sensor has nothing to report.
    fn query(&self) -> Option<ExtraData>;
}

/// Sensor returning fixed values, stamped with the time of the query.
#[derive(Clone, Debug, Default)]
pub struct StaticSensor {
    values: BTreeMap<String, f64>,
    started: Option<std::time::Instant>,
}

impl StaticSensor {
    pub fn new(values: impl IntoIterator<Item = (String, f64)>) -> Arc<Self> {
        Arc::new(Self {
            values: values.into_iter().collect(),
            started: Some(std::time::Instant::now()),
        })
    }
}

impl Sensor for StaticSensor {
    fn name(&self) -> &str {
        "static"
    }

    fn query(&self) -> Option<ExtraData> {
        if self.values.is_empty() {
            return None;
        }
        let timestamp = self
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default();
        Some(ExtraData {
            timestamp,
            values: self.values.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_static_sensor_reports_nothing() {
        assert!(StaticSensor::default().query().is_none());
        let sensor = StaticSensor::new([("humidity".to_string(), 40.0)]);
        assert_eq!(sensor.query().unwrap().values["humidity"], 40.0);
    }
}
