//! Accelerator telemetry sources.
//!
//! The coordinator never talks to hardware directly; it goes through a
//! [`TelemetrySource`]. [`NvidiaSmiSource`] reads NVIDIA devices through
//! `nvidia-smi`, and [`FakeTelemetrySource`] provides a scripted fleet with
//! fault injection for tests and hosts without GPUs.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, SwarmError};

/// Static description of one enumerated device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDescriptor {
    /// Device index (0-based).
    pub index: u32,
    /// Device name/model (e.g., "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Total memory in MB.
    pub total_memory_mb: u64,
    /// Compute capability (e.g., 8.9).
    pub compute_capability: f64,
}

/// One raw telemetry reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawTelemetry {
    /// Compute utilization fraction in [0, 1].
    pub compute_utilization: f64,
    /// Memory utilization fraction in [0, 1].
    pub memory_utilization: f64,
    /// Temperature in Celsius.
    pub temperature_c: f64,
    /// Power draw in Watts.
    pub power_watts: f64,
}

/// Hardware/driver interface queried by the coordinator.
///
/// Both operations may fail transiently; callers wrap them in retry and
/// circuit-breaking policies.
pub trait TelemetrySource: Send + Sync {
    /// Enumerate all available devices.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::Enumeration`] if the device list cannot be read.
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceDescriptor>>>;

    /// Read current telemetry for one device.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::Query`] if the device cannot be read.
    fn query(&self, device_index: u32) -> BoxFuture<'_, Result<RawTelemetry>>;
}

/// NVIDIA telemetry via nvidia-smi.
#[derive(Debug, Default)]
pub struct NvidiaSmiSource {
    /// Custom nvidia-smi path (for testing or non-standard installs).
    nvidia_smi_path: Option<String>,
}

impl NvidiaSmiSource {
    /// Create a source using nvidia-smi from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source with a custom nvidia-smi path.
    #[must_use]
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            nvidia_smi_path: Some(path.into()),
        }
    }

    fn nvidia_smi_path(&self) -> &str {
        self.nvidia_smi_path.as_deref().unwrap_or("nvidia-smi")
    }

    /// Parse enumeration output.
    ///
    /// Expected format (`--format=csv,noheader,nounits`):
    /// `index, name, memory.total, compute_cap`
    pub fn parse_devices_csv(output: &str) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(", ").collect();
            if parts.len() < 4 {
                continue; // Skip malformed lines
            }

            let index = parts[0]
                .trim()
                .parse::<u32>()
                .map_err(|e| SwarmError::Enumeration(format!("invalid device index: {e}")))?;

            let name = parts[1].trim().to_string();

            let total_memory_mb = parts[2]
                .trim()
                .parse::<u64>()
                .map_err(|e| SwarmError::Enumeration(format!("invalid memory value: {e}")))?;

            let compute_capability = parts[3].trim().parse::<f64>().map_err(|e| {
                SwarmError::Enumeration(format!("invalid compute capability: {e}"))
            })?;

            devices.push(DeviceDescriptor {
                index,
                name,
                total_memory_mb,
                compute_capability,
            });
        }

        Ok(devices)
    }

    /// Parse a single-device telemetry line.
    ///
    /// Expected format (`--format=csv,noheader,nounits`):
    /// `utilization.gpu, utilization.memory, temperature.gpu, power.draw`
    pub fn parse_telemetry_csv(device_index: u32, output: &str) -> Result<RawTelemetry> {
        let fault = |reason: String| SwarmError::Query {
            device_index,
            reason,
        };

        let line = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| fault("empty nvidia-smi output".to_string()))?;

        let parts: Vec<&str> = line.split(", ").map(str::trim).collect();
        if parts.len() < 3 {
            return Err(fault(format!("malformed telemetry line: {line}")));
        }

        let percent = |value: &str, what: &str| -> Result<f64> {
            value
                .parse::<f64>()
                .map(|p| (p / 100.0).clamp(0.0, 1.0))
                .map_err(|e| fault(format!("invalid {what}: {e}")))
        };

        let compute_utilization = percent(parts[0], "compute utilization")?;
        let memory_utilization = percent(parts[1], "memory utilization")?;
        let temperature_c = parts[2]
            .parse::<f64>()
            .map_err(|e| fault(format!("invalid temperature: {e}")))?;

        let power_watts = match parts.get(3) {
            Some(&"[N/A]") | Some(&"") | None => 0.0,
            Some(value) => value
                .parse::<f64>()
                .map_err(|e| fault(format!("invalid power value: {e}")))?,
        };

        Ok(RawTelemetry {
            compute_utilization,
            memory_utilization,
            temperature_c,
            power_watts,
        })
    }

    async fn run_nvidia_smi(&self, args: &[String]) -> std::result::Result<String, String> {
        // the child is killed if this future is dropped mid-query
        let output = Command::new(self.nvidia_smi_path())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run nvidia-smi: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("nvidia-smi failed: {}", stderr.trim()));
        }

        String::from_utf8(output.stdout).map_err(|e| format!("invalid nvidia-smi output: {e}"))
    }
}

impl TelemetrySource for NvidiaSmiSource {
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceDescriptor>>> {
        async move {
            let args = [
                "--query-gpu=index,name,memory.total,compute_cap".to_string(),
                "--format=csv,noheader,nounits".to_string(),
            ];
            let output = self
                .run_nvidia_smi(&args)
                .await
                .map_err(SwarmError::Enumeration)?;
            Self::parse_devices_csv(&output)
        }
        .boxed()
    }

    fn query(&self, device_index: u32) -> BoxFuture<'_, Result<RawTelemetry>> {
        async move {
            let args = [
                format!("--id={device_index}"),
                "--query-gpu=utilization.gpu,utilization.memory,temperature.gpu,power.draw"
                    .to_string(),
                "--format=csv,noheader,nounits".to_string(),
            ];
            let output = self
                .run_nvidia_smi(&args)
                .await
                .map_err(|reason| SwarmError::Query {
                    device_index,
                    reason,
                })?;
            Self::parse_telemetry_csv(device_index, &output)
        }
        .boxed()
    }
}

/// A scripted telemetry source for testing.
///
/// Readings are fixed per device until changed; faults can be injected for
/// the next `n` queries of a device or the next `n` enumerations.
#[derive(Debug, Default)]
pub struct FakeTelemetrySource {
    devices: Vec<DeviceDescriptor>,
    readings: Mutex<HashMap<u32, RawTelemetry>>,
    query_failures: Mutex<HashMap<u32, u32>>,
    query_counts: Mutex<HashMap<u32, u32>>,
    enumeration_failures: AtomicU32,
    enumerate_calls: AtomicU32,
}

impl FakeTelemetrySource {
    /// Create a new fake source with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fake device with its initial reading.
    #[must_use]
    pub fn with_device(mut self, device: DeviceDescriptor, reading: RawTelemetry) -> Self {
        self.readings.get_mut().insert(device.index, reading);
        self.devices.push(device);
        self
    }

    /// Replace the reading returned for a device.
    pub fn set_reading(&self, device_index: u32, reading: RawTelemetry) {
        self.readings.lock().insert(device_index, reading);
    }

    /// Make the next `count` queries for a device fail.
    pub fn fail_next_queries(&self, device_index: u32, count: u32) {
        self.query_failures.lock().insert(device_index, count);
    }

    /// Make every future query for a device fail.
    pub fn fail_always(&self, device_index: u32) {
        self.fail_next_queries(device_index, u32::MAX);
    }

    /// Stop injecting query failures for a device.
    pub fn heal(&self, device_index: u32) {
        self.query_failures.lock().remove(&device_index);
    }

    /// Make the next `count` enumerations fail.
    pub fn fail_next_enumerations(&self, count: u32) {
        self.enumeration_failures.store(count, Ordering::SeqCst);
    }

    /// Number of queries that reached this source for a device.
    #[must_use]
    pub fn query_count(&self, device_index: u32) -> u32 {
        self.query_counts
            .lock()
            .get(&device_index)
            .copied()
            .unwrap_or(0)
    }

    /// Number of enumerations that reached this source.
    #[must_use]
    pub fn enumerate_count(&self) -> u32 {
        self.enumerate_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, device_index: u32) -> bool {
        let mut failures = self.query_failures.lock();
        match failures.get_mut(&device_index) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }
}

impl TelemetrySource for FakeTelemetrySource {
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceDescriptor>>> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .enumeration_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if failed {
            Err(SwarmError::Enumeration("injected enumeration fault".to_string()))
        } else {
            Ok(self.devices.clone())
        };
        futures::future::ready(result).boxed()
    }

    fn query(&self, device_index: u32) -> BoxFuture<'_, Result<RawTelemetry>> {
        *self.query_counts.lock().entry(device_index).or_insert(0) += 1;

        let result = if self.take_failure(device_index) {
            Err(SwarmError::Query {
                device_index,
                reason: "injected query fault".to_string(),
            })
        } else {
            self.readings
                .lock()
                .get(&device_index)
                .copied()
                .ok_or_else(|| SwarmError::Query {
                    device_index,
                    reason: format!("device {device_index} not found"),
                })
        };
        futures::future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(index: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: format!("Fake GPU {index}"),
            total_memory_mb: 8192,
            compute_capability: 8.6,
        }
    }

    fn reading(compute: f64) -> RawTelemetry {
        RawTelemetry {
            compute_utilization: compute,
            memory_utilization: 0.25,
            temperature_c: 60.0,
            power_watts: 180.0,
        }
    }

    #[test]
    fn test_parse_single_device() {
        let csv = "0, NVIDIA GeForce RTX 4090, 24564, 8.9";

        let devices = NvidiaSmiSource::parse_devices_csv(csv).expect("should parse");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(devices[0].total_memory_mb, 24564);
        assert!((devices[0].compute_capability - 8.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_multiple_devices() {
        let csv = r"0, NVIDIA GeForce RTX 4090, 24564, 8.9
1, NVIDIA GeForce GTX 1050, 2048, 6.1

2, NVIDIA A100, 81920, 8.0";

        let devices = NvidiaSmiSource::parse_devices_csv(csv).expect("should parse");
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].total_memory_mb, 2048);
        assert_eq!(devices[2].name, "NVIDIA A100");
    }

    #[test]
    fn test_parse_devices_invalid_index() {
        let csv = "zero, GPU, 1024, 7.5";
        let err = NvidiaSmiSource::parse_devices_csv(csv).expect_err("should fail");
        assert!(matches!(err, SwarmError::Enumeration(_)));
        assert!(err.to_string().contains("invalid device index"));
    }

    #[test]
    fn test_parse_devices_skips_malformed() {
        let devices = NvidiaSmiSource::parse_devices_csv("garbage line\n   \n")
            .expect("malformed lines are skipped");
        assert!(devices.is_empty());
    }

    #[test]
    fn test_parse_telemetry() {
        let t = NvidiaSmiSource::parse_telemetry_csv(3, "75, 40, 68, 320.50").expect("parse");
        assert!((t.compute_utilization - 0.75).abs() < 1e-9);
        assert!((t.memory_utilization - 0.40).abs() < 1e-9);
        assert!((t.temperature_c - 68.0).abs() < 1e-9);
        assert!((t.power_watts - 320.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_telemetry_na_power() {
        let t = NvidiaSmiSource::parse_telemetry_csv(0, "10, 20, 40, [N/A]").expect("parse");
        assert!(t.power_watts.abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_telemetry_clamps_percentages() {
        let t = NvidiaSmiSource::parse_telemetry_csv(0, "150, -5, 40, 100").expect("parse");
        assert!((t.compute_utilization - 1.0).abs() < f64::EPSILON);
        assert!(t.memory_utilization.abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_telemetry_errors_carry_device() {
        let err = NvidiaSmiSource::parse_telemetry_csv(5, "").expect_err("empty");
        assert!(matches!(err, SwarmError::Query { device_index: 5, .. }));

        let err = NvidiaSmiSource::parse_telemetry_csv(5, "x, 1, 2, 3").expect_err("bad");
        assert!(err.to_string().contains("invalid compute utilization"));
    }

    #[test]
    fn test_nvidia_source_paths() {
        assert_eq!(NvidiaSmiSource::new().nvidia_smi_path(), "nvidia-smi");
        assert_eq!(
            NvidiaSmiSource::with_path("/opt/bin/nvidia-smi").nvidia_smi_path(),
            "/opt/bin/nvidia-smi"
        );
    }

    #[tokio::test]
    async fn test_nvidia_source_missing_binary() {
        let source = NvidiaSmiSource::with_path("/nonexistent/nvidia-smi");
        let err = source.enumerate().await.expect_err("binary missing");
        assert!(matches!(err, SwarmError::Enumeration(_)));

        let err = source.query(0).await.expect_err("binary missing");
        assert!(matches!(err, SwarmError::Query { device_index: 0, .. }));
    }

    #[tokio::test]
    async fn test_fake_source_enumerate_and_query() {
        let source = FakeTelemetrySource::new()
            .with_device(descriptor(0), reading(0.5))
            .with_device(descriptor(1), reading(0.9));

        let devices = source.enumerate().await.expect("enumerate");
        assert_eq!(devices.len(), 2);

        let t = source.query(1).await.expect("query");
        assert!((t.compute_utilization - 0.9).abs() < f64::EPSILON);
        assert_eq!(source.query_count(1), 1);
        assert_eq!(source.query_count(0), 0);

        assert!(source.query(9).await.is_err());
    }

    #[tokio::test]
    async fn test_fake_source_injected_faults() {
        let source = FakeTelemetrySource::new().with_device(descriptor(0), reading(0.1));

        source.fail_next_queries(0, 2);
        assert!(source.query(0).await.is_err());
        assert!(source.query(0).await.is_err());
        assert!(source.query(0).await.is_ok());

        source.fail_always(0);
        for _ in 0..5 {
            assert!(source.query(0).await.is_err());
        }
        source.heal(0);
        assert!(source.query(0).await.is_ok());
        assert_eq!(source.query_count(0), 9);
    }

    #[tokio::test]
    async fn test_fake_source_enumeration_faults() {
        let source = FakeTelemetrySource::new().with_device(descriptor(0), reading(0.1));
        source.fail_next_enumerations(1);

        assert!(source.enumerate().await.is_err());
        assert_eq!(source.enumerate().await.expect("recovered").len(), 1);
        assert_eq!(source.enumerate_count(), 2);
    }

    #[tokio::test]
    async fn test_fake_source_set_reading() {
        let source = FakeTelemetrySource::new().with_device(descriptor(0), reading(0.1));
        source.set_reading(0, reading(0.95));
        let t = source.query(0).await.expect("query");
        assert!((t.compute_utilization - 0.95).abs() < f64::EPSILON);
    }
}
