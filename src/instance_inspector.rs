//! Compute-instance status and load inspection (component B).
//!
//! Answers "is the instance up, what is it, and how loaded is it" without
//! going through the shell channel — these calls hit the cloud control
//! plane (EC2 describe + CloudWatch metrics) directly.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

/// CPU utilization sample, or an explanation for why there isn't one.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CpuUtilization {
    Data {
        average: f64,
        maximum: f64,
        timestamp: String,
        period_minutes: u32,
    },
    NoData {
        message: String,
        period_minutes: u32,
    },
    Error {
        message: String,
    },
}

/// Snapshot of a compute instance's state, identity, and load.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub state: String,
    pub instance_type: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub launch_time: String,
    pub os_name: String,
    pub cpu_utilization: CpuUtilization,
}

/// Inspects a compute instance's state and load. Unlike `RemoteShell`, this
/// trait's methods return `Result` — a failure here means the caller could
/// not even reach the control plane, which is a distinct failure mode from
/// a remote shell command returning a nonzero exit code.
#[async_trait]
pub trait InstanceInspector: Send + Sync {
    async fn status(&self) -> anyhow::Result<InstanceStatus>;
}

/// Production inspector for EC2 instances, grounded on
/// `core.py::check_instance_status` / `_get_cpu_utilization` /
/// `_get_instance_os_name`.
pub struct Ec2InstanceInspector {
    ec2: aws_sdk_ec2::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
    instance_id: String,
}

impl Ec2InstanceInspector {
    pub fn new(
        ec2: aws_sdk_ec2::Client,
        cloudwatch: aws_sdk_cloudwatch::Client,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            ec2,
            cloudwatch,
            instance_id: instance_id.into(),
        }
    }

    pub async fn from_env(region: &str, instance_id: impl Into<String>) -> Self {
        let region_provider = aws_config::Region::new(region.to_string());
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self::new(
            aws_sdk_ec2::Client::new(&sdk_config),
            aws_sdk_cloudwatch::Client::new(&sdk_config),
            instance_id,
        )
    }

    /// Best-effort OS name from the instance's AMI description, matching
    /// `_get_instance_os_name`'s substring heuristics. Returns `"Unknown"`
    /// on any lookup failure rather than propagating an error — the
    /// original treats this as informational, not load-bearing.
    async fn os_name(&self, image_id: Option<&str>) -> String {
        let Some(image_id) = image_id else {
            return "Unknown".to_string();
        };

        let response = match self.ec2.describe_images().image_ids(image_id).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "describe_images failed");
                return "Unknown".to_string();
            }
        };

        let Some(image) = response.images().first() else {
            return "Unknown".to_string();
        };

        let description = image.description().unwrap_or_default();
        let architecture = image.architecture().map(|a| a.as_str()).unwrap_or_default();

        if !description.contains("Ubuntu") {
            return "Unknown".to_string();
        }

        let mut os_name = if description.contains("24.04") {
            "Ubuntu 24.04 LTS".to_string()
        } else if description.contains("22.04") {
            "Ubuntu 22.04 LTS".to_string()
        } else if description.contains("20.04") {
            "Ubuntu 20.04 LTS".to_string()
        } else {
            "Ubuntu Linux".to_string()
        };

        if architecture.eq_ignore_ascii_case("arm64") {
            os_name.push_str(" ARM64");
        }

        os_name
    }

    /// 5-minute CPU utilization window, matching `_get_cpu_utilization`.
    async fn cpu_utilization(&self) -> CpuUtilization {
        let now = aws_sdk_cloudwatch::primitives::DateTime::from(std::time::SystemTime::now());
        let start = aws_sdk_cloudwatch::primitives::DateTime::from(
            std::time::SystemTime::now() - std::time::Duration::from_secs(300),
        );

        let dimension = aws_sdk_cloudwatch::types::Dimension::builder()
            .name("InstanceId")
            .value(&self.instance_id)
            .build();

        let response = self
            .cloudwatch
            .get_metric_statistics()
            .namespace("AWS/EC2")
            .metric_name("CPUUtilization")
            .dimensions(dimension)
            .start_time(start)
            .end_time(now)
            .period(300)
            .statistics(aws_sdk_cloudwatch::types::Statistic::Average)
            .statistics(aws_sdk_cloudwatch::types::Statistic::Maximum)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return CpuUtilization::Error {
                    message: format!("CloudWatch API error: {e}"),
                }
            }
        };

        let latest = response
            .datapoints()
            .iter()
            .max_by_key(|d| d.timestamp().map(aws_sdk_cloudwatch::primitives::DateTime::secs));

        match latest {
            Some(point) => CpuUtilization::Data {
                average: round2(point.average().unwrap_or_default()),
                maximum: round2(point.maximum().unwrap_or_default()),
                timestamp: point
                    .timestamp()
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
                period_minutes: 5,
            },
            None => CpuUtilization::NoData {
                message: "No CPU data available (instance may be recently started)".to_string(),
                period_minutes: 5,
            },
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl InstanceInspector for Ec2InstanceInspector {
    async fn status(&self) -> anyhow::Result<InstanceStatus> {
        let response = self
            .ec2
            .describe_instances()
            .instance_ids(&self.instance_id)
            .send()
            .await?;

        let instance = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| anyhow::anyhow!("Instance not found: {}", self.instance_id))?;

        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let os_name = self.os_name(instance.image_id()).await;

        let cpu_utilization = if state == "running" {
            self.cpu_utilization().await
        } else {
            CpuUtilization::NoData {
                message: "Instance not running".to_string(),
                period_minutes: 5,
            }
        };

        Ok(InstanceStatus {
            instance_id: instance.instance_id().unwrap_or_default().to_string(),
            state,
            instance_type: instance
                .instance_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            public_ip: instance.public_ip_address().map(str::to_string),
            private_ip: instance.private_ip_address().map(str::to_string),
            launch_time: instance
                .launch_time()
                .map(|t| t.to_string())
                .unwrap_or_default(),
            os_name,
            cpu_utilization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInspector(InstanceStatus);

    #[async_trait]
    impl InstanceInspector for FakeInspector {
        async fn status(&self) -> anyhow::Result<InstanceStatus> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn status_serializes_cpu_variants() {
        let status = InstanceStatus {
            instance_id: "i-abc".to_string(),
            state: "running".to_string(),
            instance_type: "t3.medium".to_string(),
            public_ip: None,
            private_ip: Some("10.0.0.1".to_string()),
            launch_time: "2026-01-01T00:00:00Z".to_string(),
            os_name: "Ubuntu 22.04 LTS".to_string(),
            cpu_utilization: CpuUtilization::NoData {
                message: "No CPU data available (instance may be recently started)".to_string(),
                period_minutes: 5,
            },
        };
        let inspector = FakeInspector(status);
        let result = inspector.status().await.unwrap();
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["cpu_utilization"]["kind"], "no_data");
    }
}
