//! Timed and operator-released waits.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{Interrupt, Operation, OperationSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::Services;
use crate::schedule::{fields, Command, ConfigValue, OperationTag};

/// Legacy schedule-file format, e.g. `2024-05-01T04h30m00s-0700`.
pub const LEGACY_DATETIME_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%Ss%z";

/// Parses an offset-aware wall-clock time, RFC 3339 or the legacy format.
pub fn parse_target_datetime(text: &str) -> SchedResult<DateTime<FixedOffset>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, LEGACY_DATETIME_FORMAT))
        .map_err(|_| {
            SchedError::invalid(
                fields::TARGET_DATETIME,
                format!("'{text}' is not a date and time with a UTC offset"),
            )
        })
}

/// Blocks until a wall-clock time.
#[derive(Debug)]
pub struct WaitUntil {
    target: DateTime<FixedOffset>,
    interrupt: Interrupt,
}

impl WaitUntil {
    /// Parses the target time up front so a bad date fails validation.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        let target = match command.require(fields::TARGET_DATETIME)? {
            ConfigValue::Text(text) => parse_target_datetime(text)?,
            _ => {
                return Err(SchedError::invalid(
                    fields::TARGET_DATETIME,
                    "expected date and time text",
                ))
            }
        };
        Ok(Arc::new(Self {
            target,
            interrupt: Interrupt::new(),
        }))
    }

    /// Time to wait for, in the offset it was written with.
    pub fn target(&self) -> DateTime<FixedOffset> {
        self.target
    }
}

#[async_trait]
impl Operation for WaitUntil {
    fn tag(&self) -> OperationTag {
        OperationTag::WaitUntil
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        let remaining = self.target.with_timezone(&Utc) - Utc::now();
        let Ok(remaining) = remaining.to_std() else {
            services
                .status
                .info(format!("{} has already passed, continuing", self.target));
            return Ok(());
        };
        services.status.info(format!("Waiting until {}", self.target));
        if self.interrupt.sleep(remaining).await {
            services.status.warn("Wait interrupted");
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        self.interrupt.trigger();
        true
    }
}

/// Blocks for a fixed time.
#[derive(Debug)]
pub struct WaitForDuration {
    duration: Duration,
    interrupt: Interrupt,
}

impl WaitForDuration {
    /// Negative or unrepresentable durations are invalid.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        let secs = command.number(fields::SECONDS)?;
        if secs < 0.0 {
            return Err(SchedError::invalid(fields::SECONDS, "must not be negative"));
        }
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| SchedError::invalid(fields::SECONDS, e.to_string()))?;
        Ok(Arc::new(Self {
            duration,
            interrupt: Interrupt::new(),
        }))
    }
}

#[async_trait]
impl Operation for WaitForDuration {
    fn tag(&self) -> OperationTag {
        OperationTag::WaitForDuration
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services
            .status
            .info(format!("Waiting for {}s", self.duration.as_secs_f64()));
        if self.interrupt.sleep(self.duration).await {
            services.status.warn("Wait interrupted");
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        self.interrupt.trigger();
        true
    }
}

/// Blocks until the operator releases the prompt.
#[derive(Debug, Default)]
pub struct WaitForPrompt {
    interrupt: Interrupt,
}

impl WaitForPrompt {
    /// Takes no fields.
    pub fn construct(_: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        Ok(Arc::new(Self::default()))
    }
}

#[async_trait]
impl Operation for WaitForPrompt {
    fn tag(&self) -> OperationTag {
        OperationTag::WaitForPrompt
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services.status.warn("Waiting for operator to continue");
        tokio::select! {
            _ = services.prompt.wait() => {
                info!("Prompt released");
                services.status.info("Continuing");
            }
            _ = self.interrupt.wait() => services.status.warn("Prompt wait interrupted"),
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        self.interrupt.trigger();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::catalog::Catalog;
    use crate::hardware::mock::MockRig;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Instant;

    #[test]
    fn test_parse_target_datetime_formats() {
        let rfc = parse_target_datetime("2024-05-01T04:30:00-07:00").unwrap();
        let legacy = parse_target_datetime("2024-05-01T04h30m00s-0700").unwrap();
        assert_eq!(rfc, legacy);
        assert_eq!(
            rfc.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 30, 0).unwrap()
        );
        assert!(parse_target_datetime("2024-05-01 04:30:00").is_err());
    }

    #[test]
    fn test_negative_duration_is_invalid() {
        let cmd = Command::new(OperationTag::WaitForDuration).with(fields::SECONDS, -3.0);
        assert!(WaitForDuration::construct(&cmd, &OperationSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_past_target_returns_immediately() {
        let rig = MockRig::new(Catalog::new());
        let past = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
        let cmd = Command::new(OperationTag::WaitUntil).with(fields::TARGET_DATETIME, past);
        let op = WaitUntil::construct(&cmd, &OperationSettings::default()).unwrap();

        let start = Instant::now();
        op.run(&rig.services()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(rig.status.contains("already passed"));
    }

    #[tokio::test]
    async fn test_release_before_prompt_is_ignored() {
        let rig = MockRig::new(Catalog::new());
        let cmd = Command::new(OperationTag::WaitForPrompt);
        let op = WaitForPrompt::construct(&cmd, &OperationSettings::default()).unwrap();

        assert!(!rig.prompt.release());
        let early = tokio::time::timeout(Duration::from_millis(50), op.run(&rig.services())).await;
        assert!(early.is_err(), "stale release let the prompt through");
        assert!(!rig.prompt.is_waiting());
    }

    #[tokio::test]
    async fn test_release_while_waiting_continues() {
        let rig = MockRig::new(Catalog::new());
        let cmd = Command::new(OperationTag::WaitForPrompt);
        let op = WaitForPrompt::construct(&cmd, &OperationSettings::default()).unwrap();
        let services = rig.services();

        let releaser = async {
            while !rig.prompt.is_waiting() {
                tokio::task::yield_now().await;
            }
            assert!(rig.prompt.release());
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(op.run(&services), releaser)
        })
        .await
        .unwrap();
        result.unwrap();
        assert!(rig.status.contains("Continuing"));
        assert!(!rig.prompt.is_waiting());
    }

    #[tokio::test]
    async fn test_prompt_wait_can_be_interrupted() {
        let rig = MockRig::new(Catalog::new());
        let cmd = Command::new(OperationTag::WaitForPrompt);
        let op = WaitForPrompt::construct(&cmd, &OperationSettings::default()).unwrap();
        assert!(op.interrupt());
        tokio::time::timeout(Duration::from_secs(5), op.run(&rig.services()))
            .await
            .unwrap()
            .unwrap();
        assert!(rig.status.contains("interrupted"));
    }
}
