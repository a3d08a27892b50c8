//! Receiver frequency tuning, gain adjustment, and digitizer mode.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Operation, OperationSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::{DigitizerMode, Services, TuningChannel};
use crate::schedule::{fields, Command, OperationTag};

const CHANNEL_FIELDS: [(TuningChannel, &str); 4] = [
    (TuningChannel::A, fields::TUNING_A),
    (TuningChannel::B, fields::TUNING_B),
    (TuningChannel::C, fields::TUNING_C),
    (TuningChannel::D, fields::TUNING_D),
];

/// Index of the channel that re-establishes focus: the highest frequency,
/// first one wins on ties.
pub fn focus_channel(channels: &[(TuningChannel, f64)]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, (_, freq)) in channels.iter().enumerate() {
        match best {
            Some(b) if channels[b].1 >= *freq => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Retunes the present channels, then adjusts gains.
#[derive(Debug, Clone)]
pub struct SetFrequencyTuning {
    ids: Vec<String>,
    channels: Vec<(TuningChannel, f64)>,
    rf_gain: bool,
    if_gain: bool,
    eq_level: bool,
    focus: bool,
    settle: Duration,
}

impl SetFrequencyTuning {
    /// Builds from a `set_frequency_tuning` line.
    pub fn construct(
        command: &Command,
        settings: &OperationSettings,
    ) -> SchedResult<Arc<dyn Operation>> {
        let ids = command.identifiers(fields::EQUIPMENT_LIST)?;
        if ids.is_empty() {
            return Err(SchedError::invalid(fields::EQUIPMENT_LIST, "no equipment selected"));
        }

        let mut channels = Vec::new();
        for (channel, field) in CHANNEL_FIELDS {
            if let Some(freq) = command.optional_number(field)? {
                if freq <= 0.0 {
                    return Err(SchedError::invalid(field, "frequency must be positive"));
                }
                channels.push((channel, freq));
            }
        }

        Ok(Arc::new(Self {
            ids,
            channels,
            rf_gain: command.flag(fields::RF_GAIN_FLAG)?,
            if_gain: command.flag(fields::IF_GAIN_FLAG)?,
            eq_level: command.flag(fields::EQ_LEVEL_FLAG)?,
            focus: command.optional_flag(fields::FOCUS_FLAG, true)?,
            settle: settings.settle,
        }))
    }

    fn retuned(&self) -> Vec<TuningChannel> {
        self.channels.iter().map(|(c, _)| *c).collect()
    }
}

#[async_trait]
impl Operation for SetFrequencyTuning {
    fn tag(&self) -> OperationTag {
        OperationTag::SetFrequencyTuning
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        if let Some(focus) = focus_channel(&self.channels) {
            let names: Vec<String> = self.retuned().iter().map(|c| c.to_string()).collect();
            services
                .status
                .info(format!("Setting frequencies for channels: {}", names.join(", ")));

            for (i, (channel, freq)) in self.channels.iter().enumerate() {
                let defer_focus = !self.focus || i != focus;
                debug!(%channel, freq, defer_focus, "Retuning");
                services
                    .equipment
                    .retune(*freq, &self.ids, *channel, defer_focus)
                    .await?;
            }
            tokio::time::sleep(self.settle).await;
        }

        if self.rf_gain {
            services.status.info("Tuning RF gain");
            services.equipment.autotune(&self.ids).await?;
        }

        if self.if_gain {
            let channels = self.retuned();
            if channels.is_empty() {
                services
                    .status
                    .warn("IF tuning requested but no channel was retuned, skipping");
            } else {
                services.status.info("Tuning IF gain");
                services.equipment.tune_if(&self.ids, &channels).await?;
            }
        }

        if self.eq_level {
            debug!("Equalizer levelling requested, nothing to do");
        }
        Ok(())
    }
}

/// Switches the digitizer sampling mode.
#[derive(Debug, Clone)]
pub struct SetDigitizerMode {
    ids: Vec<String>,
    mode: DigitizerMode,
}

impl SetDigitizerMode {
    /// Builds from a `set_digitizer_mode` line.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        let ids = command.identifiers(fields::EQUIPMENT_LIST)?;
        if ids.is_empty() {
            return Err(SchedError::invalid(fields::EQUIPMENT_LIST, "no equipment selected"));
        }
        let text = command.identifier(fields::DIGITIZER_MODE)?;
        let mode = DigitizerMode::parse(&text).ok_or_else(|| {
            SchedError::invalid(fields::DIGITIZER_MODE, format!("unknown digitizer mode '{text}'"))
        })?;
        Ok(Arc::new(Self { ids, mode }))
    }
}

#[async_trait]
impl Operation for SetDigitizerMode {
    fn tag(&self) -> OperationTag {
        OperationTag::SetDigitizerMode
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services
            .status
            .info(format!("Setting digitizer to {}", self.mode));
        services
            .equipment
            .set_digitizer_mode(self.mode, &self.ids)
            .await
    }
}
