//! Simulated experiment hardware.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ionflow_hal::{ChannelData, HalError, HalResult, HardwareBackend};
use rand::Rng;
use tracing::{debug, instrument};

/// Hardware backend that samples random photon counts.
///
/// Each configured channel gets `shots` samples in `0..=max_count`, and its
/// result channel holds the mean.
pub struct SimulatedHardware {
    name: String,
    channels: Vec<String>,
    vector_channels: Vec<(String, usize)>,
    max_count: i64,
    delay: Option<Duration>,
    failure: Option<String>,
    executed: Mutex<Vec<String>>,
}

impl SimulatedHardware {
    /// Create a backend with a single `pmt` channel.
    pub fn new() -> Self {
        Self {
            name: "simulated".to_string(),
            channels: vec!["pmt".to_string()],
            vector_channels: Vec::new(),
            max_count: 10,
            delay: None,
            failure: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Replace the sampled channels.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Add a vector channel of `len` uniform samples.
    pub fn with_vector_channel(mut self, name: impl Into<String>, len: usize) -> Self {
        self.vector_channels.push((name.into(), len));
        self
    }

    /// Sleep for `delay` on every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every execution with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Programs executed so far, in order.
    pub fn executed_programs(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of executions so far.
    pub fn execution_count(&self) -> usize {
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn sample(&self, shots: u32) -> ChannelData {
        let mut rng = rand::thread_rng();
        let mut data = ChannelData::default();

        for channel in &self.channels {
            let counts: Vec<i64> = (0..shots)
                .map(|_| rng.gen_range(0..=self.max_count))
                .collect();
            let mean = counts.iter().sum::<i64>() as f64 / f64::from(shots);
            data.result_channels.insert(channel.clone(), mean);
            data.shot_channels.insert(channel.clone(), counts);
        }
        for (channel, len) in &self.vector_channels {
            let samples = (0..*len).map(|_| rng.r#gen::<f64>()).collect();
            data.vector_channels.insert(channel.clone(), samples);
        }
        data
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareBackend for SimulatedHardware {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, program))]
    async fn execute(&self, program: &str, shots: u32) -> HalResult<ChannelData> {
        if shots == 0 {
            return Err(HalError::InvalidShots("shots must be at least 1".to_string()));
        }
        let start = Instant::now();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(program.to_string());

        if let Some(ref message) = self.failure {
            return Err(HalError::Execution(message.clone()));
        }

        let data = self.sample(shots);
        debug!("Execution completed in {:?}", start.elapsed());
        Ok(data)
    }
}
