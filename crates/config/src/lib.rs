use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dividers accepted by the clock system for MCLK and SMCLK.
pub const CLOCK_DIVIDERS: [u32; 6] = [1, 2, 4, 8, 16, 32];
/// Timer input divider (ID field) choices.
pub const TIMER_INPUT_DIVIDERS: [u16; 4] = [1, 2, 4, 8];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ClockSection {
    pub dco_hz: u32,
    pub mclk_divider: u32,
    pub smclk_divider: u32,
}

impl Default for ClockSection {
    fn default() -> Self {
        // MCLK = 16 MHz, SMCLK = 1 MHz
        Self {
            dco_hz: 16_000_000,
            mclk_divider: 1,
            smclk_divider: 16,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TimerSection {
    pub input_divider: u16,
    pub expansion_divider: u16,
    pub period_us: u32,
}

impl Default for TimerSection {
    fn default() -> Self {
        Self {
            input_divider: 1,
            expansion_divider: 1,
            period_us: 1000,
        }
    }
}

/// Which LED an output belongs to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedId {
    /// Toggled every `toggle_every` timer firings.
    Handler,
    /// Toggled once per main-loop iteration.
    Main,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedOwnership {
    #[default]
    Split,
    HandlerOwnsBoth,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LedSection {
    pub ownership: LedOwnership,
}

/// How the main loop takes part in the shared-word demo.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharedRole {
    /// No shared word at all; the handler only keeps time.
    #[default]
    Off,
    /// Main loop only reads what the handler publishes.
    Reader,
    /// Main loop writes the reset pattern before reading it back.
    ReaderWriter,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    #[default]
    Unprotected,
    Protected,
}

/// Order in which the two 16-bit halves are accessed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HalfOrder {
    LowFirst,
    HighFirst,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SharedSection {
    pub role: SharedRole,
    pub guard: Guard,
    pub write_order: HalfOrder,
    pub read_order: HalfOrder,
}

impl Default for SharedSection {
    fn default() -> Self {
        Self {
            role: SharedRole::Off,
            guard: Guard::Unprotected,
            write_order: HalfOrder::LowFirst,
            read_order: HalfOrder::HighFirst,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct MainLoopSection {
    pub busy_wait_steps: u32,
    pub diagnostic_stall_steps: u32,
}

impl Default for MainLoopSection {
    fn default() -> Self {
        Self {
            busy_wait_steps: 60,
            diagnostic_stall_steps: 5000,
        }
    }
}

/// Knobs that only exist in simulation: how many source clocks elapse per
/// main-loop operation and how late the handler may be entered.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SimSection {
    pub clocks_per_step: u32,
    pub max_latency_steps: u32,
    pub seed: u64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            clocks_per_step: 4,
            max_latency_steps: 0,
            seed: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SystemConfig {
    pub name: String,
    pub clock: ClockSection,
    pub timer: TimerSection,
    pub toggle_every: u16,
    pub leds: LedSection,
    pub shared: SharedSection,
    pub main_loop: MainLoopSection,
    pub sim: SimSection,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "blinky".to_string(),
            clock: ClockSection::default(),
            timer: TimerSection::default(),
            toggle_every: 1000,
            leds: LedSection::default(),
            shared: SharedSection::default(),
            main_loop: MainLoopSection::default(),
            sim: SimSection::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open system config at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse System Config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse System Config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock.dco_hz == 0 {
            anyhow::bail!("Clock 'dco_hz' must be greater than zero");
        }
        if !CLOCK_DIVIDERS.contains(&self.clock.mclk_divider) {
            anyhow::bail!(
                "Clock 'mclk_divider' {} is not one of {:?}",
                self.clock.mclk_divider,
                CLOCK_DIVIDERS
            );
        }
        if !CLOCK_DIVIDERS.contains(&self.clock.smclk_divider) {
            anyhow::bail!(
                "Clock 'smclk_divider' {} is not one of {:?}",
                self.clock.smclk_divider,
                CLOCK_DIVIDERS
            );
        }
        if !TIMER_INPUT_DIVIDERS.contains(&self.timer.input_divider) {
            anyhow::bail!(
                "Timer 'input_divider' {} is not one of {:?}",
                self.timer.input_divider,
                TIMER_INPUT_DIVIDERS
            );
        }
        if !(1..=8).contains(&self.timer.expansion_divider) {
            anyhow::bail!("Timer 'expansion_divider' must be within 1..=8");
        }
        if self.timer.period_us == 0 {
            anyhow::bail!("Timer 'period_us' must be greater than zero");
        }
        if self.toggle_every == 0 {
            anyhow::bail!("'toggle_every' must be greater than zero");
        }
        if self.sim.clocks_per_step == 0 {
            anyhow::bail!("Sim 'clocks_per_step' must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    pub max_steps: u64,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxSteps,
    WallTime,
    MemoryViolation,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RaceDetectedAssertion {
    pub race_detected: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ToggleCount {
    pub led: LedId,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MinTogglesAssertion {
    pub min_toggles: ToggleCount,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StopReasonAssertion {
    pub expected_stop_reason: StopReason,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    RaceDetected(RaceDetectedAssertion),
    MinToggles(MinTogglesAssertion),
    ExpectedStopReason(StopReasonAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    #[serde(default = "default_inputs")]
    pub inputs: TestInputs,
    pub limits: TestLimits,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

fn default_inputs() -> TestInputs {
    TestInputs { system: None }
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if let Some(system) = &self.inputs.system {
            if system.trim().is_empty() {
                anyhow::bail!("Input 'system' path cannot be empty");
            }
        }

        if self.limits.max_steps == 0 {
            anyhow::bail!("Limit 'max_steps' must be greater than zero");
        }

        Ok(())
    }
}
