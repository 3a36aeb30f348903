use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickrace_config::{
    Guard, LedId, SharedRole, StopReason, SystemConfig, TestAssertion, TestScript,
};
use tickrace_core::explore::explore;
use tickrace_core::metrics::{FiringLog, RunMetrics};
use tickrace_core::{Machine, RunSummary, SimulationError};
use tracing::{error, info, warn};

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

/// Upper bound on `limits.max_steps` accepted from a test script.
const MAX_ALLOWED_STEPS: u64 = 50_000_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a test script and write result.json / junit.xml
    Test(TestArgs),
    /// Enumerate every interleaving of one main-loop iteration
    Explore(ExploreArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the system configuration (YAML)
    #[arg(short, long)]
    system: Option<PathBuf>,

    /// Enable per-firing debug tracing
    #[arg(short, long)]
    trace: bool,

    /// Maximum number of main-loop steps to execute
    #[arg(long, default_value = "200000")]
    max_steps: u64,

    /// Write a JSON snapshot of the machine after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Path to the test script (YAML)
    #[arg(long)]
    script: PathBuf,

    /// Directory for result.json and junit.xml
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Write the JUnit report to this path
    #[arg(long)]
    junit: Option<PathBuf>,

    #[arg(short, long)]
    trace: bool,
}

#[derive(Args, Debug)]
struct ExploreArgs {
    #[arg(short, long)]
    system: Option<PathBuf>,

    /// Most timer firings placed within one iteration
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
    max_firings: u8,

    /// Exit non-zero if any interleaving observes a torn word
    #[arg(long)]
    expect_clean: bool,

    #[arg(short, long)]
    trace: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct Overrides {
    /// Override `shared.guard`
    #[arg(long, value_enum)]
    guard: Option<GuardArg>,

    /// Override `shared.role`
    #[arg(long, value_enum)]
    role: Option<RoleArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum GuardArg {
    Unprotected,
    Protected,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Off,
    Reader,
    ReaderWriter,
}

impl Overrides {
    fn apply(&self, config: &mut SystemConfig) {
        if let Some(guard) = self.guard {
            config.shared.guard = match guard {
                GuardArg::Unprotected => Guard::Unprotected,
                GuardArg::Protected => Guard::Protected,
            };
        }
        if let Some(role) = self.role {
            config.shared.role = match role {
                RoleArg::Off => SharedRole::Off,
                RoleArg::Reader => SharedRole::Reader,
                RoleArg::ReaderWriter => SharedRole::ReaderWriter,
            };
        }
    }
}

fn init_tracing(trace: bool) {
    let level = if trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SystemConfig> {
    match path {
        Some(path) => {
            info!("Loading system config: {:?}", path);
            SystemConfig::from_file(path)
        }
        None => {
            info!("Using default board configuration");
            Ok(SystemConfig::default())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Test(args)) => {
            init_tracing(args.trace);
            run_test(args)
        }
        Some(Commands::Explore(args)) => {
            init_tracing(args.trace);
            run_explore(args)
        }
        None => {
            init_tracing(cli.run.trace);
            run_interactive(cli.run)
        }
    };
    ExitCode::from(code)
}

fn run_interactive(args: RunArgs) -> u8 {
    let mut config = match load_config(args.system.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    args.overrides.apply(&mut config);

    let mut machine = match Machine::from_config(&config) {
        Ok(machine) => machine,
        Err(e) => {
            error!("{}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    let metrics = Arc::new(RunMetrics::new());
    let firing_log = Arc::new(FiringLog::new());
    machine.observers.push(metrics.clone());
    machine.observers.push(firing_log.clone());

    info!(
        "TA3 CCR0 = {} for a {} us period",
        machine.ctx.threshold(),
        config.timer.period_us
    );
    info!(
        "Running '{}' ({:?}, {:?}) for {} steps...",
        config.name, config.shared.role, config.shared.guard, args.max_steps
    );
    let code = match machine.run(args.max_steps, None) {
        Ok(summary) => {
            log_summary(&summary);
            let firings = firing_log.stats();
            if let (Some(min), Some(max)) = (firings.min_interval, firings.max_interval) {
                info!("Firing interval {}..={} clocks", min, max);
            }
            info!("{:.0} steps/s", metrics.steps_per_second());
            EXIT_PASS
        }
        Err(e) => {
            error!("Simulation error at step {}: {}", machine.steps(), e);
            EXIT_RUNTIME_ERROR
        }
    };

    if let Some(path) = &args.snapshot {
        let written = serde_json::to_string_pretty(&machine.snapshot())
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        match written {
            Ok(()) => info!("Snapshot written to {:?}", path),
            Err(e) => {
                error!("Failed to write snapshot {:?}: {}", path, e);
                return EXIT_RUNTIME_ERROR;
            }
        }
    }
    code
}

fn log_summary(summary: &RunSummary) {
    info!(
        "Stopped ({:?}) after {} steps / {} clocks",
        summary.stop_reason, summary.steps, summary.clocks
    );
    info!(
        "Timer fired {} times, handler ran {} times",
        summary.firings, summary.services
    );
    info!(
        "LED toggles: handler {}, main {}",
        summary.handler_led_toggles, summary.main_led_toggles
    );
    if summary.races > 0 {
        warn!(
            "{} torn reads in {} iterations",
            summary.races, summary.iterations
        );
    } else {
        info!("No torn reads in {} iterations", summary.iterations);
    }
}

fn run_explore(args: ExploreArgs) -> u8 {
    let mut config = match load_config(args.system.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    args.overrides.apply(&mut config);

    let report = match explore(&config, usize::from(args.max_firings)) {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    if report.program.is_empty() {
        println!("shared role is off: nothing to explore");
        return EXIT_PASS;
    }

    let program: Vec<String> = report.program.iter().map(|op| op.to_string()).collect();
    println!("program: {}", program.join(" "));
    println!("interleavings: {}", report.interleavings);
    println!("torn: {}", report.torn.len());
    for torn in &report.torn {
        println!(
            "  fired before {:?}, serviced before {:?}: observed {}",
            torn.fired_before, torn.serviced_before, torn.observed
        );
    }

    if args.expect_clean && !report.is_clean() {
        EXIT_ASSERT_FAIL
    } else {
        EXIT_PASS
    }
}

#[derive(Serialize, Debug)]
struct AssertionResult {
    assertion: TestAssertion,
    passed: bool,
    detail: String,
}

#[derive(Serialize, Debug)]
struct TestConfigEcho {
    script: String,
    system: Option<String>,
    max_steps: u64,
    wall_time_ms: Option<u64>,
}

#[derive(Serialize, Debug)]
struct TestResult {
    status: &'static str,
    stop_reason: StopReason,
    steps: u64,
    clocks: u64,
    firings: u64,
    services: u64,
    iterations: u64,
    races: u64,
    handler_led_toggles: u64,
    main_led_toggles: u64,
    system_hash: String,
    config: TestConfigEcho,
    assertions: Vec<AssertionResult>,
}

fn run_test(args: TestArgs) -> u8 {
    let script = match TestScript::from_file(&args.script) {
        Ok(script) => script,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    if script.limits.max_steps > MAX_ALLOWED_STEPS {
        error!(
            "limits.max_steps {} exceeds the allowed maximum {}",
            script.limits.max_steps, MAX_ALLOWED_STEPS
        );
        return EXIT_CONFIG_ERROR;
    }

    // Relative system paths resolve against the script's directory.
    let system_path = script.inputs.system.as_ref().map(|system| {
        let path = PathBuf::from(system);
        if path.is_absolute() {
            path
        } else {
            args.script
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(path)
        }
    });

    let (config, system_hash) = match load_with_hash(system_path.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let mut machine = match Machine::from_config(&config) {
        Ok(machine) => machine,
        Err(e) => {
            error!("{}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let deadline = script
        .limits
        .wall_time_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let summary = match machine.run(script.limits.max_steps, deadline) {
        Ok(summary) => summary,
        Err(SimulationError::MemoryViolation(addr)) => {
            warn!("Memory violation at {:#x}", addr);
            machine.summary(StopReason::MemoryViolation)
        }
        Err(e) => {
            error!("Simulation error: {}", e);
            return EXIT_RUNTIME_ERROR;
        }
    };
    log_summary(&summary);

    let assertions: Vec<AssertionResult> = script
        .assertions
        .iter()
        .map(|assertion| evaluate(assertion, &summary))
        .collect();
    let passed = assertions.iter().all(|a| a.passed);

    let result = TestResult {
        status: if passed { "pass" } else { "fail" },
        stop_reason: summary.stop_reason,
        steps: summary.steps,
        clocks: summary.clocks,
        firings: summary.firings,
        services: summary.services,
        iterations: summary.iterations,
        races: summary.races,
        handler_led_toggles: summary.handler_led_toggles,
        main_led_toggles: summary.main_led_toggles,
        system_hash,
        config: TestConfigEcho {
            script: args.script.display().to_string(),
            system: system_path.map(|p| p.display().to_string()),
            max_steps: script.limits.max_steps,
            wall_time_ms: script.limits.wall_time_ms,
        },
        assertions,
    };

    if let Err(e) = write_outputs(&args, &result) {
        error!("Failed to write test outputs: {:#}", e);
        return EXIT_RUNTIME_ERROR;
    }

    for a in result.assertions.iter().filter(|a| !a.passed) {
        error!("Assertion failed: {}", a.detail);
    }
    if passed {
        info!("Test passed");
        EXIT_PASS
    } else {
        EXIT_ASSERT_FAIL
    }
}

fn load_with_hash(path: Option<&Path>) -> anyhow::Result<(SystemConfig, String)> {
    let (config, bytes) = match path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read system config {:?}: {}", path, e))?;
            (SystemConfig::from_file(path)?, bytes)
        }
        None => {
            let config = SystemConfig::default();
            let bytes = serde_yaml::to_string(&config)?.into_bytes();
            (config, bytes)
        }
    };
    Ok((config, format!("{:x}", Sha256::digest(&bytes))))
}

fn evaluate(assertion: &TestAssertion, summary: &RunSummary) -> AssertionResult {
    let (passed, detail) = match assertion {
        TestAssertion::RaceDetected(a) => {
            let detected = summary.races > 0;
            (
                detected == a.race_detected,
                format!(
                    "race_detected: expected {}, observed {} torn reads",
                    a.race_detected, summary.races
                ),
            )
        }
        TestAssertion::MinToggles(a) => {
            let toggles = match a.min_toggles.led {
                LedId::Handler => summary.handler_led_toggles,
                LedId::Main => summary.main_led_toggles,
            };
            (
                toggles >= a.min_toggles.count,
                format!(
                    "min_toggles: {:?} LED toggled {} times, expected at least {}",
                    a.min_toggles.led, toggles, a.min_toggles.count
                ),
            )
        }
        TestAssertion::ExpectedStopReason(a) => (
            summary.stop_reason == a.expected_stop_reason,
            format!(
                "expected_stop_reason: expected {:?}, got {:?}",
                a.expected_stop_reason, summary.stop_reason
            ),
        ),
    };
    AssertionResult {
        assertion: assertion.clone(),
        passed,
        detail,
    }
}

fn write_outputs(args: &TestArgs, result: &TestResult) -> anyhow::Result<()> {
    let junit = junit_report(result);

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("result.json"), serde_json::to_string_pretty(result)?)?;
        std::fs::write(dir.join("junit.xml"), &junit)?;
        info!("Results written to {:?}", dir);
    }
    if let Some(path) = &args.junit {
        std::fs::write(path, &junit)?;
    }
    Ok(())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn junit_report(result: &TestResult) -> String {
    let failures = result.assertions.iter().filter(|a| !a.passed).count();
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<testsuite name=\"tickrace test\" tests=\"{}\" failures=\"{}\">\n",
        result.assertions.len().max(1),
        failures
    ));

    if result.assertions.is_empty() {
        xml.push_str(&format!(
            "  <testcase name=\"run\" classname=\"{}\"/>\n",
            xml_escape(&result.config.script)
        ));
    }
    for (idx, a) in result.assertions.iter().enumerate() {
        let name = xml_escape(&format!("assertion_{}", idx));
        if a.passed {
            xml.push_str(&format!("  <testcase name=\"{}\"/>\n", name));
        } else {
            xml.push_str(&format!(
                "  <testcase name=\"{}\">\n    <failure message=\"{}\"/>\n  </testcase>\n",
                name,
                xml_escape(&a.detail)
            ));
        }
    }
    xml.push_str("</testsuite>\n");
    xml
}
