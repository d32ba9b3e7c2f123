//! Shared test utilities for serial_termios integration tests.
//!
//! This module provides common test infrastructure including:
//! - Emulated backends wired to simulated lines
//! - Hardware test configuration from the environment
//! - Timing assertions

#![allow(dead_code)]

use serial_termios::backend::emulated::{EmulatedBackend, SimulatedDriver, SimulatedLine};
use serial_termios::config::TestingConfig;
use serial_termios::{Backend, Config, Fd, OpenFlags, SetAttrWhen, Termios};
use std::env;
use std::time::{Duration, Instant};

/// An emulated backend plus the far end of each of its lines.
pub struct Harness {
    pub backend: EmulatedBackend<SimulatedDriver>,
    pub lines: Vec<SimulatedLine>,
}

impl Harness {
    /// Lines named `COM1`..`COMn` on a driver without a base clock.
    pub fn new(lines: usize) -> Self {
        Self::with_driver(SimulatedDriver::new(), lines, &Config::default())
    }

    /// Lines on a driver that reports `base` as its UART clock.
    pub fn with_base_clock(base: u32, lines: usize) -> Self {
        Self::with_driver(SimulatedDriver::with_base_clock(base), lines, &Config::default())
    }

    pub fn with_driver(driver: SimulatedDriver, lines: usize, config: &Config) -> Self {
        let lines = (1..=lines)
            .map(|n| driver.add_line(&format!("COM{}", n)))
            .collect();
        Self {
            backend: EmulatedBackend::new(driver, config),
            lines,
        }
    }

    /// Line `COM{n}`, 1-based like the device names.
    pub fn line(&self, n: usize) -> &SimulatedLine {
        &self.lines[n - 1]
    }

    /// Open `COM{n}` read-write.
    pub fn open(&self, n: usize) -> Fd {
        self.backend
            .open(&format!("COM{}", n), OpenFlags::O_RDWR)
            .expect("open simulated line")
    }

    /// Set VMIN/VTIME on an open descriptor.
    pub fn set_timing(&self, fd: Fd, vmin: u8, vtime: u8) {
        let mut termios: Termios = self.backend.tcgetattr(fd).expect("tcgetattr");
        termios.set_read_timing(vmin, vtime);
        self.backend
            .tcsetattr(fd, SetAttrWhen::Now, &termios)
            .expect("tcsetattr");
    }
}

/// Hardware test configuration from the environment.
///
/// Returns `None` (and says so) when `TEST_PORT` is unset.
pub fn hardware_config() -> Option<TestingConfig> {
    let port = match env::var("TEST_PORT") {
        Ok(port) => port,
        Err(_) => {
            println!("⏭️  Skipping hardware test: TEST_PORT not set");
            return None;
        }
    };
    let defaults = TestingConfig::default();
    Some(TestingConfig {
        port: Some(port),
        peer_port: env::var("TEST_PEER_PORT").ok(),
        baud: env::var("TEST_BAUD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.baud),
        loopback_enabled: env::var("TEST_LOOPBACK").ok().as_deref() == Some("1"),
        ..defaults
    })
}

/// Run `f` and return its result with the elapsed time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let result = f();
    (result, start.elapsed())
}

/// Assert `elapsed` lies in `[min_ms, max_ms]`.
pub fn assert_elapsed_between(elapsed: Duration, min_ms: u64, max_ms: u64) {
    let ms = elapsed.as_millis() as u64;
    assert!(
        (min_ms..=max_ms).contains(&ms),
        "expected {}..={} ms, took {} ms",
        min_ms,
        max_ms,
        ms
    );
}
