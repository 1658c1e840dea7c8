//! Timing accumulators and the teardown report
//!
//! Six phase counters plus per-buffer peak bytes are collected during a run. At
//! teardown they are reduced across ranks (sum for durations, max for memory) and
//! the leader writes one report:
//!
//! ```text
//! ---------------------------------------------------------------------
//!       GPU Time Info (average):
//! ---------------------------------------------------------------------
//! Data Transfer:   0.1200 s.
//! Data Cast/Pack:  0.0300 s.
//! Neighbor copy:   0.0100 s.
//! Neighbor build:  0.2000 s.
//! Force calc:      1.5000 s.
//! LJ calc:         0.0000 s.
//! Average split:   1.0000.
//! Max Mem / Proc:  12.50 MB.
//! ---------------------------------------------------------------------
//! ```

use crate::collective::Collective;
use crate::error::Result;
use gb_backends::Device;
use std::io::{self, Write};
use std::time::Instant;

/// Fault code kernels write when a matrix inversion is ill-conditioned
pub const MATRIX_INVERSION_CODE: i32 = 2;

const RULE: &str = "---------------------------------------------------------------------";

/// Named phases of a timestep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Host/device data transfer
    Transfer,
    /// Casting and packing host data
    CastPack,
    /// Copying neighbor lists to the device
    NeighborCopy,
    /// Building (or unpacking) neighbor lists on the device
    NeighborBuild,
    /// Main ellipsoid force kernels
    Force,
    /// Sphere/Lennard-Jones kernels for mixed forms
    Secondary,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Transfer,
        Phase::CastPack,
        Phase::NeighborCopy,
        Phase::NeighborBuild,
        Phase::Force,
        Phase::Secondary,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Transfer => "transfer",
            Phase::CastPack => "cast_pack",
            Phase::NeighborCopy => "neighbor_copy",
            Phase::NeighborBuild => "neighbor_build",
            Phase::Force => "force",
            Phase::Secondary => "secondary",
        }
    }
}

/// Wall-clock timer around device work; stopping waits for the device
#[derive(Debug, Clone, Default)]
pub struct PhaseTimer {
    start: Option<Instant>,
    total: f64,
}

impl PhaseTimer {
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Synchronize the device, then add the elapsed time; returns this interval's seconds
    pub fn stop(&mut self, device: &dyn Device) -> Result<f64> {
        let Some(start) = self.start.take() else {
            return Ok(0.0);
        };
        device.synchronize()?;
        let seconds = start.elapsed().as_secs_f64();
        self.total += seconds;
        Ok(seconds)
    }

    pub fn total_seconds(&self) -> f64 {
        self.total
    }

    pub fn zero(&mut self) {
        *self = Self::default();
    }
}

/// The pool's device timers
///
/// `kernel`/`kernel2` time neighbor builds, `gayberne`/`gayberne2` the force
/// kernels and `pair` the per-form kernels.
#[derive(Debug, Clone, Default)]
pub struct DeviceTimers {
    pub kernel: PhaseTimer,
    pub kernel2: PhaseTimer,
    pub gayberne: PhaseTimer,
    pub gayberne2: PhaseTimer,
    pub pair: PhaseTimer,
}

impl DeviceTimers {
    pub fn zero_all(&mut self) {
        *self = Self::default();
    }

    /// Sum over every device timer
    pub fn total_seconds(&self) -> f64 {
        [&self.kernel, &self.kernel2, &self.gayberne, &self.gayberne2, &self.pair]
            .iter()
            .map(|t| t.total_seconds())
            .sum()
    }
}

/// Numerical fault reported by a kernel through the error flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    MatrixInversion,
    Unknown(i32),
}

impl DeviceFault {
    /// `None` for a clean flag
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            MATRIX_INVERSION_CODE => Some(DeviceFault::MatrixInversion),
            other => Some(DeviceFault::Unknown(other)),
        }
    }

    pub fn message(&self) -> String {
        match self {
            DeviceFault::MatrixInversion => "BAD MATRIX INVERSION IN FORCE COMPUTATION.".to_string(),
            DeviceFault::Unknown(code) => format!("UNKNOWN DEVICE ERROR CODE {code}."),
        }
    }
}

/// What teardown observed, returned on every rank
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownReport {
    /// Phase durations summed over all ranks, indexed like [`Phase::ALL`]
    pub phase_seconds: [f64; 6],
    pub world_size: usize,
    /// Mean device share over all recorded timesteps and ranks
    pub average_split: f64,
    /// Largest per-rank device footprint in bytes
    pub max_bytes: f64,
    pub fault: Option<DeviceFault>,
    /// Whether this rank wrote the report
    pub written: bool,
}

impl TeardownReport {
    /// Phase duration averaged over ranks
    pub fn average_seconds(&self, phase: Phase) -> f64 {
        self.phase_seconds[phase.index()] / self.world_size.max(1) as f64
    }

    pub fn max_mb(&self) -> f64 {
        self.max_bytes / (1024.0 * 1024.0)
    }

    /// Mean share of atoms processed on the host
    pub fn host_fraction(&self) -> f64 {
        1.0 - self.average_split
    }
}

/// Per-phase seconds and per-buffer peak bytes for one run
#[derive(Debug, Clone, Default)]
pub struct TimingAccumulators {
    seconds: [f64; 6],
    peaks: Vec<(String, f64)>,
}

impl TimingAccumulators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zero_all(&mut self) {
        self.seconds = [0.0; 6];
        self.peaks.clear();
    }

    pub fn accumulate(&mut self, phase: Phase, seconds: f64) {
        self.seconds[phase.index()] += seconds;
    }

    pub fn seconds(&self, phase: Phase) -> f64 {
        self.seconds[phase.index()]
    }

    /// Raise the peak for `name` to `bytes` if larger
    pub fn record_peak(&mut self, name: &str, bytes: f64) {
        match self.peaks.iter_mut().find(|(n, _)| n == name) {
            Some((_, peak)) => *peak = peak.max(bytes),
            None => self.peaks.push((name.to_string(), bytes)),
        }
    }

    pub fn peak(&self, name: &str) -> Option<f64> {
        self.peaks.iter().find(|(n, _)| n == name).map(|(_, b)| *b)
    }

    /// Sum of every recorded peak
    pub fn total_peak_bytes(&self) -> f64 {
        self.peaks.iter().map(|(_, b)| b).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.seconds.iter().all(|s| *s == 0.0) && self.peaks.is_empty()
    }

    /// Reduce across ranks, write the report on the leader, then zero everything
    ///
    /// Collective: every rank must call it. The report is written only on the leader,
    /// only with a sink, and only if some rank spent time in the force kernels.
    pub fn aggregate_and_report(
        &mut self,
        collective: &dyn Collective,
        average_split: f64,
        device_builds_neighbors: bool,
        sink: Option<&mut dyn Write>,
    ) -> io::Result<TeardownReport> {
        let mut times = self.seconds;
        collective.sum(&mut times);
        let mut max_bytes = [self.total_peak_bytes()];
        collective.max(&mut max_bytes);
        self.zero_all();

        let mut report = TeardownReport {
            phase_seconds: times,
            world_size: collective.world_size(),
            average_split,
            max_bytes: max_bytes[0],
            fault: None,
            written: false,
        };

        if collective.is_leader() && report.phase_seconds[Phase::Force.index()] > 0.0 {
            if let Some(out) = sink {
                write_report(out, &report, collective.procs_per_device() == 1, device_builds_neighbors)?;
                report.written = true;
            }
        }

        tracing::info!(
            world_size = report.world_size,
            average_split = report.average_split,
            max_mb = report.max_mb(),
            written = report.written,
            "timing_aggregated"
        );
        Ok(report)
    }
}

fn write_report(
    out: &mut dyn Write,
    report: &TeardownReport,
    per_phase: bool,
    device_builds_neighbors: bool,
) -> io::Result<()> {
    write!(out, "\n\n{RULE}\n")?;
    write!(out, "      GPU Time Info (average): ")?;
    write!(out, "\n{RULE}\n")?;

    if per_phase {
        let avg = |phase| report.average_seconds(phase);
        writeln!(out, "Data Transfer:   {:.4} s.", avg(Phase::Transfer))?;
        writeln!(out, "Data Cast/Pack:  {:.4} s.", avg(Phase::CastPack))?;
        writeln!(out, "Neighbor copy:   {:.4} s.", avg(Phase::NeighborCopy))?;
        if device_builds_neighbors {
            writeln!(out, "Neighbor build:  {:.4} s.", avg(Phase::NeighborBuild))?;
        } else {
            writeln!(out, "Neighbor unpack: {:.4} s.", avg(Phase::NeighborBuild))?;
        }
        writeln!(out, "Force calc:      {:.4} s.", avg(Phase::Force))?;
        writeln!(out, "LJ calc:         {:.4} s.", avg(Phase::Secondary))?;
    }
    writeln!(out, "Average split:   {:.4}.", report.average_split)?;
    writeln!(out, "Max Mem / Proc:  {:.2} MB.", report.max_mb())?;
    write!(out, "{RULE}\n\n")?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::SingleProcess;
    use gb_backends::CpuDevice;

    #[test]
    fn accumulate_and_zero() {
        let mut acc = TimingAccumulators::new();
        acc.accumulate(Phase::Force, 1.0);
        acc.accumulate(Phase::Force, 0.5);
        acc.record_peak("lj1", 256.0);
        acc.record_peak("lj1", 128.0);
        acc.record_peak("lj3", 64.0);

        assert_eq!(acc.seconds(Phase::Force), 1.5);
        assert_eq!(acc.peak("lj1"), Some(256.0));
        assert_eq!(acc.total_peak_bytes(), 320.0);

        acc.zero_all();
        assert!(acc.is_zero());
    }

    #[test]
    fn report_text_matches_fixed_format() {
        let mut acc = TimingAccumulators::new();
        acc.accumulate(Phase::Transfer, 0.12);
        acc.accumulate(Phase::Force, 1.5);
        acc.record_peak("tables", 2.5 * 1024.0 * 1024.0);

        let mut out = Vec::new();
        let report = acc
            .aggregate_and_report(&SingleProcess::new(), 1.0, true, Some(&mut out))
            .unwrap();
        assert!(report.written);
        assert!(acc.is_zero());

        let text = String::from_utf8(out).unwrap();
        let expected = format!(
            "\n\n{RULE}\n      GPU Time Info (average): \n{RULE}\n\
             Data Transfer:   0.1200 s.\n\
             Data Cast/Pack:  0.0000 s.\n\
             Neighbor copy:   0.0000 s.\n\
             Neighbor build:  0.0000 s.\n\
             Force calc:      1.5000 s.\n\
             LJ calc:         0.0000 s.\n\
             Average split:   1.0000.\n\
             Max Mem / Proc:  2.50 MB.\n\
             {RULE}\n\n"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn shared_device_suppresses_phase_lines() {
        let mut acc = TimingAccumulators::new();
        acc.accumulate(Phase::Force, 1.0);
        let mut out = Vec::new();
        acc.aggregate_and_report(&SingleProcess::sharing_device(2), 0.5, false, Some(&mut out))
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Force calc"));
        assert!(text.contains("Average split:   0.5000."));
        assert!(text.contains("Max Mem / Proc:  0.00 MB."));
    }

    #[test]
    fn neighbor_unpack_label_for_host_neighbors() {
        let mut acc = TimingAccumulators::new();
        acc.accumulate(Phase::Force, 1.0);
        let mut out = Vec::new();
        acc.aggregate_and_report(&SingleProcess::new(), 1.0, false, Some(&mut out))
            .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Neighbor unpack: 0.0000 s."));
    }

    #[test]
    fn nothing_written_without_force_time_or_sink() {
        let mut acc = TimingAccumulators::new();
        let mut out = Vec::new();
        let report = acc
            .aggregate_and_report(&SingleProcess::new(), 1.0, true, Some(&mut out))
            .unwrap();
        assert!(!report.written);
        assert!(out.is_empty());

        acc.accumulate(Phase::Force, 1.0);
        let report = acc.aggregate_and_report(&SingleProcess::new(), 1.0, true, None).unwrap();
        assert!(!report.written);
        assert_eq!(report.average_seconds(Phase::Force), 1.0);
    }

    #[test]
    fn phase_timer_accumulates() {
        let device = CpuDevice::new();
        let mut timer = PhaseTimer::default();
        assert_eq!(timer.stop(&device).unwrap(), 0.0);

        timer.start();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let first = timer.stop(&device).unwrap();
        assert!(first > 0.0);
        assert_eq!(timer.total_seconds(), first);

        timer.zero();
        assert_eq!(timer.total_seconds(), 0.0);
    }

    #[test]
    fn fault_codes() {
        assert_eq!(DeviceFault::from_code(0), None);
        assert_eq!(DeviceFault::from_code(2), Some(DeviceFault::MatrixInversion));
        assert_eq!(DeviceFault::from_code(5), Some(DeviceFault::Unknown(5)));
        assert_eq!(
            DeviceFault::MatrixInversion.message(),
            "BAD MATRIX INVERSION IN FORCE COMPUTATION."
        );
    }
}
