//! Text summary builder for CLI output.
//!
//! Formats a [`RunReport`] as human-readable lines for text mode.

use crate::report::RunReport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_ms(ms: u64) -> String {
    if ms >= 1_000 {
        format!("{:.2}s", ms as f64 / 1_000.0)
    } else {
        format!("{ms}ms")
    }
}

/// Build a text summary from a finished run report.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    let version = report.engine_version.as_deref().unwrap_or("-");
    let pid = report
        .process_id
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    lines.push(format!("Engine: {} (version {version}, pid {pid})", report.engine));
    if let Some(ms) = report.startup_ms {
        lines.push(format!("Startup: {}", fmt_ms(ms)));
    }

    if let Some(image) = report.image.as_ref() {
        lines.push(format!(
            "Image: {} {}x{} ({:?}, {} bytes)",
            image.filename, image.width, image.height, image.format, image.size_bytes
        ));
    }
    if let Some(w) = report.watermark.as_ref().filter(|w| w.enabled) {
        lines.push(format!(
            "Watermark: {} at {:?} (opacity {:.2}, scale {:.2})",
            w.path.display(),
            w.position,
            w.opacity,
            w.scale
        ));
    }

    lines.push(format!("Run: {}", outcome_line(report)));
    for t in &report.stages {
        let took = t.duration_ms.map_or_else(|| "-".to_string(), fmt_ms);
        lines.push(format!(
            "  {:<16} at {:>8}  took {:>8}",
            t.stage.as_str(),
            fmt_ms(t.entered_after_ms),
            took
        ));
    }

    if let Some(fps) = report.fps.as_ref() {
        lines.push(format!(
            "FPS: avg {:.1} med {:.1} p25 {:.1} p75 {:.1} 1% low {:.1} ({} samples)",
            fps.mean, fps.median, fps.p25, fps.p75, fps.p1_low, fps.samples
        ));
    }
    if let Some(n) = report.particle_count {
        lines.push(format!("Particles: {n}"));
    }
    if let Some(acc) = report.recognition_accuracy {
        lines.push(format!("Recognition accuracy: {:.1}%", acc * 100.0));
    }

    if !report.faults.is_empty() {
        lines.push(format!("Engine faults: {}", report.faults.len()));
        for f in &report.faults {
            lines.push(format!("  [{}] {}", f.code, f.message));
        }
    }
    if let Some(error) = report.error.as_deref() {
        lines.push(format!("Error: {error}"));
    }

    TextSummary { lines }
}

fn outcome_line(report: &RunReport) -> String {
    let outcome = match (report.reached_final, report.skipped) {
        (true, true) => "reached final stage (skipped)",
        (true, false) => "reached final stage",
        (false, _) => "did not reach final stage",
    };
    format!(
        "{outcome} in {} (started {})",
        fmt_ms(report.run_duration_ms),
        report.started_at
    )
}
