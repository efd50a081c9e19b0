//! # Display Helpers
//!
//! Formatters and table printing used for the sweep preview and the end-of-sweep
//! summary.
//!
//! ```rust
//! use collective_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bandwidth(Some(187.254)), "187.25 GB/s");
//! ```

use crate::{launch::ProcessResult, results::SweepSummary, size::SizeSpec};
use colored::*;
use std::time::Duration;

/// Format a duration in a human-readable way
///
/// The unit is chosen from the magnitude: nanoseconds, microseconds, milliseconds
/// and seconds with two decimals, then minutes and hours in compound form.
///
/// ```rust
/// # use collective_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Bus bandwidth for display, `-` when nothing was measured.
pub fn format_bandwidth(gbps: Option<f64>) -> String {
    match gbps {
        Some(value) => format!("{:.2} GB/s", value),
        None => "-".to_string(),
    }
}

/// Print a table row with the given column widths
///
/// ```rust
/// # use collective_bench::utils::{print_table_row, print_table_separator};
/// let widths = [18, 8, 12];
/// print_table_separator(&widths);
/// print_table_row(&["Configuration", "Status", "Peak busbw"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a table separator
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}

/// Human-readable sizes a sweep will cover, e.g. `2K, 4K, ... 8G (23 sizes)`.
pub fn describe_sizes(sizes: &[u64]) -> String {
    match sizes {
        [] => "no sizes".to_string(),
        [only] => SizeSpec::format(*only),
        [first, second, .., last] if sizes.len() > 4 => format!(
            "{}, {}, ... {} ({} sizes)",
            SizeSpec::format(*first),
            SizeSpec::format(*second),
            SizeSpec::format(*last),
            sizes.len()
        ),
        _ => sizes
            .iter()
            .map(|&s| SizeSpec::format(s))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn status_of(result: &ProcessResult) -> String {
    if result.succeeded() {
        "OK".to_string()
    } else if result.timed_out {
        "TIMEOUT".to_string()
    } else if let Some(code) = result.exit_code {
        format!("EXIT {}", code)
    } else if result.error.is_some() {
        "ERROR".to_string()
    } else {
        "SIGNAL".to_string()
    }
}

/// Print the end-of-sweep table.
pub fn print_summary(summary: &SweepSummary) {
    let widths = [22, 10, 10, 14];
    println!();
    println!("{}", "Sweep Summary".bold());
    print_table_separator(&widths);
    print_table_row(&["Configuration", "Status", "Duration", "Peak busbw"], &widths);
    print_table_separator(&widths);
    for result in &summary.results {
        let status = status_of(result);
        let duration = format_duration(result.duration);
        let bandwidth = format_bandwidth(result.peak_bus_bandwidth_gbps);
        print_table_row(
            &[result.label.as_str(), status.as_str(), duration.as_str(), bandwidth.as_str()],
            &widths,
        );
    }
    print_table_separator(&widths);

    if summary.all_succeeded() {
        println!("{}", "All configurations completed".green());
    } else {
        println!(
            "{} {}",
            "Failed configurations:".red(),
            summary.failed.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(None), "-");
        assert_eq!(format_bandwidth(Some(12.0)), "12.00 GB/s");
    }

    #[test]
    fn test_describe_sizes() {
        assert_eq!(describe_sizes(&[]), "no sizes");
        assert_eq!(describe_sizes(&[2048]), "2K");
        assert_eq!(describe_sizes(&[2048, 4096, 8192]), "2K, 4K, 8K");
        let sweep: Vec<u64> = (11..=33).map(|p| 1u64 << p).collect();
        assert_eq!(describe_sizes(&sweep), "2K, 4K, ... 8G (23 sizes)");
    }
}
