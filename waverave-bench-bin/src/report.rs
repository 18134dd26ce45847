use waverave_bench::{Event, RateSummary, RunResult, Termination};

/// Convert bytes/s to MB/s.
pub fn mb_per_sec(rate: f64) -> f64 {
    rate / 1e6
}

/// Prints benchmark progress and results.
#[derive(Debug, Default)]
pub struct Presenter {
    runs: usize,
}

pub fn print_sample_rates(tx: Option<f64>, rx: Option<f64>) {
    let fmt = |r: Option<f64>| match r {
        Some(r) => format!("{} MHz", r / 1e6),
        None => String::from("unknown"),
    };
    println!("Sampling rates - Tx : {}\t Rx : {}", fmt(tx), fmt(rx));
}

impl Presenter {
    pub fn event(&mut self, event: &Event) {
        match event {
            Event::Started { capacity } => {
                self.runs += 1;
                println!("Run {}: streaming into {} sample buffer", self.runs, capacity);
            }
            Event::Probe(obs) => println!("Rx rate: {:.3} MB/s", mb_per_sec(obs.rate)),
            Event::InvalidSamples {
                index,
                amplitude_sq,
            } => println!(
                "Received invalid samples (index {index}, squared amplitude {amplitude_sq}), terminating early"
            ),
            Event::ReadError(e) => println!("Read failed: {e}"),
            Event::TeardownError(e) => println!("Warning: {e}"),
        }
    }

    pub fn summary(&self, result: &RunResult) {
        println!("{}", summary_line(result));
        match result.summary {
            RateSummary::Mean { rate, count } => println!(
                "Average Rx transfer speed: {:.3} MB/s ({count} samples)",
                mb_per_sec(rate)
            ),
            RateSummary::NoData => {
                println!("Average Rx transfer speed: no data (run shorter than probe interval)")
            }
        }
    }
}

pub fn summary_line(result: &RunResult) -> String {
    let secs = result.elapsed.as_secs_f64();
    match result.termination {
        Termination::Completed => format!(
            "Run completed full duration: {:.1} s, {} samples",
            secs, result.samples_read
        ),
        Termination::InvalidSamples { .. } => format!(
            "Run terminated early after {:.1} s: invalid samples received, link is faulty",
            secs
        ),
        Termination::ReadError => {
            format!("Run terminated early after {:.1} s: stream read failed", secs)
        }
        Termination::Cancelled => format!("Run cancelled after {:.1} s", secs),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn result(termination: Termination) -> RunResult {
        RunResult {
            summary: RateSummary::NoData,
            termination,
            observations: Vec::new(),
            samples_read: 1234,
            reads: 2,
            empty_reads: 0,
            elapsed: Duration::from_millis(1800),
        }
    }

    #[test]
    fn termination_lines_are_distinct() {
        let lines = [
            summary_line(&result(Termination::Completed)),
            summary_line(&result(Termination::InvalidSamples {
                index: 0,
                amplitude_sq: 0,
            })),
            summary_line(&result(Termination::ReadError)),
            summary_line(&result(Termination::Cancelled)),
        ];
        assert_eq!(lines[0], "Run completed full duration: 1.8 s, 1234 samples");
        assert!(lines[1].contains("invalid samples"));
        for (i, a) in lines.iter().enumerate() {
            for b in &lines[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn scales_to_megabytes() {
        assert_eq!(mb_per_sec(61.44e6), 61.44);
    }
}
