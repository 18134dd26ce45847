use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    BenchError, BufferPool, Direction, Error, Metadata, RateAggregator, RateObservation,
    RateSummary, SampleBuffer, StreamChannel, StreamConfig, Transport, ValidityWindow, Verdict,
    validate,
};

/// Settings for a benchmark run.
#[derive(Clone, Debug, PartialEq)]
pub struct BenchParams {
    /// How long to stream for.
    pub duration: Duration,
    /// Longest time to wait on any single read.
    pub read_timeout: Duration,
    /// Minimum time between link rate probes.
    pub probe_interval: Duration,
    /// Samples per batch. The read buffer holds `frame_multiplier` batches.
    pub batch_size: usize,
    /// Number of batches in the read buffer.
    pub frame_multiplier: usize,
    /// Acceptable test-tone amplitude range.
    pub window: ValidityWindow,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            read_timeout: Duration::from_millis(1000),
            probe_interval: Duration::from_millis(1100),
            batch_size: 680,
            frame_multiplier: 32,
            window: ValidityWindow::default(),
        }
    }
}

impl BenchParams {
    /// Read buffer size, in samples.
    pub fn buffer_capacity(&self) -> usize {
        self.batch_size * self.frame_multiplier
    }
}

/// Why a benchmark run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Streamed for the full duration.
    Completed,
    /// Stopped early on a sample outside the validity window.
    InvalidSamples {
        /// Position of the bad sample in its read batch.
        index: usize,
        /// Squared amplitude of the bad sample.
        amplitude_sq: u64,
    },
    /// Stopped early because the transport failed a read.
    ReadError,
    /// Stopped early because the run was cancelled.
    Cancelled,
}

impl Termination {
    /// Returns true if the run streamed for its full duration.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed full duration"),
            Self::InvalidSamples {
                index,
                amplitude_sq,
            } => write!(
                f,
                "terminated early on invalid samples (index {index}, squared amplitude {amplitude_sq})"
            ),
            Self::ReadError => f.write_str("terminated early on a read error"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// The outcome of a benchmark run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    /// Mean link rate, or [`RateSummary::NoData`] if no probes were taken.
    pub summary: RateSummary,
    /// Why the run stopped.
    pub termination: Termination,
    /// Every link rate probe, in order.
    pub observations: Vec<RateObservation>,
    /// Total samples read.
    pub samples_read: u64,
    /// Total read calls.
    pub reads: u64,
    /// Read calls that returned no samples.
    pub empty_reads: u64,
    /// Time spent streaming, from start to the end of the loop.
    pub elapsed: Duration,
}

/// Progress events emitted while a benchmark runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The stream started, reading into a buffer of `capacity` samples.
    Started {
        /// Read buffer size, in samples.
        capacity: usize,
    },
    /// A link rate probe was taken.
    Probe(RateObservation),
    /// A batch held a sample outside the validity window.
    InvalidSamples {
        /// Position of the bad sample in its read batch.
        index: usize,
        /// Squared amplitude of the bad sample.
        amplitude_sq: u64,
    },
    /// A read failed.
    ReadError(String),
    /// Stopping or closing the stream failed. The run still completes.
    TeardownError(String),
}

/// Loop states. The stream handle lives in the state until it's closed.
enum State<S> {
    Running(S),
    Draining(S, Termination),
    Stopped(Termination, Duration),
}

/// Everything measured while the loop runs.
struct Progress {
    start: Instant,
    last_probe: Instant,
    rates: RateAggregator,
    meta: Metadata,
    samples_read: u64,
    reads: u64,
    empty_reads: u64,
}

/// A benchmark engine.
///
/// Holds the run settings and the sample buffer pool, so back-to-back runs
/// reuse the same read buffer.
pub struct Benchmark {
    params: BenchParams,
    pool: BufferPool,
}

impl Benchmark {
    /// Make a new benchmark with the given settings.
    pub fn new(params: BenchParams) -> Self {
        Self {
            params,
            pool: BufferPool::new(),
        }
    }

    /// Get the run settings.
    pub fn params(&self) -> &BenchParams {
        &self.params
    }

    /// Access the read buffer pool.
    pub fn pool(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Run one benchmark on a transport.
    ///
    /// Opens a stream with `config`, starts it, and reads & validates samples
    /// until the duration runs out, a sample is invalid, a read fails, or
    /// `cancel` is triggered. The stream is always stopped and closed before
    /// this returns, and teardown failures are only reported through
    /// `observer` and the log.
    ///
    /// Only fails if the stream couldn't be set up or started.
    pub async fn run<T: Transport>(
        &mut self,
        session: &mut T,
        config: &StreamConfig,
        cancel: Option<&CancellationToken>,
        mut observer: impl FnMut(&Event),
    ) -> Result<RunResult, BenchError> {
        if config.direction != Direction::Rx {
            return Err(BenchError::StreamSetup(Error::InvalidParameter(
                "only receive streams can be benchmarked",
            )));
        }
        let mut stream = session
            .setup_stream(config)
            .await
            .map_err(BenchError::StreamSetup)?;
        debug!("Stream set up: {:?}", config);

        let mut buf = self.pool.get(self.params.buffer_capacity());

        if let Err(err) = session.control_stream(&mut stream, true).await {
            if let Err(e) = session.close_stream(stream).await {
                warn!("Failed to start stream, and failed closing it too: {}", e);
            }
            return Err(BenchError::StreamControl(err));
        }
        observer(&Event::Started {
            capacity: buf.capacity(),
        });

        let start = Instant::now();
        let mut progress = Progress {
            start,
            last_probe: start,
            rates: RateAggregator::new(),
            meta: Metadata::default(),
            samples_read: 0,
            reads: 0,
            empty_reads: 0,
        };

        let mut state = State::Running(stream);
        let (termination, elapsed) = loop {
            state = match state {
                State::Running(mut stream) => {
                    match iterate(
                        &mut stream,
                        &mut buf,
                        &self.params,
                        &mut progress,
                        cancel,
                        &mut observer,
                    )
                    .await
                    {
                        None => State::Running(stream),
                        Some(t) => State::Draining(stream, t),
                    }
                }
                State::Draining(stream, t) => {
                    // Elapsed time covers the loop only, not the teardown.
                    let elapsed = progress.start.elapsed();
                    teardown(session, stream, &mut observer).await;
                    State::Stopped(t, elapsed)
                }
                State::Stopped(t, elapsed) => break (t, elapsed),
            };
        };
        drop(buf);

        debug!(
            "Run finished after {:?}: {} ({} samples in {} reads)",
            elapsed, termination, progress.samples_read, progress.reads
        );
        let (summary, observations) = progress.rates.into_parts();
        Ok(RunResult {
            summary,
            termination,
            observations,
            samples_read: progress.samples_read,
            reads: progress.reads,
            empty_reads: progress.empty_reads,
            elapsed,
        })
    }
}

/// Run one pass of the read loop. Returns the termination reason if the loop
/// should stop.
async fn iterate<S: StreamChannel>(
    stream: &mut S,
    buf: &mut SampleBuffer,
    params: &BenchParams,
    progress: &mut Progress,
    cancel: Option<&CancellationToken>,
    observer: &mut impl FnMut(&Event),
) -> Option<Termination> {
    if progress.start.elapsed() >= params.duration {
        return Some(Termination::Completed);
    }
    if cancel.is_some_and(|c| c.is_cancelled()) {
        return Some(Termination::Cancelled);
    }

    // The transport is given the timeout, but isn't trusted to honor it.
    let read = tokio::time::timeout(
        params.read_timeout,
        stream.read(buf.read_target(), &mut progress.meta, params.read_timeout),
    );
    let outcome = match cancel {
        Some(token) => token.run_until_cancelled(read).await,
        None => Some(read.await),
    };
    let Some(outcome) = outcome else {
        return Some(Termination::Cancelled);
    };
    let count = match outcome {
        Ok(Ok(count)) => count.min(buf.capacity()),
        Ok(Err(e)) => {
            warn!("Stream read error: {}", e);
            observer(&Event::ReadError(e.to_string()));
            return Some(Termination::ReadError);
        }
        Err(_) => {
            trace!("Read timed out without the transport returning");
            0
        }
    };
    buf.set_len(count);
    progress.reads += 1;
    progress.samples_read += count as u64;
    if count == 0 {
        progress.empty_reads += 1;
    }

    if let Verdict::Invalid {
        index,
        amplitude_sq,
    } = validate(buf.samples(), &params.window)
    {
        warn!(
            "Received invalid samples: index {}, squared amplitude {}",
            index, amplitude_sq
        );
        observer(&Event::InvalidSamples {
            index,
            amplitude_sq,
        });
        return Some(Termination::InvalidSamples {
            index,
            amplitude_sq,
        });
    }

    let now = Instant::now();
    if now.duration_since(progress.last_probe) >= params.probe_interval {
        progress.last_probe = now;
        let info = stream.info();
        let observation = RateObservation {
            rate: info.link_rate,
            at: now.duration_since(progress.start),
        };
        trace!(
            "Link rate {} B/s, {} overruns, {} dropped frames",
            info.link_rate, info.overruns, info.dropped_frames
        );
        progress.rates.push(observation);
        observer(&Event::Probe(observation));
    }
    None
}

/// Stop and close a stream, reporting but not propagating errors.
async fn teardown<T: Transport>(
    session: &mut T,
    mut stream: T::Stream,
    observer: &mut impl FnMut(&Event),
) {
    if let Err(e) = session.control_stream(&mut stream, false).await {
        warn!("Failed to stop stream: {}", e);
        observer(&Event::TeardownError(format!("failed to stop stream: {e}")));
    }
    if let Err(e) = session.close_stream(stream).await {
        warn!("Failed to close stream: {}", e);
        observer(&Event::TeardownError(format!("failed to close stream: {e}")));
    }
}

/// Run a benchmark with default settings, apart from the validity window and
/// duration.
///
/// See [`Benchmark::run`] for details.
pub async fn run_benchmark<T: Transport>(
    session: &mut T,
    config: &StreamConfig,
    window: ValidityWindow,
    duration: Duration,
) -> Result<RunResult, BenchError> {
    let params = BenchParams {
        duration,
        window,
        ..Default::default()
    };
    Benchmark::new(params).run(session, config, None, |_| ()).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{ComplexI16, StreamInfo};

    #[derive(Clone, Debug)]
    enum Step {
        Batch(Vec<ComplexI16>),
        Timeout,
        Fail,
        Stall,
    }

    #[derive(Default)]
    struct Calls {
        setup: usize,
        start: usize,
        stop: usize,
        close: usize,
    }

    /// A transport that plays back a script of reads and counts lifecycle
    /// calls.
    struct FakeTransport {
        script: Vec<Step>,
        idle: Step,
        read_delay: Duration,
        link_rates: Vec<f64>,
        fail_setup: bool,
        fail_start: bool,
        fail_stop: bool,
        calls: Calls,
    }

    impl FakeTransport {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script,
                idle: Step::Timeout,
                read_delay: Duration::from_millis(100),
                link_rates: vec![1e6],
                fail_setup: false,
                fail_start: false,
                fail_stop: false,
                calls: Calls::default(),
            }
        }
    }

    struct FakeStream {
        script: VecDeque<Step>,
        idle: Step,
        read_delay: Duration,
        link_rates: Vec<f64>,
        probes: usize,
    }

    impl StreamChannel for FakeStream {
        async fn read(
            &mut self,
            buf: &mut [ComplexI16],
            meta: &mut Metadata,
            timeout: Duration,
        ) -> Result<usize, Error> {
            let step = self.script.pop_front().unwrap_or_else(|| self.idle.clone());
            match step {
                Step::Batch(samples) => {
                    tokio::time::sleep(self.read_delay).await;
                    let n = samples.len().min(buf.len());
                    buf[..n].copy_from_slice(&samples[..n]);
                    meta.timestamp += n as u64;
                    Ok(n)
                }
                Step::Timeout => {
                    tokio::time::sleep(timeout).await;
                    Ok(0)
                }
                Step::Fail => Err(Error::ReturnData),
                Step::Stall => std::future::pending().await,
            }
        }

        fn info(&mut self) -> StreamInfo {
            let rate = self.link_rates[self.probes % self.link_rates.len()];
            self.probes += 1;
            StreamInfo {
                link_rate: rate,
                ..Default::default()
            }
        }
    }

    impl Transport for FakeTransport {
        type Stream = FakeStream;

        async fn setup_stream(&mut self, _config: &StreamConfig) -> Result<FakeStream, Error> {
            self.calls.setup += 1;
            if self.fail_setup {
                return Err(Error::Busy);
            }
            Ok(FakeStream {
                script: self.script.drain(..).collect(),
                idle: self.idle.clone(),
                read_delay: self.read_delay,
                link_rates: self.link_rates.clone(),
                probes: 0,
            })
        }

        async fn control_stream(
            &mut self,
            _stream: &mut FakeStream,
            start: bool,
        ) -> Result<(), Error> {
            if start {
                self.calls.start += 1;
                if self.fail_start {
                    return Err(Error::NotStreaming);
                }
            } else {
                self.calls.stop += 1;
                if self.fail_stop {
                    return Err(Error::NotStreaming);
                }
            }
            Ok(())
        }

        async fn close_stream(&mut self, _stream: FakeStream) -> Result<(), Error> {
            self.calls.close += 1;
            Ok(())
        }
    }

    fn tone(n: usize) -> Vec<ComplexI16> {
        vec![ComplexI16::new(2000, 0); n]
    }

    fn params(duration: Duration) -> BenchParams {
        BenchParams {
            duration,
            ..Default::default()
        }
    }

    fn assert_torn_down_once(t: &FakeTransport) {
        assert_eq!(t.calls.setup, 1);
        assert_eq!(t.calls.start, 1);
        assert_eq!(t.calls.stop, 1);
        assert_eq!(t.calls.close, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_invalid_batch() {
        let mut transport = FakeTransport::new(vec![
            Step::Batch(tone(1)),
            Step::Batch(tone(1)),
            Step::Batch(vec![ComplexI16::new(0, 0)]),
            Step::Batch(tone(1)),
        ]);
        transport.read_delay = Duration::from_millis(600);
        transport.link_rates = vec![42e6];

        let mut bench = Benchmark::new(params(Duration::from_secs(10)));
        let mut events = Vec::new();
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |e| {
                events.push(e.clone())
            })
            .await
            .unwrap();

        assert_eq!(
            result.termination,
            Termination::InvalidSamples {
                index: 0,
                amplitude_sq: 0
            }
        );
        assert_eq!(result.reads, 3);
        assert_eq!(result.samples_read, 3);
        // Only the probe after the second batch (at 1.2 s) happened.
        assert_eq!(result.observations.len(), 1);
        assert_eq!(result.observations[0].at, Duration::from_millis(1200));
        assert_eq!(
            result.summary,
            RateSummary::Mean {
                rate: 42e6,
                count: 1
            }
        );
        assert_torn_down_once(&transport);
        assert_eq!(bench.pool().allocations(), 1);
        assert_eq!(bench.pool().available(), 1);
        assert!(matches!(events[0], Event::Started { capacity: 21760 }));
        assert!(matches!(events.last(), Some(Event::InvalidSamples { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn all_timeouts_still_finish_on_time() {
        let mut transport = FakeTransport::new(Vec::new());
        let duration = Duration::from_secs(10);
        let mut bench = Benchmark::new(params(duration));
        let begin = Instant::now();
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |_| ())
            .await
            .unwrap();

        assert!(begin.elapsed() <= duration + bench.params().read_timeout);
        assert_eq!(result.termination, Termination::Completed);
        assert!(result.termination.is_complete());
        assert_eq!(result.samples_read, 0);
        assert_eq!(result.reads, result.empty_reads);
        assert!(result.reads >= 10);
        assert_torn_down_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reads_are_bounded() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.idle = Step::Stall;
        let duration = Duration::from_secs(3);
        let mut bench = Benchmark::new(params(duration));
        let begin = Instant::now();
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |_| ())
            .await
            .unwrap();

        assert!(begin.elapsed() <= duration + bench.params().read_timeout);
        assert_eq!(result.termination, Termination::Completed);
        assert_eq!(result.empty_reads, 3);
        assert_torn_down_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_tears_down() {
        let mut transport = FakeTransport::new(vec![
            Step::Batch(tone(64)),
            Step::Timeout,
            Step::Fail,
        ]);
        let mut bench = Benchmark::new(params(Duration::from_secs(10)));
        let mut errors = 0;
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |e| {
                if let Event::ReadError(_) = e {
                    errors += 1;
                }
            })
            .await
            .unwrap();

        assert_eq!(result.termination, Termination::ReadError);
        assert_eq!(errors, 1);
        assert_eq!(result.reads, 2);
        assert_eq!(result.samples_read, 64);
        assert_eq!(result.empty_reads, 1);
        assert_torn_down_once(&transport);
        assert_eq!(bench.pool().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failure_acquires_nothing() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.fail_setup = true;
        let mut bench = Benchmark::new(params(Duration::from_secs(1)));
        let err = bench
            .run(&mut transport, &StreamConfig::default(), None, |_| ())
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::StreamSetup(Error::Busy)));
        assert_eq!(transport.calls.start, 0);
        assert_eq!(transport.calls.close, 0);
        assert_eq!(bench.pool().allocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_closes_stream() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.fail_start = true;
        let mut bench = Benchmark::new(params(Duration::from_secs(1)));
        let err = bench
            .run(&mut transport, &StreamConfig::default(), None, |_| ())
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::StreamControl(Error::NotStreaming)));
        assert_eq!(transport.calls.stop, 0);
        assert_eq!(transport.calls.close, 1);
        assert_eq!(bench.pool().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_failure_is_not_propagated() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.fail_stop = true;
        let mut bench = Benchmark::new(params(Duration::from_secs(2)));
        let mut teardown_errors = 0;
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |e| {
                if let Event::TeardownError(_) = e {
                    teardown_errors += 1;
                }
            })
            .await
            .unwrap();

        assert_eq!(result.termination, Termination::Completed);
        assert_eq!(teardown_errors, 1);
        assert_torn_down_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn transmit_streams_are_rejected() {
        let mut transport = FakeTransport::new(Vec::new());
        let config = StreamConfig {
            direction: Direction::Tx,
            ..Default::default()
        };
        let err = Benchmark::new(BenchParams::default())
            .run(&mut transport, &config, None, |_| ())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::StreamSetup(_)));
        assert_eq!(transport.calls.setup, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_run_has_no_data() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.idle = Step::Batch(tone(680));
        let result = run_benchmark(
            &mut transport,
            &StreamConfig::default(),
            ValidityWindow::default(),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert_eq!(result.termination, Termination::Completed);
        assert_eq!(result.summary, RateSummary::NoData);
        assert!(result.observations.is_empty());
        assert_eq!(result.reads, 5);
        assert_eq!(result.samples_read, 5 * 680);
        assert_torn_down_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timer_resets_to_probe_time() {
        let mut transport = FakeTransport::new(Vec::new());
        transport.idle = Step::Batch(tone(16));
        transport.read_delay = Duration::from_millis(700);
        transport.link_rates = vec![10e6, 20e6, 30e6];
        let mut bench = Benchmark::new(params(Duration::from_millis(4500)));
        let result = bench
            .run(&mut transport, &StreamConfig::default(), None, |_| ())
            .await
            .unwrap();

        let at: Vec<_> = result.observations.iter().map(|o| o.at).collect();
        assert_eq!(
            at,
            [
                Duration::from_millis(1400),
                Duration::from_millis(2800),
                Duration::from_millis(4200)
            ]
        );
        let mean = result.summary.mean().unwrap();
        assert!((mean - 20e6).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_run() {
        let mut transport = FakeTransport::new(Vec::new());
        let cancel = CancellationToken::new();
        let cancel_tx = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel_tx.cancel();
        });
        let mut bench = Benchmark::new(params(Duration::from_secs(10)));
        let result = bench
            .run(&mut transport, &StreamConfig::default(), Some(&cancel), |_| ())
            .await
            .unwrap();

        assert_eq!(result.termination, Termination::Cancelled);
        assert!(result.elapsed < Duration::from_secs(3));
        assert_torn_down_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_runs_reuse_buffer() {
        let mut bench = Benchmark::new(params(Duration::from_secs(1)));
        for _ in 0..3 {
            let mut transport = FakeTransport::new(Vec::new());
            transport.idle = Step::Batch(tone(100));
            bench
                .run(&mut transport, &StreamConfig::default(), None, |_| ())
                .await
                .unwrap();
            assert_torn_down_once(&transport);
        }
        assert_eq!(bench.pool().allocations(), 1);
        assert_eq!(bench.pool().available(), 1);
    }
}
