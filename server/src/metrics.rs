// Request and synthesis counters exposed on /metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::SynthesisResult;

/// Latency samples kept for percentiles.
const MAX_SAMPLES: usize = 1000;

/// Per-route request counters.
#[derive(Debug, Clone, Default)]
pub struct EndpointMetrics {
    request_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    total_latency_ms: Arc<AtomicU64>,
    max_latency_ms: Arc<AtomicU64>,
    latency_samples: Arc<Mutex<VecDeque<u64>>>,
}

impl EndpointMetrics {
    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            if samples.len() == MAX_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(sorted: &[u64], p: usize) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        sorted[(sorted.len() * p / 100).min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> EndpointStats {
        let request_count = self.request_count.load(Ordering::Relaxed);
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let mut sorted: Vec<u64> = self
            .latency_samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();

        EndpointStats {
            request_count,
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: if request_count == 0 {
                0.0
            } else {
                total as f64 / request_count as f64
            },
            min_latency_ms: sorted.first().copied().unwrap_or(0),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: Self::percentile(&sorted, 50),
            p95_latency_ms: Self::percentile(&sorted, 95),
            p99_latency_ms: Self::percentile(&sorted, 99),
        }
    }
}

/// Engine-level totals. Seconds are accumulated in microseconds.
#[derive(Debug, Clone, Default)]
pub struct SynthesisMetrics {
    synthesis_count: Arc<AtomicU64>,
    failure_count: Arc<AtomicU64>,
    cancelled_count: Arc<AtomicU64>,
    audio_us: Arc<AtomicU64>,
    infer_us: Arc<AtomicU64>,
    missing_phonemes: Arc<AtomicU64>,
}

impl SynthesisMetrics {
    pub fn record_result(&self, result: &SynthesisResult) {
        self.synthesis_count.fetch_add(1, Ordering::Relaxed);
        self.audio_us
            .fetch_add((result.audio_seconds * 1e6) as u64, Ordering::Relaxed);
        self.infer_us
            .fetch_add((result.infer_seconds * 1e6) as u64, Ordering::Relaxed);
        let missing: usize = result.missing_phonemes.iter().map(|(_, n)| n).sum();
        self.missing_phonemes
            .fetch_add(missing as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, cancelled: bool) {
        if cancelled {
            self.cancelled_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SynthesisStats {
        let audio_seconds = self.audio_us.load(Ordering::Relaxed) as f64 / 1e6;
        let infer_seconds = self.infer_us.load(Ordering::Relaxed) as f64 / 1e6;
        SynthesisStats {
            synthesis_count: self.synthesis_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            cancelled_count: self.cancelled_count.load(Ordering::Relaxed),
            total_audio_seconds: audio_seconds,
            total_infer_seconds: infer_seconds,
            real_time_factor: if audio_seconds > 0.0 {
                infer_seconds / audio_seconds
            } else {
                0.0
            },
            missing_phonemes: self.missing_phonemes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub synthesise: EndpointMetrics,
    pub stream: EndpointMetrics,
    pub synthesis: SynthesisMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub synthesis: SynthesisStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub synthesise: EndpointStats,
    pub stream: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SynthesisStats {
    pub synthesis_count: u64,
    pub failure_count: u64,
    pub cancelled_count: u64,
    pub total_audio_seconds: f64,
    pub total_infer_seconds: f64,
    pub real_time_factor: f64,
    pub missing_phonemes: u64,
}
