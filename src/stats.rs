use std::time::Duration;

use crate::icmp::IcmpResponse;

#[derive(Debug, Clone)]
pub struct PingStatistics {
    pub destination: String,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Round-trip times in seconds, in arrival order.
    pub rtts: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub transmitted: u64,
    pub received: u64,
    pub loss_percent: f64,
    /// `None` when no reply was ever received.
    pub rtt: Option<RttSummary>,
}

impl PingStatistics {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            packets_sent: 0,
            packets_received: 0,
            rtts: Vec::new(),
        }
    }

    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_received(&mut self, rtt: Duration) {
        self.packets_received += 1;
        self.rtts.push(rtt.as_secs_f64());
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (1.0 - self.packets_received as f64 / self.packets_sent as f64) * 100.0
    }

    pub fn summarize(&self) -> Summary {
        Summary {
            transmitted: self.packets_sent,
            received: self.packets_received,
            loss_percent: self.loss_percentage(),
            rtt: rtt_summary(&self.rtts),
        }
    }

    pub fn format_summary(&self) -> String {
        let summary = self.summarize();
        let mut out = format!(
            "\n--- {} ping statistics ---\n{} packets transmitted, {} packets received, {:.1}% packet loss",
            self.destination, summary.transmitted, summary.received, summary.loss_percent
        );

        if let Some(rtt) = summary.rtt {
            out.push_str(&format!(
                "\nround-trip min/avg/max/stddev = {:.4}/{:.4}/{:.4}/{:.4} ms",
                rtt.min * 1000.0,
                rtt.avg * 1000.0,
                rtt.max * 1000.0,
                rtt.stddev * 1000.0
            ));
        }

        out
    }

    pub fn format_response(&self, response: &IcmpResponse) -> String {
        let source = response
            .source
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| self.destination.clone());
        let hops = response
            .hop_limit
            .map(|h| h.to_string())
            .unwrap_or_else(|| "?".to_string());

        format!(
            "{} bytes from {}: icmp_seq={} {}={} time={}",
            response.bytes,
            source,
            response.sequence,
            response.version.hop_label(),
            hops,
            crate::utils::format_time(response.rtt)
        )
    }

    pub fn format_header(&self, resolved_ip: &str, payload_size: usize) -> String {
        format!("PING {} ({}): {} data bytes", self.destination, resolved_ip, payload_size)
    }
}

/// Sorts a copy of the samples; min/max come from the ends, stddev is the
/// population standard deviation.
pub fn rtt_summary(samples: &[f64]) -> Option<RttSummary> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len() as f64;
    let avg = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / n;

    Some(RttSummary {
        min: sorted[0],
        avg,
        max: sorted[sorted.len() - 1],
        stddev: variance.sqrt(),
    })
}
