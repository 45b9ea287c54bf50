//! Terminal presentation of probe results

mod results_view;

pub use results_view::ProbeApp;

use crate::proxy::models::ProbeResult;

/// Marker shown for an address family that did not answer
pub const TIMEOUT_LABEL: &str = "✗ Timeout";

/// Text of one address column
pub fn address_cell(address: Option<&str>) -> String {
    match address {
        Some(address) => format!("✓ {}", address),
        None => TIMEOUT_LABEL.to_string(),
    }
}

/// Counts shown once a run is over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub ipv4: usize,
    pub ipv6: usize,
    pub unreachable: usize,
}

impl Summary {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.add(result);
        }
        summary
    }

    pub fn add(&mut self, result: &ProbeResult) {
        self.total += 1;
        if result.ipv4.is_some() {
            self.ipv4 += 1;
        }
        if result.ipv6.is_some() {
            self.ipv6 += 1;
        }
        if result.is_unreachable() {
            self.unreachable += 1;
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} nodes | IPv4: {} | IPv6: {} | Unreachable: {}",
            self.total, self.ipv4, self.ipv6, self.unreachable
        )
    }
}
