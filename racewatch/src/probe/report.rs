//! The probe's final statistics line.
//!
//! ```text
//! PPID=<parent_id>, PID=<probe_id>, STATS={00:<n00>, 01:<n01>, 10:<n10>, 11:<n11>}
//! ```

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};

use crate::probe::store::{Outcome, OutcomeStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub parent_pid: i32,
    pub pid: i32,
    pub stats: OutcomeStats,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PPID={}, PID={}, STATS={{", self.parent_pid, self.pid)?;
        for (i, outcome) in Outcome::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", outcome.label(), self.stats.count(*outcome))?;
        }
        f.write_str("}")
    }
}

impl FromStr for ProbeReport {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let rest = line
            .strip_prefix("PPID=")
            .ok_or_else(|| anyhow!("report must start with PPID="))?;
        let (parent, rest) = rest
            .split_once(", PID=")
            .ok_or_else(|| anyhow!("report missing PID field"))?;
        let (pid, rest) = rest
            .split_once(", STATS={")
            .ok_or_else(|| anyhow!("report missing STATS field"))?;
        let body = rest
            .strip_suffix('}')
            .ok_or_else(|| anyhow!("report STATS not closed"))?;

        let mut counts = [0u64; 4];
        let mut fields = body.split(", ");
        for outcome in Outcome::ALL {
            let field = fields
                .next()
                .ok_or_else(|| anyhow!("report missing count for {outcome}"))?;
            let (label, value) = field
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed count {field:?}"))?;
            if label != outcome.label() {
                bail!("expected count for {outcome}, found {label:?}");
            }
            counts[outcome.index()] = value
                .parse()
                .with_context(|| format!("parse count for {outcome}"))?;
        }
        if let Some(extra) = fields.next() {
            bail!("unexpected trailing field {extra:?}");
        }

        Ok(Self {
            parent_pid: parent.parse().context("parse PPID")?,
            pid: pid.parse().context("parse PID")?,
            stats: OutcomeStats::new(counts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_the_stats_line() {
        let report = ProbeReport {
            parent_pid: 100,
            pid: 101,
            stats: OutcomeStats::new([5, 1, 2, 3]),
        };
        assert_eq!(
            report.to_string(),
            "PPID=100, PID=101, STATS={00:5, 01:1, 10:2, 11:3}"
        );
    }

    #[test]
    fn parses_a_line_with_crlf() {
        let report: ProbeReport = "PPID=7, PID=8, STATS={00:50, 01:0, 10:1, 11:50}\r\n"
            .parse()
            .expect("parse");
        assert_eq!(report.parent_pid, 7);
        assert_eq!(report.pid, 8);
        assert_eq!(report.stats.total(), 101);
    }

    #[test]
    fn rejects_out_of_order_counts() {
        let err = "PPID=7, PID=8, STATS={01:0, 00:50, 10:1, 11:50}"
            .parse::<ProbeReport>()
            .unwrap_err();
        assert!(err.to_string().contains("expected count for 00"));
    }
}
