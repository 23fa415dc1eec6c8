//! Iptables traffic collector.
//!
//! Runs `iptables -nxvL` and turns annotated accounting rules into
//! per-chain byte gauges. A rule is exported only when its comment carries
//! a `DOWNLOAD <label>` or `UPLOAD <label>` tag; everything else in the
//! listing is ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{CollectError, Collector, Descriptor, Sample, SampleSink};

const CHAIN_LABELS: &[&str] = &["chain", "rule"];

/// First field of a chain declaration line in the verbose listing.
const CHAIN_HEADER: &str = "Chain";

/// Chain attributed to rules seen before any chain declaration.
const UNKNOWN_CHAIN: &str = "UNKNOWN";

/// Bound on the listing subprocess; a wedged iptables must not stall the
/// whole scrape.
const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction for running external commands.
///
/// The real implementation shells out through tokio; tests swap in a
/// canned-output mock from [`crate::collector::mock`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command and returns its stdout.
    ///
    /// Spawn failure, non-zero exit, and exceeding `timeout` are all
    /// reported as [`CollectError::Unavailable`].
    async fn output(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CollectError>;
}

/// Real command runner backed by `tokio::process`.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn output(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CollectError> {
        let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| {
                CollectError::Unavailable(format!(
                    "{} did not finish within {}s",
                    program,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| CollectError::Unavailable(format!("running {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(CollectError::Unavailable(format!(
                "{} exited with {}",
                program, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Direction a tagged rule accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// One exported accounting rule found in the listing.
#[derive(Debug, PartialEq)]
pub struct TaggedRule {
    pub chain: String,
    pub rule: String,
    pub direction: Direction,
    pub bytes: f64,
}

/// Line scanner for the verbose rule listing.
///
/// Scanning is restartable: the current-chain state lives on the stack of
/// [`RuleScanner::scan`], so nothing leaks between scrapes.
pub struct RuleScanner {
    download_re: Regex,
    upload_re: Regex,
}

impl RuleScanner {
    pub fn new() -> Result<Self, CollectError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| CollectError::InvalidConfig(format!("rule tag pattern: {}", e)))
        };
        Ok(Self {
            download_re: compile(r"/\* DOWNLOAD (.*) \*/")?,
            upload_re: compile(r"/\* UPLOAD (.*) \*/")?,
        })
    }

    /// Extracts tagged rules from a full listing.
    ///
    /// Per line, in order: blank lines are skipped; a chain declaration
    /// updates the current chain; lines whose first two fields are not an
    /// integer packet count and a float byte count are skipped (headers,
    /// policy lines); remaining lines are exported only when a direction
    /// tag is present in their comment.
    pub fn scan(&self, listing: &str) -> Vec<TaggedRule> {
        let mut rules = Vec::new();
        let mut current_chain = UNKNOWN_CHAIN.to_string();

        for line in listing.lines() {
            let mut fields = line.split_whitespace();
            let Some(first) = fields.next() else {
                continue;
            };
            if first == CHAIN_HEADER {
                if let Some(name) = fields.next() {
                    current_chain = name.to_string();
                }
                continue;
            }
            if first.parse::<u64>().is_err() {
                continue;
            }
            let Some(bytes) = fields.next().and_then(|f| f.parse::<f64>().ok()) else {
                continue;
            };
            let Some((direction, label)) = self.rule_tag(line) else {
                continue;
            };
            rules.push(TaggedRule {
                chain: current_chain.clone(),
                rule: label,
                direction,
                bytes,
            });
        }
        rules
    }

    fn rule_tag(&self, line: &str) -> Option<(Direction, String)> {
        if let Some(captures) = self.download_re.captures(line) {
            return Some((Direction::Download, captures[1].to_string()));
        }
        if let Some(captures) = self.upload_re.captures(line) {
            return Some((Direction::Upload, captures[1].to_string()));
        }
        None
    }
}

/// Collector exposing iptables accounting rules as byte gauges.
pub struct IptablesCollector<R = SystemCommandRunner> {
    download_desc: Arc<Descriptor>,
    upload_desc: Arc<Descriptor>,
    scanner: RuleScanner,
    runner: R,
}

impl IptablesCollector<SystemCommandRunner> {
    pub fn new() -> Result<Self, CollectError> {
        Self::with_runner(SystemCommandRunner)
    }
}

impl<R: CommandRunner> IptablesCollector<R> {
    pub fn with_runner(runner: R) -> Result<Self, CollectError> {
        Ok(Self {
            download_desc: Descriptor::new(
                "iptables",
                "download_bytes",
                "Iptables download traffic in each chain.",
                CHAIN_LABELS,
            ),
            upload_desc: Descriptor::new(
                "iptables",
                "upload_bytes",
                "Iptables upload traffic in each chain.",
                CHAIN_LABELS,
            ),
            scanner: RuleScanner::new()?,
            runner,
        })
    }
}

#[async_trait]
impl<R: CommandRunner> Collector for IptablesCollector<R> {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectError> {
        let listing = self
            .runner
            .output("iptables", &["-nxvL"], LIST_TIMEOUT)
            .await?;

        for tagged in self.scanner.scan(&listing) {
            let desc = match tagged.direction {
                Direction::Download => &self.download_desc,
                Direction::Upload => &self.upload_desc,
            };
            let _ = sink.send(Sample::gauge(
                desc,
                tagged.bytes,
                vec![tagged.chain, tagged.rule],
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockCommandRunner;
    use tokio::sync::mpsc;

    const LISTING: &str = "\
Chain INPUT (policy ACCEPT 1523 packets, 190283 bytes)
    pkts      bytes target     prot opt in     out     source               destination

Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)
    pkts      bytes target     prot opt in     out     source               destination
      12       1000            all  --  *      *       0.0.0.0/0            0.0.0.0/0            /* DOWNLOAD web */
       7        250            all  --  *      *       0.0.0.0/0            0.0.0.0/0            /* UPLOAD web */
       3         99            all  --  *      *       0.0.0.0/0            0.0.0.0/0
";

    fn scanner() -> RuleScanner {
        RuleScanner::new().unwrap()
    }

    #[test]
    fn test_scan_download_rule() {
        let rules = scanner().scan(LISTING);
        assert!(rules.contains(&TaggedRule {
            chain: "FORWARD".to_string(),
            rule: "web".to_string(),
            direction: Direction::Download,
            bytes: 1000.0,
        }));
    }

    #[test]
    fn test_scan_upload_rule() {
        let rules = scanner().scan(LISTING);
        assert!(rules.contains(&TaggedRule {
            chain: "FORWARD".to_string(),
            rule: "web".to_string(),
            direction: Direction::Upload,
            bytes: 250.0,
        }));
    }

    #[test]
    fn test_scan_skips_untagged_and_headers() {
        // Only the two tagged FORWARD rules survive: headers fail the
        // numeric checks and the untagged rule has no annotation.
        assert_eq!(scanner().scan(LISTING).len(), 2);
    }

    #[test]
    fn test_scan_unknown_chain() {
        let listing = "42 512 all -- * * 0.0.0.0/0 0.0.0.0/0 /* DOWNLOAD stray */\n";
        let rules = scanner().scan(listing);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].chain, "UNKNOWN");
        assert_eq!(rules[0].rule, "stray");
        assert_eq!(rules[0].bytes, 512.0);
    }

    #[test]
    fn test_scan_chain_changes() {
        let listing = "\
Chain PREROUTING (policy ACCEPT)
1 10 /* DOWNLOAD a */
Chain POSTROUTING (policy ACCEPT)
2 20 /* UPLOAD b */
";
        let rules = scanner().scan(listing);
        assert_eq!(rules[0].chain, "PREROUTING");
        assert_eq!(rules[1].chain, "POSTROUTING");
    }

    #[test]
    fn test_scan_empty_listing() {
        assert!(scanner().scan("").is_empty());
        assert!(scanner().scan("\n   \n").is_empty());
    }

    #[tokio::test]
    async fn test_update_emits_samples() {
        let collector =
            IptablesCollector::with_runner(MockCommandRunner::with_output(LISTING)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        collector.update(&tx).await.unwrap();
        drop(tx);

        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        assert_eq!(samples.len(), 2);

        let download = samples
            .iter()
            .find(|s| s.desc.fq_name() == "traffic_iptables_download_bytes")
            .unwrap();
        assert_eq!(download.value, 1000.0);
        assert_eq!(download.label_values, ["FORWARD", "web"]);

        let upload = samples
            .iter()
            .find(|s| s.desc.fq_name() == "traffic_iptables_upload_bytes")
            .unwrap();
        assert_eq!(upload.value, 250.0);
        assert_eq!(upload.label_values, ["FORWARD", "web"]);
    }

    #[tokio::test]
    async fn test_update_command_failure() {
        let collector =
            IptablesCollector::with_runner(MockCommandRunner::failing("exec format error"))
                .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = collector.update(&tx).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, CollectError::Unavailable(_)));
        assert!(rx.recv().await.is_none());
    }
}
