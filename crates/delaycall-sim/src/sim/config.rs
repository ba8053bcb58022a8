use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use delaycall::{DelayConfig, OrderingScope, OverflowPolicy};
use std::path::PathBuf;

/// Runtime configuration for the `delaycall-sim` binary.
///
/// These settings control the synthetic request source, the simulated
/// downstream service and the dispatcher itself. All values are parsed from CLI
/// arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "delaycall-sim",
    version,
    about = "Drives the per-key delay dispatcher with synthetic traffic"
)]
pub struct CliArgs {
    /// Number of requests produced by the random source.
    ///
    /// Ignored when `--input` is given.
    ///
    /// Environment variable: `REQUESTS`
    #[arg(long, env = "REQUESTS", default_value_t = 1_000)]
    pub requests: u64,

    /// Number of distinct keys (`user1`..`userN`) the random source spreads
    /// requests across.
    ///
    /// With a single key the ordering monitor checks that execution follows
    /// global sequence order; with more keys it checks order per key.
    ///
    /// Environment variable: `KEYS`
    #[arg(long, env = "KEYS", default_value_t = 1)]
    pub keys: u64,

    /// One in N generated requests carries the delay flag.
    ///
    /// Environment variable: `DELAY_ONE_IN`
    #[arg(long, env = "DELAY_ONE_IN", default_value_t = 100)]
    pub delay_one_in: u32,

    /// Upper bound of the random gap between generated requests.
    ///
    /// Environment variable: `MAX_GAP_MS`
    #[arg(long, env = "MAX_GAP_MS", default_value_t = 200)]
    pub max_gap_ms: u64,

    /// Upper bound of the simulated service latency per request.
    ///
    /// Environment variable: `MAX_SERVICE_MS`
    #[arg(long, env = "MAX_SERVICE_MS", default_value_t = 50)]
    pub max_service_ms: u64,

    /// One in N service calls fails. Zero disables failures.
    ///
    /// Environment variable: `FAILURE_ONE_IN`
    #[arg(long, env = "FAILURE_ONE_IN", default_value_t = 0)]
    pub failure_one_in: u32,

    /// Idle window after which a key's worker retires. Also the throttle
    /// applied after each delay-flagged follow-up request.
    ///
    /// Environment variable: `WINDOW_MS`
    #[arg(long, env = "WINDOW_MS", default_value_t = 100)]
    pub window_ms: u64,

    /// Capacity of each per-key worker queue.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1_000)]
    pub queue_capacity: usize,

    /// Behavior when a worker queue is full: `block` or `reject`.
    ///
    /// Environment variable: `OVERFLOW`
    #[arg(long, env = "OVERFLOW", default_value_t = String::from("block"))]
    pub overflow: String,

    /// Read requests from a JSON-lines file instead of generating them.
    ///
    /// Each line is an object with `key`, `payload`, `sequence_id` and an
    /// optional `delay`.
    ///
    /// Environment variable: `INPUT`
    #[arg(long, env = "INPUT")]
    pub input: Option<PathBuf>,

    /// Seconds to wait for active workers to retire on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub enum Source {
    Random {
        requests: u64,
        keys: u64,
        delay_one_in: u32,
        max_gap: Duration,
    },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub source: Source,
    pub max_service: Duration,
    pub failure_one_in: u32,
    pub ordering: OrderingScope,
    pub delay: DelayConfig,
}

impl TryFrom<CliArgs> for SimConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.keys == 0 {
            bail!("KEYS must be greater than 0");
        }

        if args.delay_one_in == 0 {
            bail!("DELAY_ONE_IN must be greater than 0");
        }

        if args.input.is_none() && args.requests == 0 {
            bail!("REQUESTS must be greater than 0 when no INPUT file is given");
        }

        let overflow: OverflowPolicy = args.overflow.parse()?;

        let delay = DelayConfig {
            window: Duration::from_millis(args.window_ms),
            queue_capacity: args.queue_capacity,
            overflow,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            ..DelayConfig::default()
        };
        delay.validate()?;

        // Global contiguous order only holds when one key sees every id.
        let (source, ordering) = match args.input {
            Some(path) => (Source::File(path), OrderingScope::PerKey),
            None => {
                let ordering = if args.keys == 1 {
                    OrderingScope::Global
                } else {
                    OrderingScope::PerKey
                };
                let source = Source::Random {
                    requests: args.requests,
                    keys: args.keys,
                    delay_one_in: args.delay_one_in,
                    max_gap: Duration::from_millis(args.max_gap_ms),
                };
                (source, ordering)
            }
        };

        Ok(Self {
            source,
            max_service: Duration::from_millis(args.max_service_ms),
            failure_one_in: args.failure_one_in,
            ordering,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<SimConfig> {
        let argv = std::iter::once("delaycall-sim").chain(args.iter().copied());
        SimConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_mirror_reference_demo() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.delay.window, Duration::from_millis(100));
        assert_eq!(config.delay.queue_capacity, 1_000);
        assert_eq!(config.delay.overflow, OverflowPolicy::Block);
        assert_eq!(config.ordering, OrderingScope::Global);
        assert!(matches!(
            config.source,
            Source::Random {
                requests: 1_000,
                keys: 1,
                delay_one_in: 100,
                ..
            }
        ));
    }

    #[test]
    fn multiple_keys_switch_to_per_key_ordering() {
        let config = parse(&["--keys", "4", "--overflow", "reject"]).unwrap();
        assert_eq!(config.ordering, OrderingScope::PerKey);
        assert_eq!(config.delay.overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn input_file_replaces_random_source() {
        let config = parse(&["--input", "requests.jsonl", "--requests", "0"]).unwrap();
        assert!(matches!(config.source, Source::File(_)));
        assert_eq!(config.ordering, OrderingScope::PerKey);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse(&["--keys", "0"]).is_err());
        assert!(parse(&["--delay-one-in", "0"]).is_err());
        assert!(parse(&["--window-ms", "0"]).is_err());
        assert!(parse(&["--queue-capacity", "0"]).is_err());
        assert!(parse(&["--overflow", "drop"]).is_err());
    }
}
