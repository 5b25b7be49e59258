//! Command line and test options.

use std::time::Duration;

use clap::Parser;

use crate::proto::{IoOp, IO_HDR_SIZE};

/// Sentinel for "no limit" durations.
pub const TIME_INF: Duration = Duration::MAX;

/// Parse a time string with optional unit suffix (`h|m|s|ms|us|ns`);
/// `inf` maps to [`TIME_INF`]. A bare number is seconds.
pub fn parse_time(s: &str) -> Result<Duration, String> {
    if s == "inf" {
        return Ok(TIME_INF);
    }
    let (value_str, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };
    let value: f64 = value_str
        .parse()
        .map_err(|_| format!("invalid time value '{}'", s))?;
    let secs = match unit {
        "" | "s" => value,
        "h" => value * 3600.0,
        "m" => value * 60.0,
        "ms" => value / 1e3,
        "us" => value / 1e6,
        "ns" => value / 1e9,
        _ => return Err(format!("invalid time unit '{}'", unit)),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid time value '{}'", s))
}

/// Parse a retry/iteration budget; `inf` maps to `u64::MAX`.
pub fn parse_inf_count(s: &str) -> Result<u64, String> {
    if s == "inf" {
        return Ok(u64::MAX);
    }
    s.parse().map_err(|_| format!("invalid count '{}'", s))
}

/// Parse a window size; must be positive.
pub fn parse_window(s: &str) -> Result<u64, String> {
    let v: u64 = s.parse().map_err(|_| format!("invalid window size '{}'", s))?;
    if v == 0 {
        return Err(format!("invalid window size '{}'", s));
    }
    Ok(v)
}

/// Parse the IO request packet size; must hold at least the header.
pub fn parse_iomsg_size(s: &str) -> Result<usize, String> {
    let v: usize = s.parse().map_err(|_| format!("invalid size '{}'", s))?;
    if v < IO_HDR_SIZE {
        return Err(format!("io message size must be >= {}", IO_HDR_SIZE));
    }
    Ok(v)
}

/// Payload size range from a `min[:max]` argument.
#[derive(Debug, Clone, Copy)]
pub struct DataRange {
    pub min: u64,
    /// `None` keeps the default maximum.
    pub max: Option<u64>,
}

/// Parse `min`, `min:max`, `:max` or `min:`.
pub fn parse_data_size(s: &str) -> Result<DataRange, String> {
    let err = || format!("invalid data size range '{}'", s);
    match s.split_once(':') {
        None => {
            let v = s.parse().map_err(|_| err())?;
            Ok(DataRange {
                min: v,
                max: Some(v),
            })
        }
        Some(("", max)) => Ok(DataRange {
            min: 0,
            max: Some(max.parse().map_err(|_| err())?),
        }),
        Some((min, "")) => Ok(DataRange {
            min: min.parse().map_err(|_| err())?,
            max: None,
        }),
        Some((min, max)) => Ok(DataRange {
            min: min.parse().map_err(|_| err())?,
            max: Some(max.parse().map_err(|_| err())?),
        }),
    }
}

fn parse_op(s: &str) -> Result<IoOp, String> {
    match s {
        "read" => Ok(IoOp::Read),
        "write" => Ok(IoOp::Write),
        _ => Err(format!("invalid operation name '{}'", s)),
    }
}

#[derive(Parser, Debug)]
#[command(name = "io_bench")]
#[command(about = "Point-to-point tagged-I/O benchmark; server mode without peers, client mode with them")]
pub struct Cli {
    /// TCP port number to use
    #[arg(short = 'p', default_value_t = 1337)]
    pub port: u16,

    /// Timeout for connecting to the peer (or "inf")
    #[arg(short = 'n', default_value = "20", value_parser = parse_time)]
    pub connect_timeout: Duration,

    /// Comma-separated string of IO operations [read|write]
    #[arg(short = 'o', value_delimiter = ',', value_parser = parse_op)]
    pub operations: Vec<IoOp>,

    /// Range that should be used to get data size of IO payload
    #[arg(short = 'd', default_value = "4096", value_parser = parse_data_size)]
    pub data_size: DataRange,

    /// Number of offcache IO buffers
    #[arg(short = 'b', default_value_t = 0)]
    pub num_offcache_buffers: usize,

    /// Number of iterations to run communication (0 = unbounded)
    #[arg(short = 'i', default_value_t = 1000)]
    pub iter_count: u64,

    /// Number of outstanding requests
    #[arg(short = 'w', default_value = "1", value_parser = parse_window)]
    pub window_size: u64,

    /// Number of outstanding requests per connection
    #[arg(short = 'a', default_value = "1", value_parser = parse_window)]
    pub conn_window_size: u64,

    /// Split the data transfer to chunks of this size
    #[arg(short = 'k', default_value_t = usize::MAX)]
    pub chunk_size: usize,

    /// Size of IO request packet
    #[arg(short = 'r', default_value = "256", value_parser = parse_iomsg_size)]
    pub iomsg_size: usize,

    /// Client timeout (or "inf")
    #[arg(short = 't', default_value = "50", value_parser = parse_time)]
    pub client_timeout: Duration,

    /// Number of connection retries on client or listen retries on
    /// server (or "inf")
    #[arg(short = 'c', default_value = "inf", value_parser = parse_inf_count)]
    pub retries: u64,

    /// Retry interval
    #[arg(short = 'y', default_value = "5", value_parser = parse_time)]
    pub retry_interval: Duration,

    /// Time limit to run the IO client (or "inf")
    #[arg(short = 'l', default_value = "inf", value_parser = parse_time)]
    pub client_runtime_limit: Duration,

    /// Random seed to use for randomizing
    #[arg(short = 's')]
    pub random_seed: Option<u32>,

    /// Set verbose mode
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Enable data integrity and transaction check
    #[arg(short = 'q')]
    pub validate: bool,

    /// Enable debugging mode for IO operation timeouts
    #[arg(short = 'D')]
    pub debug_timeout: bool,

    /// Use human-readable timestamps
    #[arg(short = 'H')]
    pub human_time: bool,

    /// Life time of the legacy logger object; accepted for
    /// compatibility
    #[arg(short = 'L')]
    pub logger_lifetime: Option<f64>,

    /// Report printing interval in seconds
    #[arg(short = 'P', default_value_t = 1.0)]
    pub print_interval: f64,

    /// Rendezvous threshold used to force eager or rendezvous protocol
    #[arg(short = 'R')]
    pub rndv_thresh: Option<usize>,

    /// Peers to connect to, as host or host:port; none means server
    /// mode
    pub servers: Vec<String>,
}

/// Resolved test options.
#[derive(Debug, Clone)]
pub struct Opts {
    pub servers: Vec<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub client_timeout: Duration,
    pub retries: u64,
    pub retry_interval: Duration,
    pub client_runtime_limit: Duration,
    pub print_interval: Duration,
    pub iomsg_size: usize,
    pub min_data_size: u64,
    pub max_data_size: u64,
    pub chunk_size: usize,
    pub iter_count: u64,
    pub window_size: u64,
    pub conn_window_size: u64,
    pub operations: Vec<IoOp>,
    pub random_seed: u32,
    pub num_offcache_buffers: usize,
    pub verbose: bool,
    pub validate: bool,
    pub debug_timeout: bool,
    pub human_time: bool,
    pub logger_lifetime: Option<f64>,
    pub rndv_thresh: Option<usize>,
}

impl Opts {
    pub fn from_cli(cli: Cli) -> Result<Opts, String> {
        let min_data_size = cli.data_size.min;
        let max_data_size = cli.data_size.max.unwrap_or(4096);
        if min_data_size > max_data_size {
            return Err(format!(
                "invalid data size range {}:{}",
                min_data_size, max_data_size
            ));
        }
        if max_data_size == 0 {
            return Err("data size must be positive".to_string());
        }

        // Default operation set, and chunks never larger than the
        // largest payload.
        let mut operations: Vec<IoOp> = Vec::new();
        for op in cli.operations {
            if !operations.contains(&op) {
                operations.push(op);
            }
        }
        if operations.is_empty() {
            operations.push(IoOp::Write);
        }
        let chunk_size = cli.chunk_size.min(max_data_size as usize);

        let random_seed = cli.random_seed.unwrap_or_else(|| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            (now as u32) ^ std::process::id()
        });

        let iter_count = if cli.iter_count == 0 {
            u64::MAX
        } else {
            cli.iter_count
        };

        if !cli.print_interval.is_finite() || cli.print_interval < 0.0 {
            return Err(format!("invalid print interval {}", cli.print_interval));
        }

        Ok(Opts {
            servers: cli.servers,
            port: cli.port,
            connect_timeout: cli.connect_timeout,
            client_timeout: cli.client_timeout,
            retries: cli.retries,
            retry_interval: cli.retry_interval,
            client_runtime_limit: cli.client_runtime_limit,
            print_interval: Duration::from_secs_f64(cli.print_interval),
            iomsg_size: cli.iomsg_size,
            min_data_size: min_data_size.max(1),
            max_data_size,
            chunk_size,
            iter_count,
            window_size: cli.window_size,
            conn_window_size: cli.conn_window_size,
            operations,
            random_seed,
            num_offcache_buffers: cli.num_offcache_buffers,
            verbose: cli.verbose,
            validate: cli.validate,
            debug_timeout: cli.debug_timeout,
            human_time: cli.human_time,
            logger_lifetime: cli.logger_lifetime,
            rndv_thresh: cli.rndv_thresh,
        })
    }

    /// Transport configuration derived from these options.
    pub fn transport_config(&self) -> tagio::Config {
        tagio::Config {
            iomsg_size: self.iomsg_size,
            connect_timeout: if self.connect_timeout == TIME_INF {
                None
            } else {
                Some(self.connect_timeout)
            },
            rndv_thresh: self.rndv_thresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_time("17.5s").unwrap(), Duration::from_secs_f64(17.5));
        assert_eq!(parse_time("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(
            parse_time("15.5h").unwrap(),
            Duration::from_secs_f64(15.5 * 3600.0)
        );
        assert_eq!(parse_time("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_time("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_time("7ns").unwrap(), Duration::from_nanos(7));
        assert_eq!(parse_time("inf").unwrap(), TIME_INF);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("abc").is_err());
        assert!(parse_time("5x").is_err());
        assert!(parse_time("-3s").is_err());
        assert!(parse_time("").is_err());
    }

    #[test]
    fn test_parse_data_size_forms() {
        let r = parse_data_size("8192").unwrap();
        assert_eq!((r.min, r.max), (8192, Some(8192)));

        let r = parse_data_size("1024:65536").unwrap();
        assert_eq!((r.min, r.max), (1024, Some(65536)));

        let r = parse_data_size(":4000").unwrap();
        assert_eq!((r.min, r.max), (0, Some(4000)));

        let r = parse_data_size("100:").unwrap();
        assert_eq!((r.min, r.max), (100, None));

        assert!(parse_data_size("a:b").is_err());
    }

    #[test]
    fn test_parse_inf_count() {
        assert_eq!(parse_inf_count("inf").unwrap(), u64::MAX);
        assert_eq!(parse_inf_count("3").unwrap(), 3);
        assert!(parse_inf_count("-1").is_err());
    }

    #[test]
    fn test_parse_window_rejects_zero() {
        assert!(parse_window("0").is_err());
        assert_eq!(parse_window("16").unwrap(), 16);
    }

    #[test]
    fn test_parse_iomsg_size_minimum() {
        assert!(parse_iomsg_size("15").is_err());
        assert_eq!(parse_iomsg_size("16").unwrap(), 16);
        assert_eq!(parse_iomsg_size("256").unwrap(), 256);
    }

    #[test]
    fn test_cli_defaults_and_adjustment() {
        let cli = Cli::parse_from(["io_bench"]);
        let opts = Opts::from_cli(cli).unwrap();
        assert_eq!(opts.port, 1337);
        assert_eq!(opts.iter_count, 1000);
        assert_eq!(opts.operations, vec![IoOp::Write]);
        // Chunk size clamps to the largest payload.
        assert_eq!(opts.chunk_size, 4096);
        assert!(opts.servers.is_empty());
    }

    #[test]
    fn test_cli_client_mode_flags() {
        let cli = Cli::parse_from([
            "io_bench",
            "-d",
            "1000:10000",
            "-o",
            "read,write",
            "-i",
            "0",
            "-w",
            "32",
            "-a",
            "4",
            "-q",
            "host1",
            "host2:9999",
        ]);
        let opts = Opts::from_cli(cli).unwrap();
        assert_eq!(opts.min_data_size, 1000);
        assert_eq!(opts.max_data_size, 10_000);
        assert_eq!(opts.operations, vec![IoOp::Read, IoOp::Write]);
        assert_eq!(opts.iter_count, u64::MAX);
        assert_eq!(opts.window_size, 32);
        assert_eq!(opts.conn_window_size, 4);
        assert!(opts.validate);
        assert_eq!(opts.servers, vec!["host1", "host2:9999"]);
    }
}
