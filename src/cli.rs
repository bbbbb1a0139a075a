use clap::{Arg, ArgAction, Command};
use std::ffi::OsString;
use std::time::Duration;

use crate::session::SessionConfig;

pub const SYNOPSIS: &str =
    "icmping [-t timeout] [-i interval] [-c count] [-s packetSize] [-root] [-h] <hostname or IP address>";

#[derive(Debug, Clone)]
pub struct PingArgs {
    pub target: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
    pub count: Option<u64>,
    pub size: usize,
    pub privileged: bool,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            target: None,
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            count: None,
            size: 56,
            privileged: false,
            force_ipv4: false,
            force_ipv6: false,
        }
    }
}

impl PingArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout,
            interval: self.interval,
            count: self.count,
            packet_size: self.size,
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("icmping")
        .version("0.1.0")
        .about("Send ICMP echo requests to a host and report round-trip statistics")
        .override_usage(SYNOPSIS)
        .arg(
            Arg::new("target")
                .help("Target hostname or IP address")
                .index(1)
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .help("Maximum wait time for each reply (e.g. 10s, 500ms)")
                .value_name("duration")
                .default_value("10s")
                .value_parser(parse_duration)
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .help("Interval between echo requests")
                .value_name("duration")
                .default_value("1s")
                .value_parser(parse_duration)
        )
        .arg(
            Arg::new("count")
                .short('c')
                .help("Number of echo requests to send; negative means until interrupted")
                .value_name("count")
                .default_value("-1")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64))
        )
        .arg(
            Arg::new("size")
                .short('s')
                .help("Size of each packet in bytes")
                .value_name("packetSize")
                .default_value("56")
                .value_parser(clap::value_parser!(usize))
        )
        .arg(
            Arg::new("root")
                .long("root")
                .help("Use raw sockets; requires root privileges (set this when running under sudo)")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue)
        )
}

/// Rewrites the single-dash `-root` into the long form clap understands.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| if arg == "-root" { OsString::from("--root") } else { arg })
        .collect()
}

pub fn parse_args() -> Result<PingArgs, clap::Error> {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> Result<PingArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut cmd = build_cli();
    let matches = cmd.try_get_matches_from_mut(normalize_args(args))?;

    let mut args = PingArgs::default();

    args.target = matches.get_one::<String>("target").cloned();
    args.privileged = matches.get_flag("root");
    args.force_ipv4 = matches.get_flag("force_ipv4");
    args.force_ipv6 = matches.get_flag("force_ipv6");

    if let Some(timeout) = matches.get_one::<Duration>("timeout") {
        args.timeout = *timeout;
    }

    if let Some(interval) = matches.get_one::<Duration>("interval") {
        args.interval = *interval;
    }

    if let Some(count) = matches.get_one::<i64>("count") {
        args.count = u64::try_from(*count).ok();
    }

    if let Some(size) = matches.get_one::<usize>("size") {
        args.size = *size;
    }

    // Validation
    if args.force_ipv4 && args.force_ipv6 {
        return Err(cmd.error(clap::error::ErrorKind::ArgumentConflict, "Cannot force both IPv4 and IPv6"));
    }

    Ok(args)
}

/// Parses durations such as `10s`, `1.5s`, `250ms` or `1m30s`. A bare
/// number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<f64>() {
        return scaled(secs, 1_000_000_000, input);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if number_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        rest = &rest[unit_len..];

        total = total
            .checked_add(scaled(value, nanos_per_unit, input)?)
            .ok_or_else(|| format!("duration '{}' out of range", input))?;
    }

    Ok(total)
}

fn scaled(value: f64, nanos_per_unit: u64, input: &str) -> Result<Duration, String> {
    let nanos = value * nanos_per_unit as f64;
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return Err(format!("duration '{}' out of range", input));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
