mod cli;
mod dns;
mod icmp;
mod session;
mod stats;
mod utils;

use anyhow::Context;
use icmp::IcmpConnection;
use session::Session;

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    // Parse command line arguments
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let Some(target) = args.target.clone() else {
        println!("Usage: {}", cli::SYNOPSIS);
        std::process::exit(1);
    };

    // Validate parameters
    if let Err(e) = utils::validate_ping_params(args.size, args.timeout) {
        utils::exit_with_error(&e.to_string(), 1);
    }

    if let Err(e) = run(&target, &args).await {
        utils::exit_with_error(&format!("{:#}", e), 1);
    }
}

/// Everything between argument parsing and exit. The connection is owned by
/// the session and closed when this returns, on every path.
async fn run(host: &str, args: &cli::PingArgs) -> anyhow::Result<()> {
    let target = dns::resolve_target(host, args.privileged, args.force_ipv4, args.force_ipv6)
        .await
        .with_context(|| format!("cannot resolve {}", host))?;

    println!("{}", stats::PingStatistics::new(&target.host).format_header(&target.ip.to_string(), args.size));

    let connection = IcmpConnection::open(target.ip, args.privileged).context("ERROR initiating connection")?;
    log::debug!("using {} toward {:?}", connection.spec(), target.destination);

    let mut shutdown = utils::setup_signal_handler();
    let mut session = Session::new(connection, target, args.session_config(), utils::generate_identifier());

    let reason = session.run(&mut shutdown).await?;
    log::debug!("stopped: {:?}", reason);

    println!("{}", session.statistics().format_summary());
    Ok(())
}
