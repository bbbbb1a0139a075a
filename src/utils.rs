use std::process;
use std::time::Duration;
use tokio::sync::watch;

/// Echo identifier for this run: the process id truncated to 16 bits.
/// Two concurrent runs may share it; that only matters on raw sockets.
pub fn generate_identifier() -> u16 {
    (process::id() & 0xffff) as u16
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("icmping: {}", message);
    process::exit(code);
}

/// Validate ping parameters
pub fn validate_ping_params(size: usize, timeout: Duration) -> anyhow::Result<()> {
    if size > 65500 {
        return Err(anyhow::anyhow!("packet size too large, maximum is 65500 bytes"));
    }

    if timeout.is_zero() {
        return Err(anyhow::anyhow!("timeout must be greater than 0"));
    }

    Ok(())
}

/// Format a round-trip time in milliseconds
pub fn format_time(rtt: Duration) -> String {
    format!("{:.3} ms", rtt.as_secs_f64() * 1000.0)
}

/// Cooperative stop flag shared between the signal task and the exchange loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if the
    /// sending side goes away without requesting one.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Handle Ctrl+C signal for graceful shutdown
pub fn setup_signal_handler() -> Shutdown {
    let (tx, shutdown) = Shutdown::channel();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::debug!("interrupt received");
                let _ = tx.send(true);
            }
            Err(e) => log::warn!("failed to listen for Ctrl+C: {}", e),
        }
    });

    shutdown
}
