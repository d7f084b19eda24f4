use std::io::{BufRead, BufReader};

use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// Latched stop flag shared between the listener task and the capture loop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal { rx })
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if the
    /// sending side goes away without requesting one.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Listen for Ctrl-C, or `q` / Esc followed by Enter on stdin.
pub fn listen() -> StopSignal {
    listen_with(BufReader::new(std::io::stdin()))
}

fn listen_with<R>(input: R) -> StopSignal
where
    R: BufRead + Send + 'static,
{
    let (tx, signal) = StopSignal::channel();
    let keys = spawn_key_reader(input);

    tokio::spawn(async move {
        let stop_key = wait_for_stop_key(keys);
        tokio::pin!(stop_key);

        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("interrupt received, stopping"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    // Fall back to the keyboard alone.
                    (&mut stop_key).await;
                    info!("stop key pressed, stopping");
                }
            },
            _ = &mut stop_key => info!("stop key pressed, stopping"),
        }
        let _ = tx.send(true);
    });

    signal
}

/// Read `input` line by line on a plain OS thread, where a blocked read does
/// not hold up runtime shutdown. The returned receiver fires on a stop key;
/// its sender is dropped at end of input.
fn spawn_key_reader<R>(input: R) -> oneshot::Receiver<()>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("stop-keys".into())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) if is_stop_key(&line) => {
                        let _ = tx.send(());
                        return;
                    }
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start keyboard listener, only Ctrl-C will stop");
    }
    rx
}

/// Resolves when a stop key line is read. Pends forever once input closes,
/// so running detached from a terminal does not stop the loop.
async fn wait_for_stop_key(keys: oneshot::Receiver<()>) {
    if keys.await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn is_stop_key(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("quit") || line.contains('\u{1b}')
}
